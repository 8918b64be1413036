use notesync_lib::config::BridgeSettings;
use notesync_lib::{AppError, BridgeGateway};
use serde_json::json;
use std::path::{Path, PathBuf};

const MOCK_BRIDGE: &str = "tests/fixtures/mock-bridge.sh";

fn bare_settings(seed: &Path) -> BridgeSettings {
    BridgeSettings {
        installed_paths: vec![seed.join("missing").join("notesync-bridge")],
        dev_seed_dirs: vec![seed.to_path_buf()],
        prebuilt_timeout_ms: 2_000,
        ..BridgeSettings::default()
    }
}

#[cfg(unix)]
fn install_script(path: &Path, contents: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("script dir");
    }
    std::fs::write(path, contents).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path.to_path_buf()
}

#[cfg(unix)]
fn install_mock(path: &Path) -> PathBuf {
    let contents = std::fs::read_to_string(MOCK_BRIDGE).expect("read mock bridge");
    install_script(path, &contents)
}

#[test]
fn fixture_script_exists() {
    assert!(PathBuf::from(MOCK_BRIDGE).exists());
}

#[cfg(unix)]
#[test]
fn fixture_script_echoes_request() {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new("bash")
        .arg(MOCK_BRIDGE)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn mock");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(br#"{"op":"ensure_inbox","payload":{}}"#)
        .expect("write request");
    let output = child.wait_with_output().expect("mock output");
    assert!(output.status.success());
    let reply: serde_json::Value = serde_json::from_slice(&output.stdout).expect("reply json");
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["request"]["op"], "ensure_inbox");
}

#[cfg(unix)]
#[test]
fn falls_through_to_dev_tree_then_reports_every_candidate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let workspace = dir.path().join("workspace");
    let seed = workspace.join("crates").join("app");
    std::fs::create_dir_all(&seed).expect("seed");
    let dev_build = install_mock(&workspace.join("target").join("debug").join("notesync-bridge"));
    let log_dir = dir.path().join("logs");

    let gateway = BridgeGateway::new(bare_settings(&seed), log_dir.clone());
    let data = gateway
        .invoke_blocking("search_notes", json!({"query": "draft"}))
        .expect("dev build answers");
    assert_eq!(data["request"]["op"], "search_notes");
    assert_eq!(data["request"]["payload"]["query"], "draft");

    std::fs::remove_file(&dev_build).expect("remove dev build");
    let error = gateway
        .invoke_blocking("search_notes", json!({}))
        .expect_err("nothing left to run");
    let message = match error {
        AppError::WriterUnavailable(message) => message,
        other => panic!("expected WriterUnavailable, got {:?}", other),
    };
    assert!(message.contains("installed"), "{}", message);
    assert!(message.contains(&seed.join("missing").join("notesync-bridge").display().to_string()));
    assert!(message.contains("dev-build"), "{}", message);
    assert!(message.contains("build-from-source"), "{}", message);
    assert!(message.contains(&log_dir.display().to_string()), "{}", message);
}

#[cfg(unix)]
#[tokio::test]
async fn protocol_failure_is_final_and_typed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rejecting = install_script(
        &dir.path().join("override").join("notesync-bridge"),
        "#!/usr/bin/env bash\ncat >/dev/null\necho '{\"ok\":false,\"error\":{\"code\":\"CONFLICT\",\"message\":\"stale note update rejected\"}}'\n",
    );
    let fallback = install_mock(&dir.path().join("pref").join("notesync-bridge"));
    let mut settings = bare_settings(dir.path());
    settings.override_path = Some(rejecting);
    settings.preference_path = Some(fallback);

    let gateway = BridgeGateway::new(settings, dir.path().join("logs"));
    let error = gateway
        .invoke("update_note", json!({"id": "n1", "title": "late"}))
        .await
        .expect_err("conflict surfaces");
    assert!(matches!(error, AppError::Conflict(ref message) if message == "stale note update rejected"));
}

#[cfg(unix)]
#[test]
fn transport_failures_fall_through_to_next_candidate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hanging = install_script(
        &dir.path().join("override").join("notesync-bridge"),
        "#!/usr/bin/env bash\nsleep 30\n",
    );
    let crashing = install_script(
        &dir.path().join("pref").join("notesync-bridge"),
        "#!/usr/bin/env bash\ncat >/dev/null\necho 'boom' >&2\nexit 3\n",
    );
    let garbled = install_script(
        &dir.path().join("installed").join("notesync-bridge"),
        "#!/usr/bin/env bash\ncat >/dev/null\necho 'not json at all'\n",
    );
    let working = install_mock(&dir.path().join("app").join("notesync"));

    let mut settings = bare_settings(dir.path());
    settings.override_path = Some(hanging);
    settings.preference_path = Some(crashing);
    settings.installed_paths = vec![garbled];
    settings.app_executables = vec![working];
    settings.prebuilt_timeout_ms = 500;

    let gateway = BridgeGateway::new(settings, dir.path().join("logs"));
    let started = std::time::Instant::now();
    let data = gateway
        .invoke_blocking("ensure_inbox", json!({}))
        .expect("app executable answers");
    assert_eq!(data["request"]["op"], "ensure_inbox");
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}

#[cfg(unix)]
#[test]
fn oversized_request_to_stalled_candidate_still_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stalled = install_script(
        &dir.path().join("override").join("notesync-bridge"),
        "#!/usr/bin/env bash\nsleep 30\n",
    );
    let working = install_mock(&dir.path().join("pref").join("notesync-bridge"));
    let mut settings = bare_settings(dir.path());
    settings.override_path = Some(stalled);
    settings.preference_path = Some(working);
    settings.prebuilt_timeout_ms = 500;

    // Far beyond a pipe buffer, so a blocking write would never finish.
    let body = "x".repeat(1024 * 1024);
    let gateway = BridgeGateway::new(settings, dir.path().join("logs"));
    let started = std::time::Instant::now();
    let data = gateway
        .invoke_blocking("update_note", json!({"id": "n1", "body": body}))
        .expect("fallback answers");
    assert_eq!(data["request"]["payload"]["body"].as_str().map(str::len), Some(1024 * 1024));
    assert!(started.elapsed() < std::time::Duration::from_secs(10), "{:?}", started.elapsed());
}
