use super::protocol::{BridgeRequest, BridgeResponse};
use super::resolve::{resolve_candidates, BridgeCandidate};
use crate::config::BridgeSettings;
use crate::errors::{AppError, AppResult};
use serde_json::Value;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

const FALLBACK_PATH: &str = "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";
const TERMINATE_GRACE: Duration = Duration::from_millis(1500);
const STDERR_TAIL_CHARS: usize = 400;

/// Reaches the external writer through the first working candidate.
#[derive(Debug, Clone)]
pub struct BridgeGateway {
    settings: BridgeSettings,
    log_dir: PathBuf,
}

impl BridgeGateway {
    pub fn new(settings: BridgeSettings, log_dir: PathBuf) -> Self {
        Self { settings, log_dir }
    }

    pub async fn invoke(&self, op: &str, payload: Value) -> AppResult<Value> {
        let gateway = self.clone();
        let op = op.to_string();
        tokio::task::spawn_blocking(move || gateway.invoke_blocking(&op, payload)).await?
    }

    /// Tries candidates in order. Transport failures fall through to the next
    /// candidate; an `ok:false` reply is final and returned as a typed error.
    pub fn invoke_blocking(&self, op: &str, payload: Value) -> AppResult<Value> {
        let request = BridgeRequest {
            op: op.to_string(),
            payload,
        };
        let line = serde_json::to_string(&request)?;
        let resolution = resolve_candidates(&self.settings);
        let evaluated = resolution.describe();
        let mut attempts = Vec::new();

        for candidate in &resolution.candidates {
            if !candidate.is_present() {
                attempts.push(format!("{}: not found", candidate));
                continue;
            }
            let started = Instant::now();
            match run_candidate(candidate, &line) {
                Ok(response) => {
                    tracing::debug!(
                        op = %op,
                        chosen = %candidate,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        ok = response.ok,
                        "bridge call completed"
                    );
                    return response.into_result();
                }
                Err(error) => {
                    tracing::warn!(
                        op = %op,
                        chosen = %candidate,
                        timeout_ms = candidate.timeout.as_millis() as u64,
                        candidates = ?evaluated,
                        error = %error,
                        "bridge candidate failed"
                    );
                    attempts.push(format!("{}: {}", candidate, error.message()));
                }
            }
        }

        attempts.extend(resolution.unresolved.iter().cloned());
        tracing::error!(op = %op, candidates = ?evaluated, attempts = ?attempts, "no bridge candidate answered");
        Err(AppError::WriterUnavailable(format!(
            "external writer unavailable for '{}'; tried: {}. Logs: {}",
            op,
            attempts.join("; "),
            self.log_dir.display()
        )))
    }
}

fn prepare_command(candidate: &BridgeCandidate) -> Command {
    let path = match std::env::var("PATH") {
        Ok(existing) if !existing.trim().is_empty() => format!("{}:{}", FALLBACK_PATH, existing),
        _ => FALLBACK_PATH.to_string(),
    };
    let mut command = Command::new(&candidate.program);
    command.args(&candidate.args).env("PATH", path);
    if let Some(dir) = candidate.probe.parent().filter(|dir| dir.is_dir()) {
        command.current_dir(dir);
    }
    command
}

fn run_candidate(candidate: &BridgeCandidate, line: &str) -> AppResult<BridgeResponse> {
    let mut child = prepare_command(candidate)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| AppError::Transport(format!("spawn failed: {}", error)))?;

    // Readers first, and the request on its own thread, so a child that never
    // drains a pipe cannot hold the call past the candidate's timeout.
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);
    if let Some(stdin) = child.stdin.take() {
        spawn_writer(stdin, line.to_string(), candidate.to_string());
    }

    let status = match child.wait_timeout(candidate.timeout)? {
        Some(status) => status,
        None => {
            terminate_then_kill(&mut child);
            return Err(AppError::Transport(format!(
                "timed out after {} ms",
                candidate.timeout.as_millis()
            )));
        }
    };

    let stdout = join_reader(stdout);
    let stderr = join_reader(stderr);
    if !status.success() {
        return Err(AppError::Transport(format!(
            "exited with {}{}",
            status,
            stderr_tail(&stderr)
        )));
    }
    parse_reply(&stdout)
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = source.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// Writes the request and closes stdin on a detached thread. A writer that exits
/// without reading shows up as a bad exit or a missing reply, not here.
fn spawn_writer(mut stdin: ChildStdin, line: String, chosen: String) {
    std::thread::spawn(move || {
        if let Err(error) = stdin.write_all(line.as_bytes()).and_then(|_| stdin.write_all(b"\n")) {
            tracing::debug!(chosen = %chosen, error = %error, "bridge stdin closed early");
        }
    });
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle.and_then(|handle| handle.join().ok()).unwrap_or_default()
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let count = trimmed.chars().count();
    let tail: String = trimmed.chars().skip(count.saturating_sub(STDERR_TAIL_CHARS)).collect();
    format!("; stderr: {}", tail)
}

/// Build tools may print before the reply; only the last non-empty line counts.
fn parse_reply(stdout: &str) -> AppResult<BridgeResponse> {
    let last = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .ok_or_else(|| AppError::Transport("empty response".to_string()))?;
    serde_json::from_str(last).map_err(|_| AppError::Transport(format!("malformed response: {}", last)))
}

fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        if matches!(child.wait_timeout(TERMINATE_GRACE), Ok(Some(_))) {
            return;
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::{parse_reply, stderr_tail};
    use crate::errors::AppError;

    #[test]
    fn reply_is_the_last_non_empty_line() {
        let reply = parse_reply("   Compiling notesync\n{\"ok\":true,\"data\":{\"folder_id\":\"f\"}}\n\n")
            .expect("reply");
        assert!(reply.ok);

        assert!(matches!(parse_reply("\n \n"), Err(AppError::Transport(_))));
        assert!(matches!(parse_reply("{\"ok\":true}\nnot json"), Err(AppError::Transport(_))));
    }

    #[test]
    fn stderr_tail_is_bounded() {
        assert_eq!(stderr_tail("  "), "");
        let long = "x".repeat(1000);
        assert_eq!(stderr_tail(&long).len(), "; stderr: ".len() + 400);
    }
}
