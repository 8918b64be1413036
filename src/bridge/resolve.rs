use crate::config::{BridgeSettings, BRIDGE_BINARY};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUILD_PROGRAM: &str = "cargo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateKind {
    Override,
    Preference,
    Installed,
    AppExecutable,
    DevBuild,
    BuildFromSource,
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::Preference => "preference",
            Self::Installed => "installed",
            Self::AppExecutable => "app-executable",
            Self::DevBuild => "dev-build",
            Self::BuildFromSource => "build-from-source",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCandidate {
    pub kind: CandidateKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Path whose presence decides whether the candidate is worth spawning.
    pub probe: PathBuf,
    pub timeout: Duration,
}

impl BridgeCandidate {
    fn prebuilt(kind: CandidateKind, path: PathBuf, settings: &BridgeSettings) -> Self {
        Self {
            kind,
            program: path.clone(),
            args: Vec::new(),
            probe: path,
            timeout: settings.prebuilt_timeout(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.probe
            .canonicalize()
            .map(|canonical| canonical.is_file())
            .unwrap_or(false)
    }
}

impl fmt::Display for BridgeCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.program.display())?;
        if !self.args.is_empty() {
            write!(f, " {}", self.args.join(" "))?;
        }
        Ok(())
    }
}

/// Ordered candidates plus notes on classes that produced none.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub candidates: Vec<BridgeCandidate>,
    pub unresolved: Vec<String>,
}

impl Resolution {
    fn push(&mut self, candidate: BridgeCandidate) {
        let known = self
            .candidates
            .iter()
            .any(|existing| existing.program == candidate.program && existing.args == candidate.args);
        if !known {
            self.candidates.push(candidate);
        }
    }

    pub fn describe(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(ToString::to_string)
            .chain(self.unresolved.iter().cloned())
            .collect()
    }
}

/// Builds the candidate list in priority order. Nothing is spawned here; existence
/// of prebuilt paths is checked by the caller so diagnostics can still name them.
pub fn resolve_candidates(settings: &BridgeSettings) -> Resolution {
    let mut resolution = Resolution::default();

    if let Some(path) = &settings.override_path {
        resolution.push(BridgeCandidate::prebuilt(CandidateKind::Override, path.clone(), settings));
    }
    if let Some(path) = &settings.preference_path {
        resolution.push(BridgeCandidate::prebuilt(CandidateKind::Preference, path.clone(), settings));
    }
    for path in &settings.installed_paths {
        resolution.push(BridgeCandidate::prebuilt(CandidateKind::Installed, path.clone(), settings));
    }
    for path in &settings.app_executables {
        let mut candidate = BridgeCandidate::prebuilt(CandidateKind::AppExecutable, path.clone(), settings);
        candidate.args = vec!["--bridge".to_string()];
        resolution.push(candidate);
    }

    let dev_builds = find_dev_builds(&settings.dev_seed_dirs);
    if dev_builds.is_empty() {
        resolution.unresolved.push(format!(
            "{}: no target/{{release,debug}}/{} above {}",
            CandidateKind::DevBuild.as_str(),
            BRIDGE_BINARY,
            seeds_label(&settings.dev_seed_dirs)
        ));
    }
    for path in dev_builds {
        resolution.push(BridgeCandidate::prebuilt(CandidateKind::DevBuild, path, settings));
    }

    let manifests = find_manifests(&settings.dev_seed_dirs);
    if manifests.is_empty() {
        resolution.unresolved.push(format!(
            "{}: no Cargo.toml with src/bin/{}.rs above {}",
            CandidateKind::BuildFromSource.as_str(),
            BRIDGE_BINARY,
            seeds_label(&settings.dev_seed_dirs)
        ));
    }
    for manifest in manifests {
        resolution.push(BridgeCandidate {
            kind: CandidateKind::BuildFromSource,
            program: PathBuf::from(BUILD_PROGRAM),
            args: vec![
                "run".to_string(),
                "--quiet".to_string(),
                "--bin".to_string(),
                BRIDGE_BINARY.to_string(),
                "--manifest-path".to_string(),
                manifest.display().to_string(),
            ],
            probe: manifest,
            timeout: settings.build_timeout(),
        });
    }

    resolution
}

fn seeds_label(seeds: &[PathBuf]) -> String {
    if seeds.is_empty() {
        return "(no seed directories)".to_string();
    }
    seeds
        .iter()
        .map(|seed| seed.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn find_dev_builds(seeds: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for seed in seeds {
        for dir in seed.ancestors() {
            for profile in ["release", "debug"] {
                let path = dir.join("target").join(profile).join(BRIDGE_BINARY);
                if path.is_file() && !found.contains(&path) {
                    found.push(path);
                }
            }
        }
    }
    found
}

fn find_manifests(seeds: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for seed in seeds {
        for dir in seed.ancestors() {
            if has_bridge_source(dir) {
                let manifest = dir.join("Cargo.toml");
                if !found.contains(&manifest) {
                    found.push(manifest);
                }
            }
        }
    }
    found
}

fn has_bridge_source(dir: &Path) -> bool {
    dir.join("Cargo.toml").is_file() && dir.join("src").join("bin").join(format!("{}.rs", BRIDGE_BINARY)).is_file()
}

#[cfg(test)]
mod tests {
    use super::{resolve_candidates, CandidateKind};
    use crate::config::{BridgeSettings, BRIDGE_BINARY};
    use std::fs;
    use std::path::PathBuf;

    fn bare_settings(seed: PathBuf) -> BridgeSettings {
        BridgeSettings {
            installed_paths: Vec::new(),
            dev_seed_dirs: vec![seed],
            ..BridgeSettings::default()
        }
    }

    #[test]
    fn candidates_follow_priority_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = bare_settings(dir.path().to_path_buf());
        settings.override_path = Some(PathBuf::from("/opt/override/notesync-bridge"));
        settings.preference_path = Some(PathBuf::from("/opt/pref/notesync-bridge"));
        settings.installed_paths = vec![PathBuf::from("/usr/local/bin/notesync-bridge")];
        settings.app_executables = vec![PathBuf::from("/opt/app/notesync")];

        let resolution = resolve_candidates(&settings);
        let kinds: Vec<CandidateKind> = resolution.candidates.iter().map(|candidate| candidate.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CandidateKind::Override,
                CandidateKind::Preference,
                CandidateKind::Installed,
                CandidateKind::AppExecutable
            ]
        );
        assert_eq!(resolution.candidates[3].args, vec!["--bridge".to_string()]);
        assert_eq!(resolution.unresolved.len(), 2);
        assert!(resolution.candidates.iter().all(|candidate| !candidate.is_present()));
    }

    #[test]
    fn walks_up_from_seeds_to_dev_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let nested = root.join("crates").join("app");
        fs::create_dir_all(&nested).expect("nested");
        fs::create_dir_all(root.join("target").join("debug")).expect("target");
        fs::write(root.join("target").join("debug").join(BRIDGE_BINARY), "#!/bin/sh\n").expect("binary");
        fs::create_dir_all(root.join("src").join("bin")).expect("src");
        fs::write(root.join("Cargo.toml"), "[package]\n").expect("manifest");
        fs::write(root.join("src").join("bin").join(format!("{}.rs", BRIDGE_BINARY)), "fn main() {}\n")
            .expect("source");

        let resolution = resolve_candidates(&bare_settings(nested));
        assert!(resolution.unresolved.is_empty());
        let dev = &resolution.candidates[0];
        assert_eq!(dev.kind, CandidateKind::DevBuild);
        assert!(dev.is_present());
        let build = &resolution.candidates[1];
        assert_eq!(build.kind, CandidateKind::BuildFromSource);
        assert!(build.args.contains(&"--manifest-path".to_string()));
        assert!(build.timeout > dev.timeout);
    }
}
