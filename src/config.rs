use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATA_DIR_ENV: &str = "NOTESYNC_DATA_DIR";
pub const BRIDGE_PATH_ENV: &str = "NOTESYNC_BRIDGE_PATH";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DB_FILE: &str = "notesync.db";
pub const BRIDGE_BINARY: &str = "notesync-bridge";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SyncSettings {
    pub debounce_ms: u64,
    pub poll_interval_secs: u64,
    pub bridge: BridgeSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            poll_interval_secs: 5,
            bridge: BridgeSettings::default(),
        }
    }
}

impl SyncSettings {
    /// Reads `<data_dir>/config.yaml`; a missing file yields defaults.
    pub fn load(data_dir: &Path) -> AppResult<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: SyncSettings = serde_yaml::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.poll_interval_secs == 0 {
            return Err(AppError::Validation("poll_interval_secs must be at least 1".to_string()));
        }
        if self.bridge.prebuilt_timeout_ms == 0 || self.bridge.build_timeout_ms == 0 {
            return Err(AppError::Validation("bridge timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Inputs to bridge resolution. All read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BridgeSettings {
    /// Explicit override; normally filled from `NOTESYNC_BRIDGE_PATH`.
    pub override_path: Option<PathBuf>,
    pub preference_path: Option<PathBuf>,
    pub installed_paths: Vec<PathBuf>,
    /// Executables of the long-lived app, which answer one request under `--bridge`.
    pub app_executables: Vec<PathBuf>,
    pub dev_seed_dirs: Vec<PathBuf>,
    pub prebuilt_timeout_ms: u64,
    pub build_timeout_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            override_path: None,
            preference_path: None,
            installed_paths: default_installed_paths(),
            app_executables: Vec::new(),
            dev_seed_dirs: Vec::new(),
            prebuilt_timeout_ms: 5_000,
            build_timeout_ms: 180_000,
        }
    }
}

impl BridgeSettings {
    /// Fills the runtime-derived inputs: env override, this executable, and seed dirs.
    pub fn with_environment(mut self) -> Self {
        if self.override_path.is_none() {
            self.override_path = std::env::var_os(BRIDGE_PATH_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from);
        }
        if let Ok(current) = std::env::current_exe() {
            if !self.app_executables.contains(&current) {
                self.app_executables.push(current.clone());
            }
            if let Some(parent) = current.parent() {
                push_unique(&mut self.dev_seed_dirs, parent.to_path_buf());
            }
        }
        if let Ok(cwd) = std::env::current_dir() {
            push_unique(&mut self.dev_seed_dirs, cwd);
        }
        push_unique(&mut self.dev_seed_dirs, PathBuf::from(env!("CARGO_MANIFEST_DIR")));
        self
    }

    pub fn prebuilt_timeout(&self) -> Duration {
        Duration::from_millis(self.prebuilt_timeout_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

fn push_unique(paths: &mut Vec<PathBuf>, path: PathBuf) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

fn default_installed_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/usr/local/bin").join(BRIDGE_BINARY),
        PathBuf::from("/opt/homebrew/bin").join(BRIDGE_BINARY),
        PathBuf::from("/usr/bin").join(BRIDGE_BINARY),
    ];
    if let Some(home) = std::env::var_os("HOME") {
        paths.insert(0, PathBuf::from(home).join(".local").join("bin").join(BRIDGE_BINARY));
    }
    paths
}

/// `NOTESYNC_DATA_DIR`, else `$HOME/.notesync`.
pub fn resolve_data_dir() -> AppResult<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    std::env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .map(|home| PathBuf::from(home).join(".notesync"))
        .ok_or_else(|| AppError::Io(format!("cannot locate data directory; set {} or HOME", DATA_DIR_ENV)))
}

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE)
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub fn backups_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("backups")
}
