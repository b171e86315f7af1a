use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Bounds above this are accepted but logged; each transfer holds its own
/// control connection and servers commonly cap sessions per client.
pub const CONCURRENCY_WARN_THRESHOLD: usize = 64;

/// Settings for one fetch run. Field names serialise in camelCase so a
/// config file reads `{"endpointHost": "...", "maxConcurrency": 5, ...}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchConfig {
    pub endpoint_host: String,
    pub endpoint_port: u16,
    pub base_directory: String,
    pub local_root: PathBuf,
    pub max_concurrency: usize,
    pub username: String,
    pub password: String,
    /// Descend into subdirectories of `base_directory`.
    pub recursive: bool,
    /// Cancel the run once this many seconds have elapsed.
    pub timeout_secs: Option<u64>,
    pub io_timeout_secs: u64,
    /// Append failed outcomes as JSON Lines to this file.
    pub failures_out: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            endpoint_host: "localhost".to_string(),
            endpoint_port: 21,
            base_directory: "/".to_string(),
            local_root: PathBuf::from("target/"),
            max_concurrency: 5,
            username: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            recursive: false,
            timeout_secs: None,
            io_timeout_secs: 30,
            failures_out: None,
        }
    }
}

impl FetchConfig {
    /// Location of the per-user config file (`~/.ftpfetch/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".".to_owned() + env!("CARGO_PKG_NAME")).join("config.json"))
    }

    /// Read a config file. Missing keys fall back to their defaults.
    pub fn read_from(path: &Path) -> Result<Self, FetchError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FetchError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            FetchError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Load `explicit` if given, else the per-user file when it exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, FetchError> {
        if let Some(p) = explicit {
            return Self::read_from(p);
        }
        match Self::default_path() {
            Some(p) if p.is_file() => {
                tracing::debug!("[config] loading {}", p.display());
                Self::read_from(&p)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Reject settings that would make the run meaningless. Runs before any
    /// network activity.
    pub fn validate(&self) -> Result<(), FetchError> {
        validate_concurrency(self.max_concurrency)?;
        if self.endpoint_host.trim().is_empty() {
            return Err(FetchError::Configuration("endpointHost must not be empty".into()));
        }
        if self.endpoint_port == 0 {
            return Err(FetchError::Configuration("endpointPort must be > 0".into()));
        }
        if self.base_directory.trim().is_empty() {
            return Err(FetchError::Configuration("baseDirectory must not be empty".into()));
        }
        if self.local_root.as_os_str().is_empty() {
            return Err(FetchError::Configuration("localRoot must not be empty".into()));
        }
        if self.local_root.is_file() {
            return Err(FetchError::Configuration(format!(
                "localRoot {} exists and is not a directory",
                self.local_root.display()
            )));
        }
        if self.io_timeout_secs == 0 {
            return Err(FetchError::Configuration("ioTimeoutSecs must be > 0".into()));
        }
        Ok(())
    }
}

/// The concurrency bound must be positive. Large bounds only warn.
pub fn validate_concurrency(max_concurrency: usize) -> Result<(), FetchError> {
    if max_concurrency == 0 {
        return Err(FetchError::Configuration("maxConcurrency must be > 0".into()));
    }
    if max_concurrency > CONCURRENCY_WARN_THRESHOLD {
        tracing::warn!(
            "[config] maxConcurrency {} is above {}; the server may refuse extra connections",
            max_concurrency,
            CONCURRENCY_WARN_THRESHOLD
        );
    }
    Ok(())
}
