use std::path::PathBuf;
use std::time::Duration;

use crate::crypto;

pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

fn string_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// zero counts as unset
fn secs_env(name: &str, default: u64) -> Duration {
    let secs = string_env(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&s| s > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Remote name and network bound for pull/push/clone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub remote: String,
    pub timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { remote: DEFAULT_REMOTE.to_string(), timeout: Duration::from_secs(DEFAULT_GIT_TIMEOUT_SECS) }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            remote: string_env("GITBOARD_REMOTE").unwrap_or_else(|| DEFAULT_REMOTE.to_string()),
            timeout: secs_env("GITBOARD_GIT_TIMEOUT_SECS", DEFAULT_GIT_TIMEOUT_SECS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub repo_path: PathBuf,
    pub identity_path: PathBuf,
    pub sync_interval: Duration,
    pub sync: SyncConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            identity_path: crypto::default_identity_path(),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            sync: SyncConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            repo_path: string_env("GITBOARD_REPO").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            identity_path: string_env("GITBOARD_IDENTITY")
                .map(PathBuf::from)
                .unwrap_or_else(crypto::default_identity_path),
            sync_interval: secs_env("GITBOARD_SYNC_INTERVAL_SECS", DEFAULT_SYNC_INTERVAL_SECS),
            sync: SyncConfig::from_env(),
        }
    }
}
