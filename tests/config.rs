use std::path::PathBuf;
use std::time::Duration;

use gitboard::config::{ServiceConfig, SyncConfig};
use serial_test::serial;

const VARS: [&str; 5] = [
    "GITBOARD_REMOTE",
    "GITBOARD_GIT_TIMEOUT_SECS",
    "GITBOARD_REPO",
    "GITBOARD_IDENTITY",
    "GITBOARD_SYNC_INTERVAL_SECS",
];

fn clear() {
    for v in VARS {
        std::env::remove_var(v);
    }
}

#[test]
#[serial]
fn defaults_when_unset() {
    clear();
    let sync = SyncConfig::from_env();
    assert_eq!(sync, SyncConfig::default());
    assert_eq!(sync.remote, "origin");
    assert_eq!(sync.timeout, Duration::from_secs(30));

    let cfg = ServiceConfig::from_env();
    assert_eq!(cfg.repo_path, PathBuf::from("."));
    assert_eq!(cfg.sync_interval, Duration::from_secs(300));
    assert!(cfg.identity_path.ends_with("gitboard/identity.toml"));
}

#[test]
#[serial]
fn env_overrides() {
    clear();
    std::env::set_var("GITBOARD_REMOTE", "upstream");
    std::env::set_var("GITBOARD_GIT_TIMEOUT_SECS", "5");
    std::env::set_var("GITBOARD_REPO", "/srv/forum");
    std::env::set_var("GITBOARD_IDENTITY", "/etc/gitboard/id.toml");
    std::env::set_var("GITBOARD_SYNC_INTERVAL_SECS", "60");

    let cfg = ServiceConfig::from_env();
    assert_eq!(cfg.sync.remote, "upstream");
    assert_eq!(cfg.sync.timeout, Duration::from_secs(5));
    assert_eq!(cfg.repo_path, PathBuf::from("/srv/forum"));
    assert_eq!(cfg.identity_path, PathBuf::from("/etc/gitboard/id.toml"));
    assert_eq!(cfg.sync_interval, Duration::from_secs(60));
    clear();
}

#[test]
#[serial]
fn garbage_numbers_fall_back() {
    clear();
    std::env::set_var("GITBOARD_GIT_TIMEOUT_SECS", "soon");
    std::env::set_var("GITBOARD_REMOTE", "   ");
    let sync = SyncConfig::from_env();
    assert_eq!(sync.timeout, Duration::from_secs(30));
    assert_eq!(sync.remote, "origin");
    clear();
}

#[test]
#[serial]
fn zero_durations_fall_back() {
    clear();
    std::env::set_var("GITBOARD_GIT_TIMEOUT_SECS", "0");
    std::env::set_var("GITBOARD_SYNC_INTERVAL_SECS", "0");
    let cfg = ServiceConfig::from_env();
    assert_eq!(cfg.sync.timeout, Duration::from_secs(30));
    assert_eq!(cfg.sync_interval, Duration::from_secs(300));
    clear();
}
