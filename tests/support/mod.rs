//! Shared helpers for integration tests

#![allow(dead_code)]

use nimbus::discovery::Declaration;
use nimbus::NimbusConfig;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes `files` (relative path, content) under a fresh temporary project root
pub fn write_project(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    for (relative, content) in files {
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create directory");
        }
        fs::write(&path, content).expect("Failed to write file");
    }
    dir
}

/// Configuration for runs against the in-process engine: loopback capture server,
/// short session timeout
pub fn test_config(session_timeout_secs: u64) -> NimbusConfig {
    NimbusConfig {
        session_timeout_secs,
        build_timeout_secs: 30,
        max_parallel: 2,
        capture_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        advertise_host: "127.0.0.1".to_string(),
        ..NimbusConfig::default()
    }
}

/// Entries of `root` left behind by a build workspace
pub fn leftover_workspaces(root: &Path) -> Vec<PathBuf> {
    fs::read_dir(root)
        .expect("Failed to read project root")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(nimbus::build::WORKSPACE_PREFIX))
                .unwrap_or(false)
        })
        .collect()
}

pub fn bucket(name: &str) -> Declaration {
    Declaration::Bucket {
        name: name.to_string(),
    }
}

pub fn topic(name: &str) -> Declaration {
    Declaration::Topic {
        name: name.to_string(),
    }
}

pub fn nimbus_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_nimbus"))
}
