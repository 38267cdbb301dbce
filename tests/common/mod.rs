//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use tempfile::TempDir;

use renix::core::closure::SourceArchive;
use renix::core::flake_ref::FlakeRef;
use renix::core::gateway::{FetchGateway, PrefetchData};
use renix::core::inputs::{DeclaredInput, SourceSpec};
use renix::core::lock::SourceInfo;
use renix::error::GatewayError;

/// Test project context
///
/// Creates a temporary directory for test flakes and provides utilities
/// for setting up lock-file scenarios.
pub struct TestProject {
    /// Temporary directory for the test flake
    pub dir: TempDir,
}

impl TestProject {
    /// Create a new test flake in a temporary directory
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Get the path to the test flake directory
    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Path to the flake.lock inside the test flake
    pub fn lock_path(&self) -> PathBuf {
        self.dir.path().join("flake.lock")
    }

    /// Create a file in the test flake
    pub fn create_file(&self, name: &str, content: &str) {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// Check if a file exists in the test flake
    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    /// Read a file from the test flake
    pub fn read_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).expect("Failed to read file")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Declared source input for a reference string, no overrides.
pub fn source_input(reference: &str) -> DeclaredInput {
    DeclaredInput::Source(SourceSpec::from_ref(FlakeRef::parse(reference)))
}

/// Declared source input with `flake = false`.
pub fn non_flake_input(reference: &str) -> DeclaredInput {
    let mut spec = SourceSpec::from_ref(FlakeRef::parse(reference));
    spec.is_flake = false;
    DeclaredInput::Source(spec)
}

/// Declared source input with nested follows overrides.
pub fn source_input_with_follows(
    reference: &str,
    follows: &[(&str, &[&str])],
) -> DeclaredInput {
    let mut spec = SourceSpec::from_ref(FlakeRef::parse(reference));
    for (name, path) in follows {
        spec.follows.insert(
            (*name).to_string(),
            path.iter().map(|s| (*s).to_string()).collect(),
        );
    }
    DeclaredInput::Source(spec)
}

/// Scripted fetch gateway that records every call.
///
/// Prefetch results are stubbed per reference string; upstream lock files
/// are stubbed per archive location (URL for tarball/git, path for local
/// directories). Unstubbed prefetches fail; unstubbed lock fetches report
/// "no lock file". Locations registered with [`MockGateway::fail_lock`]
/// make the lock fetch itself error out.
#[derive(Default)]
pub struct MockGateway {
    prefetch_stubs: Mutex<HashMap<String, PrefetchData>>,
    lock_stubs: Mutex<HashMap<String, Value>>,
    failing_locks: Mutex<HashSet<String>>,
    prefetch_calls: Mutex<Vec<String>>,
    fetch_lock_calls: Mutex<Vec<String>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stub a github prefetch: `reference` resolves to `rev`.
    pub fn stub_github(&self, reference: &str, owner: &str, repo: &str, rev: &str) {
        let data = PrefetchData {
            hash: format!("sha256-{rev}"),
            locked: SourceInfo {
                kind: "github".into(),
                owner: Some(owner.into()),
                repo: Some(repo.into()),
                rev: Some(rev.into()),
                last_modified: Some(1_700_000_000),
                ..SourceInfo::default()
            },
            original: SourceInfo {
                kind: "github".into(),
                owner: Some(owner.into()),
                repo: Some(repo.into()),
                ..SourceInfo::default()
            },
        };
        self.prefetch_stubs
            .lock()
            .unwrap()
            .insert(reference.to_string(), data);
    }

    /// Stub a git prefetch: `reference` resolves to `rev`.
    pub fn stub_git(&self, reference: &str, url: &str, rev: &str) {
        let data = PrefetchData {
            hash: format!("sha256-{rev}"),
            locked: SourceInfo {
                kind: "git".into(),
                url: Some(url.into()),
                rev: Some(rev.into()),
                rev_count: Some(42),
                last_modified: Some(1_700_000_000),
                ..SourceInfo::default()
            },
            original: SourceInfo {
                kind: "git".into(),
                url: Some(url.into()),
                ..SourceInfo::default()
            },
        };
        self.prefetch_stubs
            .lock()
            .unwrap()
            .insert(reference.to_string(), data);
    }

    /// Stub a path prefetch: hashing the local tree succeeds.
    pub fn stub_path(&self, reference: &str, path: &str, hash: &str) {
        let data = PrefetchData {
            hash: hash.to_string(),
            locked: SourceInfo {
                kind: "path".into(),
                path: Some(path.into()),
                last_modified: Some(1_700_000_000),
                ..SourceInfo::default()
            },
            original: SourceInfo {
                kind: "path".into(),
                path: Some(path.into()),
                ..SourceInfo::default()
            },
        };
        self.prefetch_stubs
            .lock()
            .unwrap()
            .insert(reference.to_string(), data);
    }

    /// Stub the upstream flake.lock served for an archive location.
    pub fn stub_lock(&self, location: &str, lock: Value) {
        self.lock_stubs
            .lock()
            .unwrap()
            .insert(location.to_string(), lock);
    }

    /// Make lock fetches for an archive location fail outright.
    pub fn fail_lock(&self, location: &str) {
        self.failing_locks
            .lock()
            .unwrap()
            .insert(location.to_string());
    }

    pub fn prefetch_count(&self) -> usize {
        self.prefetch_calls.lock().unwrap().len()
    }

    pub fn prefetch_calls(&self) -> Vec<String> {
        self.prefetch_calls.lock().unwrap().clone()
    }

    pub fn fetch_lock_count(&self) -> usize {
        self.fetch_lock_calls.lock().unwrap().len()
    }

    pub fn fetch_lock_calls(&self) -> Vec<String> {
        self.fetch_lock_calls.lock().unwrap().clone()
    }
}

fn archive_location(archive: &SourceArchive) -> String {
    match archive {
        SourceArchive::Path(path) => path.display().to_string(),
        SourceArchive::Git { url, .. } => url.clone(),
        SourceArchive::Tarball { url, .. } => url.clone(),
    }
}

impl FetchGateway for MockGateway {
    fn prefetch(&self, reference: &str) -> Result<PrefetchData, GatewayError> {
        self.prefetch_calls
            .lock()
            .unwrap()
            .push(reference.to_string());
        self.prefetch_stubs
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| GatewayError::Prefetch {
                reference: reference.to_string(),
                message: "no stub for reference".to_string(),
            })
    }

    fn fetch_lock(&self, archive: &SourceArchive) -> Result<Option<Value>, GatewayError> {
        let location = archive_location(archive);
        self.fetch_lock_calls.lock().unwrap().push(location.clone());
        if self.failing_locks.lock().unwrap().contains(&location) {
            return Err(GatewayError::FetchTree {
                location,
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(self.lock_stubs.lock().unwrap().get(&location).cloned())
    }
}
