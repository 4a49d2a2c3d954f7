//! Test doubles shared by the director integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conductor_director::{BoxError, Integrator, Manifest, ManifestManager, Merged, ReadyItem};
use tokio::sync::Notify;

/// In-memory manifest that counts reads.
#[derive(Default)]
pub struct MockManifest {
    manifest: Mutex<Manifest>,
    reads: AtomicUsize,
    fail_reads: Mutex<bool>,
}

impl MockManifest {
    pub fn with_ready(items: &[(&str, &str)]) -> Arc<Self> {
        let manifest = Manifest {
            ready: items
                .iter()
                .map(|(branch, sha)| ReadyItem::new(*branch, *sha))
                .collect(),
            ..Manifest::default()
        };
        Arc::new(Self {
            manifest: Mutex::new(manifest),
            ..Self::default()
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn main_head(&self) -> Option<String> {
        self.manifest.lock().expect("lock").main_head.clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        *self.fail_reads.lock().expect("lock") = fail;
    }
}

#[async_trait]
impl ManifestManager for MockManifest {
    async fn read(&self) -> Result<Manifest, BoxError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if *self.fail_reads.lock().expect("lock") {
            return Err("manifest unavailable".into());
        }
        Ok(self.manifest.lock().expect("lock").clone())
    }

    async fn update_main_head(&self, sha: &str) -> Result<(), BoxError> {
        self.manifest.lock().expect("lock").main_head = Some(sha.to_string());
        Ok(())
    }
}

/// Integrator that merges every branch as `merged-<sha>` unless told to
/// fail it, optionally pausing until released.
#[derive(Default)]
pub struct MockIntegrator {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    pub gate: Option<Gate>,
}

pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl MockIntegrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(branches: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(branches.iter().map(ToString::to_string).collect()),
            ..Self::default()
        })
    }

    /// An integrator whose every call blocks until `release` is notified.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Gate {
                entered: Notify::new(),
                release: Notify::new(),
            }),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Integrator for MockIntegrator {
    async fn integrate(&self, item: &ReadyItem) -> Result<Merged, BoxError> {
        self.calls.lock().expect("lock").push(item.branch.clone());
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.failing.lock().expect("lock").contains(&item.branch) {
            return Err(format!("conflict on {}", item.branch).into());
        }
        Ok(Merged {
            sha: format!("merged-{}", item.sha),
        })
    }
}
