//! In-process discovery service.
//!
//! Enforces the same validation rules a remote service would: signatures
//! must verify, creates start at sequence 0 and updates advance the
//! sequence by exactly one. Failures can be injected to exercise callers'
//! retry paths.

use crate::{DiscoveryClient, DiscoveryError, Entry, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use veil_crypto::PublicKey;

/// Discovery service backed by a map in memory
#[derive(Default)]
pub struct MemoryDiscovery {
    entries: RwLock<HashMap<PublicKey, Entry>>,
    injected: Mutex<VecDeque<DiscoveryError>>,
    writes: AtomicUsize,
}

impl MemoryDiscovery {
    /// Create an empty service
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write calls fail with `errors`, in order
    pub fn inject_failures(&self, errors: impl IntoIterator<Item = DiscoveryError>) {
        if let Ok(mut queue) = self.injected.lock() {
            queue.extend(errors);
        }
    }

    /// Number of successful writes (creates and updates)
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no entries are stored
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn take_injected(&self) -> Option<DiscoveryError> {
        self.injected.lock().ok().and_then(|mut q| q.pop_front())
    }
}

#[async_trait]
impl DiscoveryClient for MemoryDiscovery {
    async fn entry(&self, pk: &PublicKey) -> Result<Entry> {
        self.entries
            .read()
            .await
            .get(pk)
            .cloned()
            .ok_or(DiscoveryError::EntryNotFound)
    }

    async fn post_entry(&self, entry: &Entry) -> Result<()> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        entry.verify()?;
        if entry.sequence != 0 {
            return Err(DiscoveryError::InvalidSequence {
                expected: 0,
                actual: entry.sequence,
            });
        }

        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.static_pk) {
            return Err(DiscoveryError::EntryAlreadyExists);
        }
        entries.insert(entry.static_pk, entry.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(pk = %entry.static_pk, "discovery entry created");
        Ok(())
    }

    async fn put_entry(&self, entry: &Entry) -> Result<()> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        entry.verify()?;

        let mut entries = self.entries.write().await;
        let prev = entries
            .get(&entry.static_pk)
            .ok_or(DiscoveryError::EntryNotFound)?;
        if entry.sequence != prev.sequence + 1 {
            return Err(DiscoveryError::InvalidSequence {
                expected: prev.sequence + 1,
                actual: entry.sequence,
            });
        }
        entries.insert(entry.static_pk, entry.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(pk = %entry.static_pk, seq = entry.sequence, "discovery entry updated");
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<Entry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.server.as_ref().is_some_and(|s| s.available_sessions > 0))
            .cloned()
            .collect())
    }
}
