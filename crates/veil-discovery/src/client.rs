//! Interface to a discovery service.

use crate::{Entry, Result};
use async_trait::async_trait;
use veil_crypto::PublicKey;

/// Operations the relay and client roles need from a discovery service.
///
/// Implementations must be safe to share between tasks; every entity holds
/// one behind an `Arc<dyn DiscoveryClient>`.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Look up the entry owned by `pk`
    async fn entry(&self, pk: &PublicKey) -> Result<Entry>;

    /// Create a new entry (sequence 0)
    async fn post_entry(&self, entry: &Entry) -> Result<()>;

    /// Replace an existing entry with its next sequence
    async fn put_entry(&self, entry: &Entry) -> Result<()>;

    /// Relay entries that still advertise free session slots
    async fn available_servers(&self) -> Result<Vec<Entry>>;
}
