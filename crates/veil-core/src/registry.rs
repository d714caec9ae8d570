//! Shared client instances keyed by public key.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use veil_crypto::{PublicKey, SecretKey};
use veil_discovery::DiscoveryClient;

/// At most one [`Client`] per public key
///
/// Pass the registry by reference to whatever needs a shared client; there
/// is no process-wide instance.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<PublicKey, Arc<Client>>,
}

impl ClientRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for `pk`, creating it if absent
    ///
    /// Check and insert happen under the same shard lock, so concurrent
    /// callers for one key all receive the same instance.
    ///
    /// # Errors
    ///
    /// Returns the [`Client::new`] error; nothing is inserted.
    pub fn get_or_create(
        &self,
        pk: PublicKey,
        sk: SecretKey,
        discovery: Arc<dyn DiscoveryClient>,
        config: ClientConfig,
    ) -> Result<Arc<Client>> {
        self.clients
            .entry(pk)
            .or_try_insert_with(|| {
                tracing::debug!(local_pk = %pk, "creating shared client");
                Client::new(pk, sk, discovery, config).map(Arc::new)
            })
            .map(|client| Arc::clone(client.value()))
    }

    /// Client for `pk`, if registered
    #[must_use]
    pub fn get(&self, pk: &PublicKey) -> Option<Arc<Client>> {
        self.clients.get(pk).map(|client| Arc::clone(client.value()))
    }

    /// Unregister and return the client for `pk`
    ///
    /// The client is not closed.
    pub fn remove(&self, pk: &PublicKey) -> Option<Arc<Client>> {
        self.clients.remove(pk).map(|(_, client)| client)
    }

    /// Registered clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Unregister and close every client
    pub async fn close_all(&self) {
        let keys: Vec<PublicKey> = self.clients.iter().map(|entry| *entry.key()).collect();
        for pk in keys {
            if let Some((_, client)) = self.clients.remove(&pk) {
                if let Err(e) = client.close().await {
                    tracing::warn!(local_pk = %pk, error = %e, "client close failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use veil_crypto::generate_keypair;
    use veil_discovery::MemoryDiscovery;

    #[test]
    fn test_same_key_same_instance() {
        let registry = ClientRegistry::new();
        let disc: Arc<dyn DiscoveryClient> = Arc::new(MemoryDiscovery::new());
        let (pk, sk) = generate_keypair();

        let a = registry
            .get_or_create(pk, sk.clone(), Arc::clone(&disc), ClientConfig::default())
            .unwrap();
        let b = registry
            .get_or_create(pk, sk, Arc::clone(&disc), ClientConfig::default())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_get_or_create() {
        let registry = Arc::new(ClientRegistry::new());
        let disc: Arc<dyn DiscoveryClient> = Arc::new(MemoryDiscovery::new());
        let (pk, sk) = generate_keypair();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let disc = Arc::clone(&disc);
                let sk = sk.clone();
                std::thread::spawn(move || {
                    registry
                        .get_or_create(pk, sk, disc, ClientConfig::default())
                        .unwrap()
                })
            })
            .collect();
        let clients: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_create_not_inserted() {
        let registry = ClientRegistry::new();
        let disc: Arc<dyn DiscoveryClient> = Arc::new(MemoryDiscovery::new());
        let (pk, _) = generate_keypair();
        let (_, wrong_sk) = generate_keypair();

        assert!(registry
            .get_or_create(pk, wrong_sk, disc, ClientConfig::default())
            .is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_closes_clients() {
        let registry = ClientRegistry::new();
        let disc: Arc<dyn DiscoveryClient> = Arc::new(MemoryDiscovery::new());
        let (pk, sk) = generate_keypair();
        let client = registry
            .get_or_create(pk, sk, disc, ClientConfig::default())
            .unwrap();

        registry.close_all().await;
        assert!(registry.get(&pk).is_none());
        assert_eq!(client.listen(80).unwrap_err().code(), Some(ErrorCode::EntityClosed));
    }
}
