//! State shared by relays and clients: identity, discovery binding and the
//! live session map.

use crate::error::{Error, Result};
use crate::session::Session;
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use veil_crypto::{PublicKey, SecretKey};
use veil_discovery::{ClientInfo, DiscoveryClient, DiscoveryError, Entry, ServerInfo};

/// Identity, discovery handle and sessions of one entity
pub struct EntityCommon {
    pk: PublicKey,
    sk: SecretKey,
    discovery: Arc<dyn DiscoveryClient>,
    discovery_timeout: Duration,
    sessions: RwLock<HashMap<PublicKey, Arc<Session>>>,
    /// Last entry this entity published
    entry: Mutex<Option<Entry>>,
    span: tracing::Span,
}

impl EntityCommon {
    /// Bind a key pair to a discovery service
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `sk` does not derive `pk`.
    pub fn new(
        pk: PublicKey,
        sk: SecretKey,
        discovery: Arc<dyn DiscoveryClient>,
        discovery_timeout: Duration,
    ) -> Result<Self> {
        sk.check_pair(&pk)
            .map_err(|e| Error::Config(format!("secret key does not match public key: {e}").into()))?;
        pk.validate()
            .map_err(|e| Error::Config(format!("invalid public key: {e}").into()))?;
        Ok(Self {
            pk,
            sk,
            discovery,
            discovery_timeout,
            sessions: RwLock::new(HashMap::new()),
            entry: Mutex::new(None),
            span: tracing::info_span!("entity", local_pk = %pk),
        })
    }

    /// Public key of this entity
    #[must_use]
    pub fn pk(&self) -> PublicKey {
        self.pk
    }

    /// Secret key of this entity
    #[must_use]
    pub fn sk(&self) -> &SecretKey {
        &self.sk
    }

    /// Span carrying `local_pk`, for instrumenting this entity's tasks
    #[must_use]
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Discovery service handle
    #[must_use]
    pub fn discovery(&self) -> &Arc<dyn DiscoveryClient> {
        &self.discovery
    }

    /// Run a discovery call under the configured timeout
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or the discovery error.
    pub async fn with_discovery<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = veil_discovery::Result<T>>,
    {
        tokio::time::timeout(self.discovery_timeout, call)
            .await
            .map_err(|_| Error::Timeout("discovery request".into()))?
            .map_err(Error::from)
    }

    /// Register a live session
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionConflict`] if a session for the same remote
    /// key is already registered; callers evict it first.
    pub async fn register_session(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.entry(session.remote_pk()) {
            MapEntry::Occupied(_) => Err(Error::SessionConflict(session.remote_pk())),
            MapEntry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Remove whatever session is registered for `pk`
    pub async fn remove_session(&self, pk: &PublicKey) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(pk)
    }

    /// Remove `session` only if it is still the registered one
    pub async fn remove_session_if(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.remote_pk()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.remote_pk());
                true
            }
            _ => false,
        }
    }

    /// Session with `pk`, if one is live
    pub async fn session(&self, pk: &PublicKey) -> Option<Arc<Session>> {
        self.sessions.read().await.get(pk).cloned()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remote keys of all live sessions
    pub async fn session_keys(&self) -> Vec<PublicKey> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Empty the session map, returning what was in it
    pub async fn take_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect()
    }

    /// Publish this entity as a relay reachable at `address`
    ///
    /// # Errors
    ///
    /// Returns the discovery error; retrying is up to the caller.
    pub async fn update_server_entry(&self, address: &str, available_sessions: usize) -> Result<()> {
        let info = ServerInfo {
            address: address.to_string(),
            available_sessions,
        };
        self.upsert_entry(|current| match current {
            Some(mut entry) => {
                entry.server = Some(info);
                entry
            }
            None => Entry::new_server(self.pk, info.address, info.available_sessions),
        })
        .await
    }

    /// Publish this entity as a client reachable through `delegated_servers`
    ///
    /// # Errors
    ///
    /// Returns the discovery error; retrying is up to the caller.
    pub async fn update_client_entry(&self, delegated_servers: Vec<PublicKey>) -> Result<()> {
        self.upsert_entry(|current| match current {
            Some(mut entry) => {
                entry.client = Some(ClientInfo { delegated_servers });
                entry
            }
            None => Entry::new_client(self.pk, delegated_servers),
        })
        .await
    }

    async fn upsert_entry<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(Option<Entry>) -> Entry,
    {
        let mut cached = self.entry.lock().await;

        let current = match cached.clone() {
            Some(entry) => Some(entry),
            None => match self.with_discovery(self.discovery.entry(&self.pk)).await {
                Ok(entry) => Some(entry),
                Err(Error::Discovery(DiscoveryError::EntryNotFound)) => None,
                Err(e) => return Err(e),
            },
        };

        let is_update = current.is_some();
        let mut entry = build(current);
        if is_update {
            entry.advance();
        }
        entry.sign(&self.sk);

        let result = if is_update {
            self.with_discovery(self.discovery.put_entry(&entry)).await
        } else {
            self.with_discovery(self.discovery.post_entry(&entry)).await
        };

        match result {
            Ok(()) => {
                tracing::debug!(parent: &self.span, seq = entry.sequence, "discovery entry published");
                *cached = Some(entry);
                Ok(())
            }
            Err(e) => {
                // Refetch next time in case the service state moved on.
                *cached = None;
                Err(e)
            }
        }
    }
}
