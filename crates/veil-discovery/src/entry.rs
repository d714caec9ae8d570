//! Signed discovery entries.

use crate::{DiscoveryError, ENTRY_VERSION, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use veil_crypto::{PublicKey, SecretKey, Signature};

/// Reachability of a relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Address clients dial over TCP (`host:port`)
    pub address: String,
    /// Session slots the relay still advertises
    pub available_sessions: usize,
}

/// Reachability of a client
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Relays the client currently holds sessions with
    pub delegated_servers: Vec<PublicKey>,
}

/// One entity's discovery record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry format version
    pub version: String,
    /// Incremented by one on every update
    pub sequence: u64,
    /// Unix time of the last update, in nanoseconds
    pub timestamp: i64,
    /// Owner of the entry
    pub static_pk: PublicKey,
    /// Present when the owner is a relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    /// Present when the owner is a client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Owner's signature over every other field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

impl Entry {
    /// New unsigned relay entry at sequence 0
    #[must_use]
    pub fn new_server(pk: PublicKey, address: String, available_sessions: usize) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence: 0,
            timestamp: unix_nanos(),
            static_pk: pk,
            server: Some(ServerInfo {
                address,
                available_sessions,
            }),
            client: None,
            signature: None,
        }
    }

    /// New unsigned client entry at sequence 0
    #[must_use]
    pub fn new_client(pk: PublicKey, delegated_servers: Vec<PublicKey>) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence: 0,
            timestamp: unix_nanos(),
            static_pk: pk,
            server: None,
            client: Some(ClientInfo { delegated_servers }),
            signature: None,
        }
    }

    /// Prepare the entry for the next update: bump sequence and timestamp
    /// and drop the now stale signature.
    pub fn advance(&mut self) {
        self.sequence += 1;
        self.timestamp = unix_nanos().max(self.timestamp + 1);
        self.signature = None;
    }

    /// Canonical bytes covered by the signature
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Serialization`] if encoding fails.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = Entry {
            signature: None,
            ..self.clone()
        };
        serde_json::to_vec(&unsigned).map_err(|e| DiscoveryError::Serialization(e.to_string()))
    }

    /// Sign the entry with the owner's secret key
    ///
    /// Signing an entry that cannot be encoded leaves it unsigned; such an
    /// entry is then rejected by [`Entry::verify`].
    pub fn sign(&mut self, sk: &SecretKey) {
        self.signature = self.signing_bytes().ok().map(|bytes| sk.sign(&bytes));
    }

    /// Check structure and signature
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidEntry`] for structural problems and
    /// [`DiscoveryError::InvalidSignature`] if the signature is missing or
    /// does not verify against `static_pk`.
    pub fn verify(&self) -> Result<()> {
        if self.server.is_none() && self.client.is_none() {
            return Err(DiscoveryError::InvalidEntry(
                "entry has neither server nor client info".to_string(),
            ));
        }
        if let Some(server) = &self.server {
            if server.address.is_empty() {
                return Err(DiscoveryError::InvalidEntry(
                    "server entry has empty address".to_string(),
                ));
            }
        }
        let sig = self.signature.ok_or(DiscoveryError::InvalidSignature)?;
        self.static_pk
            .verify(&self.signing_bytes()?, &sig)
            .map_err(|_| DiscoveryError::InvalidSignature)
    }

    /// Whether this entry describes a relay
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    /// Whether this entry describes a client
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.client.is_some()
    }
}
