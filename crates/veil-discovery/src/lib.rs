//! # VEIL Discovery
//!
//! Discovery layer for the VEIL relay protocol.
//!
//! Discovery maps an entity's public key to its reachability:
//! - relays publish their listening address and how many session slots
//!   they still have available
//! - clients publish which relays they have delegated (are connected to)
//!
//! Entries are signed by their owner and carry a strictly increasing
//! sequence number, so the discovery service itself does not need to be
//! trusted to keep them intact.
//!
//! The storage and transport of a discovery service are external to this
//! crate; [`DiscoveryClient`] is the interface the relay and client roles
//! consume, and [`MemoryDiscovery`] is an in-process implementation.
//!
//! ## Example
//!
//! ```
//! use veil_crypto::generate_keypair;
//! use veil_discovery::{DiscoveryClient, Entry, MemoryDiscovery};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), veil_discovery::DiscoveryError> {
//! let (pk, sk) = generate_keypair();
//! let disc = MemoryDiscovery::new();
//!
//! let mut entry = Entry::new_server(pk, "127.0.0.1:8080".to_string(), 100);
//! entry.sign(&sk);
//! disc.post_entry(&entry).await?;
//!
//! let found = disc.entry(&pk).await?;
//! assert_eq!(found.server.unwrap().available_sessions, 100);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod entry;
pub mod error;
pub mod memory;

pub use client::DiscoveryClient;
pub use entry::{ClientInfo, Entry, ServerInfo};
pub use error::{DiscoveryError, Result};
pub use memory::MemoryDiscovery;

/// Entry format version written by this crate
pub const ENTRY_VERSION: &str = "0.0.1";
