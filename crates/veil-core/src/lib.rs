//! # VEIL Core
//!
//! Relay and client roles of the VEIL protocol.
//!
//! Entities are addressed by Ed25519 public key. Clients that cannot reach
//! each other directly both keep a session open to a relay; a dialer sends
//! a signed stream request through the relay, the destination answers with
//! a signed response, and the relay splices the two streams together.
//!
//! ## Layers
//!
//! | Layer | Module |
//! |-------|--------|
//! | Relay / client roles | [`server`], [`client`] |
//! | Signed stream requests | [`request`] |
//! | Stream multiplexing | [`mux`], [`frame`] |
//! | Authenticated session | [`handshake`], [`session`] |
//! | Discovery binding | [`entity`] |
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use veil_core::{Client, ClientConfig, Server, ServerConfig};
//! use veil_crypto::generate_keypair;
//! use veil_discovery::{DiscoveryClient, MemoryDiscovery};
//!
//! # async fn run() -> veil_core::Result<()> {
//! let disc: Arc<dyn DiscoveryClient> = Arc::new(MemoryDiscovery::new());
//!
//! let (pk, sk) = generate_keypair();
//! let relay = Server::new(pk, sk, Arc::clone(&disc), ServerConfig::default())?;
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! tokio::spawn({
//!     let relay = relay.clone();
//!     async move { relay.serve(listener, None).await }
//! });
//! relay.ready().await;
//!
//! let (pk, sk) = generate_keypair();
//! let client = Client::new(pk, sk, Arc::clone(&disc), ClientConfig::default())?;
//! client.initiate_server_connections(1).await?;
//! let listener = client.listen(80)?;
//! let stream = listener.accept().await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod mux;
pub mod registry;
pub mod request;
pub mod retry;
pub mod server;
pub mod session;
pub mod splice;
pub mod stream;
mod tasks;

pub use addr::Addr;
pub use client::Client;
pub use config::{ClientConfig, Config, LoggingConfig, MuxConfig, ServerConfig};
pub use entity::EntityCommon;
pub use error::{Error, ErrorCode, Result};
pub use listener::Listener;
pub use registry::ClientRegistry;
pub use request::{SignedObject, StreamRequest, StreamResponse, TimestampTracker};
pub use retry::{RetryConfig, RetryError};
pub use server::Server;
pub use session::Session;
pub use stream::Stream;
