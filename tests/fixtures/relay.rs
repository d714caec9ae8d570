//! Single-relay fixture for integration testing
//!
//! Provides a running relay on a loopback port with an in-memory discovery
//! service, plus helpers to attach clients to it:
//! - full [`Client`]s that go through discovery
//! - raw [`Session`]s for driving the request protocol by hand
//!
//! # Example
//!
//! ```no_run
//! use veil_integration_tests::fixtures::RelayFixture;
//!
//! #[tokio::test]
//! async fn test_dial() {
//!     let fixture = RelayFixture::new().await.unwrap();
//!     let a = fixture.online_client().await.unwrap();
//!     let b = fixture.online_client().await.unwrap();
//!     let listener = b.listen(80).unwrap();
//!     // ... dial and accept ...
//!     fixture.cleanup().await.unwrap();
//! }
//! ```

use crate::test_helpers::{init_tracing, step_timeout, wait_until, within};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use veil_core::{Client, ClientConfig, Error, MuxConfig, Result, Server, ServerConfig, Session};
use veil_crypto::{SecretKey, generate_keypair};
use veil_discovery::{DiscoveryClient, MemoryDiscovery};

/// A relay serving on loopback
pub struct RelayFixture {
    /// Discovery shared by the relay and every client of the fixture
    pub discovery: Arc<MemoryDiscovery>,
    /// The relay under test
    pub relay: Server,
    /// Where the relay accepts sessions
    pub relay_addr: SocketAddr,
    serve: JoinHandle<Result<()>>,
}

impl RelayFixture {
    /// Start a relay with the default configuration
    ///
    /// # Errors
    ///
    /// Returns the error from building the relay or binding its socket.
    pub async fn new() -> Result<Self> {
        Self::with_config(ServerConfig::default()).await
    }

    /// Start a relay with `config` and wait until it is ready
    ///
    /// # Errors
    ///
    /// Returns the error from building the relay or binding its socket.
    pub async fn with_config(config: ServerConfig) -> Result<Self> {
        Self::with_discovery(Arc::new(MemoryDiscovery::new()), config).await
    }

    /// Start a relay publishing to an existing discovery service
    ///
    /// # Errors
    ///
    /// Returns the error from building the relay or binding its socket.
    pub async fn with_discovery(discovery: Arc<MemoryDiscovery>, config: ServerConfig) -> Result<Self> {
        init_tracing();
        let (pk, sk) = generate_keypair();
        let relay = Server::new(pk, sk, Arc::clone(&discovery) as Arc<dyn DiscoveryClient>, config)?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let relay_addr = listener.local_addr()?;
        let serve = tokio::spawn({
            let relay = relay.clone();
            async move { relay.serve(listener, None).await }
        });
        within("relay ready", relay.ready()).await;

        Ok(Self {
            discovery,
            relay,
            relay_addr,
            serve,
        })
    }

    /// Discovery handle as consumed by relays and clients
    pub fn discovery_handle(&self) -> Arc<dyn DiscoveryClient> {
        Arc::clone(&self.discovery) as Arc<dyn DiscoveryClient>
    }

    /// A client with a fresh identity that has not connected anywhere
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub fn new_client(&self, config: ClientConfig) -> Result<Client> {
        let (pk, sk) = generate_keypair();
        Client::new(pk, sk, self.discovery_handle(), config)
    }

    /// A client connected to the relay and published in discovery
    ///
    /// # Errors
    ///
    /// Returns the error from connecting to the relay.
    pub async fn online_client(&self) -> Result<Client> {
        self.online_client_with(ClientConfig::default()).await
    }

    /// [`RelayFixture::online_client`] with a custom configuration
    ///
    /// # Errors
    ///
    /// Returns the error from connecting to the relay.
    pub async fn online_client_with(&self, config: ClientConfig) -> Result<Client> {
        let client = self.new_client(config)?;
        client.initiate_server_connections(1).await?;
        Ok(client)
    }

    /// A bare session from `sk` to the relay, bypassing discovery
    ///
    /// # Errors
    ///
    /// Returns the connect or handshake error.
    pub async fn raw_session(&self, sk: &SecretKey) -> Result<Session> {
        let tcp = TcpStream::connect(self.relay_addr).await?;
        Session::initiate(
            tcp,
            Some(self.relay_addr),
            sk,
            self.relay.local_pk(),
            step_timeout(),
            MuxConfig::default(),
        )
        .await
    }

    /// Wait until the relay reports `n` live sessions
    pub async fn wait_for_sessions(&self, n: usize) {
        wait_until(&format!("{n} relay sessions"), || async move {
            self.relay.session_count() == n
        })
        .await;
    }

    /// Available sessions the relay currently advertises
    ///
    /// # Errors
    ///
    /// Returns the discovery error if the relay entry is missing.
    pub async fn advertised_capacity(&self) -> Result<usize> {
        let entry = self.discovery.entry(&self.relay.local_pk()).await?;
        Ok(entry.server.map_or(0, |info| info.available_sessions))
    }

    /// Wait until the relay advertises `n` available sessions
    pub async fn wait_for_capacity(&self, n: usize) {
        wait_until(&format!("advertised capacity {n}"), || async move {
            self.advertised_capacity().await.ok() == Some(n)
        })
        .await;
    }

    /// Close the relay and wait for `serve` to return
    ///
    /// # Errors
    ///
    /// Returns the error `serve` ended with.
    pub async fn cleanup(self) -> Result<()> {
        self.relay.close().await?;
        within("relay serve to return", self.serve)
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}
