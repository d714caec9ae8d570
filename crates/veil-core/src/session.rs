//! Authenticated, multiplexed sessions.

use crate::config::MuxConfig;
use crate::error::Result;
use crate::handshake;
use crate::mux::{Mux, MuxStream};
use crate::request::TimestampTracker;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use veil_crypto::{PublicKey, SecretKey};

/// One encrypted connection to a peer entity, carrying many streams
///
/// A session exists only after a successful handshake, so `remote_pk` is
/// always authenticated.
pub struct Session {
    remote_pk: PublicKey,
    remote_tcp: Option<SocketAddr>,
    mux: Mux,
    tracker: TimestampTracker,
}

impl Session {
    /// Run the responder handshake over `io`
    ///
    /// # Errors
    ///
    /// Returns the handshake error; nothing is registered on failure.
    pub async fn respond<T>(
        io: T,
        remote_tcp: Option<SocketAddr>,
        sk: &SecretKey,
        timeout: Duration,
        mux: MuxConfig,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let established = handshake::respond(io, sk, timeout).await?;
        Ok(Self::from_parts(established, false, remote_tcp, mux))
    }

    /// Run the initiator handshake over `io`, requiring the peer to be
    /// `expected`
    ///
    /// # Errors
    ///
    /// Returns the handshake error.
    pub async fn initiate<T>(
        io: T,
        remote_tcp: Option<SocketAddr>,
        sk: &SecretKey,
        expected: PublicKey,
        timeout: Duration,
        mux: MuxConfig,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let established = handshake::initiate(io, sk, Some(expected), timeout).await?;
        Ok(Self::from_parts(established, true, remote_tcp, mux))
    }

    fn from_parts<T>(
        established: handshake::Established<T>,
        initiator: bool,
        remote_tcp: Option<SocketAddr>,
        mux: MuxConfig,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let remote_pk = established.remote_pk;
        Self {
            remote_pk,
            remote_tcp,
            mux: Mux::new(established, initiator, mux),
            tracker: TimestampTracker::new(),
        }
    }

    /// Authenticated key of the peer
    #[must_use]
    pub fn remote_pk(&self) -> PublicKey {
        self.remote_pk
    }

    /// Peer's TCP address, when known
    #[must_use]
    pub fn remote_tcp(&self) -> Option<SocketAddr> {
        self.remote_tcp
    }

    /// Anti-replay state for requests arriving on this session
    #[must_use]
    pub fn tracker(&self) -> &TimestampTracker {
        &self.tracker
    }

    /// Open an outgoing stream
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorCode::SessionClosed`] once closed.
    pub fn open_stream(&self) -> Result<MuxStream> {
        self.mux.open_stream()
    }

    /// Wait for an incoming stream
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorCode::SessionClosed`] once closed.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        self.mux.accept_stream().await
    }

    /// Close the connection and every stream on it
    pub fn close(&self) {
        self.mux.close();
    }

    /// Whether the connection has closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Resolve once the connection has closed
    pub async fn closed(&self) {
        self.mux.closed().await;
    }

    /// Streams currently open
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.mux.stream_count()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_pk", &self.remote_pk)
            .field("remote_tcp", &self.remote_tcp)
            .field("closed", &self.is_closed())
            .finish()
    }
}
