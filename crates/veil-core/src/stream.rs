//! Application-facing streams.

use crate::addr::Addr;
use crate::mux::MuxStream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bidirectional byte stream between two public-key addresses, relayed
/// through a session
///
/// Shutting down the write half sends end-of-stream to the peer; dropping
/// the stream closes both directions.
pub struct Stream {
    inner: MuxStream,
    local: Addr,
    remote: Addr,
}

impl Stream {
    pub(crate) fn new(inner: MuxStream, local: Addr, remote: Addr) -> Self {
        Self {
            inner,
            local,
            remote,
        }
    }

    /// This end's address
    #[must_use]
    pub fn local_addr(&self) -> Addr {
        self.local
    }

    /// The other end's address
    #[must_use]
    pub fn remote_addr(&self) -> Addr {
        self.remote
    }

    /// Id of the underlying multiplexed stream
    #[must_use]
    pub fn stream_id(&self) -> u32 {
        self.inner.id()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("stream_id", &self.inner.id())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
