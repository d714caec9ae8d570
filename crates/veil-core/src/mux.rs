//! Stream multiplexer over one encrypted session.
//!
//! A [`Mux`] owns two tasks: a reader that decrypts records, decodes
//! [`Frame`]s and dispatches them to streams, and a writer that drains a
//! queue of outgoing frames. Streams opened by the handshake initiator use
//! odd ids, streams opened by the responder use even ids.
//!
//! Flow control is per stream and credit based. Both sides start with
//! [`BASE_WINDOW`] bytes of send credit; a receiver configured with a larger
//! window grants the difference right after the stream is created, and
//! returns credit with `Window` frames as the application consumes data.

use crate::config::MuxConfig;
use crate::error::{ErrorCode, Result};
use crate::frame::{Frame, FrameType};
use crate::handshake::{Established, SecureReader, SecureWriter};
use crate::tasks::wait_done;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Send credit every stream starts with
pub const BASE_WINDOW: u32 = 256 * 1024;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct RecvState {
    buf: VecDeque<u8>,
    fin: bool,
    /// Credit still granted to the peer
    window: u32,
    /// Consumed bytes not yet returned as credit
    unacked: u32,
    waker: Option<Waker>,
}

#[derive(Default)]
struct SendState {
    window: u32,
    fin_sent: bool,
    waker: Option<Waker>,
}

#[derive(Default)]
struct StreamState {
    recv: RecvState,
    send: SendState,
    reset: bool,
}

struct StreamShared {
    state: Mutex<StreamState>,
}

impl StreamShared {
    fn new(receive_window: u32) -> Self {
        let mut state = StreamState::default();
        state.recv.window = receive_window;
        state.send.window = BASE_WINDOW;
        Self {
            state: Mutex::new(state),
        }
    }

    /// Queue received data; false if the peer overran its credit
    fn push_data(&self, data: Vec<u8>) -> bool {
        let mut st = lock(&self.state);
        if st.reset || st.recv.fin {
            return true;
        }
        let Ok(len) = u32::try_from(data.len()) else {
            return false;
        };
        if len > st.recv.window {
            return false;
        }
        st.recv.window -= len;
        st.recv.buf.extend(data);
        if let Some(waker) = st.recv.waker.take() {
            waker.wake();
        }
        true
    }

    fn remote_fin(&self) {
        let mut st = lock(&self.state);
        st.recv.fin = true;
        if let Some(waker) = st.recv.waker.take() {
            waker.wake();
        }
    }

    fn add_credit(&self, credit: u32) {
        let mut st = lock(&self.state);
        st.send.window = st.send.window.saturating_add(credit);
        if let Some(waker) = st.send.waker.take() {
            waker.wake();
        }
    }

    fn reset(&self) {
        let mut st = lock(&self.state);
        st.reset = true;
        if let Some(waker) = st.recv.waker.take() {
            waker.wake();
        }
        if let Some(waker) = st.send.waker.take() {
            waker.wake();
        }
    }
}

struct MuxInner {
    initiator: bool,
    config: MuxConfig,
    /// Also guards the closed transition, so no stream is added after close
    streams: Mutex<StreamTable>,
    frames: mpsc::UnboundedSender<Frame>,
    closed: watch::Sender<bool>,
    next_id: AtomicU32,
}

#[derive(Default)]
struct StreamTable {
    closed: bool,
    streams: HashMap<u32, Arc<StreamShared>>,
}

impl MuxInner {
    fn send(&self, frame: Frame) -> bool {
        self.frames.send(frame).is_ok()
    }

    fn is_local_id(&self, id: u32) -> bool {
        (id % 2 == 1) == self.initiator
    }

    fn get(&self, id: u32) -> Option<Arc<StreamShared>> {
        lock(&self.streams).streams.get(&id).cloned()
    }

    fn remove(&self, id: u32) -> Option<Arc<StreamShared>> {
        lock(&self.streams).streams.remove(&id)
    }

    /// Register a stream; `None` once the connection is closed
    fn insert(&self, id: u32) -> Option<Arc<StreamShared>> {
        let mut table = lock(&self.streams);
        if table.closed || table.streams.contains_key(&id) {
            return None;
        }
        let shared = Arc::new(StreamShared::new(self.config.receive_window));
        table.streams.insert(id, Arc::clone(&shared));
        Some(shared)
    }

    fn grant_extra_window(&self, id: u32) {
        let extra = self.config.receive_window.saturating_sub(BASE_WINDOW);
        if extra > 0 {
            self.send(Frame::window(id, extra));
        }
    }

    /// Tear down the connection: reset every stream and stop the writer.
    /// Returns false if it was already closed.
    fn shutdown(&self, go_away: bool) -> bool {
        let streams = {
            let mut table = lock(&self.streams);
            if table.closed {
                return false;
            }
            table.closed = true;
            std::mem::take(&mut table.streams)
        };
        if go_away {
            self.send(Frame::go_away());
        }
        for shared in streams.values() {
            shared.reset();
        }
        self.closed.send_replace(true);
        true
    }

    fn accept_remote(self: &Arc<Self>, id: u32, accept_tx: &mpsc::Sender<MuxStream>) {
        if id == 0 || self.is_local_id(id) {
            tracing::warn!(stream_id = id, "peer opened stream with invalid id");
            self.send(Frame::reset(id));
            return;
        }
        let Some(shared) = self.insert(id) else {
            self.send(Frame::reset(id));
            return;
        };
        self.grant_extra_window(id);

        let stream = MuxStream {
            id,
            shared,
            mux: Arc::clone(self),
        };
        // A refused stream is dropped here, which resets it.
        if accept_tx.try_send(stream).is_err() {
            tracing::debug!(stream_id = id, "accept backlog full, resetting stream");
        }
    }

    /// Handle one frame; false ends the connection
    fn dispatch(self: &Arc<Self>, frame: Frame, accept_tx: &mpsc::Sender<MuxStream>) -> bool {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Open => self.accept_remote(id, accept_tx),
            FrameType::Data => {
                if let Some(shared) = self.get(id) {
                    if !shared.push_data(frame.payload) {
                        tracing::warn!(stream_id = id, "peer exceeded stream window");
                        self.remove(id);
                        shared.reset();
                        self.send(Frame::reset(id));
                    }
                }
            }
            FrameType::Fin => {
                if let Some(shared) = self.get(id) {
                    shared.remote_fin();
                }
            }
            FrameType::Reset => {
                if let Some(shared) = self.remove(id) {
                    shared.reset();
                }
            }
            FrameType::Window => match frame.window_credit() {
                Ok(credit) => {
                    if let Some(shared) = self.get(id) {
                        shared.add_credit(credit);
                    }
                }
                Err(e) => {
                    tracing::warn!(stream_id = id, error = %e, "malformed window frame");
                    return false;
                }
            },
            FrameType::GoAway => {
                tracing::debug!("peer sent go-away");
                return false;
            }
        }
        true
    }
}

async fn read_loop<R>(
    mut reader: SecureReader<R>,
    inner: Arc<MuxInner>,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let record = match reader.read_record().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!("connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                break;
            }
        };
        let frame = match Frame::decode(&record) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "malformed frame, closing connection");
                break;
            }
        };
        if !inner.dispatch(frame, &accept_tx) {
            break;
        }
    }
    inner.shutdown(false);
}

async fn write_loop<W>(
    mut writer: SecureWriter<W>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut closed: watch::Receiver<bool>,
    inner: Arc<MuxInner>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_record(&frame.encode()).await {
                    tracing::debug!(error = %e, "connection write failed");
                    inner.shutdown(false);
                    return;
                }
            }
            () = wait_done(&mut closed) => break,
        }
    }

    // Flush whatever was queued before the close, then end the transport.
    let drain = async {
        while let Ok(frame) = frames.try_recv() {
            if writer.write_record(&frame.encode()).await.is_err() {
                return;
            }
        }
        let _ = writer.shutdown().await;
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
}

/// Stream multiplexer for one session
pub struct Mux {
    inner: Arc<MuxInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    reader: JoinHandle<()>,
}

impl Mux {
    /// Start multiplexing over an established session
    pub fn new<T>(established: Established<T>, initiator: bool, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);

        let inner = Arc::new(MuxInner {
            initiator,
            config,
            streams: Mutex::new(StreamTable::default()),
            frames: frame_tx,
            closed: closed_tx,
            next_id: AtomicU32::new(if initiator { 1 } else { 2 }),
        });

        let reader = tokio::spawn(read_loop(
            established.reader,
            Arc::clone(&inner),
            accept_tx,
        ));
        tokio::spawn(write_loop(
            established.writer,
            frame_rx,
            closed_rx,
            Arc::clone(&inner),
        ));

        Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            reader,
        }
    }

    /// Open a new outgoing stream
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::SessionClosed`] if the connection is closed.
    pub fn open_stream(&self) -> Result<MuxStream> {
        let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
        let shared = self
            .inner
            .insert(id)
            .ok_or(ErrorCode::SessionClosed)?;
        self.inner.send(Frame::open(id));
        self.inner.grant_extra_window(id);
        Ok(MuxStream {
            id,
            shared,
            mux: Arc::clone(&self.inner),
        })
    }

    /// Wait for the peer to open a stream
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::SessionClosed`] once the connection is closed.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ErrorCode::SessionClosed.into())
    }

    /// Close the connection, resetting every open stream
    pub fn close(&self) {
        if self.inner.shutdown(true) {
            tracing::debug!("multiplexer closed");
        }
        self.reader.abort();
    }

    /// Whether the connection has closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolve once the connection has closed
    pub async fn closed(&self) {
        wait_done(&mut self.inner.closed.subscribe()).await;
    }

    /// Number of streams currently open
    #[must_use]
    pub fn stream_count(&self) -> usize {
        lock(&self.inner.streams).streams.len()
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.close();
    }
}

/// One multiplexed bidirectional byte stream
///
/// Dropping a stream that has not finished in both directions resets it.
pub struct MuxStream {
    id: u32,
    shared: Arc<StreamShared>,
    mux: Arc<MuxInner>,
}

impl MuxStream {
    /// Multiplexer-assigned stream id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.id).finish()
    }
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut st = lock(&this.shared.state);

        if !st.recv.buf.is_empty() {
            let n = buf.remaining().min(st.recv.buf.len());
            let chunk: Vec<u8> = st.recv.buf.drain(..n).collect();
            buf.put_slice(&chunk);

            st.recv.unacked += n as u32;
            if st.recv.unacked >= this.mux.config.receive_window / 2 && !st.recv.fin && !st.reset
            {
                let credit = std::mem::take(&mut st.recv.unacked);
                st.recv.window += credit;
                this.mux.send(Frame::window(this.id, credit));
            }
            return Poll::Ready(Ok(()));
        }
        if st.recv.fin {
            return Poll::Ready(Ok(()));
        }
        if st.reset {
            return Poll::Ready(Err(reset_error()));
        }
        st.recv.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut st = lock(&this.shared.state);

        if st.reset {
            return Poll::Ready(Err(reset_error()));
        }
        if st.send.fin_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if st.send.window == 0 {
            st.send.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = data
            .len()
            .min(st.send.window as usize)
            .min(this.mux.config.max_frame_payload);
        st.send.window -= n as u32;
        if !this.mux.send(Frame::data(this.id, data[..n].to_vec())) {
            return Poll::Ready(Err(reset_error()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut st = lock(&this.shared.state);
        if !st.send.fin_sent && !st.reset {
            st.send.fin_sent = true;
            this.mux.send(Frame::fin(this.id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let finished = {
            let st = lock(&self.shared.state);
            st.reset || (st.send.fin_sent && st.recv.fin)
        };
        self.mux.remove(self.id);
        if !finished {
            self.mux.send(Frame::reset(self.id));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handshake;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use veil_crypto::generate_keypair;

    const TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) async fn mux_pair(config: MuxConfig) -> (Mux, Mux) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (_, sk_a) = generate_keypair();
        let (_, sk_b) = generate_keypair();
        let (init, resp) = tokio::join!(
            handshake::initiate(a, &sk_a, None, TIMEOUT),
            handshake::respond(b, &sk_b, TIMEOUT)
        );
        (
            Mux::new(init.unwrap(), true, config.clone()),
            Mux::new(resp.unwrap(), false, config),
        )
    }

    #[tokio::test]
    async fn test_open_accept_exchange() {
        let (a, b) = mux_pair(MuxConfig::default()).await;

        let mut s1 = a.open_stream().unwrap();
        assert_eq!(s1.id(), 1);
        s1.write_all(b"ping").await.unwrap();

        let mut s2 = b.accept_stream().await.unwrap();
        assert_eq!(s2.id(), 1);
        let mut buf = [0u8; 4];
        s2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        s2.write_all(b"pong").await.unwrap();
        s2.shutdown().await.unwrap();
        let mut reply = Vec::new();
        s1.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn test_stream_ids_by_role() {
        let (a, b) = mux_pair(MuxConfig::default()).await;
        assert_eq!(a.open_stream().unwrap().id(), 1);
        assert_eq!(a.open_stream().unwrap().id(), 3);
        assert_eq!(b.open_stream().unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_flow_control_large_transfer() {
        let (a, b) = mux_pair(MuxConfig::default()).await;
        let payload: Vec<u8> = (0..(BASE_WINDOW as usize * 4)).map(|i| i as u8).collect();
        let expected = payload.clone();

        let mut tx = a.open_stream().unwrap();
        let writer = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            tx.shutdown().await.unwrap();
            tx
        });

        let mut rx = b.accept_stream().await.unwrap();
        let mut received = Vec::new();
        tokio::time::timeout(TIMEOUT, rx.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_larger_receive_window_granted() {
        let config = MuxConfig {
            receive_window: BASE_WINDOW * 2,
            ..MuxConfig::default()
        };
        let (a, b) = mux_pair(config).await;
        let payload = vec![7u8; BASE_WINDOW as usize + 1024];

        let mut tx = a.open_stream().unwrap();
        let _rx = b.accept_stream().await.unwrap();
        // Fits in the granted window without the receiver reading.
        tokio::time::timeout(TIMEOUT, tx.write_all(&payload))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_streams_are_independent() {
        let (a, b) = mux_pair(MuxConfig::default()).await;

        let mut streams = Vec::new();
        for i in 0..8u8 {
            let mut s = a.open_stream().unwrap();
            s.write_all(&[i; 1000]).await.unwrap();
            s.shutdown().await.unwrap();
            streams.push(s);
        }
        for _ in 0..8 {
            let mut s = b.accept_stream().await.unwrap();
            let mut data = Vec::new();
            s.read_to_end(&mut data).await.unwrap();
            assert_eq!(data.len(), 1000);
            let tag = ((s.id() - 1) / 2) as u8;
            assert!(data.iter().all(|&x| x == tag));
        }
    }

    #[tokio::test]
    async fn test_accept_backlog_overflow_resets() {
        let config = MuxConfig {
            accept_backlog: 1,
            ..MuxConfig::default()
        };
        let (a, _b) = mux_pair(config).await;

        let _queued = a.open_stream().unwrap();
        let mut refused = a.open_stream().unwrap();
        let mut buf = [0u8; 1];
        let err = tokio::time::timeout(TIMEOUT, refused.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_dropped_stream_resets_peer() {
        let (a, b) = mux_pair(MuxConfig::default()).await;

        let s1 = a.open_stream().unwrap();
        let mut s2 = b.accept_stream().await.unwrap();
        drop(s1);

        let mut buf = [0u8; 1];
        let err = tokio::time::timeout(TIMEOUT, s2.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(a.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_data_before_reset_is_delivered() {
        let (a, b) = mux_pair(MuxConfig::default()).await;

        let mut s1 = a.open_stream().unwrap();
        s1.write_all(b"last words").await.unwrap();
        drop(s1);

        let mut s2 = b.accept_stream().await.unwrap();
        let mut buf = [0u8; 10];
        s2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"last words");
    }

    #[tokio::test]
    async fn test_close_resets_streams_both_sides() {
        let (a, b) = mux_pair(MuxConfig::default()).await;

        let mut s1 = a.open_stream().unwrap();
        let mut s2 = b.accept_stream().await.unwrap();

        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(s1.write_all(b"x").await.is_err());
        assert!(a.open_stream().is_err());

        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(TIMEOUT, s2.read(&mut buf)).await.unwrap();
        assert!(result.is_err());
        tokio::time::timeout(TIMEOUT, b.closed()).await.unwrap();
        assert_eq!(
            b.accept_stream().await.unwrap_err().code(),
            Some(ErrorCode::SessionClosed)
        );
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let (a, _b) = mux_pair(MuxConfig::default()).await;
        let mut s = a.open_stream().unwrap();
        s.shutdown().await.unwrap();
        assert_eq!(
            s.write_all(b"late").await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mux_moves_across_worker_threads() {
        let (a, b) = mux_pair(MuxConfig::default()).await;
        let mut s1 = a.open_stream().unwrap();

        let peer = tokio::spawn(async move {
            let mut s2 = b.accept_stream().await.unwrap();
            let mut buf = [0u8; 5];
            s2.read_exact(&mut buf).await.unwrap();
            b.close();
            b.closed().await;
            buf
        });

        s1.write_all(b"hello").await.unwrap();
        let received = tokio::time::timeout(TIMEOUT, peer).await.unwrap().unwrap();
        assert_eq!(&received, b"hello");
        tokio::time::timeout(TIMEOUT, a.closed()).await.unwrap();
    }
}
