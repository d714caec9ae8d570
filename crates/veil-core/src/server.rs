//! Relay server.
//!
//! A relay accepts sessions from clients, advertises itself in discovery and
//! forwards stream requests between the clients it holds sessions with.
//! Once the destination accepts, the two streams are spliced and the relay
//! copies bytes without looking at them.

use crate::config::ServerConfig;
use crate::entity::EntityCommon;
use crate::error::{Error, ErrorCode, Result};
use crate::mux::MuxStream;
use crate::request::{SignedObject, StreamRequest, StreamResponse, read_object, timed, write_object};
use crate::retry::{RetryError, retry};
use crate::session::Session;
use crate::splice::splice;
use crate::tasks::{TaskGroup, wait_done};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OnceCell, watch};
use tracing::Instrument;
use veil_crypto::{PublicKey, SecretKey};
use veil_discovery::DiscoveryClient;

/// Relay server
///
/// Cloning yields another handle to the same relay.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    entity: EntityCommon,
    config: ServerConfig,
    tasks: TaskGroup,
    serving: AtomicBool,
    ready: watch::Sender<bool>,
    session_count: watch::Sender<usize>,
    closed: OnceCell<()>,
}

impl Server {
    /// Create a relay with the given identity and discovery service
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or the key
    /// pair does not match.
    pub fn new(
        pk: PublicKey,
        sk: SecretKey,
        discovery: Arc<dyn DiscoveryClient>,
        config: ServerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let entity = EntityCommon::new(pk, sk, discovery, config.discovery_timeout())?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                entity,
                config,
                tasks: TaskGroup::new(),
                serving: AtomicBool::new(false),
                ready: watch::channel(false).0,
                session_count: watch::channel(0).0,
                closed: OnceCell::new(),
            }),
        })
    }

    /// Public key of this relay
    #[must_use]
    pub fn local_pk(&self) -> PublicKey {
        self.inner.entity.pk()
    }

    /// Configuration this relay runs with
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        *self.inner.session_count.borrow()
    }

    /// Whether a session with `pk` is live
    pub async fn has_session(&self, pk: &PublicKey) -> bool {
        self.inner.entity.session(pk).await.is_some()
    }

    /// Accept sessions on `listener` until [`Server::close`] is called
    ///
    /// The relay is published in discovery at `advertised_addr`, or at the
    /// listener's local address if none is given. Publishing happens before
    /// the first accept; [`Server::ready`] resolves once it has.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::EntityClosed`] if the relay is already closed,
    /// [`Error::Config`] if it is already serving, the discovery error if
    /// the first publish fails, and the I/O error if accepting fails.
    pub async fn serve(&self, listener: TcpListener, advertised_addr: Option<String>) -> Result<()> {
        let inner = &self.inner;
        if inner.tasks.is_done() {
            return Err(ErrorCode::EntityClosed.into());
        }
        if inner.serving.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("relay is already serving".into()));
        }

        let span = inner.entity.span().clone();
        let address = match advertised_addr {
            Some(address) => address,
            None => listener.local_addr()?.to_string(),
        };
        let max_sessions = inner.config.max_sessions;
        tracing::info!(parent: &span, %address, max_sessions, "relay serving");

        let entity = &inner.entity;
        let addr = address.as_str();
        retry(
            &inner.config.update_retry,
            inner.tasks.subscribe(),
            "publish relay entry",
            move || entity.update_server_entry(addr, max_sessions),
        )
        .await
        .map_err(|e| {
            inner.serving.store(false, Ordering::SeqCst);
            e.into_error()
        })?;

        let updater = update_loop(Arc::clone(inner), address.clone()).instrument(span.clone());
        if !inner.tasks.spawn(updater) {
            return Ok(());
        }
        inner.ready.send_replace(true);

        let mut done = inner.tasks.subscribe();
        loop {
            let accepted = tokio::select! {
                () = wait_done(&mut done) => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((tcp, remote_tcp)) => {
                    let sessions = inner.entity.session_count().await;
                    if sessions >= max_sessions {
                        tracing::debug!(
                            parent: &span,
                            %remote_tcp,
                            sessions,
                            max_sessions,
                            "over advertised capacity, accepting anyway"
                        );
                    }
                    let conn_span = tracing::info_span!(
                        parent: &span,
                        "session",
                        %remote_tcp,
                        remote_pk = tracing::field::Empty
                    );
                    let task = handle_connection(Arc::clone(inner), tcp, remote_tcp).instrument(conn_span);
                    if !inner.tasks.spawn(task) {
                        return Ok(());
                    }
                }
                Err(e) => {
                    if inner.tasks.is_done() {
                        return Ok(());
                    }
                    tracing::error!(parent: &span, error = %e, "accept failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Resolve once the relay is published and accepting
    ///
    /// Never resolves if [`Server::serve`] fails before that point.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Whether the relay is published and accepting
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Stop accepting, close every session and wait for background tasks
    ///
    /// Safe to call any number of times, concurrently or not; every call
    /// returns once shutdown has completed.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for shutdown errors.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.get_or_init(|| self.inner.shutdown()).await;
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_pk", &self.local_pk())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl ServerInner {
    async fn shutdown(&self) {
        tracing::info!(parent: self.entity.span(), "relay closing");
        self.tasks.signal();
        for session in self.entity.take_sessions().await {
            session.close();
        }
        self.tasks.drain().await;
        self.session_count.send_replace(0);
        tracing::info!(parent: self.entity.span(), "relay closed");
    }

    async fn publish_session_count(&self) {
        let count = self.entity.session_count().await;
        self.session_count.send_replace(count);
    }

    /// Answer `request` on `src` with a rejection signed by this relay
    async fn reject(&self, src: &mut MuxStream, request: &SignedObject, err: &Error) {
        let Some(code) = err.code() else {
            return;
        };
        let resp = StreamResponse::reject(request.hash(), code);
        match SignedObject::sign_response(&resp, self.entity.sk()) {
            Ok(obj) => {
                if let Err(e) = write_object(src, &obj).await {
                    tracing::debug!(error = %e, "could not deliver rejection");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not sign rejection"),
        }
    }
}

/// Republish the advertised capacity whenever the session count changes
///
/// A round that exhausts its retries is tried again after the policy's
/// maximum backoff, so the entry converges without further count changes.
async fn update_loop(inner: Arc<ServerInner>, address: String) {
    let mut counts = inner.session_count.subscribe();
    let mut done = inner.tasks.subscribe();
    let entity = &inner.entity;
    let max_sessions = inner.config.max_sessions;
    let retry_after = Duration::from_millis(inner.config.update_retry.max_backoff_ms);
    let mut pending = false;

    loop {
        tokio::select! {
            () = wait_done(&mut done) => return,
            changed = counts.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = tokio::time::sleep(retry_after), if pending => {}
        }
        let available = max_sessions.saturating_sub(*counts.borrow_and_update());
        let addr = address.as_str();
        let result = retry(
            &inner.config.update_retry,
            inner.tasks.subscribe(),
            "update relay entry",
            move || entity.update_server_entry(addr, available),
        )
        .await;

        match result {
            Ok(()) => {
                pending = false;
                tracing::debug!(available, "relay entry updated");
            }
            Err(RetryError::Cancelled) => return,
            Err(e @ RetryError::Exhausted { .. }) => {
                pending = true;
                tracing::warn!(error = %e, ?retry_after, "relay entry update failed, will retry");
            }
            Err(RetryError::Permanent(e)) => {
                tracing::error!(error = %e, "relay entry updates stopped");
                return;
            }
        }
    }
}

async fn handle_connection(inner: Arc<ServerInner>, tcp: TcpStream, remote_tcp: SocketAddr) {
    let _ = tcp.set_nodelay(true);
    let mut done = inner.tasks.subscribe();

    let handshake = Session::respond(
        tcp,
        Some(remote_tcp),
        inner.entity.sk(),
        inner.config.handshake_timeout(),
        inner.config.mux.clone(),
    );
    let session = tokio::select! {
        () = wait_done(&mut done) => return,
        result = handshake => match result {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::warn!(error = %e, "session handshake failed");
                return;
            }
        },
    };
    let remote_pk = session.remote_pk();
    tracing::Span::current().record("remote_pk", tracing::field::display(remote_pk));

    // Newest session for a key wins.
    while inner.entity.register_session(Arc::clone(&session)).await.is_err() {
        if let Some(old) = inner.entity.remove_session(&remote_pk).await {
            tracing::info!("replacing existing session");
            old.close();
        }
    }
    if inner.tasks.is_done() {
        session.close();
        inner.entity.remove_session_if(&session).await;
        return;
    }
    inner.publish_session_count().await;
    tracing::info!("session established");

    loop {
        let stream = tokio::select! {
            () = wait_done(&mut done) => break,
            stream = session.accept_stream() => match stream {
                Ok(stream) => stream,
                Err(_) => break,
            },
        };
        let stream_span = tracing::debug_span!("stream", stream_id = stream.id());
        let task = handle_stream(Arc::clone(&inner), Arc::clone(&session), stream).instrument(stream_span);
        if !inner.tasks.spawn(task) {
            break;
        }
    }

    session.close();
    inner.entity.remove_session_if(&session).await;
    inner.publish_session_count().await;
    tracing::info!("session closed");
}

async fn handle_stream(inner: Arc<ServerInner>, session: Arc<Session>, mut src: MuxStream) {
    let limit = inner.config.request_timeout();
    let request = match timed(limit, "stream request", read_object(&mut src)).await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable stream request");
            return;
        }
    };

    let dst = match forward(&inner, &session, &request, &mut src).await {
        Ok(Some(dst)) => dst,
        Ok(None) => {
            tracing::debug!("destination refused stream");
            return;
        }
        Err(e) => {
            tracing::debug!(error = %e, "stream request rejected");
            inner.reject(&mut src, &request, &e).await;
            return;
        }
    };

    match splice(src, dst).await {
        Ok((end, bytes)) => tracing::debug!(?end, bytes, "stream finished"),
        Err(e) => tracing::debug!(error = %e, "stream ended with error"),
    }
}

/// Validate `request`, pass it to the destination and relay the answer
///
/// Returns the destination stream if it accepted.
async fn forward(
    inner: &ServerInner,
    session: &Session,
    request: &SignedObject,
    src: &mut MuxStream,
) -> Result<Option<MuxStream>> {
    let req = StreamRequest::open(request)?;
    if req.src.pk != session.remote_pk() {
        return Err(ErrorCode::ReqInvalidSrcPk.into());
    }
    session.tracker().check_and_update(&req.src.pk, req.timestamp)?;

    let dst_session = inner
        .entity
        .session(&req.dst.pk)
        .await
        .ok_or(ErrorCode::ReqNoSession)?;
    let mut dst = dst_session.open_stream()?;
    write_object(&mut dst, request).await?;

    let limit = inner.config.request_timeout();
    let response = timed(limit, "stream response", read_object(&mut dst)).await?;
    let resp = StreamResponse::open(&response, &request.hash(), &req.dst.pk, None)?;
    write_object(src, &response).await?;

    tracing::debug!(src = %req.src, dst = %req.dst, accepted = resp.accepted, "stream request forwarded");
    Ok(resp.accepted.then_some(dst))
}
