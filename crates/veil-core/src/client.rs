//! Client role: delegate relays, listen on ports and dial other clients.

use crate::addr::Addr;
use crate::config::ClientConfig;
use crate::entity::EntityCommon;
use crate::error::{Error, ErrorCode, Result};
use crate::listener::{Listener, PortMap};
use crate::mux::MuxStream;
use crate::request::{
    SignedObject, StreamRequest, StreamResponse, TimestampClock, TimestampTracker, read_object,
    timed, write_object,
};
use crate::retry::{RetryError, retry};
use crate::session::Session;
use crate::stream::Stream;
use crate::tasks::{TaskGroup, wait_done};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio::sync::mpsc::{OwnedPermit, error::TrySendError};
use tracing::Instrument;
use veil_crypto::{PublicKey, SecretKey};
use veil_discovery::{DiscoveryClient, DiscoveryError, Entry};

/// First source port handed out to outgoing streams
const EPHEMERAL_PORT_START: u16 = 49152;
const EPHEMERAL_PORT_COUNT: u16 = 16384;

/// Client entity
///
/// A client holds sessions with one or more relays (its delegated relays),
/// publishes them in discovery, and opens or accepts streams through them.
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    entity: EntityCommon,
    config: ClientConfig,
    ports: PortMap,
    clock: TimestampClock,
    /// Last accepted timestamp per dialer, across every relay
    replay: TimestampTracker,
    next_port: AtomicU16,
    tasks: TaskGroup,
    closed: OnceCell<()>,
}

impl Client {
    /// Create a client with the given identity and discovery service
    ///
    /// No relay is contacted until [`Client::initiate_server_connections`]
    /// or [`Client::dial`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or the key
    /// pair does not match.
    pub fn new(
        pk: PublicKey,
        sk: SecretKey,
        discovery: Arc<dyn DiscoveryClient>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let entity = EntityCommon::new(pk, sk, discovery, config.discovery_timeout())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                entity,
                config,
                ports: PortMap::default(),
                clock: TimestampClock::new(),
                replay: TimestampTracker::new(),
                next_port: AtomicU16::new(rand::random()),
                tasks: TaskGroup::new(),
                closed: OnceCell::new(),
            }),
        })
    }

    /// Public key of this client
    #[must_use]
    pub fn local_pk(&self) -> PublicKey {
        self.inner.entity.pk()
    }

    /// Configuration this client runs with
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Relays this client currently holds sessions with
    pub async fn delegated_servers(&self) -> Vec<PublicKey> {
        self.inner.entity.session_keys().await
    }

    /// Live relay sessions
    pub async fn session_count(&self) -> usize {
        self.inner.entity.session_count().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.tasks.is_done() {
            return Err(ErrorCode::EntityClosed.into());
        }
        Ok(())
    }

    /// Connect to relays listed in discovery until `min` sessions are live,
    /// then publish this client's entry
    ///
    /// Returns the number of live relay sessions.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::CannotConnectToDelegated`] if fewer than `min`
    /// sessions could be established, or the discovery error.
    pub async fn initiate_server_connections(&self, min: usize) -> Result<usize> {
        self.ensure_open()?;
        let entity = &self.inner.entity;
        let servers = entity
            .with_discovery(entity.discovery().available_servers())
            .await?;

        let mut connected = entity.session_count().await;
        for server in &servers {
            if connected >= min {
                break;
            }
            if entity.session(&server.static_pk).await.is_some() {
                continue;
            }
            match connect_server(&self.inner, server).await {
                Ok(_) => connected += 1,
                Err(e) => {
                    tracing::warn!(
                        parent: entity.span(),
                        relay = %server.static_pk,
                        error = %e,
                        "relay connection failed"
                    );
                }
            }
        }

        if connected > 0 {
            let inner = &*self.inner;
            retry(
                &inner.config.dial_retry,
                inner.tasks.subscribe(),
                "publish client entry",
                move || inner.publish_entry(),
            )
            .await
            .map_err(RetryError::into_error)?;
        }
        if connected < min {
            return Err(ErrorCode::CannotConnectToDelegated
                .wrap(format!("connected to {connected} of {min} relays")));
        }
        tracing::info!(parent: entity.span(), relays = connected, "client online");
        Ok(connected)
    }

    /// Bind `port` for incoming streams
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::PortOccupied`] if the port is taken,
    /// [`ErrorCode::EntityClosed`] after close, and [`Error::Config`] for
    /// port 0.
    pub fn listen(&self, port: u16) -> Result<Listener> {
        self.ensure_open()?;
        if port == 0 {
            return Err(Error::Config("cannot listen on port 0".into()));
        }
        let local = Addr::new(self.local_pk(), port);
        let listener = self.inner.ports.bind(local, self.inner.config.accept_queue_len)?;
        tracing::debug!(parent: self.inner.entity.span(), port, "listening");
        Ok(listener)
    }

    /// Open a stream to `dst_pk` on `dst_port`
    ///
    /// The destination is looked up in discovery and reached through one of
    /// its delegated relays, preferring relays this client is already
    /// connected to.
    ///
    /// # Errors
    ///
    /// Discovery failures map to [`ErrorCode::DiscEntryNotFound`],
    /// [`ErrorCode::DiscEntryIsNotClient`] or
    /// [`ErrorCode::DiscEntryHasNoDelegated`]; an unreachable relay set to
    /// [`ErrorCode::CannotConnectToDelegated`]. A refused request returns
    /// the code carried in the rejection.
    pub async fn dial(&self, dst_pk: PublicKey, dst_port: u16) -> Result<Stream> {
        self.ensure_open()?;
        if dst_port == 0 {
            return Err(ErrorCode::ReqInvalidDstPort.into());
        }
        let entity = &self.inner.entity;
        let entry = match entity.with_discovery(entity.discovery().entry(&dst_pk)).await {
            Ok(entry) => entry,
            Err(Error::Discovery(DiscoveryError::EntryNotFound)) => {
                return Err(ErrorCode::DiscEntryNotFound.into());
            }
            Err(e) => return Err(e),
        };
        entry.verify()?;
        let Some(client) = entry.client else {
            return Err(ErrorCode::DiscEntryIsNotClient.into());
        };
        let mut relays = client.delegated_servers;
        if relays.is_empty() {
            return Err(ErrorCode::DiscEntryHasNoDelegated.into());
        }

        let live = entity.session_keys().await;
        relays.sort_by_key(|pk| !live.contains(pk));

        let mut last_err = None;
        for relay_pk in relays {
            match self.session_with(relay_pk).await {
                Ok(session) => return self.dial_via(&session, dst_pk, dst_port).await,
                Err(e) => {
                    tracing::debug!(parent: entity.span(), relay = %relay_pk, error = %e, "delegated relay unreachable");
                    last_err = Some(e);
                }
            }
        }
        Err(ErrorCode::CannotConnectToDelegated.wrap(
            last_err.map_or_else(|| "no delegated relay".to_string(), |e| e.to_string()),
        ))
    }

    /// [`Client::dial`], retrying transient failures per the configured
    /// dial policy
    ///
    /// # Errors
    ///
    /// Returns the last dial error, or [`ErrorCode::EntityClosed`] if the
    /// client closes while waiting.
    pub async fn dial_with_retry(&self, dst_pk: PublicKey, dst_port: u16) -> Result<Stream> {
        retry(
            &self.inner.config.dial_retry,
            self.inner.tasks.subscribe(),
            "dial",
            move || self.dial(dst_pk, dst_port),
        )
        .await
        .map_err(RetryError::into_error)
    }

    /// Session with `relay_pk`, connecting if none is live
    async fn session_with(&self, relay_pk: PublicKey) -> Result<Arc<Session>> {
        let entity = &self.inner.entity;
        if let Some(session) = entity.session(&relay_pk).await {
            if !session.is_closed() {
                return Ok(session);
            }
        }
        let entry = entity.with_discovery(entity.discovery().entry(&relay_pk)).await?;
        if !entry.is_server() {
            return Err(ErrorCode::DiscEntryIsNotServer.into());
        }
        let session = connect_server(&self.inner, &entry).await?;
        if let Err(e) = self.inner.publish_entry().await {
            tracing::warn!(parent: entity.span(), error = %e, "client entry update failed");
        }
        Ok(session)
    }

    async fn dial_via(&self, session: &Session, dst_pk: PublicKey, dst_port: u16) -> Result<Stream> {
        let inner = &self.inner;
        let local = Addr::new(inner.entity.pk(), inner.ephemeral_port());
        let remote = Addr::new(dst_pk, dst_port);
        let req = StreamRequest {
            timestamp: inner.clock.next(),
            src: local,
            dst: remote,
        };
        let request = SignedObject::sign_request(&req, inner.entity.sk())?;

        let mut stream = session.open_stream()?;
        write_object(&mut stream, &request).await?;
        let response = timed(
            inner.config.request_timeout(),
            "stream response",
            read_object(&mut stream),
        )
        .await?;
        let relay_pk = session.remote_pk();
        StreamResponse::open(&response, &request.hash(), &dst_pk, Some(&relay_pk))?.into_result()?;

        tracing::debug!(parent: inner.entity.span(), src = %local, dst = %remote, relay = %relay_pk, "stream dialed");
        Ok(Stream::new(stream, local, remote))
    }

    /// Close every relay session and listener
    ///
    /// Safe to call any number of times; afterwards every operation returns
    /// [`ErrorCode::EntityClosed`].
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for shutdown errors.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.get_or_init(|| self.inner.shutdown()).await;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local_pk", &self.local_pk())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn ephemeral_port(&self) -> u16 {
        EPHEMERAL_PORT_START + self.next_port.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_PORT_COUNT
    }

    /// Publish the current set of delegated relays
    async fn publish_entry(&self) -> Result<()> {
        let relays = self.entity.session_keys().await;
        self.entity.update_client_entry(relays).await
    }

    async fn shutdown(&self) {
        tracing::info!(parent: self.entity.span(), "client closing");
        self.tasks.signal();
        self.ports.clear();
        for session in self.entity.take_sessions().await {
            session.close();
        }
        self.tasks.drain().await;
        tracing::info!(parent: self.entity.span(), "client closed");
    }

    /// Check an incoming request and reserve its listener queue slot
    fn admit(&self, request: &SignedObject) -> Result<(StreamRequest, OwnedPermit<Stream>)> {
        let req = StreamRequest::open(request)?;
        self.replay.check_and_update(&req.src.pk, req.timestamp)?;
        if req.dst.pk != self.entity.pk() {
            return Err(ErrorCode::ReqInvalidDstPk.into());
        }
        let queue = self
            .ports
            .queue(req.dst.port)
            .ok_or(ErrorCode::ReqNoListener)?;
        let permit = queue.try_reserve_owned().map_err(|e| match e {
            TrySendError::Full(_) => ErrorCode::AcceptChanMaxed,
            TrySendError::Closed(_) => ErrorCode::ReqNoListener,
        })?;
        Ok((req, permit))
    }

    async fn respond(&self, stream: &mut MuxStream, resp: &StreamResponse) -> Result<()> {
        let obj = SignedObject::sign_response(resp, self.entity.sk())?;
        write_object(stream, &obj).await
    }
}

/// Connect and hand-shake with the relay described by `entry`
async fn connect_server(inner: &Arc<ClientInner>, entry: &Entry) -> Result<Arc<Session>> {
    let info = entry.server.as_ref().ok_or(ErrorCode::DiscEntryIsNotServer)?;
    let relay_pk = entry.static_pk;
    let entity = &inner.entity;
    let limit = inner.config.handshake_timeout();

    let tcp = timed(limit, "relay connect", async {
        TcpStream::connect(info.address.as_str()).await.map_err(Error::from)
    })
    .await?;
    let _ = tcp.set_nodelay(true);
    let remote_tcp = tcp.peer_addr().ok();
    let session = Session::initiate(
        tcp,
        remote_tcp,
        entity.sk(),
        relay_pk,
        limit,
        inner.config.mux.clone(),
    )
    .await?;
    let session = Arc::new(session);

    if entity.register_session(Arc::clone(&session)).await.is_err() {
        // Lost a race with a concurrent connect; keep the existing session.
        session.close();
        return entity
            .session(&relay_pk)
            .await
            .ok_or_else(|| ErrorCode::SessionClosed.into());
    }

    let span = tracing::info_span!(parent: entity.span(), "session", remote_pk = %relay_pk, remote_tcp = ?remote_tcp);
    let task = serve_session(Arc::clone(inner), Arc::clone(&session)).instrument(span);
    if inner.tasks.is_done() || !inner.tasks.spawn(task) {
        entity.remove_session_if(&session).await;
        session.close();
        return Err(ErrorCode::EntityClosed.into());
    }
    tracing::info!(parent: entity.span(), relay = %relay_pk, "relay session established");
    Ok(session)
}

/// Accept streams the relay forwards to this client
async fn serve_session(inner: Arc<ClientInner>, session: Arc<Session>) {
    let mut done = inner.tasks.subscribe();
    loop {
        let stream = tokio::select! {
            () = wait_done(&mut done) => break,
            stream = session.accept_stream() => match stream {
                Ok(stream) => stream,
                Err(_) => break,
            },
        };
        let span = tracing::debug_span!("stream", stream_id = stream.id());
        let task = handle_incoming(Arc::clone(&inner), stream).instrument(span);
        if !inner.tasks.spawn(task) {
            break;
        }
    }

    session.close();
    let removed = inner.entity.remove_session_if(&session).await;
    tracing::info!("relay session closed");
    if removed && !inner.tasks.is_done() {
        if let Err(e) = inner.publish_entry().await {
            tracing::warn!(error = %e, "client entry update failed");
        }
    }
}

async fn handle_incoming(inner: Arc<ClientInner>, mut stream: MuxStream) {
    let limit = inner.config.request_timeout();
    let request = match timed(limit, "stream request", read_object(&mut stream)).await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable stream request");
            return;
        }
    };

    match inner.admit(&request) {
        Ok((req, permit)) => {
            if let Err(e) = inner.respond(&mut stream, &StreamResponse::accept(request.hash())).await {
                tracing::debug!(error = %e, "could not accept stream");
                return;
            }
            tracing::debug!(src = %req.src, dst = %req.dst, "stream accepted");
            permit.send(Stream::new(stream, req.dst, req.src));
        }
        Err(e) => {
            tracing::debug!(error = %e, "stream request refused");
            if let Some(code) = e.code() {
                let resp = StreamResponse::reject(request.hash(), code);
                if let Err(e) = inner.respond(&mut stream, &resp).await {
                    tracing::debug!(error = %e, "could not deliver rejection");
                }
            }
        }
    }
}
