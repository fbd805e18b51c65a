use std::{
    io,
    sync::{Arc, Mutex, OnceLock, Weak},
};

use rustls::pki_types::CertificateDer;
use snafu::{OptionExt, ResultExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    peer_certificates,
    splice::{self, Tunnel},
    supervise, AlreadyComposedSnafu, ComposeSnafu, ConnectSnafu, Connection, ConnectionConfig,
    ConnectionError, ConnectionInfo, ConnectionKind, HandshakeSnafu, KeepAliveTimeoutSnafu,
    NotComposedSnafu, NotRunningSnafu, Phase, Session, StartCancelledSnafu, StartContext,
    StartTimeoutSnafu, StopReason, TlsConfigSnafu, VerificationSnafu, CLOSE_STOPPED,
    CLOSE_VERIFICATION_FAILED,
};
use crate::{
    address::Address, key::NodeId, registry::Registry, socket::UdpTransport,
    tls::{self, chain, SharedTlsConfig},
};

/// A connection dialed out to a peer proxy on behalf of a local client.
///
/// Started once towards a peer address, expecting the peer to be one of a set of
/// [`NodeId`]s, and composed at most once with a local client's TCP stream.
#[derive(derive_more::Debug)]
pub struct ConnectionForward {
    conn: Arc<Connection>,
    node_ids: Vec<NodeId>,
    #[debug(skip)]
    endpoint: quinn::Endpoint,
    #[debug(skip)]
    registry: Weak<Registry<ConnectionForward>>,
    phase: Mutex<Phase>,
    session: OnceLock<Session>,
    client_address: OnceLock<Address>,
    stop_reason: OnceLock<StopReason>,
    cancel: CancellationToken,
    #[debug(skip)]
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionForward {
    pub(crate) fn new(
        transport: Arc<UdpTransport>,
        endpoint: quinn::Endpoint,
        address: Address,
        node_ids: Vec<NodeId>,
        tls: SharedTlsConfig,
        config: ConnectionConfig,
        registry: Weak<Registry<ConnectionForward>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn: Arc::new(Connection::new(transport, address, tls, config)),
            node_ids,
            endpoint,
            registry,
            phase: Mutex::new(Phase::Idle),
            session: OnceLock::new(),
            client_address: OnceLock::new(),
            stop_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The address of the peer proxy.
    pub fn address(&self) -> Address {
        self.conn.address
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.lock().expect("poisoned")
    }

    /// Why the connection stopped, once it did.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason.get().copied()
    }

    /// The verified node id of the peer, once started.
    pub fn node_id(&self) -> Option<NodeId> {
        self.session.get().map(|session| session.node_id)
    }

    /// The certificate chain the peer presented, once started.
    pub fn certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.session
            .get()
            .map(|session| session.certificates.as_slice())
    }

    /// The address of the composed local client.
    pub fn client_address(&self) -> Result<Address, ConnectionError> {
        self.client_address.get().copied().context(NotComposedSnafu)
    }

    /// A snapshot of this connection, once started.
    pub fn info(&self) -> Option<ConnectionInfo> {
        let session = self.session.get()?;
        self.conn.info(session, ConnectionKind::Forward)
    }

    /// Dials the peer and verifies it is one of the expected node ids.
    ///
    /// Sends hole punching pings while the QUIC handshake is in flight.  Fails without
    /// touching the network when the requested timeout exceeds
    /// [`MAX_START_TIMEOUT`](crate::defaults::MAX_START_TIMEOUT).
    pub async fn start(self: &Arc<Self>, ctx: StartContext) -> Result<NodeId, ConnectionError> {
        let deadline = ctx.deadline()?;
        {
            let mut phase = self.phase.lock().expect("poisoned");
            if *phase != Phase::Idle {
                return NotRunningSnafu { phase: *phase }.fail();
            }
            *phase = Phase::Starting;
        }
        info!(remote = %self.conn.address, "starting forward connection");

        let session = match self.establish(&ctx, deadline).await {
            Ok(session) => session,
            Err(err) => {
                debug!(remote = %self.conn.address, "start failed: {err:#}");
                self.set_stopped_after_failed_start();
                return Err(err);
            }
        };
        let node_id = session.node_id;
        let connection = session.connection.clone();
        self.session.set(session).ok();

        {
            let mut phase = self.phase.lock().expect("poisoned");
            if *phase != Phase::Starting {
                // stopped while the handshake completed
                connection.close(CLOSE_STOPPED.into(), b"stopped");
                return Err(self.not_running(*phase));
            }
            *phase = Phase::Started;
            if let Some(registry) = self.registry.upgrade() {
                registry.insert_remote(self.conn.address, self.clone());
            }

            let conn = self.conn.clone();
            let watcher = conn.watch();
            let cancel = self.cancel.clone();
            let this = Arc::downgrade(self);
            let closed = async move {
                connection.closed().await;
            };
            let task = tokio::spawn(
                async move {
                    if let Some(reason) = supervise(&conn, watcher, &cancel, closed).await {
                        spawn_stop(this, reason);
                    }
                }
                .instrument(info_span!("keep-alive", remote = %self.conn.address)),
            );
            self.tasks.lock().expect("poisoned").push(task);
        }

        info!(remote = %self.conn.address, node = %node_id.fmt_short(), "forward connection started");
        Ok(node_id)
    }

    async fn establish(
        &self,
        ctx: &StartContext,
        deadline: Instant,
    ) -> Result<Session, ConnectionError> {
        let client_config =
            tls::make_client_config(&self.conn.tls, &self.conn.config).context(TlsConfigSnafu)?;
        let server_name = self.conn.address.host().to_string();
        let connecting = self
            .endpoint
            .connect_with(client_config, self.conn.address.socket_addr(), &server_name)
            .context(ConnectSnafu)?;

        let connection = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return StartCancelledSnafu.fail(),
            _ = self.cancel.cancelled() => return StartCancelledSnafu.fail(),
            _ = time::sleep_until(deadline) => {
                return StartTimeoutSnafu { timeout: ctx.timeout }.fail();
            }
            never = self.conn.punch() => match never {},
            res = connecting => res.context(HandshakeSnafu)?,
        };

        let certificates = peer_certificates(&connection);
        match chain::verify_server_chain(&self.node_ids, &certificates) {
            Ok(node_id) => Ok(Session {
                connection,
                node_id,
                certificates,
            }),
            Err(err) => {
                warn!(remote = %self.conn.address, "server certificate chain rejected: {err:#}");
                connection.close(
                    CLOSE_VERIFICATION_FAILED.into(),
                    b"certificate chain verification failed",
                );
                Err(err).context(VerificationSnafu)
            }
        }
    }

    /// Composes the started connection with a local client.
    ///
    /// Bytes flow both ways until either side ends, after which the connection stops.
    pub async fn compose<S>(
        self: &Arc<Self>,
        client: S,
        client_address: Address,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let tunnel = self.open_tunnel().await?;
        self.attach(tunnel, client, client_address, None).await
    }

    /// Marks the connection composed and opens its tunnel stream.
    pub(crate) async fn open_tunnel(self: &Arc<Self>) -> Result<Tunnel, ConnectionError> {
        let connection = {
            let mut phase = self.phase.lock().expect("poisoned");
            match *phase {
                Phase::Started => {}
                Phase::Composed => return AlreadyComposedSnafu.fail(),
                other => return Err(self.not_running(other)),
            }
            let session = self
                .session
                .get()
                .context(NotRunningSnafu { phase: *phase })?;
            *phase = Phase::Composed;
            session.connection.clone()
        };

        match splice::open_tunnel(&connection).await {
            Ok(tunnel) => Ok(tunnel),
            Err(err) => {
                self.stop_with(StopReason::Failed).await;
                Err(err).context(ComposeSnafu)
            }
        }
    }

    /// Splices `tunnel` with the client, after writing `greeting` to the client.
    pub(crate) async fn attach<S>(
        self: &Arc<Self>,
        tunnel: Tunnel,
        mut client: S,
        client_address: Address,
        greeting: Option<&[u8]>,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Some(greeting) = greeting {
            let res: io::Result<()> = async {
                client.write_all(greeting).await?;
                client.flush().await
            }
            .await;
            if let Err(err) = res {
                self.stop_with(StopReason::Failed).await;
                return Err(err).context(ComposeSnafu);
            }
        }

        {
            let phase = self.phase.lock().expect("poisoned");
            if *phase != Phase::Composed {
                return Err(self.not_running(*phase));
            }
            self.client_address.set(client_address).ok();
            if let Some(registry) = self.registry.upgrade() {
                registry.insert_local(client_address, self.clone());
            }

            let cancel = self.cancel.clone();
            let end_timeout = self.conn.config.end_timeout;
            let this = Arc::downgrade(self);
            let task = tokio::spawn(
                async move {
                    match splice::splice(client, tunnel, &cancel, end_timeout).await {
                        Ok(()) => debug!("tunnel finished"),
                        Err(err) => debug!("tunnel failed: {err:#}"),
                    }
                    spawn_stop(this, StopReason::Finished);
                }
                .instrument(info_span!(
                    "splice",
                    remote = %self.conn.address,
                    client = %client_address
                )),
            );
            self.tasks.lock().expect("poisoned").push(task);
        }

        info!(remote = %self.conn.address, client = %client_address, "forward connection composed");
        Ok(())
    }

    /// Stops the connection.
    ///
    /// Ends both legs gracefully, bounded by the end timeout, and removes the connection
    /// from the registries.  Calling this more than once has no further effect.
    pub async fn stop(&self) {
        self.stop_with(StopReason::Requested).await
    }

    pub(crate) async fn stop_with(&self, reason: StopReason) {
        {
            let mut phase = self.phase.lock().expect("poisoned");
            if matches!(*phase, Phase::Stopping | Phase::Stopped) {
                return;
            }
            *phase = Phase::Stopping;
        }
        self.stop_reason.set(reason).ok();
        info!(remote = %self.conn.address, %reason, "stopping forward connection");

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.conn.address, self.client_address.get(), self);
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("poisoned"));
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!("connection task panicked: {err:#}");
                }
            }
        }
        if let Some(session) = self.session.get() {
            session.connection.close(CLOSE_STOPPED.into(), b"stopped");
        }

        *self.phase.lock().expect("poisoned") = Phase::Stopped;
        info!(remote = %self.conn.address, "forward connection stopped");
    }

    fn set_stopped_after_failed_start(&self) {
        let mut phase = self.phase.lock().expect("poisoned");
        if *phase == Phase::Starting {
            *phase = Phase::Stopped;
        }
    }

    fn not_running(&self, phase: Phase) -> ConnectionError {
        match self.stop_reason.get() {
            Some(StopReason::KeepAliveTimeout) => KeepAliveTimeoutSnafu.build(),
            _ => NotRunningSnafu { phase }.build(),
        }
    }
}

impl Drop for ConnectionForward {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Stops the connection from a task of its own, without waiting for the stop.
fn spawn_stop(conn: Weak<ConnectionForward>, reason: StopReason) {
    if let Some(conn) = conn.upgrade() {
        tokio::spawn(async move { conn.stop_with(reason).await });
    }
}
