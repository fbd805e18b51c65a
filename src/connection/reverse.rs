use std::{
    sync::{Arc, Mutex, OnceLock, Weak},
    time::Duration,
};

use rustls::pki_types::CertificateDer;
use snafu::{OptionExt, ResultExt};
use tokio::{
    net::TcpStream,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    peer_certificates,
    splice,
    supervise, AlreadyComposedSnafu, ComposeTimeoutSnafu, Connection, ConnectionConfig,
    ConnectionError, ConnectionInfo, ConnectionKind, HandshakeSnafu, KeepAliveTimeoutSnafu,
    NotComposedSnafu, NotRunningSnafu, Phase, Session, StartCancelledSnafu, StartContext,
    StartSnafu, StartTimeoutSnafu, StopReason, VerificationSnafu, CLOSE_STOPPED,
    CLOSE_VERIFICATION_FAILED,
};
use crate::{
    address::Address, key::NodeId, registry::Registry, socket::{ActivityWatcher, UdpTransport},
    tls::{chain, SharedTlsConfig},
};

/// A connection accepted from a peer proxy and connected to the local backend.
///
/// Started once for a peer address, which opens the backend connection and punches towards
/// the peer, and composed at most once with the peer's inbound QUIC connection.
#[derive(derive_more::Debug)]
pub struct ConnectionReverse {
    conn: Arc<Connection>,
    server_address: Address,
    #[debug(skip)]
    registry: Weak<Registry<ConnectionReverse>>,
    phase: Mutex<Phase>,
    session: OnceLock<Session>,
    server: Mutex<Option<TcpStream>>,
    server_local_address: OnceLock<Address>,
    stop_reason: OnceLock<StopReason>,
    cancel: CancellationToken,
    #[debug(skip)]
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionReverse {
    pub(crate) fn new(
        transport: Arc<UdpTransport>,
        address: Address,
        server_address: Address,
        tls: SharedTlsConfig,
        config: ConnectionConfig,
        registry: Weak<Registry<ConnectionReverse>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn: Arc::new(Connection::new(transport, address, tls, config)),
            server_address,
            registry,
            phase: Mutex::new(Phase::Idle),
            session: OnceLock::new(),
            server: Mutex::new(None),
            server_local_address: OnceLock::new(),
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

    /// The node id of the leaf certificate the peer presented, once composed.
    pub fn node_id(&self) -> Option<NodeId> {
        self.session.get().map(|session| session.node_id)
    }

    /// The certificate chain the peer presented, once composed.
    pub fn certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.session
            .get()
            .map(|session| session.certificates.as_slice())
    }

    /// The local address of the connection to the backend, once composed.
    pub fn server_local_address(&self) -> Result<Address, ConnectionError> {
        match self.session.get() {
            Some(_) => self.server_local_address.get().copied().context(NotComposedSnafu),
            None => NotComposedSnafu.fail(),
        }
    }

    /// A snapshot of this connection, once composed.
    pub fn info(&self) -> Option<ConnectionInfo> {
        let session = self.session.get()?;
        self.conn.info(session, ConnectionKind::Reverse)
    }

    /// Connects to the backend and punches towards the peer until it is heard from.
    pub async fn start(self: &Arc<Self>, ctx: StartContext) -> Result<(), ConnectionError> {
        let deadline = ctx.deadline()?;
        {
            let mut phase = self.phase.lock().expect("poisoned");
            if *phase != Phase::Idle {
                return NotRunningSnafu { phase: *phase }.fail();
            }
            *phase = Phase::Starting;
        }
        info!(remote = %self.conn.address, "starting reverse connection");

        let (server, watcher) = match self.establish(&ctx, deadline).await {
            Ok(res) => res,
            Err(err) => {
                debug!(remote = %self.conn.address, "start failed: {err:#}");
                let mut phase = self.phase.lock().expect("poisoned");
                if *phase == Phase::Starting {
                    *phase = Phase::Stopped;
                }
                return Err(err);
            }
        };

        {
            let mut phase = self.phase.lock().expect("poisoned");
            if *phase != Phase::Starting {
                return Err(self.not_running(*phase));
            }
            if let Ok(local) = server.local_addr() {
                self.server_local_address.set(local.into()).ok();
            }
            *self.server.lock().expect("poisoned") = Some(server);
            *phase = Phase::Started;
            if let Some(registry) = self.registry.upgrade() {
                registry.insert_remote(self.conn.address, self.clone());
            }

            let conn = self.conn.clone();
            let cancel = self.cancel.clone();
            let this = Arc::downgrade(self);
            let task = tokio::spawn(
                async move {
                    let closed = std::future::pending();
                    if let Some(reason) = supervise(&conn, watcher, &cancel, closed).await {
                        spawn_stop(this, reason);
                    }
                }
                .instrument(info_span!("keep-alive", remote = %self.conn.address)),
            );
            self.tasks.lock().expect("poisoned").push(task);
        }

        info!(remote = %self.conn.address, "reverse connection started");
        Ok(())
    }

    async fn establish(
        &self,
        ctx: &StartContext,
        deadline: Instant,
    ) -> Result<(TcpStream, ActivityWatcher), ConnectionError> {
        let mut watcher = self.conn.watch();

        let server = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return StartCancelledSnafu.fail(),
            _ = self.cancel.cancelled() => return StartCancelledSnafu.fail(),
            _ = time::sleep_until(deadline) => {
                return StartTimeoutSnafu { timeout: ctx.timeout }.fail();
            }
            res = TcpStream::connect(self.server_address.socket_addr()) => res.context(StartSnafu)?,
        };

        let window = self.conn.config.keep_alive_timeout;
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return StartCancelledSnafu.fail(),
            _ = self.cancel.cancelled() => return StartCancelledSnafu.fail(),
            _ = time::sleep_until(deadline) => {
                return StartTimeoutSnafu { timeout: ctx.timeout }.fail();
            }
            _ = watcher.heard_within(window) => {}
            never = self.conn.punch() => match never {},
        }

        Ok((server, watcher))
    }

    /// Completes the handshake of the peer's inbound QUIC connection and splices it with the
    /// backend.
    ///
    /// The peer must present a valid client certificate chain; its identity is the node id
    /// of the leaf.  On failure both legs are torn down.
    pub async fn compose(
        self: &Arc<Self>,
        incoming: quinn::Incoming,
        timeout: Duration,
    ) -> Result<NodeId, ConnectionError> {
        let server = {
            let mut phase = self.phase.lock().expect("poisoned");
            match *phase {
                Phase::Started => {}
                Phase::Composed => return AlreadyComposedSnafu.fail(),
                other => return Err(self.not_running(other)),
            }
            let server = self
                .server
                .lock()
                .expect("poisoned")
                .take()
                .context(NotRunningSnafu { phase: *phase })?;
            *phase = Phase::Composed;
            server
        };

        let session = match self.accept(incoming, timeout).await {
            Ok(session) => session,
            Err(err) => {
                warn!(remote = %self.conn.address, "compose failed: {err:#}");
                drop(server);
                self.stop_with(StopReason::Failed).await;
                return Err(err);
            }
        };
        let node_id = session.node_id;
        let connection = session.connection.clone();
        self.session.set(session).ok();

        {
            let phase = self.phase.lock().expect("poisoned");
            if *phase != Phase::Composed {
                connection.close(CLOSE_STOPPED.into(), b"stopped");
                return Err(self.not_running(*phase));
            }
            if let (Some(registry), Some(local)) =
                (self.registry.upgrade(), self.server_local_address.get())
            {
                registry.insert_local(*local, self.clone());
            }

            let cancel = self.cancel.clone();
            let end_timeout = self.conn.config.end_timeout;
            let this = Arc::downgrade(self);
            let task = tokio::spawn(
                async move {
                    let res = async {
                        let tunnel = tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            res = splice::accept_tunnel(&connection) => res?,
                        };
                        splice::splice(server, tunnel, &cancel, end_timeout).await
                    }
                    .await;
                    match res {
                        Ok(()) => debug!("tunnel finished"),
                        Err(err) => debug!("tunnel failed: {err:#}"),
                    }
                    let reason = match connection.close_reason() {
                        Some(_) if !cancel.is_cancelled() => StopReason::PeerClosed,
                        _ => StopReason::Finished,
                    };
                    spawn_stop(this, reason);
                }
                .instrument(info_span!("splice", remote = %self.conn.address)),
            );
            self.tasks.lock().expect("poisoned").push(task);
        }

        info!(remote = %self.conn.address, node = %node_id.fmt_short(), "reverse connection composed");
        Ok(node_id)
    }

    async fn accept(
        &self,
        incoming: quinn::Incoming,
        timeout: Duration,
    ) -> Result<Session, ConnectionError> {
        let connecting = incoming.accept().context(HandshakeSnafu)?;
        let connection = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return NotRunningSnafu { phase: Phase::Stopping }.fail();
            }
            _ = time::sleep(timeout) => return ComposeTimeoutSnafu { timeout }.fail(),
            res = connecting => res.context(HandshakeSnafu)?,
        };

        let certificates = peer_certificates(&connection);
        match chain::verify_client_chain(&certificates) {
            Ok(node_id) => Ok(Session {
                connection,
                node_id,
                certificates,
            }),
            Err(err) => {
                warn!(remote = %self.conn.address, "client certificate chain rejected: {err:#}");
                connection.close(
                    CLOSE_VERIFICATION_FAILED.into(),
                    b"certificate chain verification failed",
                );
                Err(err).context(VerificationSnafu)
            }
        }
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
        info!(remote = %self.conn.address, %reason, "stopping reverse connection");

        if let Some(registry) = self.registry.upgrade() {
            let local = self
                .session
                .get()
                .and(self.server_local_address.get());
            registry.remove(&self.conn.address, local, self);
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
        self.server.lock().expect("poisoned").take();
        if let Some(session) = self.session.get() {
            session.connection.close(CLOSE_STOPPED.into(), b"stopped");
        }

        *self.phase.lock().expect("poisoned") = Phase::Stopped;
        info!(remote = %self.conn.address, "reverse connection stopped");
    }

    fn not_running(&self, phase: Phase) -> ConnectionError {
        match self.stop_reason.get() {
            Some(StopReason::KeepAliveTimeout) => KeepAliveTimeoutSnafu.build(),
            _ => NotRunningSnafu { phase }.build(),
        }
    }
}

impl Drop for ConnectionReverse {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Stops the connection from a task of its own, without waiting for the stop.
fn spawn_stop(conn: Weak<ConnectionReverse>, reason: StopReason) {
    if let Some(conn) = conn.upgrade() {
        tokio::spawn(async move { conn.stop_with(reason).await });
    }
}
