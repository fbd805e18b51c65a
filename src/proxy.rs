//! The proxy: listeners, connection registries and the two tunnel directions.
//!
//! A [`Proxy`] owns one HTTP `CONNECT` listener for local clients and one UDP socket for its
//! peers.  Local clients name the peer proxy and the node ids it may have, the proxy dials
//! the peer with a [`ConnectionForward`] and splices the client onto the tunnel.  Inbound
//! QUIC connections from peers are handled by a [`ConnectionReverse`] each, which splices
//! the tunnel onto a fresh connection to the backend server.
//!
//! At most one connection per peer address and direction exists at any time, establishing
//! one is serialized per address.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use http::StatusCode;
use nested_enum_utils::common_fields;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    address::{Address, AddressError, Host, Port},
    connection::{
        ConnectionConfig, ConnectionError, ConnectionForward, ConnectionInfo, ConnectionKind,
        ConnectionReverse, Phase, StartContext, Tunnel, CLOSE_STOPPED,
    },
    defaults::{timeouts::*, MAX_START_TIMEOUT},
    key::{KeyParsingError, NodeId},
    lock_box::LockBox,
    registry::Registry,
    socket::UdpTransport,
    tls::{self, CreateConfigError, SharedTlsConfig, TlsConfig},
};

mod connect;

/// Invoked whenever a tunnel is composed.
pub type EstablishedCallback = Arc<dyn Fn(ConnectionEstablished) + Send + Sync + 'static>;

/// Describes a freshly composed tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEstablished {
    /// The verified node id of the peer.
    pub remote_node_id: NodeId,
    /// Host of the peer proxy.
    pub remote_host: Host,
    /// UDP port of the peer proxy.
    pub remote_port: Port,
    /// Which side of the tunnel this proxy is.
    pub kind: ConnectionKind,
}

/// Configures and spawns a [`Proxy`].
#[derive(derive_more::Debug)]
pub struct ProxyBuilder {
    tls_config: TlsConfig,
    #[debug(skip)]
    auth_token: String,
    server_addr: SocketAddr,
    forward_addr: SocketAddr,
    proxy_addr: SocketAddr,
    connect_timeout: Duration,
    connection_config: ConnectionConfig,
    #[debug(skip)]
    on_established: Option<EstablishedCallback>,
}

impl ProxyBuilder {
    /// Creates a builder.
    ///
    /// Local clients must present `auth_token`, reverse tunnels are spliced onto
    /// connections to `server_addr`.  Both listeners bind to a random localhost port unless
    /// configured otherwise.
    pub fn new(tls_config: TlsConfig, auth_token: impl Into<String>, server_addr: SocketAddr) -> Self {
        let localhost = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        Self {
            tls_config,
            auth_token: auth_token.into(),
            server_addr,
            forward_addr: localhost,
            proxy_addr: localhost,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection_config: ConnectionConfig::default(),
            on_established: None,
        }
    }

    /// Sets the address of the HTTP `CONNECT` listener.
    pub fn forward_addr(mut self, addr: SocketAddr) -> Self {
        self.forward_addr = addr;
        self
    }

    /// Sets the address of the UDP socket shared by all tunnels.
    pub fn proxy_addr(mut self, addr: SocketAddr) -> Self {
        self.proxy_addr = addr;
        self
    }

    /// Sets the bound on establishing a connection, at most [`MAX_START_TIMEOUT`].
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the timing parameters of all connections.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Sets a callback invoked whenever a tunnel is composed, in either direction.
    pub fn on_connection_established(
        mut self,
        callback: impl Fn(ConnectionEstablished) + Send + Sync + 'static,
    ) -> Self {
        self.on_established = Some(Arc::new(callback));
        self
    }

    /// Binds both listeners and starts serving.
    pub async fn spawn(self) -> Result<Proxy, SpawnError> {
        ensure!(
            self.connect_timeout <= MAX_START_TIMEOUT,
            ConnectTimeoutSnafu {
                timeout: self.connect_timeout
            }
        );

        let listener = TcpListener::bind(self.forward_addr)
            .await
            .context(BindTcpSnafu {
                addr: self.forward_addr,
            })?;
        let forward_addr = listener.local_addr().context(LocalAddrSnafu)?;

        let transport = UdpTransport::bind(self.proxy_addr).context(BindUdpSnafu {
            addr: self.proxy_addr,
        })?;
        let proxy_addr = {
            use quinn::AsyncUdpSocket;
            transport.local_addr().context(LocalAddrSnafu)?
        };

        let tls = SharedTlsConfig::new(self.tls_config);
        let server_config =
            tls::make_server_config(&tls, &self.connection_config).context(TlsConfigSnafu)?;
        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            transport.clone(),
            Arc::new(quinn::TokioRuntime),
        )
        .context(EndpointSnafu)?;

        let inner = Arc::new(Inner {
            forward_addr,
            proxy_addr,
            server_address: self.server_addr.into(),
            auth_token: self.auth_token,
            connect_timeout: self.connect_timeout,
            connection_config: self.connection_config,
            tls,
            transport,
            endpoint,
            forward_locks: LockBox::default(),
            reverse_locks: LockBox::default(),
            forward: Arc::new(Registry::default()),
            reverse: Arc::new(Registry::default()),
            on_established: self.on_established,
            stopped: AtomicBool::new(false),
            cancel_connections: CancellationToken::new(),
            cancel_listeners: CancellationToken::new(),
        });

        let http_task = tokio::spawn(
            inner
                .clone()
                .run_http(listener)
                .instrument(info_span!("http", addr = %forward_addr)),
        );
        let quic_task = tokio::spawn(
            inner
                .clone()
                .run_quic()
                .instrument(info_span!("quic", addr = %proxy_addr)),
        );
        info!(%forward_addr, %proxy_addr, server_addr = %inner.server_address, "proxy started");

        Ok(Proxy {
            inner,
            tasks: Mutex::new(vec![
                AbortOnDropHandle::new(http_task),
                AbortOnDropHandle::new(quic_task),
            ]),
        })
    }
}

/// A running proxy.
///
/// Dropping the proxy aborts its listeners, [`Proxy::stop`] shuts it down gracefully.
#[derive(Debug)]
pub struct Proxy {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<AbortOnDropHandle<()>>>,
}

#[derive(derive_more::Debug)]
struct Inner {
    forward_addr: SocketAddr,
    proxy_addr: SocketAddr,
    server_address: Address,
    #[debug(skip)]
    auth_token: String,
    connect_timeout: Duration,
    connection_config: ConnectionConfig,
    tls: SharedTlsConfig,
    transport: Arc<UdpTransport>,
    #[debug(skip)]
    endpoint: quinn::Endpoint,
    #[debug(skip)]
    forward_locks: LockBox<Address>,
    #[debug(skip)]
    reverse_locks: LockBox<Address>,
    #[debug(skip)]
    forward: Arc<Registry<ConnectionForward>>,
    #[debug(skip)]
    reverse: Arc<Registry<ConnectionReverse>>,
    #[debug(skip)]
    on_established: Option<EstablishedCallback>,
    stopped: AtomicBool,
    /// Cancels starts in flight once the proxy stops.
    cancel_connections: CancellationToken,
    cancel_listeners: CancellationToken,
}

impl Proxy {
    /// Starts building a proxy, see [`ProxyBuilder::new`].
    pub fn builder(
        tls_config: TlsConfig,
        auth_token: impl Into<String>,
        server_addr: SocketAddr,
    ) -> ProxyBuilder {
        ProxyBuilder::new(tls_config, auth_token, server_addr)
    }

    /// The bound address of the HTTP `CONNECT` listener.
    pub fn forward_addr(&self) -> SocketAddr {
        self.inner.forward_addr
    }

    /// The bound address of the UDP socket peers connect to.
    pub fn proxy_addr(&self) -> SocketAddr {
        self.inner.proxy_addr
    }

    /// The address of the backend server reverse tunnels are spliced onto.
    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_address.socket_addr()
    }

    /// The node id this proxy currently presents.
    pub fn node_id(&self) -> Option<NodeId> {
        self.inner.tls.get().node_id()
    }

    /// Replaces the key and certificate chain for all subsequent handshakes.
    pub fn set_tls_config(&self, config: TlsConfig) {
        info!(node = ?config.node_id().map(|id| id.fmt_short()), "replacing TLS config");
        self.inner.tls.set(config);
    }

    /// Establishes a forward connection to the peer proxy at `host:port`, or reuses the
    /// existing one.
    ///
    /// The peer must prove to be one of `node_ids`.  Returns the verified node id.
    pub async fn open_connection_forward(
        &self,
        node_ids: &[NodeId],
        host: Host,
        port: Port,
        ctx: StartContext,
    ) -> Result<NodeId, ProxyError> {
        let address = Address::target(host, port).context(InvalidTargetSnafu)?;
        self.inner.ensure_running()?;
        let (ctx, _link) = self.inner.link(ctx);
        let _guard = self.inner.forward_locks.lock(address).await;
        self.inner.ensure_running()?;
        let conn = self.inner.establish_forward(node_ids, address, ctx).await?;
        conn.node_id().context(NotRunningSnafu)
    }

    /// Stops the forward connection to `host:port`, if any.
    pub async fn close_connection_forward(&self, host: Host, port: Port) {
        let address = Address::new(host, port);
        let _guard = self.inner.forward_locks.lock(address).await;
        if let Some(conn) = self.inner.forward.get_remote(&address) {
            conn.stop().await;
        }
    }

    /// Starts a reverse connection for the peer proxy at `host:port`, or reuses the existing
    /// one.
    ///
    /// This punches a hole towards a peer about to connect.
    pub async fn open_connection_reverse(
        &self,
        host: Host,
        port: Port,
        ctx: StartContext,
    ) -> Result<(), ProxyError> {
        let address = Address::target(host, port).context(InvalidTargetSnafu)?;
        self.inner.ensure_running()?;
        let (ctx, _link) = self.inner.link(ctx);
        let _guard = self.inner.reverse_locks.lock(address).await;
        self.inner.ensure_running()?;
        self.inner.establish_reverse(address, ctx).await?;
        Ok(())
    }

    /// Stops the reverse connection for `host:port`, if any.
    pub async fn close_connection_reverse(&self, host: Host, port: Port) {
        let address = Address::new(host, port);
        let _guard = self.inner.reverse_locks.lock(address).await;
        if let Some(conn) = self.inner.reverse.get_remote(&address) {
            conn.stop().await;
        }
    }

    /// The number of forward connections.
    pub fn connection_forward_count(&self) -> usize {
        self.inner.forward.len()
    }

    /// The number of reverse connections.
    pub fn connection_reverse_count(&self) -> usize {
        self.inner.reverse.len()
    }

    /// The connection to or from the peer proxy at `host:port`.
    ///
    /// Forward connections take precedence.
    pub fn get_connection_info_by_proxy(&self, host: Host, port: Port) -> Option<ConnectionInfo> {
        let address = Address::new(host, port);
        self.inner
            .forward
            .get_remote(&address)
            .and_then(|conn| conn.info())
            .or_else(|| {
                self.inner
                    .reverse
                    .get_remote(&address)
                    .and_then(|conn| conn.info())
            })
    }

    /// The reverse connection whose backend connection has the local address `host:port`.
    pub fn get_connection_info_by_reverse(&self, host: Host, port: Port) -> Option<ConnectionInfo> {
        self.inner
            .reverse
            .get_local(&Address::new(host, port))
            .and_then(|conn| conn.info())
    }

    /// The forward connection serving the local client at `host:port`.
    pub fn get_connection_info_by_forward(&self, host: Host, port: Port) -> Option<ConnectionInfo> {
        self.inner
            .forward
            .get_local(&Address::new(host, port))
            .and_then(|conn| conn.info())
    }

    /// Stops the proxy.
    ///
    /// New requests are refused, every connection is stopped, then both listeners close.
    /// Calling this more than once has no further effect.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping proxy");
        self.inner.cancel_connections.cancel();

        let mut set = JoinSet::new();
        for conn in self.inner.forward.all() {
            set.spawn(async move { conn.stop().await });
        }
        for conn in self.inner.reverse.all() {
            set.spawn(async move { conn.stop().await });
        }
        while let Some(res) = set.join_next().await {
            if let Err(err) = res {
                warn!("stopping a connection failed: {err:#}");
            }
        }

        self.inner.cancel_listeners.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("poisoned"));
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!("listener task panicked: {err:#}");
                }
            }
        }
        self.inner
            .endpoint
            .close(CLOSE_STOPPED.into(), b"proxy stopped");
        info!("proxy stopped");
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<(), ProxyError> {
        ensure!(!self.stopped.load(Ordering::SeqCst), NotRunningSnafu);
        Ok(())
    }

    /// The context of a start the proxy runs on its own.
    fn context(&self) -> StartContext {
        StartContext::new(self.connect_timeout).with_cancel(self.cancel_connections.child_token())
    }

    /// Makes a caller provided context also cancel when the proxy stops.
    ///
    /// The link lives as long as the returned handle.
    fn link(&self, ctx: StartContext) -> (StartContext, AbortOnDropHandle<()>) {
        let cancel = self.cancel_connections.child_token();
        let task = {
            let outer = ctx.cancel;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                outer.cancelled().await;
                cancel.cancel();
            })
        };
        (
            StartContext::new(ctx.timeout).with_cancel(cancel),
            AbortOnDropHandle::new(task),
        )
    }

    /// Looks up or establishes the forward connection to `address`.
    ///
    /// Must be called with the address lock held.
    async fn establish_forward(
        &self,
        node_ids: &[NodeId],
        address: Address,
        ctx: StartContext,
    ) -> Result<Arc<ConnectionForward>, ProxyError> {
        if let Some(conn) = self.forward.get_remote(&address) {
            if let Some(node_id) = conn.node_id() {
                ensure!(
                    node_ids.contains(&node_id),
                    NodeIdMismatchSnafu { node_id }
                );
            }
            return Ok(conn);
        }

        let conn = ConnectionForward::new(
            self.transport.clone(),
            self.endpoint.clone(),
            address,
            node_ids.to_vec(),
            self.tls.clone(),
            self.connection_config.clone(),
            Arc::downgrade(&self.forward),
        );
        conn.start(ctx).await.context(ConnectionSnafu)?;
        Ok(conn)
    }

    /// Looks up or starts the reverse connection for `address`.
    ///
    /// A live connection is always reused, only one that is stopping is replaced.  Must be
    /// called with the address lock held.
    async fn establish_reverse(
        &self,
        address: Address,
        ctx: StartContext,
    ) -> Result<Arc<ConnectionReverse>, ProxyError> {
        if let Some(conn) = self.reverse.get_remote(&address) {
            if matches!(conn.phase(), Phase::Started | Phase::Composed) {
                return Ok(conn);
            }
            debug!(remote = %address, phase = %conn.phase(), "replacing reverse connection");
            conn.stop().await;
        }

        let conn = ConnectionReverse::new(
            self.transport.clone(),
            address,
            self.server_address,
            self.tls.clone(),
            self.connection_config.clone(),
            Arc::downgrade(&self.reverse),
        );
        conn.start(ctx).await.context(ConnectionSnafu)?;
        Ok(conn)
    }

    fn established(&self, remote_node_id: NodeId, address: Address, kind: ConnectionKind) {
        if let Some(callback) = &self.on_established {
            callback(ConnectionEstablished {
                remote_node_id,
                remote_host: address.host(),
                remote_port: address.port(),
                kind,
            });
        }
    }

    async fn run_http(self: Arc<Self>, listener: TcpListener) {
        let mut set = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel_listeners.cancelled() => break,
                Some(res) = set.join_next() => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            panic!("task panicked: {err:#?}");
                        }
                    }
                }
                res = listener.accept() => match res {
                    Ok((stream, client_addr)) => {
                        debug!(%client_addr, "accepted client");
                        let this = self.clone();
                        set.spawn(
                            async move { this.handle_connect(stream, client_addr).await }
                                .instrument(info_span!("connect", client = %client_addr)),
                        );
                    }
                    Err(err) => error!("failed to accept client: {err:#}"),
                },
            }
        }
        set.shutdown().await;
        debug!("http listener closed");
    }

    async fn run_quic(self: Arc<Self>) {
        let mut set = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel_listeners.cancelled() => break,
                Some(res) = set.join_next() => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            panic!("task panicked: {err:#?}");
                        }
                    }
                }
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => {
                        let remote = Address::from(incoming.remote_address());
                        let this = self.clone();
                        set.spawn(
                            async move { this.handle_connection_reverse(incoming).await }
                                .instrument(info_span!("reverse", %remote)),
                        );
                    }
                    None => break,
                },
            }
        }
        set.shutdown().await;
        debug!("quic listener closed");
    }

    async fn handle_connect(&self, mut stream: TcpStream, client_addr: SocketAddr) {
        let (conn, tunnel) = match self.connect_forward(&mut stream).await {
            Ok(res) => res,
            Err(err) => {
                let status = err.status();
                debug!(%status, "CONNECT failed: {err:#}");
                if let Err(err) = connect::write_response(&mut stream, status).await {
                    debug!("failed to write response: {err:#}");
                }
                return;
            }
        };

        let greeting = connect::response(StatusCode::OK);
        match conn
            .attach(tunnel, stream, client_addr.into(), Some(&greeting))
            .await
        {
            Ok(()) => {
                if let Some(node_id) = conn.node_id() {
                    self.established(node_id, conn.address(), ConnectionKind::Forward);
                }
            }
            Err(err) => debug!("failed to compose with client: {err:#}"),
        }
    }

    async fn connect_forward(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(Arc<ConnectionForward>, Tunnel), ProxyError> {
        self.ensure_running()?;
        let request = time::timeout(REQUEST_HEAD_TIMEOUT, connect::read_request(stream))
            .await
            .map_err(|_| RequestTimeoutSnafu.build())??;
        debug!(method = %request.method, target = %request.target, "request");
        ensure!(
            request.method == "CONNECT",
            MethodNotAllowedSnafu {
                method: request.method
            }
        );
        ensure!(
            connect::is_authorized(request.authorization.as_deref(), &self.auth_token),
            UnauthorizedSnafu
        );
        let (address, node_ids) = connect::parse_target(&request.target)?;

        let conn = {
            let _guard = self.forward_locks.lock(address).await;
            self.ensure_running()?;
            self.establish_forward(&node_ids, address, self.context())
                .await?
        };
        let tunnel = conn.open_tunnel().await.context(ConnectionSnafu)?;
        Ok((conn, tunnel))
    }

    async fn handle_connection_reverse(&self, incoming: quinn::Incoming) {
        let address = Address::from(incoming.remote_address());
        if self.ensure_running().is_err() {
            incoming.refuse();
            return;
        }

        let _guard = self.reverse_locks.lock(address).await;
        let conn = match self.establish_reverse(address, self.context()).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("failed to start reverse connection: {err:#}");
                incoming.refuse();
                return;
            }
        };
        // the tunnel of a composed connection stays untouched by later sessions
        if conn.phase() == Phase::Composed {
            warn!(remote = %address, "reverse connection already composed, refusing session");
            incoming.refuse();
            return;
        }
        match conn.compose(incoming, self.connect_timeout).await {
            Ok(node_id) => self.established(node_id, address, ConnectionKind::Reverse),
            Err(err) => warn!("failed to compose reverse connection: {err:#}"),
        }
    }
}

/// Errors binding the listeners of a proxy.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SpawnError {
    #[snafu(display("connect timeout {timeout:?} exceeds the maximum of {MAX_START_TIMEOUT:?}"))]
    ConnectTimeout { timeout: Duration },
    #[snafu(display("failed to bind the HTTP listener to {addr}"))]
    BindTcp {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("failed to bind the UDP socket to {addr}"))]
    BindUdp {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("failed to get the local address"))]
    LocalAddr { source: std::io::Error },
    #[snafu(display("failed to create the TLS config"))]
    TlsConfig { source: CreateConfigError },
    #[snafu(display("failed to create the QUIC endpoint"))]
    Endpoint { source: std::io::Error },
}

/// Errors at the proxy boundary.
///
/// Each maps to the HTTP status a local client receives, see [`ProxyError::status`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ProxyError {
    #[snafu(display("proxy is not running"))]
    NotRunning {},
    #[snafu(display("method {method} not allowed"))]
    MethodNotAllowed { method: String },
    #[snafu(display("failed to read the request"))]
    ReadRequest { source: std::io::Error },
    #[snafu(display("client closed the connection before the request was complete"))]
    UnexpectedEof {},
    #[snafu(display("timed out reading the request"))]
    RequestTimeout {},
    #[snafu(display("malformed request"))]
    MalformedRequest { source: httparse::Error },
    #[snafu(display("request head too large"))]
    HeadTooLarge {},
    #[snafu(display("unexpected {len} bytes after the request head"))]
    BufferNotEmpty { len: usize },
    #[snafu(display("invalid request target {url}"))]
    InvalidUrl { url: String },
    #[snafu(display("request target names no node id"))]
    MissingNodeId {},
    #[snafu(display("invalid node id"))]
    InvalidNodeId { source: KeyParsingError },
    #[snafu(display("invalid target address"))]
    InvalidTarget { source: AddressError },
    #[snafu(display("proxy authorization failed"))]
    Unauthorized {},
    #[snafu(display("connected peer is {node_id}, which was not requested"))]
    NodeIdMismatch { node_id: NodeId },
    #[snafu(display("connection failed"))]
    Connection { source: ConnectionError },
}

impl ProxyError {
    /// The HTTP status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NotRunning { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::Unauthorized { .. } => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::RequestTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            ProxyError::NodeIdMismatch { .. } => invalid_certificate(),
            ProxyError::Connection { source, .. } => match source {
                ConnectionError::StartTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ConnectionError::Verification { .. } => invalid_certificate(),
                // a reused connection which timed out before its tunnel was opened
                ConnectionError::KeepAliveTimeout { .. } => timeout_occurred(),
                err if err.is_start_failure() => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

fn invalid_certificate() -> StatusCode {
    StatusCode::from_u16(526).expect("fixed status")
}

fn timeout_occurred() -> StatusCode {
    StatusCode::from_u16(524).expect("fixed status")
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        connection::StopReason,
        test_utils::{echo_server, CertifiedNode},
    };

    const TOKEN: &str = "secret";

    fn localhost() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, 0).into()
    }

    /// A backend address nothing listens on.
    fn closed_port() -> SocketAddr {
        let socket = std::net::TcpListener::bind(localhost()).unwrap();
        socket.local_addr().unwrap()
    }

    async fn spawn_proxy(node: &CertifiedNode, server_addr: SocketAddr) -> Proxy {
        Proxy::builder(node.tls_config(), TOKEN, server_addr)
            .connect_timeout(Duration::from_secs(10))
            .spawn()
            .await
            .unwrap()
    }

    fn host_port(addr: SocketAddr) -> (Host, Port) {
        let addr = Address::from(addr);
        (addr.host(), addr.port())
    }

    fn connect_head(target: SocketAddr, node_ids: &[NodeId], authorization: &str) -> String {
        let query = node_ids
            .iter()
            .map(|id| format!("nodeId={id}"))
            .collect::<Vec<_>>()
            .join("&");
        format!(
            "CONNECT {target}?{query} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: {authorization}\r\n\r\n"
        )
    }

    /// Sends a request head and returns the stream with the response status.
    async fn request(proxy: &Proxy, head: &str) -> (TcpStream, u16) {
        let mut stream = TcpStream::connect(proxy.forward_addr()).await.unwrap();
        stream.write_all(head.as_bytes()).await.unwrap();

        // byte by byte, tunneled bytes follow the response head
        let mut response = Vec::new();
        while !response.ends_with(b"\r\n\r\n") {
            let byte = stream.read_u8().await.unwrap();
            response.push(byte);
        }
        let response = String::from_utf8(response).unwrap();
        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|status| status.parse().ok())
            .unwrap();
        (stream, status)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(10), async {
            while !condition() {
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_echo_through_tunnel() {
        let (echo_addr, _echo) = echo_server().await;
        let forward_node = CertifiedNode::self_signed();
        let reverse_node = CertifiedNode::self_signed();

        let established = Arc::new(Mutex::new(Vec::new()));
        let forward = {
            let established = established.clone();
            Proxy::builder(forward_node.tls_config(), TOKEN, closed_port())
                .connect_timeout(Duration::from_secs(10))
                .on_connection_established(move |event| {
                    established.lock().unwrap().push(event);
                })
                .spawn()
                .await
                .unwrap()
        };
        let reverse = spawn_proxy(&reverse_node, echo_addr).await;
        assert_eq!(reverse.server_addr(), echo_addr);

        let head = connect_head(reverse.proxy_addr(), &[reverse_node.node_id], "Bearer secret");
        let (mut stream, status) = request(&forward, &head).await;
        assert_eq!(status, 200);

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let (host, port) = host_port(reverse.proxy_addr());
        let info = forward.get_connection_info_by_proxy(host, port).unwrap();
        assert_eq!(info.remote_node_id, reverse_node.node_id);
        assert_eq!(info.kind, ConnectionKind::Forward);
        assert_eq!(info.remote_certificates, vec![reverse_node.der().clone()]);
        assert_eq!(forward.connection_forward_count(), 1);

        wait_until(|| !established.lock().unwrap().is_empty()).await;
        let (host, port) = host_port(stream.local_addr().unwrap());
        let info = forward.get_connection_info_by_forward(host, port).unwrap();
        assert_eq!(info.remote_node_id, reverse_node.node_id);

        let (host, port) = host_port(forward.proxy_addr());
        wait_until(|| reverse.get_connection_info_by_proxy(host, port).is_some()).await;
        let info = reverse.get_connection_info_by_proxy(host, port).unwrap();
        assert_eq!(info.remote_node_id, forward_node.node_id);
        assert_eq!(info.kind, ConnectionKind::Reverse);

        assert_eq!(
            *established.lock().unwrap(),
            vec![ConnectionEstablished {
                remote_node_id: reverse_node.node_id,
                remote_host: reverse.proxy_addr().ip().into(),
                remote_port: reverse.proxy_addr().port(),
                kind: ConnectionKind::Forward,
            }]
        );

        // the end of the client's stream travels to the backend and back
        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        wait_until(|| forward.connection_forward_count() == 0).await;
        wait_until(|| reverse.connection_reverse_count() == 0).await;

        forward.stop().await;
        reverse.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_basic_authorization() {
        let (echo_addr, _echo) = echo_server().await;
        let forward_node = CertifiedNode::self_signed();
        let reverse_node = CertifiedNode::self_signed();
        let forward = spawn_proxy(&forward_node, closed_port()).await;
        let reverse = spawn_proxy(&reverse_node, echo_addr).await;

        let basic = format!("Basic {}", data_encoding::BASE64.encode(b":secret"));
        let head = connect_head(reverse.proxy_addr(), &[reverse_node.node_id], &basic);
        let (_stream, status) = request(&forward, &head).await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unauthorized() {
        let node = CertifiedNode::self_signed();
        let peer = CertifiedNode::self_signed();
        let forward = spawn_proxy(&node, closed_port()).await;

        let head = connect_head("127.0.0.1:4000".parse().unwrap(), &[peer.node_id], "Bearer wrong");
        let (_stream, status) = request(&forward, &head).await;
        assert_eq!(status, 407);
        assert_eq!(forward.connection_forward_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_bad_requests() {
        let node = CertifiedNode::self_signed();
        let forward = spawn_proxy(&node, closed_port()).await;

        let (_stream, status) = request(&forward, "GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(status, 405);

        let head = connect_head("127.0.0.1:4000".parse().unwrap(), &[], "Bearer secret");
        let (_stream, status) = request(&forward, &head).await;
        assert_eq!(status, 400);

        let head = "CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Bearer secret\r\n\r\n";
        let (_stream, status) = request(&forward, head).await;
        assert_eq!(status, 400);
        assert_eq!(forward.connection_forward_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unclaimed_node_id() {
        let (echo_addr, _echo) = echo_server().await;
        let forward = spawn_proxy(&CertifiedNode::self_signed(), closed_port()).await;
        let reverse = spawn_proxy(&CertifiedNode::self_signed(), echo_addr).await;

        let expected = CertifiedNode::self_signed();
        let head = connect_head(reverse.proxy_addr(), &[expected.node_id], "Bearer secret");
        let (_stream, status) = request(&forward, &head).await;
        assert_eq!(status, 526);
        assert_eq!(forward.connection_forward_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_start_timeout() {
        let node = CertifiedNode::self_signed();
        let forward = Proxy::builder(node.tls_config(), TOKEN, closed_port())
            .connect_timeout(Duration::from_millis(500))
            .spawn()
            .await
            .unwrap();

        // a socket that never answers
        let silent = std::net::UdpSocket::bind(localhost()).unwrap();
        let peer = CertifiedNode::self_signed();
        let head = connect_head(silent.local_addr().unwrap(), &[peer.node_id], "Bearer secret");
        let (_stream, status) = request(&forward, &head).await;
        assert_eq!(status, 504);
        assert_eq!(forward.connection_forward_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_backend_unavailable() {
        let forward = spawn_proxy(&CertifiedNode::self_signed(), closed_port()).await;
        let reverse_node = CertifiedNode::self_signed();
        let reverse = spawn_proxy(&reverse_node, closed_port()).await;

        // the peer refuses the handshake when it cannot reach its backend
        let head = connect_head(reverse.proxy_addr(), &[reverse_node.node_id], "Bearer secret");
        let (_stream, status) = request(&forward, &head).await;
        assert_eq!(status, 502);
        assert_eq!(forward.connection_forward_count(), 0);
        assert_eq!(reverse.connection_reverse_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stopped_proxy_refuses() {
        let node = CertifiedNode::self_signed();
        let peer = CertifiedNode::self_signed();
        let forward = spawn_proxy(&node, closed_port()).await;
        forward.stop().await;
        forward.stop().await;

        let err = forward
            .open_connection_forward(
                &[peer.node_id],
                Ipv4Addr::LOCALHOST.into(),
                4000,
                StartContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(TcpStream::connect(forward.forward_addr()).await.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_connection_forward_once_per_address() {
        let (echo_addr, _echo) = echo_server().await;
        let forward = spawn_proxy(&CertifiedNode::self_signed(), closed_port()).await;
        let reverse_node = CertifiedNode::self_signed();
        let reverse = spawn_proxy(&reverse_node, echo_addr).await;
        let (host, port) = host_port(reverse.proxy_addr());

        let ctx = StartContext::new(Duration::from_secs(10));
        let node_ids = [reverse_node.node_id];
        let (a, b) = tokio::join!(
            forward.open_connection_forward(&node_ids, host, port, ctx.clone()),
            forward.open_connection_forward(&node_ids, host, port, ctx.clone()),
        );
        assert_eq!(a.unwrap(), reverse_node.node_id);
        assert_eq!(b.unwrap(), reverse_node.node_id);
        assert_eq!(forward.connection_forward_count(), 1);

        // a reused connection must still match the requested node ids
        let other = CertifiedNode::self_signed();
        let err = forward
            .open_connection_forward(&[other.node_id], host, port, ctx)
            .await
            .unwrap_err();
        assert_eq!(err.status().as_u16(), 526);

        forward.close_connection_forward(host, port).await;
        assert_eq!(forward.connection_forward_count(), 0);
        assert!(forward.get_connection_info_by_proxy(host, port).is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_start_timeout_ceiling() {
        let forward = spawn_proxy(&CertifiedNode::self_signed(), closed_port()).await;
        let peer = CertifiedNode::self_signed();

        let err = forward
            .open_connection_forward(
                &[peer.node_id],
                Ipv4Addr::LOCALHOST.into(),
                4000,
                StartContext::new(Duration::from_secs(25)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Connection {
                source: ConnectionError::StartTimeoutMax { .. },
                ..
            }
        ));
        assert_eq!(forward.connection_forward_count(), 0);

        let res = Proxy::builder(peer.tls_config(), TOKEN, closed_port())
            .connect_timeout(Duration::from_secs(25))
            .spawn()
            .await;
        assert!(matches!(res, Err(SpawnError::ConnectTimeout { .. })));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_keep_alive_stopped_connection_times_out() {
        let (echo_addr, _echo) = echo_server().await;
        let forward = spawn_proxy(&CertifiedNode::self_signed(), closed_port()).await;
        let reverse_node = CertifiedNode::self_signed();
        let reverse = spawn_proxy(&reverse_node, echo_addr).await;
        let address = Address::from(reverse.proxy_addr());

        forward
            .open_connection_forward(
                &[reverse_node.node_id],
                address.host(),
                address.port(),
                StartContext::new(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let conn = forward.inner.forward.get_remote(&address).unwrap();

        // stopped by its keep-alive between the lookup and the tunnel
        conn.stop_with(StopReason::KeepAliveTimeout).await;
        let err = conn
            .open_tunnel()
            .await
            .context(ConnectionSnafu)
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Connection {
                source: ConnectionError::KeepAliveTimeout { .. },
                ..
            }
        ));
        assert_eq!(err.status().as_u16(), 524);
        assert_eq!(forward.connection_forward_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_compose_is_single_use() {
        let (echo_addr, _echo) = echo_server().await;
        let forward = spawn_proxy(&CertifiedNode::self_signed(), closed_port()).await;
        let reverse_node = CertifiedNode::self_signed();
        let reverse = spawn_proxy(&reverse_node, echo_addr).await;
        let address = Address::from(reverse.proxy_addr());

        forward
            .open_connection_forward(
                &[reverse_node.node_id],
                address.host(),
                address.port(),
                StartContext::new(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let conn = forward.inner.forward.get_remote(&address).unwrap();
        assert_eq!(conn.phase(), Phase::Started);

        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let client_address: Address = "127.0.0.1:5000".parse().unwrap();
        conn.compose(proxy_side, client_address).await.unwrap();
        assert_eq!(conn.phase(), Phase::Composed);
        assert_eq!(conn.client_address().unwrap(), client_address);

        let (_other, other_side) = tokio::io::duplex(1024);
        let err = conn.compose(other_side, client_address).await.unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyComposed { .. }));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.stop().await;
        assert_eq!(conn.phase(), Phase::Stopped);
        let err = conn.compose(tokio::io::duplex(8).1, client_address).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotRunning { .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_graceful_end_is_bounded() {
        let (echo_addr, _echo) = echo_server().await;
        let config = ConnectionConfig {
            end_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let forward_node = CertifiedNode::self_signed();
        let forward = Proxy::builder(forward_node.tls_config(), TOKEN, closed_port())
            .connection_config(config)
            .connect_timeout(Duration::from_secs(10))
            .spawn()
            .await
            .unwrap();
        let reverse_node = CertifiedNode::self_signed();
        let reverse = spawn_proxy(&reverse_node, echo_addr).await;
        let address = Address::from(reverse.proxy_addr());

        forward
            .open_connection_forward(
                &[reverse_node.node_id],
                address.host(),
                address.port(),
                StartContext::new(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let conn = forward.inner.forward.get_remote(&address).unwrap();

        // the client never reads nor ends its side
        let (_client, proxy_side) = tokio::io::duplex(8);
        conn.compose(proxy_side, "127.0.0.1:5000".parse().unwrap())
            .await
            .unwrap();

        let started = time::Instant::now();
        conn.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.phase(), Phase::Stopped);
        assert_eq!(forward.connection_forward_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rejected_client_chain_tears_down() {
        let (echo_addr, _echo) = echo_server().await;
        let expired = CertifiedNode::builder()
            .validity(
                rcgen::date_time_ymd(2000, 1, 1),
                rcgen::date_time_ymd(2001, 1, 1),
            )
            .build();
        let forward = spawn_proxy(&expired, closed_port()).await;
        let reverse_node = CertifiedNode::self_signed();
        let reverse = spawn_proxy(&reverse_node, echo_addr).await;
        let address = Address::from(reverse.proxy_addr());

        // the handshake completes before the peer rejects the chain
        forward
            .open_connection_forward(
                &[reverse_node.node_id],
                address.host(),
                address.port(),
                StartContext::new(Duration::from_secs(10)),
            )
            .await
            .ok();
        wait_until(|| forward.connection_forward_count() == 0).await;
        wait_until(|| reverse.connection_reverse_count() == 0).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_later_session_keeps_composed_tunnel() {
        let (echo_addr, _echo) = echo_server().await;
        let forward = spawn_proxy(&CertifiedNode::self_signed(), closed_port()).await;
        let reverse_node = CertifiedNode::self_signed();
        let reverse = spawn_proxy(&reverse_node, echo_addr).await;

        let head = connect_head(reverse.proxy_addr(), &[reverse_node.node_id], "Bearer secret");
        let (mut stream, status) = request(&forward, &head).await;
        assert_eq!(status, 200);
        stream.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");

        let (host, port) = host_port(forward.proxy_addr());
        wait_until(|| reverse.get_connection_info_by_proxy(host, port).is_some()).await;
        let first = reverse
            .inner
            .reverse
            .get_remote(&Address::from(forward.proxy_addr()))
            .unwrap();
        assert_eq!(first.phase(), Phase::Composed);

        // another session from the same address, with a chain the reverse proxy rejects
        let expired = CertifiedNode::builder()
            .validity(
                rcgen::date_time_ymd(2000, 1, 1),
                rcgen::date_time_ymd(2001, 1, 1),
            )
            .build();
        let client_config = tls::make_client_config(
            &SharedTlsConfig::new(expired.tls_config()),
            &ConnectionConfig::default(),
        )
        .unwrap();
        let connecting = forward
            .inner
            .endpoint
            .connect_with(client_config, reverse.proxy_addr(), "localhost")
            .unwrap();
        let res = time::timeout(Duration::from_secs(10), connecting)
            .await
            .expect("session not refused in time");
        assert!(res.is_err());

        assert_eq!(first.phase(), Phase::Composed);
        assert!(first.stop_reason().is_none());
        assert_eq!(reverse.connection_reverse_count(), 1);
        stream.write_all(b"two").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");

        forward.stop().await;
        reverse.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_set_tls_config() {
        let (echo_addr, _echo) = echo_server().await;
        let forward = spawn_proxy(&CertifiedNode::self_signed(), closed_port()).await;
        let old = CertifiedNode::self_signed();
        let reverse = spawn_proxy(&old, echo_addr).await;
        assert_eq!(reverse.node_id(), Some(old.node_id));

        let new = CertifiedNode::self_signed();
        reverse.set_tls_config(new.tls_config());
        assert_eq!(reverse.node_id(), Some(new.node_id));

        let address = Address::from(reverse.proxy_addr());
        let node_id = forward
            .open_connection_forward(
                &[old.node_id, new.node_id],
                address.host(),
                address.port(),
                StartContext::new(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        assert_eq!(node_id, new.node_id);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_connection_reverse() {
        let (echo_addr, _echo) = echo_server().await;
        let reverse = spawn_proxy(&CertifiedNode::self_signed(), echo_addr).await;
        let peer = UdpTransport::bind(localhost()).unwrap();
        let peer_addr = {
            use quinn::AsyncUdpSocket;
            peer.local_addr().unwrap()
        };

        // the peer pings, which is all the punch phase waits for
        let pinger = {
            let peer = peer.clone();
            let target = Address::from(reverse.proxy_addr());
            AbortOnDropHandle::new(tokio::spawn(async move {
                loop {
                    peer.send_to(target, &crate::connection::Message::Ping.encode())
                        .await
                        .ok();
                    time::sleep(Duration::from_millis(50)).await;
                }
            }))
        };

        let (host, port) = host_port(peer_addr);
        reverse
            .open_connection_reverse(host, port, StartContext::new(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(reverse.connection_reverse_count(), 1);
        // not composed yet
        assert!(reverse.get_connection_info_by_proxy(host, port).is_none());

        reverse.close_connection_reverse(host, port).await;
        assert_eq!(reverse.connection_reverse_count(), 0);
        drop(pinger);
    }
}
