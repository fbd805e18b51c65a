//! Per-peer tunnel connections.
//!
//! A [`ConnectionForward`] dials a peer proxy on behalf of a local TCP client, a
//! [`ConnectionReverse`] accepts a peer proxy and connects it to the local backend.  Both
//! punch holes with ping frames while starting, keep the path alive with pings once
//! started, and are stopped exactly once.

use std::{
    convert::Infallible,
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};

use nested_enum_utils::common_fields;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    address::{Address, Host, Port},
    defaults::{timeouts::*, MAX_START_TIMEOUT},
    key::NodeId,
    socket::{ActivityWatcher, UdpTransport},
    tls::{chain::ChainError, CreateConfigError, SharedTlsConfig},
};

mod forward;
mod reverse;
mod splice;

pub use self::{forward::ConnectionForward, reverse::ConnectionReverse};
pub(crate) use self::splice::Tunnel;

/// The bytes the opener of a tunnel stream writes first.
///
/// QUIC only announces a stream to the peer once data is sent on it.
pub(crate) const STREAM_HEADER: [u8; 4] = *b"npx1";

/// Application close code of a QUIC connection stopped locally.
pub(crate) const CLOSE_STOPPED: u32 = 0;
/// Application close code of a QUIC connection whose peer failed verification.
pub(crate) const CLOSE_VERIFICATION_FAILED: u32 = 1;

/// The timing parameters of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// A connection which hears nothing from its peer for this long stops.
    pub keep_alive_timeout: Duration,
    /// Interval of the keep-alive pings of a started connection.
    pub keep_alive_interval: Duration,
    /// Interval of the hole punching pings while starting.
    pub punch_interval: Duration,
    /// Bound on the graceful end of both legs when stopping.
    pub end_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            punch_interval: DEFAULT_PUNCH_INTERVAL,
            end_timeout: DEFAULT_END_TIMEOUT,
        }
    }
}

/// Deadline and cancellation of a start.
#[derive(Debug, Clone)]
pub struct StartContext {
    /// How long the start may take, at most [`MAX_START_TIMEOUT`].
    pub timeout: Duration,
    /// Cancels the start when triggered.
    pub cancel: CancellationToken,
}

impl Default for StartContext {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl StartContext {
    /// Creates a context with the given timeout that is never cancelled.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A context with the same timeout which is cancelled together with this one, but can
    /// also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            timeout: self.timeout,
            cancel: self.cancel.child_token(),
        }
    }

    /// Checks the timeout against the ceiling and returns the deadline.
    fn deadline(&self) -> Result<Instant, ConnectionError> {
        snafu::ensure!(
            self.timeout <= MAX_START_TIMEOUT,
            StartTimeoutMaxSnafu {
                timeout: self.timeout
            }
        );
        Ok(Instant::now() + self.timeout)
    }
}

/// The lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, not yet started.
    Idle,
    /// The start is in progress.
    Starting,
    /// Started, waiting to be composed.
    Started,
    /// Composed with its local TCP leg, bytes are flowing.
    Composed,
    /// The stop is in progress.
    Stopping,
    /// Stopped for good.
    Stopped,
}

/// Why a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum StopReason {
    /// Stopped by its owner.
    #[display("requested")]
    Requested,
    /// Nothing was heard from the peer within the keep-alive timeout.
    #[display("keep-alive timeout")]
    KeepAliveTimeout,
    /// The peer closed the QUIC connection.
    #[display("closed by peer")]
    PeerClosed,
    /// Both legs of the tunnel ended.
    #[display("finished")]
    Finished,
    /// Composing failed.
    #[display("failed")]
    Failed,
}

/// Which side of a tunnel a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Dialed out on behalf of a local client.
    Forward,
    /// Accepted from a peer and connected to the local backend.
    Reverse,
}

/// A snapshot of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The verified node id of the peer.
    pub remote_node_id: NodeId,
    /// The certificate chain the peer presented.
    pub remote_certificates: Vec<CertificateDer<'static>>,
    /// Host of the local UDP socket.
    pub local_host: Host,
    /// Port of the local UDP socket.
    pub local_port: Port,
    /// Host of the peer's UDP socket.
    pub remote_host: Host,
    /// Port of the peer's UDP socket.
    pub remote_port: Port,
    /// Which side of the tunnel this is.
    pub kind: ConnectionKind,
}

/// The control frames sent over the shared UDP socket.
///
/// Each frame is a single big endian `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Message {
    /// Asks the receiver for a [`Message::Pong`].
    Ping = 0,
    /// The answer to a [`Message::Ping`].
    Pong = 1,
}

impl Message {
    /// The length of an encoded frame.
    pub const LEN: usize = 4;

    /// Encodes the frame.
    pub fn encode(self) -> [u8; Self::LEN] {
        (self as u32).to_be_bytes()
    }

    /// Decodes a frame, failing for anything but an exact ping or pong.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let tag: [u8; Self::LEN] = bytes
            .try_into()
            .map_err(|_| InvalidLengthSnafu { len: bytes.len() }.build())?;
        match u32::from_be_bytes(tag) {
            0 => Ok(Message::Ping),
            1 => Ok(Message::Pong),
            tag => UnknownTagSnafu { tag }.fail(),
        }
    }
}

/// Error decoding a control frame.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display("control frames are 4 bytes, got {len}"))]
    InvalidLength { len: usize },
    #[snafu(display("unknown control frame tag {tag}"))]
    UnknownTag { tag: u32 },
}

/// Errors of the connection lifecycle.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConnectionError {
    #[snafu(display("start timeout {timeout:?} exceeds the maximum of {MAX_START_TIMEOUT:?}"))]
    StartTimeoutMax { timeout: Duration },
    #[snafu(display("start timed out after {timeout:?}"))]
    StartTimeout { timeout: Duration },
    #[snafu(display("start cancelled"))]
    StartCancelled {},
    #[snafu(display("start failed"))]
    Start { source: std::io::Error },
    #[snafu(display("failed to initiate QUIC connection"))]
    Connect { source: quinn::ConnectError },
    #[snafu(display("QUIC handshake failed"))]
    Handshake { source: quinn::ConnectionError },
    #[snafu(display("peer certificate chain verification failed"))]
    Verification { source: ChainError },
    #[snafu(display("failed to create TLS config"))]
    TlsConfig { source: CreateConfigError },
    #[snafu(display("compose failed"))]
    Compose { source: std::io::Error },
    #[snafu(display("compose timed out after {timeout:?}"))]
    ComposeTimeout { timeout: Duration },
    #[snafu(display("connection is already composed"))]
    AlreadyComposed {},
    #[snafu(display("connection is not composed"))]
    NotComposed {},
    #[snafu(display("connection is not running ({phase:?})"))]
    NotRunning { phase: Phase },
    /// The connection stopped because its peer went silent, before the operation could use
    /// it.
    #[snafu(display("connection stopped after the keep-alive timeout"))]
    KeepAliveTimeout {},
}

impl ConnectionError {
    /// Whether the failure happened while establishing the QUIC connection.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            ConnectionError::Start { .. }
                | ConnectionError::Connect { .. }
                | ConnectionError::Handshake { .. }
        )
    }
}

/// The state a connection needs regardless of its direction.
#[derive(Debug)]
pub(crate) struct Connection {
    transport: Arc<UdpTransport>,
    address: Address,
    tls: SharedTlsConfig,
    config: ConnectionConfig,
}

impl Connection {
    pub(crate) fn new(
        transport: Arc<UdpTransport>,
        address: Address,
        tls: SharedTlsConfig,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            address,
            tls,
            config,
        }
    }

    /// Best effort datagram write to the peer.
    pub(crate) async fn send(&self, bytes: &[u8]) {
        if let Err(err) = self.transport.send_to(self.address, bytes).await {
            debug!(remote = %self.address, "failed to send datagram: {err:#}");
        }
    }

    /// Sends a ping every punch interval, forever.
    async fn punch(&self) -> Infallible {
        let mut interval = time::interval(self.config.punch_interval);
        loop {
            interval.tick().await;
            trace!(remote = %self.address, "punch");
            self.send(&Message::Ping.encode()).await;
        }
    }

    fn watch(&self) -> ActivityWatcher {
        self.transport.watch(self.address)
    }

    fn local_address(&self) -> Option<Address> {
        use quinn::AsyncUdpSocket;

        self.transport.local_addr().ok().map(Address::from)
    }

    fn info(&self, session: &Session, kind: ConnectionKind) -> Option<ConnectionInfo> {
        let local = self.local_address()?;
        Some(ConnectionInfo {
            remote_node_id: session.node_id,
            remote_certificates: session.certificates.clone(),
            local_host: local.host(),
            local_port: local.port(),
            remote_host: self.address.host(),
            remote_port: self.address.port(),
            kind,
        })
    }
}

/// The verified QUIC connection of a started or composed connection.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    connection: quinn::Connection,
    node_id: NodeId,
    certificates: Vec<CertificateDer<'static>>,
}

/// Returns the certificate chain the peer presented during the handshake.
fn peer_certificates(connection: &quinn::Connection) -> Vec<CertificateDer<'static>> {
    connection
        .peer_identity()
        .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
        .map(|certs| *certs)
        .unwrap_or_default()
}

/// Keeps a started connection alive.
///
/// Pings the peer every keep-alive interval and returns once nothing was heard from the
/// peer for the keep-alive timeout, or `closed` resolves.  Returns `None` when cancelled.
async fn supervise(
    conn: &Connection,
    mut watcher: ActivityWatcher,
    cancel: &CancellationToken,
    closed: impl Future<Output = ()>,
) -> Option<StopReason> {
    let keep_alive = time::sleep(conn.config.keep_alive_timeout);
    tokio::pin!(keep_alive, closed);
    let mut ping = time::interval(conn.config.keep_alive_interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = &mut closed => return Some(StopReason::PeerClosed),
            _ = &mut keep_alive => {
                warn!(remote = %conn.address, "no activity within {:?}", conn.config.keep_alive_timeout);
                return Some(StopReason::KeepAliveTimeout);
            }
            _ = watcher.changed() => {
                keep_alive
                    .as_mut()
                    .reset(Instant::now() + conn.config.keep_alive_timeout);
            }
            _ = ping.tick() => {
                conn.send(&Message::Ping.encode()).await;
            }
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
