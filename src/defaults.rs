//! Default values used by the proxy and its connections.

use std::time::Duration;

/// The hard ceiling for the timeout a caller may request when starting a connection.
///
/// Requests above this are rejected up front instead of being silently truncated.
pub const MAX_START_TIMEOUT: Duration = Duration::from_secs(20);

/// The capacity of the cache remembering which remote addresses were recently heard from.
pub const DEFAULT_RECENT_PEERS_CAPACITY: usize = 1024;

/// The maximum size of an HTTP request head accepted by the forward front-end.
pub const MAX_REQUEST_HEAD_SIZE: usize = 8 * 1024;

/// Contains all timeouts that we use.
pub mod timeouts {
    use std::time::Duration;

    /// Time allowed for establishing a connection on behalf of a proxy client.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// A connection that hears nothing from its peer for this long is considered dead.
    pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(20);

    /// Interval of the keep-alive pings of a started connection.
    pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

    /// Interval of the hole punching pings while a connection is starting.
    pub const DEFAULT_PUNCH_INTERVAL: Duration = Duration::from_secs(1);

    /// How long a graceful end waits for the peer before the transport is destroyed.
    pub const DEFAULT_END_TIMEOUT: Duration = Duration::from_secs(1);

    /// Time a client has to send the complete `CONNECT` request head.
    pub const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(5);
}
