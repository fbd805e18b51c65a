//! The UDP socket shared by the QUIC endpoint and every connection of a proxy.
//!
//! Besides QUIC packets the socket carries the 4 byte ping and pong control frames used for
//! hole punching and keep-alive.  Those are taken out of the receive path before quinn sees
//! them, answered when they are pings, and recorded as activity of the sending address.

use std::{
    collections::HashMap,
    fmt, io,
    net::{SocketAddr, UdpSocket},
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{ready, Context, Poll},
    time::Duration,
};

use lru::LruCache;
use quinn::{
    udp::{RecvMeta, Transmit},
    AsyncUdpSocket, Runtime, UdpPoller,
};
use tokio::{sync::watch, time::Instant};
use tracing::{trace, warn};

use crate::{
    address::Address,
    connection::Message,
    defaults::DEFAULT_RECENT_PEERS_CAPACITY,
};

/// A UDP socket which intercepts ping/pong control frames.
#[derive(Debug)]
pub(crate) struct UdpTransport {
    inner: Arc<dyn AsyncUdpSocket>,
    activity: Mutex<Activity>,
}

/// When each remote address was last heard from.
struct Activity {
    watched: HashMap<Address, Watched>,
    recent: LruCache<Address, Instant>,
}

struct Watched {
    sender: watch::Sender<Option<Instant>>,
    watchers: usize,
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("watched", &self.watched.len())
            .field("recent", &self.recent.len())
            .finish()
    }
}

impl UdpTransport {
    /// Binds a new socket.
    pub(crate) fn bind(addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let inner = quinn::TokioRuntime.wrap_udp_socket(socket)?;
        let capacity =
            NonZeroUsize::new(DEFAULT_RECENT_PEERS_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Arc::new(Self {
            inner,
            activity: Mutex::new(Activity {
                watched: HashMap::new(),
                recent: LruCache::new(capacity),
            }),
        }))
    }

    /// Sends a single datagram.
    pub(crate) async fn send_to(&self, addr: Address, contents: &[u8]) -> io::Result<()> {
        let transmit = Transmit {
            destination: addr.socket_addr(),
            ecn: None,
            contents,
            segment_size: None,
            src_ip: None,
        };
        let mut poller = self.inner.clone().create_io_poller();
        loop {
            std::future::poll_fn(|cx| poller.as_mut().poll_writable(cx)).await?;
            match self.inner.try_send(&transmit) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                res => return res,
            }
        }
    }

    /// Starts watching the activity of `addr`.
    ///
    /// The watcher starts out with the last time `addr` was heard from, if it is still
    /// remembered.
    pub(crate) fn watch(self: &Arc<Self>, addr: Address) -> ActivityWatcher {
        let mut guard = self.activity.lock().expect("poisoned");
        let activity = &mut *guard;
        let seen = activity.recent.peek(&addr).copied();
        let watched = activity.watched.entry(addr).or_insert_with(|| Watched {
            sender: watch::Sender::new(seen),
            watchers: 0,
        });
        watched.watchers += 1;
        let receiver = watched.sender.subscribe();
        ActivityWatcher {
            addr,
            receiver,
            transport: self.clone(),
        }
    }

    fn unwatch(&self, addr: &Address) {
        let mut guard = self.activity.lock().expect("poisoned");
        let activity = &mut *guard;
        let Some(watched) = activity.watched.get_mut(addr) else {
            return;
        };
        watched.watchers -= 1;
        if watched.watchers == 0 {
            if let Some(watched) = activity.watched.remove(addr) {
                if let Some(seen) = *watched.sender.borrow() {
                    activity.recent.put(*addr, seen);
                }
            }
        }
    }

    fn record(&self, addr: Address) {
        let now = Instant::now();
        let mut guard = self.activity.lock().expect("poisoned");
        let activity = &mut *guard;
        match activity.watched.get(&addr) {
            Some(watched) => {
                watched.sender.send_replace(Some(now));
            }
            None => {
                activity.recent.put(addr, now);
            }
        }
    }

    fn handle_control(&self, message: Message, addr: SocketAddr) {
        match message {
            Message::Ping => {
                let pong = Message::Pong.encode();
                let transmit = Transmit {
                    destination: addr,
                    ecn: None,
                    contents: &pong,
                    segment_size: None,
                    src_ip: None,
                };
                if let Err(err) = self.inner.try_send(&transmit) {
                    trace!(dst = %addr, "failed to send pong: {err:#}");
                }
            }
            Message::Pong => {}
        }
    }
}

impl AsyncUdpSocket for UdpTransport {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.inner.try_send(transmit)
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [io::IoSliceMut<'_>],
        metas: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        debug_assert_eq!(bufs.len(), metas.len(), "non matching bufs & metas");
        let msgs = ready!(self.inner.poll_recv(cx, bufs, metas))?;

        for (meta, buf) in metas.iter_mut().zip(bufs.iter_mut()).take(msgs) {
            self.record(meta.addr.into());
            if meta.stride == 0 {
                continue;
            }

            let mut start = 0;
            let mut is_quic = false;
            while start < meta.len {
                let end = (start + meta.stride).min(meta.len);
                match Message::decode(&buf[start..end]) {
                    Ok(message) => {
                        trace!(src = %meta.addr, ?message, "UDP recv: control frame");
                        self.handle_control(message, meta.addr);
                        // quinn ignores packets starting with a zero byte
                        buf[start] = 0u8;
                    }
                    Err(_) => is_quic = true,
                }
                start = end;
            }

            if !is_quic {
                // only control frames, nothing for quinn
                meta.len = 0;
            }
        }

        Poll::Ready(Ok(msgs))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn max_transmit_segments(&self) -> usize {
        self.inner.max_transmit_segments()
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.max_receive_segments()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}

/// Observes when a remote address was last heard from.
///
/// Dropping the last watcher of an address stops tracking it individually.
#[derive(Debug)]
pub(crate) struct ActivityWatcher {
    addr: Address,
    receiver: watch::Receiver<Option<Instant>>,
    transport: Arc<UdpTransport>,
}

impl ActivityWatcher {
    /// The last time the address was heard from.
    pub(crate) fn last_seen(&self) -> Option<Instant> {
        *self.receiver.borrow()
    }

    /// Waits until the address is heard from again.
    pub(crate) async fn changed(&mut self) {
        if self.receiver.changed().await.is_err() {
            // the transport keeps the sender alive for as long as there are watchers
            warn!(addr = %self.addr, "activity sender dropped");
            std::future::pending::<()>().await;
        }
    }

    /// Waits until the address has been heard from within the last `window`.
    pub(crate) async fn heard_within(&mut self, window: Duration) {
        let heard = self
            .receiver
            .wait_for(|seen| seen.is_some_and(|at| at.elapsed() < window))
            .await
            .is_ok();
        if !heard {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for ActivityWatcher {
    fn drop(&mut self) {
        self.transport.unwatch(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::time::timeout;

    use super::*;

    fn localhost() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, 0).into()
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_ping_is_answered_with_pong() {
        let a = UdpTransport::bind(localhost()).unwrap();
        let b = UdpTransport::bind(localhost()).unwrap();
        let a_addr: Address = a.local_addr().unwrap().into();
        let b_addr: Address = b.local_addr().unwrap().into();

        // b only answers while something polls its receive path
        let b_recv = b.clone();
        let _recv = tokio::spawn(async move { drain(b_recv).await });
        let a_recv = a.clone();
        let _recv_a = tokio::spawn(async move { drain(a_recv).await });

        let mut watcher = a.watch(b_addr);
        assert!(watcher.last_seen().is_none());
        a.send_to(b_addr, &Message::Ping.encode()).await.unwrap();
        timeout(Duration::from_secs(5), watcher.changed())
            .await
            .expect("no pong received");
        assert!(watcher.last_seen().is_some());

        // b heard a's ping before anyone watched a, so a new watcher is seeded
        let watcher = b.watch(a_addr);
        assert!(watcher.last_seen().is_some());
    }

    #[tokio::test]
    async fn test_unwatch_remembers_activity() {
        let a = UdpTransport::bind(localhost()).unwrap();
        let addr: Address = "127.0.0.1:9".parse().unwrap();
        let watcher = a.watch(addr);
        let second = a.watch(addr);
        a.record(addr);
        drop(watcher);
        assert_eq!(a.activity.lock().unwrap().watched.len(), 1);
        drop(second);
        let activity = a.activity.lock().unwrap();
        assert!(activity.watched.is_empty());
        assert!(activity.recent.peek(&addr).is_some());
    }

    async fn drain(transport: Arc<UdpTransport>) {
        let mut buf = vec![0u8; 2048];
        let mut meta = [RecvMeta::default()];
        loop {
            let mut bufs = [io::IoSliceMut::new(&mut buf)];
            if std::future::poll_fn(|cx| transport.poll_recv(cx, &mut bufs, &mut meta))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}
