//! UDP transport with address-keyed dispatch.
//!
//! One socket pair per DAW: we bind a local port for inbound replies and
//! push notifications, and send every outbound message to the remote
//! script's fixed port. A background task owns the receive side and routes
//! each decoded message to the subscribers registered for its address.
//!
//! Two kinds of subscriber exist:
//! - streams (`subscribe`) receive every message on an address until the
//!   receiver is dropped; used for push notifications.
//! - single-shot waiters (`expect_reply`) receive exactly one message and
//!   are removed; used by the request/response layer.
//!
//! Inbound messages on `/live/error` are logged at error level before
//! dispatch so DAW-side failures are never silently dropped.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::codec::OscMessage;

/// The DAW-side error notification address.
pub const ERROR_ADDRESS: &str = "/live/error";

/// Largest datagram we accept. Bulk track-data replies for big sets run to
/// a few kilobytes; 64 KiB is the UDP ceiling anyway.
const MAX_DATAGRAM: usize = 65_536;

/// Socket pair configuration.
#[derive(Debug, Clone)]
pub struct OscConfig {
    /// Local port bound for inbound messages. 0 picks an ephemeral port.
    pub local_port: u16,
    /// Host the DAW remote script listens on.
    pub remote_host: String,
    /// Port the DAW remote script listens on.
    pub remote_port: u16,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            local_port: 11001,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 11000,
        }
    }
}

/// A registered single-shot waiter, cancellable by token.
pub struct ReplySlot {
    pub token: u64,
    pub rx: oneshot::Receiver<OscMessage>,
}

#[derive(Default)]
struct Route {
    streams: Vec<mpsc::UnboundedSender<OscMessage>>,
    once: VecDeque<(u64, oneshot::Sender<OscMessage>)>,
}

impl Route {
    fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.once.is_empty()
    }
}

#[derive(Default)]
struct Dispatch {
    routes: Mutex<HashMap<String, Route>>,
    next_token: AtomicU64,
}

impl Dispatch {
    fn deliver(&self, msg: OscMessage) {
        let mut routes = self.routes.lock().unwrap();
        let Some(route) = routes.get_mut(&msg.address) else {
            trace!(address = %msg.address, "no subscriber for inbound message");
            return;
        };

        if let Some((token, tx)) = route.once.pop_front() {
            if tx.send(msg.clone()).is_err() {
                debug!(address = %msg.address, token, "reply waiter already gone");
            }
        }

        route
            .streams
            .retain(|tx| tx.send(msg.clone()).is_ok());

        if route.is_empty() {
            routes.remove(&msg.address);
        }
    }
}

/// The shared UDP socket pair.
pub struct OscTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    dispatch: Arc<Dispatch>,
    recv_task: JoinHandle<()>,
}

impl OscTransport {
    /// Bind the local port and spawn the receive loop.
    ///
    /// A bind failure is returned to the caller; the process treats it as
    /// fatal.
    pub async fn bind(config: &OscConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.local_port)).await?;
        let remote = tokio::net::lookup_host((config.remote_host.as_str(), config.remote_port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}", config.remote_host),
                )
            })?;

        let socket = Arc::new(socket);
        let dispatch = Arc::new(Dispatch::default());

        let recv_task = tokio::spawn(recv_loop(socket.clone(), dispatch.clone()));

        debug!(
            local = %socket.local_addr()?,
            %remote,
            "OSC transport bound"
        );

        Ok(Self {
            socket,
            remote,
            dispatch,
            recv_task,
        })
    }

    /// Fire-and-forget send to the DAW.
    pub async fn send(&self, msg: &OscMessage) -> io::Result<()> {
        trace!(address = %msg.address, "send");
        self.socket.send_to(&msg.encode(), self.remote).await?;
        Ok(())
    }

    /// Subscribe to every inbound message on an address. The subscription
    /// ends when the returned receiver is dropped.
    pub fn subscribe(&self, address: &str) -> mpsc::UnboundedReceiver<OscMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.dispatch.routes.lock().unwrap();
        routes.entry(address.to_string()).or_default().streams.push(tx);
        rx
    }

    /// Register a single-shot waiter for the next message on an address.
    pub fn expect_reply(&self, address: &str) -> ReplySlot {
        let (tx, rx) = oneshot::channel();
        let token = self.dispatch.next_token.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.dispatch.routes.lock().unwrap();
        routes
            .entry(address.to_string())
            .or_default()
            .once
            .push_back((token, tx));
        ReplySlot { token, rx }
    }

    /// Remove a single-shot waiter that is no longer wanted (timeout).
    pub fn cancel_reply(&self, address: &str, token: u64) {
        let mut routes = self.dispatch.routes.lock().unwrap();
        if let Some(route) = routes.get_mut(address) {
            route.once.retain(|(t, _)| *t != token);
            if route.is_empty() {
                routes.remove(address);
            }
        }
    }

    /// Local address the transport receives on (ephemeral ports in tests).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stop the receive loop. Pending waiters observe a closed channel.
    pub fn shutdown(&self) {
        self.recv_task.abort();
    }
}

impl Drop for OscTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, dispatch: Arc<Dispatch>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                // Per-datagram receive errors are not fatal to the loop.
                warn!(error = %e, "UDP receive error");
                continue;
            }
        };

        let msg = match OscMessage::decode(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%from, error = %e, "discarding undecodable datagram");
                continue;
            }
        };

        if msg.address == ERROR_ADDRESS {
            error!(args = ?msg.args, "DAW reported an error");
        }

        dispatch.deliver(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OscValue;

    async fn loopback_pair() -> (OscTransport, UdpSocket) {
        // The peer plays the DAW: transport sends to it, it replies to the
        // transport's local address.
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = OscConfig {
            local_port: 0,
            remote_host: "127.0.0.1".to_string(),
            remote_port: peer.local_addr().unwrap().port(),
        };
        let transport = OscTransport::bind(&config).await.unwrap();
        (transport, peer)
    }

    #[tokio::test]
    async fn subscribe_receives_pushed_messages() {
        let (transport, peer) = loopback_pair().await;
        let local = transport.local_addr().unwrap();
        let mut rx = transport.subscribe("/live/device/get/parameter/value");

        let push = OscMessage::new(
            "/live/device/get/parameter/value",
            vec![OscValue::Int(0), OscValue::Int(0), OscValue::Int(3), OscValue::Float(0.5)],
        );
        peer.send_to(&push.encode(), local).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got, push);
    }

    #[tokio::test]
    async fn once_waiter_fires_once_and_is_removed() {
        let (transport, peer) = loopback_pair().await;
        let local = transport.local_addr().unwrap();

        let slot = transport.expect_reply("/live/test");
        let msg = OscMessage::new("/live/test", vec![OscValue::Str("ok".into())]);
        peer.send_to(&msg.encode(), local).await.unwrap();
        assert_eq!(slot.rx.await.unwrap(), msg);

        // A second message on the same address finds no waiter; nothing
        // hangs and nothing panics.
        peer.send_to(&msg.encode(), local).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_steal_later_replies() {
        let (transport, peer) = loopback_pair().await;
        let local = transport.local_addr().unwrap();

        let stale = transport.expect_reply("/live/test");
        transport.cancel_reply("/live/test", stale.token);

        let fresh = transport.expect_reply("/live/test");
        let msg = OscMessage::new("/live/test", vec![OscValue::Str("ok".into())]);
        peer.send_to(&msg.encode(), local).await.unwrap();

        assert_eq!(fresh.rx.await.unwrap(), msg);
    }

    #[tokio::test]
    async fn undecodable_datagram_keeps_loop_alive() {
        let (transport, peer) = loopback_pair().await;
        let local = transport.local_addr().unwrap();

        peer.send_to(b"not osc at all", local).await.unwrap();

        let mut rx = transport.subscribe("/live/test");
        let msg = OscMessage::new("/live/test", vec![]);
        peer.send_to(&msg.encode(), local).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), msg);
    }
}
