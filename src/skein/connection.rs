use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{RwLock, mpsc, watch};

use crate::skein::{
    envelope::{Envelope, TunnelData, kind},
    tunnel::Tunnel,
};

/// One logical control channel to a peer, backed by exactly one transport
/// instance at a time.
///
/// A backend's `connect` wires the [`ConnectionIo`] halves to two background
/// loops (outbound-drain, inbound-fill). The rest of the node only ever sees
/// the `Connection`: it pushes envelopes with [`Connection::send`] and drains
/// the inbound queue taken once via [`Connection::take_recv`].
pub struct Connection {
    pub uri: String,
    pub proxy_uri: Option<String>,

    send_tx: mpsc::UnboundedSender<Envelope>,
    recv_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,

    is_open: AtomicBool,
    cleaned: AtomicBool,
    cleanup: std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    closed_tx: watch::Sender<bool>,

    tunnels: RwLock<HashMap<u64, Arc<Tunnel>>>,
}

/// The transport-facing halves of a Connection's queues.
pub struct ConnectionIo {
    pub send_rx: mpsc::UnboundedReceiver<Envelope>,
    pub recv_tx: mpsc::UnboundedSender<Envelope>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.uri)
            .field("is_open", &self.is_open.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(uri: impl Into<String>) -> (Arc<Self>, ConnectionIo) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let conn = Arc::new(Self {
            uri: uri.into(),
            proxy_uri: None,
            send_tx,
            recv_rx: std::sync::Mutex::new(Some(recv_rx)),
            is_open: AtomicBool::new(true),
            cleaned: AtomicBool::new(false),
            cleanup: std::sync::Mutex::new(None),
            closed_tx,
            tunnels: RwLock::new(HashMap::new()),
        });
        (conn, ConnectionIo { send_rx, recv_tx })
    }

    #[cfg(test)]
    pub fn stub() -> (Arc<Self>, ConnectionIo) {
        Self::new("stub://test")
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    /// Register the transport's teardown closure (closing sockets, stopping
    /// pollers). Runs at most once, from [`Connection::cleanup`].
    pub fn set_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        *self.cleanup.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(f));
    }

    /// Idempotent teardown: the first call runs the transport teardown and
    /// marks the connection closed; later calls are no-ops.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.is_open.store(false, Ordering::Release);
        if let Some(f) = self.cleanup.lock().unwrap_or_else(|e| e.into_inner()).take() {
            f();
        }
        let _ = self.closed_tx.send(true);
        tracing::debug!(uri = %self.uri, "connection: cleaned up");
    }

    /// Observe connection loss. The receiver flips to `true` exactly once.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Queue an envelope for the outbound-drain loop. Returns `false` when
    /// the connection is already torn down.
    pub fn send(&self, env: Envelope) -> bool {
        self.send_tx.send(env).is_ok()
    }

    /// Take the inbound queue. Exactly one consumer (the dispatcher) may do
    /// this; a second call returns `None`.
    pub fn take_recv(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.recv_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub async fn tunnel(&self, id: u64) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(&id).cloned()
    }

    pub async fn add_tunnel(&self, tun: Arc<Tunnel>) {
        self.tunnels.write().await.insert(tun.id, tun);
    }

    pub async fn remove_tunnel(&self, id: u64) -> Option<Arc<Tunnel>> {
        self.tunnels.write().await.remove(&id)
    }

    pub async fn tunnel_count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Ask the peer to retransmit tunnel data from our current read
    /// sequence. Carried as a `TunnelData` frame with `resend` set.
    pub fn request_resend(&self, td: &TunnelData) -> bool {
        match Envelope::new(kind::TUNNEL_DATA, td) {
            Ok(env) => self.send(env),
            Err(err) => {
                tracing::warn!(err = %err, "connection: encode resend request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn cleanup_runs_exactly_once() {
        let (conn, _io) = Connection::stub();
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = calls.clone();
        conn.set_cleanup(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(conn.is_open());
        conn.cleanup();
        conn.cleanup();
        conn.cleanup();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn cleanup_signals_closed_watchers() {
        let (conn, _io) = Connection::stub();
        let mut closed = conn.closed();
        assert!(!*closed.borrow());

        conn.cleanup();
        closed.changed().await.unwrap();
        assert!(*closed.borrow());
    }

    #[tokio::test]
    async fn send_reaches_transport_half() {
        let (conn, mut io) = Connection::stub();
        assert!(conn.send(Envelope {
            id: 1,
            kind: kind::PING,
            data: vec![],
        }));
        let got = io.send_rx.recv().await.unwrap();
        assert_eq!(got.kind, kind::PING);
    }

    #[tokio::test]
    async fn recv_taken_once() {
        let (conn, _io) = Connection::stub();
        assert!(conn.take_recv().is_some());
        assert!(conn.take_recv().is_none());
    }
}
