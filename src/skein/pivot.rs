use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use anyhow::Context;
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::{net::TcpListener, sync::mpsc};

use crate::skein::{
    connection::Connection,
    envelope::{
        Envelope, PivotListenerInfo, PivotPeerEnvelope, PivotPeerFailure, kind, read_envelope,
        write_envelope,
    },
};

/// One bound pivot listener accepting downstream peers.
pub struct PivotListener {
    pub id: u64,
    pub kind: String,
    pub bind_address: String,
    peer_count: AtomicUsize,
    task: tokio::task::JoinHandle<()>,
}

impl PivotListener {
    pub fn info(&self) -> PivotListenerInfo {
        PivotListenerInfo {
            id: self.id,
            kind: self.kind.clone(),
            bind_address: self.bind_address.clone(),
            peers: self.peer_count.load(Ordering::Acquire),
        }
    }
}

impl Drop for PivotListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Registry of pivot listeners and the downstream peers they have accepted.
///
/// Downstream envelopes are wrapped as [`PivotPeerEnvelope`] and sent up the
/// node's own connection; responses come back through [`PivotRegistry::route_down`]
/// keyed by peer id. The upstream connection changes across reconnects, so it
/// is held weakly and refreshed by the dispatcher.
pub struct PivotRegistry {
    listeners: DashMap<u64, Arc<PivotListener>>,
    peers: DashMap<u64, mpsc::UnboundedSender<Envelope>>,
    next_listener_id: AtomicU64,
    next_peer_id: AtomicU64,
    upstream: std::sync::RwLock<Weak<Connection>>,
}

impl PivotRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: DashMap::new(),
            peers: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            next_peer_id: AtomicU64::new(1),
            upstream: std::sync::RwLock::new(Weak::new()),
        })
    }

    pub fn set_upstream(&self, conn: &Arc<Connection>) {
        *self.upstream.write().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(conn);
    }

    fn send_up(&self, env: Envelope) -> bool {
        let up = self.upstream.read().unwrap_or_else(|e| e.into_inner()).upgrade();
        match up {
            Some(conn) => conn.send(env),
            None => false,
        }
    }

    /// Bind a pivot listener. Only TCP listeners are supported; peers speak
    /// the same framed envelope codec as the upstream transports.
    pub async fn start(
        self: &Arc<Self>,
        listener_kind: &str,
        bind_address: &str,
    ) -> anyhow::Result<PivotListenerInfo> {
        if listener_kind != "tcp" {
            anyhow::bail!("pivot: unsupported listener kind {:?}", listener_kind);
        }
        let ln = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("pivot: bind {}", bind_address))?;
        let bound = ln.local_addr()?.to_string();
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(listener = id, bind = %bound, "pivot: listener up");

        let registry = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let (tcp, peer_addr) = match ln.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::debug!(err = %err, "pivot: accept failed");
                        continue;
                    }
                };
                let peer_id = registry.next_peer_id.fetch_add(1, Ordering::Relaxed);
                tracing::info!(peer = peer_id, addr = %peer_addr, "pivot: peer connected");
                let reg = registry.clone();
                tokio::spawn(async move {
                    if let Some(l) = reg.listeners.get(&id) {
                        l.peer_count.fetch_add(1, Ordering::AcqRel);
                    }
                    let err = serve_peer(&reg, peer_id, tcp).await;
                    reg.peers.remove(&peer_id);
                    if let Some(l) = reg.listeners.get(&id) {
                        l.peer_count.fetch_sub(1, Ordering::AcqRel);
                    }
                    let reason = match err {
                        Ok(()) => "closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    tracing::info!(peer = peer_id, reason = %reason, "pivot: peer gone");
                    if let Ok(env) = Envelope::new(
                        kind::PIVOT_PEER_FAILURE,
                        &PivotPeerFailure {
                            peer_id,
                            kind: "tcp".into(),
                            error: reason,
                        },
                    ) {
                        reg.send_up(env);
                    }
                });
            }
        });

        let listener = Arc::new(PivotListener {
            id,
            kind: listener_kind.to_string(),
            bind_address: bound,
            peer_count: AtomicUsize::new(0),
            task,
        });
        let info = listener.info();
        self.listeners.insert(id, listener);
        Ok(info)
    }

    pub fn stop(&self, id: u64) -> bool {
        match self.listeners.remove(&id) {
            Some((_, l)) => {
                l.task.abort();
                tracing::info!(listener = id, "pivot: listener stopped");
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<PivotListenerInfo> {
        let mut out: Vec<PivotListenerInfo> = self.listeners.iter().map(|l| l.info()).collect();
        out.sort_by_key(|l| l.id);
        out
    }

    /// Deliver a wrapped envelope from upstream to the downstream peer it
    /// names. Unknown peers are dropped; the failure notice already went up.
    pub fn route_down(&self, wrapped: &PivotPeerEnvelope) -> bool {
        let Some(Ok(inner)) = read_envelope(&mut &wrapped.data[..]).now_or_never() else {
            tracing::warn!(peer = wrapped.peer_id, "pivot: malformed wrapped frame");
            return false;
        };
        match self.peers.get(&wrapped.peer_id) {
            Some(tx) => tx.send(inner).is_ok(),
            None => {
                tracing::debug!(peer = wrapped.peer_id, "pivot: no such peer");
                false
            }
        }
    }

    pub fn stop_all(&self) {
        for l in self.listeners.iter() {
            l.task.abort();
        }
        self.listeners.clear();
        self.peers.clear();
    }
}

/// Pump one downstream peer: frames from the peer are wrapped and sent up,
/// frames routed down are written back. Peer pings are answered locally and
/// never travel upstream.
async fn serve_peer(
    registry: &Arc<PivotRegistry>,
    peer_id: u64,
    tcp: tokio::net::TcpStream,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = tcp.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    registry.peers.insert(peer_id, tx.clone());

    let write_task = tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            if write_envelope(&mut writer, &env).await.is_err() {
                break;
            }
        }
    });

    let result = async {
        loop {
            let env = match read_envelope(&mut reader).await {
                Ok(env) => env,
                Err(crate::skein::envelope::EnvelopeError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            if env.kind == kind::PIVOT_PEER_PING {
                tracing::trace!(peer = peer_id, "pivot: peer ping");
                if tx.send(env).is_err() {
                    return Ok(());
                }
                continue;
            }

            let mut frame = Vec::with_capacity(env.data.len() + 16);
            write_envelope(&mut frame, &env)
                .now_or_never()
                .unwrap_or(Ok(()))?;
            let wrapped = Envelope::new(
                kind::PIVOT_PEER_ENVELOPE,
                &PivotPeerEnvelope {
                    peer_id,
                    data: frame,
                },
            )?;
            if !registry.send_up(wrapped) {
                anyhow::bail!("pivot: upstream gone");
            }
        }
    }
    .await;

    write_task.abort();
    result
}
