use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use dashmap::DashMap;
use rand::Rng;
use tokio::net::TcpListener;

use crate::skein::{
    bufpool::BufPool,
    config::Config,
    connection::Connection,
    envelope::{
        Envelope, HandlerStartRequest, HandlerStartResponse, HandlerStopRequest,
        HandlerStopResponse, Ping, PivotListeners, PivotPeerEnvelope, PivotStartListenerRequest,
        PivotStartListenerResponse, PivotStopListenerRequest, PivotStopListenerResponse,
        RportFwdListener, RportFwdListeners, RportFwdStartListenerRequest,
        RportFwdStartListenerResponse, RportFwdStopListenerRequest, RportFwdStopListenerResponse,
        TransportAddRequest, TransportProto, TransportResponse, TransportSwitchRequest,
        TransportsList, TunnelClose, TunnelData, kind,
    },
    pivot::PivotRegistry,
    reconnect::EndpointTable,
    transport,
    tunnel::{self, Tunnel, TunnelOptions},
};

/// A reverse port-forward bind: accepted connections ride tunnels on the
/// owning Connection toward the peer.
struct Forward {
    id: String,
    bind_address: String,
    forward_address: String,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for Forward {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Inbound frame queues keyed by tunnel id, one delivery task each.
type Deliveries = DashMap<u64, tokio::sync::mpsc::UnboundedSender<TunnelData>>;

/// Per-connection inbound envelope loop.
///
/// Every request kind gets a typed response carrying the request id; a
/// malformed or unknown envelope is logged and dropped, never fatal to the
/// connection.
pub struct Dispatcher {
    cfg: Arc<Config>,
    endpoints: Arc<EndpointTable>,
    pool: Arc<BufPool>,
    pivots: Arc<PivotRegistry>,
    next_forward: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<Config>,
        endpoints: Arc<EndpointTable>,
        pool: Arc<BufPool>,
        pivots: Arc<PivotRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            endpoints,
            pool,
            pivots,
            next_forward: AtomicU64::new(1),
        })
    }

    fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            resend_threshold: self.cfg.tunnel.resend_threshold,
            grace_close: self.cfg.tunnel.grace_close,
            chunk_size: self.cfg.tunnel.chunk_size,
        }
    }

    /// Drain the connection's inbound queue until the transport dies.
    /// Forwards started on this connection die with it; pivot listeners
    /// outlive it and re-home to the next connection.
    pub async fn run(self: Arc<Self>, conn: Arc<Connection>) {
        let Some(mut rx) = conn.take_recv() else {
            tracing::warn!(uri = %conn.uri, "dispatch: inbound queue already taken");
            return;
        };
        self.pivots.set_upstream(&conn);
        let forwards: Arc<DashMap<String, Forward>> = Arc::new(DashMap::new());
        let deliveries: Arc<Deliveries> = Arc::new(DashMap::new());

        while let Some(env) = rx.recv().await {
            let id = env.id;
            let env_kind = env.kind;
            if let Err(err) = self.dispatch(&conn, &forwards, &deliveries, env).await {
                tracing::warn!(id, kind = env_kind, err = %err, "dispatch: request failed");
            }
        }

        forwards.clear();
        deliveries.clear();
        conn.cleanup();
        tracing::debug!(uri = %conn.uri, "dispatch: loop ended");
    }

    async fn dispatch(
        &self,
        conn: &Arc<Connection>,
        forwards: &Arc<DashMap<String, Forward>>,
        deliveries: &Arc<Deliveries>,
        env: Envelope,
    ) -> anyhow::Result<()> {
        match env.kind {
            kind::PING => {
                let ping: Ping = env.decode()?;
                tracing::trace!(nonce = ping.nonce, "dispatch: ping");
                conn.send(Envelope::with_id(env.id, kind::PING, &ping)?);
            }

            kind::TUNNEL_DATA => {
                let td: TunnelData = env.decode()?;
                let Some(tun) = conn.tunnel(td.tunnel_id).await else {
                    tracing::debug!(tunnel = td.tunnel_id, "dispatch: frame for unknown tunnel");
                    return Ok(());
                };
                // Sink writes happen on a per-tunnel task, so one stalled
                // sink never blocks the other kinds behind it.
                let tx = deliveries
                    .entry(td.tunnel_id)
                    .or_insert_with(|| {
                        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                        tokio::spawn(deliver_loop(
                            conn.clone(),
                            tun.clone(),
                            rx,
                            deliveries.clone(),
                        ));
                        tx
                    })
                    .clone();
                if tx.send(td).is_err() {
                    tracing::debug!(tunnel = tun.id, "dispatch: delivery task gone");
                }
            }

            kind::TUNNEL_CLOSE => {
                let tc: TunnelClose = env.decode()?;
                deliveries.remove(&tc.tunnel_id);
                if let Some(tun) = conn.remove_tunnel(tc.tunnel_id).await {
                    tracing::debug!(tunnel = tc.tunnel_id, "dispatch: tunnel closed by peer");
                    tun.mark_closed();
                    tokio::spawn(async move { tun.shutdown_sink().await });
                }
            }

            kind::HANDLER_START_REQ => {
                let req: HandlerStartRequest = env.decode()?;
                let h = req.handler;
                let resp = if h.transport != TransportProto::Tcp {
                    HandlerStartResponse {
                        success: false,
                        error: format!("unsupported transport {}", h.transport),
                    }
                } else {
                    let bind = format!("{}:{}", h.bind_host, h.bind_port);
                    match self
                        .start_forward(conn, forwards, h.id, bind, h.forward_host, h.forward_port)
                        .await
                    {
                        Ok(_) => HandlerStartResponse { success: true, error: String::new() },
                        Err(err) => HandlerStartResponse {
                            success: false,
                            error: err.to_string(),
                        },
                    }
                };
                conn.send(Envelope::with_id(env.id, kind::HANDLER_START_RESP, &resp)?);
            }

            kind::HANDLER_STOP_REQ => {
                let req: HandlerStopRequest = env.decode()?;
                let stopped = forwards.remove(&req.handler_id).is_some();
                let resp = HandlerStopResponse {
                    success: stopped,
                    error: if stopped {
                        String::new()
                    } else {
                        format!("no handler {:?}", req.handler_id)
                    },
                };
                conn.send(Envelope::with_id(env.id, kind::HANDLER_STOP_RESP, &resp)?);
            }

            kind::RPORTFWD_START_REQ => {
                let req: RportFwdStartListenerRequest = env.decode()?;
                let id = format!("rpf-{}", self.next_forward.fetch_add(1, Ordering::Relaxed));
                let resp = match self
                    .start_forward(
                        conn,
                        forwards,
                        id,
                        req.bind_address,
                        req.forward_host,
                        req.forward_port,
                    )
                    .await
                {
                    Ok(listener) => RportFwdStartListenerResponse {
                        success: true,
                        error: String::new(),
                        listener: Some(listener),
                    },
                    Err(err) => RportFwdStartListenerResponse {
                        success: false,
                        error: err.to_string(),
                        listener: None,
                    },
                };
                conn.send(Envelope::with_id(env.id, kind::RPORTFWD_START_RESP, &resp)?);
            }

            kind::RPORTFWD_STOP_REQ => {
                let req: RportFwdStopListenerRequest = env.decode()?;
                let stopped = forwards.remove(&req.id).is_some();
                if stopped {
                    tracing::info!(forward = %req.id, "dispatch: forward stopped");
                }
                let resp = RportFwdStopListenerResponse {
                    success: stopped,
                    error: if stopped {
                        String::new()
                    } else {
                        format!("no forward {:?}", req.id)
                    },
                };
                conn.send(Envelope::with_id(env.id, kind::RPORTFWD_STOP_RESP, &resp)?);
            }

            kind::RPORTFWD_LISTENERS_REQ => {
                let mut listeners: Vec<RportFwdListener> = forwards
                    .iter()
                    .map(|f| RportFwdListener {
                        id: f.id.clone(),
                        bind_address: f.bind_address.clone(),
                        forward_address: f.forward_address.clone(),
                    })
                    .collect();
                listeners.sort_by(|a, b| a.id.cmp(&b.id));
                let resp = RportFwdListeners { listeners };
                conn.send(Envelope::with_id(env.id, kind::RPORTFWD_LISTENERS, &resp)?);
            }

            kind::TRANSPORTS_LIST_REQ => {
                let resp = TransportsList {
                    available: transport::supported_schemes()
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                };
                conn.send(Envelope::with_id(env.id, kind::TRANSPORTS_LIST, &resp)?);
            }

            kind::TRANSPORT_ADD_REQ => {
                let req: TransportAddRequest = env.decode()?;
                let resp = match self.check_endpoint(&req.url) {
                    Ok(()) => {
                        self.endpoints.add(&req.url);
                        tracing::info!(uri = %req.url, "dispatch: endpoint added");
                        TransportResponse { success: true, error: String::new() }
                    }
                    Err(err) => TransportResponse {
                        success: false,
                        error: err.to_string(),
                    },
                };
                conn.send(Envelope::with_id(env.id, kind::TRANSPORT_ADD_RESP, &resp)?);
            }

            kind::TRANSPORT_SWITCH_REQ => {
                let req: TransportSwitchRequest = env.decode()?;
                let resp = match self.check_endpoint(&req.url) {
                    Ok(()) => {
                        self.endpoints.request_switch(&req.url);
                        TransportResponse { success: true, error: String::new() }
                    }
                    Err(err) => TransportResponse {
                        success: false,
                        error: err.to_string(),
                    },
                };
                let switching = resp.success;
                conn.send(Envelope::with_id(env.id, kind::TRANSPORT_SWITCH_RESP, &resp)?);
                if switching {
                    tracing::info!(uri = %req.url, "dispatch: switching transport");
                    // The reply still has to drain through the outbound loop
                    // before the transport goes away.
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        conn.cleanup();
                    });
                }
            }

            kind::PIVOT_START_LISTENER_REQ => {
                let req: PivotStartListenerRequest = env.decode()?;
                let resp = match self.pivots.start(&req.kind, &req.bind_address).await {
                    Ok(info) => PivotStartListenerResponse {
                        success: true,
                        error: String::new(),
                        listener: Some(info),
                    },
                    Err(err) => PivotStartListenerResponse {
                        success: false,
                        error: err.to_string(),
                        listener: None,
                    },
                };
                conn.send(Envelope::with_id(env.id, kind::PIVOT_START_LISTENER_RESP, &resp)?);
            }

            kind::PIVOT_STOP_LISTENER_REQ => {
                let req: PivotStopListenerRequest = env.decode()?;
                let stopped = self.pivots.stop(req.id);
                let resp = PivotStopListenerResponse {
                    success: stopped,
                    error: if stopped {
                        String::new()
                    } else {
                        format!("no pivot listener {}", req.id)
                    },
                };
                conn.send(Envelope::with_id(env.id, kind::PIVOT_STOP_LISTENER_RESP, &resp)?);
            }

            kind::PIVOT_LISTENERS_REQ => {
                let resp = PivotListeners {
                    listeners: self.pivots.list(),
                };
                conn.send(Envelope::with_id(env.id, kind::PIVOT_LISTENERS, &resp)?);
            }

            kind::PIVOT_PEER_ENVELOPE => {
                let wrapped: PivotPeerEnvelope = env.decode()?;
                self.pivots.route_down(&wrapped);
            }

            other => {
                tracing::debug!(kind = other, "dispatch: unknown kind dropped");
            }
        }
        Ok(())
    }

    fn check_endpoint(&self, raw: &str) -> anyhow::Result<()> {
        let uri = transport::Uri::parse(raw)?;
        if !transport::supported_schemes().iter().any(|s| *s == uri.scheme) {
            anyhow::bail!("unsupported scheme {:?}", uri.scheme);
        }
        Ok(())
    }

    /// Bind a TCP listener; every accepted connection becomes a tunnel on
    /// this Connection. The peer learns the tunnel from its first frame.
    async fn start_forward(
        &self,
        conn: &Arc<Connection>,
        forwards: &Arc<DashMap<String, Forward>>,
        id: String,
        bind_address: String,
        forward_host: String,
        forward_port: u16,
    ) -> anyhow::Result<RportFwdListener> {
        if forwards.contains_key(&id) {
            anyhow::bail!("forward {:?} already exists", id);
        }
        let ln = TcpListener::bind(&bind_address)
            .await
            .with_context(|| format!("bind {}", bind_address))?;
        let bound = ln.local_addr()?.to_string();
        let forward_address = format!("{forward_host}:{forward_port}");
        tracing::info!(forward = %id, bind = %bound, to = %forward_address, "dispatch: forward up");

        let opts = self.tunnel_options();
        let pool = self.pool.clone();
        let conn2 = conn.clone();
        let task = tokio::spawn(async move {
            loop {
                let (tcp, peer) = match ln.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::debug!(err = %err, "dispatch: forward accept failed");
                        continue;
                    }
                };
                let tunnel_id: u64 = rand::thread_rng().r#gen();
                tracing::debug!(tunnel = tunnel_id, peer = %peer, "dispatch: forward accepted");
                let (read_half, write_half) = tcp.into_split();
                let tun = Arc::new(Tunnel::new(tunnel_id, Box::new(write_half), opts.clone()));
                conn2.add_tunnel(tun.clone()).await;
                tunnel::spawn_copy_loop(conn2.clone(), tun, read_half, pool.clone());
            }
        });

        let record = RportFwdListener {
            id: id.clone(),
            bind_address: bound.clone(),
            forward_address: forward_address.clone(),
        };
        forwards.insert(
            id.clone(),
            Forward {
                id,
                bind_address: bound,
                forward_address,
                task,
            },
        );
        Ok(record)
    }
}

/// Feed inbound frames for one tunnel to its sink in arrival order. Ends
/// when the peer signals close or the dispatcher drops the queue.
async fn deliver_loop(
    conn: Arc<Connection>,
    tun: Arc<Tunnel>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<TunnelData>,
    deliveries: Arc<Deliveries>,
) {
    while let Some(td) = rx.recv().await {
        let closing = tun.handle_data(&conn, td).await;
        if closing && tun.mark_closed() {
            break;
        }
    }
    deliveries.remove(&tun.id);
    conn.remove_tunnel(tun.id).await;
    tun.shutdown_sink().await;
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use crate::skein::connection::ConnectionIo;

    use super::*;

    fn dispatcher() -> (Arc<Dispatcher>, Arc<EndpointTable>) {
        let cfg = Arc::new(Config::test_default());
        let endpoints = Arc::new(EndpointTable::new(vec!["http://main:80".into()]));
        let d = Dispatcher::new(
            cfg,
            endpoints.clone(),
            Arc::new(BufPool::default()),
            PivotRegistry::new(),
        );
        (d, endpoints)
    }

    fn spawn_dispatch(d: &Arc<Dispatcher>) -> (Arc<Connection>, ConnectionIo) {
        let (conn, io) = Connection::stub();
        tokio::spawn(d.clone().run(conn.clone()));
        (conn, io)
    }

    async fn expect_kind(rx: &mut mpsc::UnboundedReceiver<Envelope>, kind: u32) -> Envelope {
        loop {
            let env = rx.recv().await.expect("response");
            if env.kind == kind {
                return env;
            }
        }
    }

    #[tokio::test]
    async fn ping_echoes_with_request_id() {
        let (d, _) = dispatcher();
        let (_conn, mut io) = spawn_dispatch(&d);

        io.recv_tx
            .send(Envelope::with_id(41, kind::PING, &Ping { nonce: 7 }).unwrap())
            .unwrap();
        let resp = expect_kind(&mut io.send_rx, kind::PING).await;
        assert_eq!(resp.id, 41);
        let pong: Ping = resp.decode().unwrap();
        assert_eq!(pong.nonce, 7);
    }

    #[tokio::test]
    async fn unknown_and_malformed_kinds_are_not_fatal() {
        let (d, _) = dispatcher();
        let (_conn, mut io) = spawn_dispatch(&d);

        io.recv_tx
            .send(Envelope { id: 1, kind: 9999, data: b"junk".to_vec() })
            .unwrap();
        // Malformed payload for a known kind.
        io.recv_tx
            .send(Envelope { id: 2, kind: kind::TUNNEL_DATA, data: b"{".to_vec() })
            .unwrap();
        io.recv_tx
            .send(Envelope::with_id(3, kind::PING, &Ping { nonce: 1 }).unwrap())
            .unwrap();

        let resp = expect_kind(&mut io.send_rx, kind::PING).await;
        assert_eq!(resp.id, 3);
    }

    #[tokio::test]
    async fn transports_list_reports_compiled_backends() {
        let (d, _) = dispatcher();
        let (_conn, mut io) = spawn_dispatch(&d);

        io.recv_tx
            .send(Envelope::with_id(5, kind::TRANSPORTS_LIST_REQ, &()).unwrap())
            .unwrap();
        let resp = expect_kind(&mut io.send_rx, kind::TRANSPORTS_LIST).await;
        let list: TransportsList = resp.decode().unwrap();
        assert!(list.available.iter().any(|s| s == "mtls"));
        assert!(list.available.iter().any(|s| s == "http"));
    }

    #[tokio::test]
    async fn transport_add_validates_the_uri() {
        let (d, endpoints) = dispatcher();
        let (_conn, mut io) = spawn_dispatch(&d);

        io.recv_tx
            .send(
                Envelope::with_id(
                    1,
                    kind::TRANSPORT_ADD_REQ,
                    &TransportAddRequest { url: "mtls://backup:8443".into() },
                )
                .unwrap(),
            )
            .unwrap();
        let resp: TransportResponse = expect_kind(&mut io.send_rx, kind::TRANSPORT_ADD_RESP)
            .await
            .decode()
            .unwrap();
        assert!(resp.success);
        assert!(endpoints.snapshot().contains(&"mtls://backup:8443".to_string()));

        io.recv_tx
            .send(
                Envelope::with_id(
                    2,
                    kind::TRANSPORT_ADD_REQ,
                    &TransportAddRequest { url: "carrier-pigeon://x".into() },
                )
                .unwrap(),
            )
            .unwrap();
        let resp: TransportResponse = expect_kind(&mut io.send_rx, kind::TRANSPORT_ADD_RESP)
            .await
            .decode()
            .unwrap();
        assert!(!resp.success);
        assert!(!resp.error.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_switch_replies_then_drops_the_connection() {
        let (d, endpoints) = dispatcher();
        let (conn, mut io) = spawn_dispatch(&d);

        io.recv_tx
            .send(
                Envelope::with_id(
                    9,
                    kind::TRANSPORT_SWITCH_REQ,
                    &TransportSwitchRequest { url: "dns://c2.example.com".into() },
                )
                .unwrap(),
            )
            .unwrap();
        let resp: TransportResponse = expect_kind(&mut io.send_rx, kind::TRANSPORT_SWITCH_RESP)
            .await
            .decode()
            .unwrap();
        assert!(resp.success);
        assert_eq!(endpoints.take_switch().as_deref(), Some("dns://c2.example.com"));

        let mut closed = conn.closed();
        closed.changed().await.unwrap();
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn rportfwd_tunnels_accepted_connections() {
        let (d, _) = dispatcher();
        let (conn, mut io) = spawn_dispatch(&d);

        io.recv_tx
            .send(
                Envelope::with_id(
                    1,
                    kind::RPORTFWD_START_REQ,
                    &RportFwdStartListenerRequest {
                        bind_address: "127.0.0.1:0".into(),
                        forward_host: "172.16.0.9".into(),
                        forward_port: 3389,
                    },
                )
                .unwrap(),
            )
            .unwrap();
        let resp: RportFwdStartListenerResponse =
            expect_kind(&mut io.send_rx, kind::RPORTFWD_START_RESP)
                .await
                .decode()
                .unwrap();
        assert!(resp.success, "{}", resp.error);
        let listener = resp.listener.unwrap();
        assert_eq!(listener.forward_address, "172.16.0.9:3389");

        // A connection accepted on the bind address becomes a tunnel.
        let mut tcp = tokio::net::TcpStream::connect(&listener.bind_address)
            .await
            .unwrap();
        tcp.write_all(b"knock").await.unwrap();

        let frame = expect_kind(&mut io.send_rx, kind::TUNNEL_DATA).await;
        let td: TunnelData = frame.decode().unwrap();
        assert_eq!(td.sequence, 0);
        assert_eq!(td.data, b"knock");
        assert_eq!(conn.tunnel_count().await, 1);

        // Peer bytes flow back down the same tunnel onto the socket.
        io.recv_tx
            .send(
                Envelope::new(
                    kind::TUNNEL_DATA,
                    &TunnelData {
                        tunnel_id: td.tunnel_id,
                        sequence: 0,
                        ack: 1,
                        data: b"welcome".to_vec(),
                        closed: false,
                        resend: false,
                    },
                )
                .unwrap(),
            )
            .unwrap();
        let mut buf = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut tcp, &mut buf).await.unwrap();
        assert_eq!(&buf, b"welcome");

        // Listing and stopping.
        io.recv_tx
            .send(Envelope::with_id(2, kind::RPORTFWD_LISTENERS_REQ, &()).unwrap())
            .unwrap();
        let list: RportFwdListeners = expect_kind(&mut io.send_rx, kind::RPORTFWD_LISTENERS)
            .await
            .decode()
            .unwrap();
        assert_eq!(list.listeners.len(), 1);

        io.recv_tx
            .send(
                Envelope::with_id(
                    3,
                    kind::RPORTFWD_STOP_REQ,
                    &RportFwdStopListenerRequest { id: listener.id.clone() },
                )
                .unwrap(),
            )
            .unwrap();
        let stop: RportFwdStopListenerResponse =
            expect_kind(&mut io.send_rx, kind::RPORTFWD_STOP_RESP)
                .await
                .decode()
                .unwrap();
        assert!(stop.success);
    }

    #[tokio::test]
    async fn stalled_tunnel_sink_does_not_block_dispatch() {
        let (d, _) = dispatcher();
        let (conn, mut io) = spawn_dispatch(&d);

        // A tiny duplex nobody reads: writes into the sink park forever.
        let (_held, b) = tokio::io::duplex(16);
        let (_r, w) = tokio::io::split(b);
        conn.add_tunnel(Arc::new(Tunnel::new(
            21,
            Box::new(w),
            TunnelOptions::default(),
        )))
        .await;

        io.recv_tx
            .send(
                Envelope::new(
                    kind::TUNNEL_DATA,
                    &TunnelData {
                        tunnel_id: 21,
                        sequence: 0,
                        ack: 0,
                        data: vec![0u8; 64 * 1024],
                        closed: false,
                        resend: false,
                    },
                )
                .unwrap(),
            )
            .unwrap();
        io.recv_tx
            .send(Envelope::with_id(77, kind::PING, &Ping { nonce: 5 }).unwrap())
            .unwrap();

        let resp = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            expect_kind(&mut io.send_rx, kind::PING),
        )
        .await
        .expect("dispatch stuck behind a stalled tunnel sink");
        assert_eq!(resp.id, 77);
    }

    #[tokio::test]
    async fn tunnel_close_removes_the_tunnel() {
        let (d, _) = dispatcher();
        let (conn, mut io) = spawn_dispatch(&d);

        let (_a, b) = tokio::io::duplex(1024);
        let (_r, w) = tokio::io::split(b);
        conn.add_tunnel(Arc::new(Tunnel::new(
            11,
            Box::new(w),
            TunnelOptions::default(),
        )))
        .await;
        assert_eq!(conn.tunnel_count().await, 1);

        io.recv_tx
            .send(Envelope::new(kind::TUNNEL_CLOSE, &TunnelClose { tunnel_id: 11 }).unwrap())
            .unwrap();
        // Ping acts as a sequencing barrier behind the close.
        io.recv_tx
            .send(Envelope::with_id(1, kind::PING, &Ping { nonce: 0 }).unwrap())
            .unwrap();
        expect_kind(&mut io.send_rx, kind::PING).await;
        assert_eq!(conn.tunnel_count().await, 0);
    }

    #[tokio::test]
    async fn pivot_listener_lifecycle_over_envelopes() {
        let (d, _) = dispatcher();
        let (_conn, mut io) = spawn_dispatch(&d);

        io.recv_tx
            .send(
                Envelope::with_id(
                    1,
                    kind::PIVOT_START_LISTENER_REQ,
                    &PivotStartListenerRequest {
                        kind: "tcp".into(),
                        bind_address: "127.0.0.1:0".into(),
                    },
                )
                .unwrap(),
            )
            .unwrap();
        let start: PivotStartListenerResponse =
            expect_kind(&mut io.send_rx, kind::PIVOT_START_LISTENER_RESP)
                .await
                .decode()
                .unwrap();
        assert!(start.success, "{}", start.error);
        let info = start.listener.unwrap();

        io.recv_tx
            .send(Envelope::with_id(2, kind::PIVOT_LISTENERS_REQ, &()).unwrap())
            .unwrap();
        let list: PivotListeners = expect_kind(&mut io.send_rx, kind::PIVOT_LISTENERS)
            .await
            .decode()
            .unwrap();
        assert_eq!(list.listeners.len(), 1);
        assert_eq!(list.listeners[0].id, info.id);

        io.recv_tx
            .send(
                Envelope::with_id(
                    3,
                    kind::PIVOT_STOP_LISTENER_REQ,
                    &PivotStopListenerRequest { id: info.id },
                )
                .unwrap(),
            )
            .unwrap();
        let stop: PivotStopListenerResponse =
            expect_kind(&mut io.send_rx, kind::PIVOT_STOP_LISTENER_RESP)
                .await
                .decode()
                .unwrap();
        assert!(stop.success);
    }
}
