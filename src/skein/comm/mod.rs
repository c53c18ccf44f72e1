use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::skein::envelope::{Handler, TransportProto};

pub mod handshake;
pub mod listener;
pub mod protocol;
pub mod route;

use protocol::{
    ChannelInfo, ChannelReply, ControlOp, ControlReply, ControlRequest, StreamHeader,
};
use route::{ChannelTarget, RouteRegistry};

/// Rust trait objects take a single principal trait, so read+write streams
/// get a wrapper trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Handler lifecycle requests arriving on the peer's control stream.
#[derive(Debug)]
pub enum CommEvent {
    HandlerOpen(Handler),
    HandlerClose(String),
}

/// One authenticated mux session with a peer. Carries any number of byte
/// channels plus a control stream per direction for keepalive, latency and
/// handler management.
pub struct CommSession {
    pub peer_fingerprint: String,
    control: Mutex<tokio_yamux::Control>,
    control_tx: mpsc::Sender<(ControlRequest, oneshot::Sender<ControlReply>)>,
    next_channel_id: AtomicU64,
    next_request_id: AtomicU64,
    pending_opens: AtomicUsize,
    driver: tokio::task::JoinHandle<()>,
}

impl Drop for CommSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl CommSession {
    /// Client side: authenticate against the pinned fingerprint, then bring
    /// up the mux and our outbound control stream.
    pub async fn initiate<S>(
        mut stream: S,
        identity: &handshake::Identity,
        pinned: &str,
        routes: Arc<RouteRegistry>,
        events: mpsc::UnboundedSender<CommEvent>,
    ) -> anyhow::Result<Arc<Self>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let peer = handshake::initiate(&mut stream, identity, pinned)
            .await
            .context("comm: handshake")?;
        let session = tokio_yamux::Session::new_client(stream, tokio_yamux::Config::default());
        Self::start(session, peer.fingerprint, routes, events).await
    }

    /// Server side: authenticate the initiator against the authorized set.
    pub async fn accept<S>(
        mut stream: S,
        identity: &handshake::Identity,
        authorized: &[String],
        routes: Arc<RouteRegistry>,
        events: mpsc::UnboundedSender<CommEvent>,
    ) -> anyhow::Result<Arc<Self>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let peer = handshake::accept(&mut stream, identity, authorized)
            .await
            .context("comm: handshake")?;
        let session = tokio_yamux::Session::new_server(stream, tokio_yamux::Config::default());
        Self::start(session, peer.fingerprint, routes, events).await
    }

    async fn start<S>(
        mut session: tokio_yamux::Session<S>,
        peer_fingerprint: String,
        routes: Arc<RouteRegistry>,
        events: mpsc::UnboundedSender<CommEvent>,
    ) -> anyhow::Result<Arc<Self>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let mut control = session.control();

        // Drive the mux and dispatch every inbound stream by its header.
        let driver = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(stream) => {
                        let routes = routes.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            let mut stream: BoxedStream = Box::new(stream);
                            match protocol::read_stream_header(&mut stream).await {
                                Ok(StreamHeader::Control) => {
                                    control_server(stream, events).await;
                                }
                                Ok(StreamHeader::Channel(info)) => {
                                    handle_inbound_channel(stream, info, routes).await;
                                }
                                Err(err) => {
                                    tracing::debug!(err = %err, "comm: bad stream header");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "comm: session error");
                        break;
                    }
                }
            }
            tracing::debug!("comm: session closed");
        });

        // Our outbound control stream, driven by a task that serializes
        // request/reply pairs.
        let mut control_stream: BoxedStream = Box::new(
            control
                .open_stream()
                .await
                .context("comm: open control stream")?,
        );
        protocol::write_stream_header(&mut control_stream, &StreamHeader::Control)
            .await
            .context("comm: announce control stream")?;

        let (control_tx, control_rx) = mpsc::channel(16);
        tokio::spawn(control_client(control_stream, control_rx));

        tracing::info!(peer = %peer_fingerprint, "comm: session established");

        Ok(Arc::new(Self {
            peer_fingerprint,
            control: Mutex::new(control),
            control_tx,
            next_channel_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
            pending_opens: AtomicUsize::new(0),
            driver,
        }))
    }

    /// Open a byte channel toward the peer. Errors carry the peer's
    /// rejection reason verbatim.
    pub async fn open_channel(&self, mut info: ChannelInfo) -> anyhow::Result<BoxedStream> {
        if info.id == 0 {
            info.id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        }
        self.pending_opens.fetch_add(1, Ordering::AcqRel);
        let res = self.open_channel_inner(info).await;
        self.pending_opens.fetch_sub(1, Ordering::AcqRel);
        res
    }

    async fn open_channel_inner(&self, info: ChannelInfo) -> anyhow::Result<BoxedStream> {
        let stream = {
            let mut ctrl = self.control.lock().await;
            ctrl.open_stream().await.context("comm: open stream")?
        };
        let mut stream: BoxedStream = Box::new(stream);
        protocol::write_stream_header(&mut stream, &StreamHeader::Channel(info.clone()))
            .await
            .context("comm: send channel header")?;
        let reply = protocol::read_channel_reply(&mut stream)
            .await
            .context("comm: read channel reply")?;
        if !reply.accepted {
            anyhow::bail!(
                "comm: channel {} to {}:{} rejected: {}",
                info.id,
                info.remote_host,
                info.remote_port,
                reply.reason
            );
        }
        Ok(stream)
    }

    pub fn pending_opens(&self) -> usize {
        self.pending_opens.load(Ordering::Acquire)
    }

    async fn control_roundtrip(&self, op: ControlOp) -> anyhow::Result<ControlReply> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send((ControlRequest { id, op }, tx))
            .await
            .map_err(|_| anyhow::anyhow!("comm: control stream closed"))?;
        let reply = rx
            .await
            .map_err(|_| anyhow::anyhow!("comm: control stream closed"))?;
        if reply.id != id {
            anyhow::bail!("comm: control reply id mismatch");
        }
        Ok(reply)
    }

    pub async fn keepalive(&self) -> anyhow::Result<()> {
        let nonce = rand::random();
        let reply = self.control_roundtrip(ControlOp::Keepalive { nonce }).await?;
        if !reply.ok {
            anyhow::bail!("comm: keepalive refused");
        }
        Ok(())
    }

    /// Round-trip time of a control exchange.
    pub async fn latency(&self) -> anyhow::Result<std::time::Duration> {
        let started = std::time::Instant::now();
        let reply = self.control_roundtrip(ControlOp::Latency).await?;
        if !reply.ok {
            anyhow::bail!("comm: latency probe refused");
        }
        let elapsed = started.elapsed();
        tracing::debug!(
            peer = %self.peer_fingerprint,
            latency_ns = %elapsed.as_nanos(),
            "comm: latency probe"
        );
        Ok(elapsed)
    }

    /// Ask the peer to start a forward handler.
    pub async fn open_handler(&self, handler: Handler) -> anyhow::Result<()> {
        let reply = self
            .control_roundtrip(ControlOp::HandlerOpen { handler })
            .await?;
        if !reply.ok {
            anyhow::bail!("comm: handler open refused: {}", reply.payload);
        }
        Ok(())
    }

    pub async fn close_handler(&self, id: String) -> anyhow::Result<()> {
        let reply = self.control_roundtrip(ControlOp::HandlerClose { id }).await?;
        if !reply.ok {
            anyhow::bail!("comm: handler close refused: {}", reply.payload);
        }
        Ok(())
    }

    /// Periodic keepalive; tears nothing down itself, but a dead control
    /// stream surfaces as an error to the caller's watchdog.
    pub fn spawn_keepalive(
        self: &Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(err) = session.keepalive().await {
                    tracing::debug!(err = %err, "comm: keepalive failed");
                    break;
                }
            }
        })
    }

    pub async fn close(&self) {
        self.driver.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }
}

async fn control_client(
    mut stream: BoxedStream,
    mut rx: mpsc::Receiver<(ControlRequest, oneshot::Sender<ControlReply>)>,
) {
    while let Some((req, reply_tx)) = rx.recv().await {
        if protocol::write_control_request(&mut stream, &req)
            .await
            .is_err()
        {
            break;
        }
        match protocol::read_control_reply(&mut stream).await {
            Ok(reply) => {
                let _ = reply_tx.send(reply);
            }
            Err(_) => break,
        }
    }
}

/// Answer the peer's control requests until its stream closes.
async fn control_server(mut stream: BoxedStream, events: mpsc::UnboundedSender<CommEvent>) {
    loop {
        let req = match protocol::read_control_request(&mut stream).await {
            Ok(req) => req,
            Err(_) => break,
        };
        let reply = match req.op {
            ControlOp::Keepalive { .. } => ControlReply {
                id: req.id,
                ok: true,
                payload: String::new(),
            },
            ControlOp::Latency => ControlReply {
                id: req.id,
                ok: true,
                payload: std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos().to_string())
                    .unwrap_or_default(),
            },
            ControlOp::HandlerOpen { handler } => {
                let ok = events.send(CommEvent::HandlerOpen(handler)).is_ok();
                ControlReply {
                    id: req.id,
                    ok,
                    payload: if ok { String::new() } else { "no handler sink".into() },
                }
            }
            ControlOp::HandlerClose { id } => {
                let ok = events.send(CommEvent::HandlerClose(id)).is_ok();
                ControlReply {
                    id: req.id,
                    ok,
                    payload: if ok { String::new() } else { "no handler sink".into() },
                }
            }
        };
        if protocol::write_control_reply(&mut stream, &reply)
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Resolve, dial and pipe one inbound channel, or reject it with a reason
/// before any payload byte moves.
async fn handle_inbound_channel(
    mut stream: BoxedStream,
    info: ChannelInfo,
    routes: Arc<RouteRegistry>,
) {
    let target = match routes.resolve(&info) {
        Ok(t) => t,
        Err(reason) => {
            tracing::debug!(channel = info.id, reason = %reason, "comm: channel rejected");
            let _ = protocol::write_channel_reply(
                &mut stream,
                &ChannelReply {
                    accepted: false,
                    reason,
                },
            )
            .await;
            return;
        }
    };

    match target {
        ChannelTarget::Local { route } => {
            let _guard = route.as_ref().map(|r| r.track());
            dial_and_pipe(stream, info).await;
        }
        ChannelTarget::Forward { route, session } => {
            let guard = route.track();
            match session.open_channel(info.clone()).await {
                Ok(mut upstream) => {
                    drop(guard);
                    if protocol::write_channel_reply(
                        &mut stream,
                        &ChannelReply {
                            accepted: true,
                            reason: String::new(),
                        },
                    )
                    .await
                    .is_err()
                    {
                        return;
                    }
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
                }
                Err(err) => {
                    drop(guard);
                    let _ = protocol::write_channel_reply(
                        &mut stream,
                        &ChannelReply {
                            accepted: false,
                            reason: err.to_string(),
                        },
                    )
                    .await;
                }
            }
        }
    }
}

async fn dial_and_pipe(mut stream: BoxedStream, info: ChannelInfo) {
    let addr = format!("{}:{}", info.remote_host, info.remote_port);
    match info.transport {
        TransportProto::Tcp => match tokio::net::TcpStream::connect(&addr).await {
            Ok(mut tcp) => {
                if protocol::write_channel_reply(
                    &mut stream,
                    &ChannelReply {
                        accepted: true,
                        reason: String::new(),
                    },
                )
                .await
                .is_err()
                {
                    return;
                }
                tracing::debug!(channel = info.id, target = %addr, "comm: channel open");
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut tcp).await;
                tracing::debug!(channel = info.id, "comm: channel closed");
            }
            Err(err) => {
                let _ = protocol::write_channel_reply(
                    &mut stream,
                    &ChannelReply {
                        accepted: false,
                        reason: format!("dial {}: {}", addr, err),
                    },
                )
                .await;
            }
        },
        TransportProto::Udp => match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => {
                if let Err(err) = socket.connect(&addr).await {
                    let _ = protocol::write_channel_reply(
                        &mut stream,
                        &ChannelReply {
                            accepted: false,
                            reason: format!("dial {}: {}", addr, err),
                        },
                    )
                    .await;
                    return;
                }
                if protocol::write_channel_reply(
                    &mut stream,
                    &ChannelReply {
                        accepted: true,
                        reason: String::new(),
                    },
                )
                .await
                .is_err()
                {
                    return;
                }
                pump_udp(stream, socket).await;
            }
            Err(err) => {
                let _ = protocol::write_channel_reply(
                    &mut stream,
                    &ChannelReply {
                        accepted: false,
                        reason: format!("udp bind: {}", err),
                    },
                )
                .await;
            }
        },
        TransportProto::NamedPipe => {
            let _ = protocol::write_channel_reply(
                &mut stream,
                &ChannelReply {
                    accepted: false,
                    reason: "namedpipe channels not supported here".into(),
                },
            )
            .await;
        }
    }
}

/// Datagram channel framing: u32 length prefix per datagram on the stream
/// side, raw datagrams on the socket side.
async fn pump_udp(stream: BoxedStream, socket: tokio::net::UdpSocket) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let socket = Arc::new(socket);
    let (mut reader, mut writer) = tokio::io::split(stream);

    let sock_out = socket.clone();
    let to_socket = tokio::spawn(async move {
        loop {
            let len = match reader.read_u32().await {
                Ok(len) if len as usize <= 65_535 => len as usize,
                _ => break,
            };
            let mut buf = vec![0u8; len];
            if reader.read_exact(&mut buf).await.is_err() {
                break;
            }
            if sock_out.send(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut buf = vec![0u8; 65_535];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if writer.write_u32(n as u32).await.is_err()
            || writer.write_all(&buf[..n]).await.is_err()
            || writer.flush().await.is_err()
        {
            break;
        }
    }
    to_socket.abort();
}
