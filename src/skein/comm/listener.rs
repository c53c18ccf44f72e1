use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicBool, atomic::Ordering},
};

use anyhow::Context;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    sync::mpsc,
};

use crate::skein::{
    comm::{
        CommSession,
        protocol::ChannelInfo,
    },
    envelope::TransportProto,
};

/// Inbound datagram flows are dropped after this much peer silence.
const FLOW_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Stream,
    Packet,
}

/// A local bind whose accepted traffic is forwarded through a comm session
/// as reverse channels.
pub struct CommListener {
    pub id: String,
    pub kind: ListenerKind,
    pub bind_address: String,
    pub forward_host: String,
    pub forward_port: u16,
    closed: AtomicBool,
    task: tokio::task::JoinHandle<()>,
}

impl CommListener {
    /// Stop accepting. For stream listeners, channels already piping stay
    /// alive; for packet listeners, the socket goes away and flows with it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.task.abort();
        tracing::info!(listener = %self.id, "comm: listener closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for CommListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Arc<CommListener>>,
}

impl ListenerRegistry {
    pub fn insert(&self, listener: Arc<CommListener>) {
        self.listeners.insert(listener.id.clone(), listener);
    }

    pub fn close(&self, id: &str) -> bool {
        match self.listeners.remove(id) {
            Some((_, l)) => l.close(),
            None => false,
        }
    }

    pub fn list(&self) -> Vec<Arc<CommListener>> {
        self.listeners.iter().map(|l| l.clone()).collect()
    }

    pub fn close_all(&self) {
        for l in self.listeners.iter() {
            l.close();
        }
        self.listeners.clear();
    }
}

fn channel_info(
    transport: TransportProto,
    peer: SocketAddr,
    forward_host: &str,
    forward_port: u16,
) -> ChannelInfo {
    ChannelInfo {
        id: 0,
        transport,
        application: String::new(),
        route_id: 0,
        local_host: peer.ip().to_string(),
        local_port: peer.port(),
        remote_host: forward_host.to_string(),
        remote_port: forward_port,
    }
}

/// Bind a TCP listener and forward every accepted connection through the
/// session toward `forward_host:forward_port`.
pub async fn start_stream(
    session: Arc<CommSession>,
    id: String,
    bind_address: String,
    forward_host: String,
    forward_port: u16,
) -> anyhow::Result<Arc<CommListener>> {
    let ln = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("comm: bind {}", bind_address))?;
    let bound = ln.local_addr()?.to_string();
    tracing::info!(listener = %id, bind = %bound, "comm: stream listener up");

    let fwd_host = forward_host.clone();
    let task = tokio::spawn(async move {
        loop {
            let (mut tcp, peer) = match ln.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::debug!(err = %err, "comm: accept failed");
                    continue;
                }
            };
            let session = session.clone();
            let info = channel_info(TransportProto::Tcp, peer, &fwd_host, forward_port);
            tokio::spawn(async move {
                match session.open_channel(info).await {
                    Ok(mut channel) => {
                        let _ = tokio::io::copy_bidirectional(&mut tcp, &mut channel).await;
                    }
                    Err(err) => {
                        tracing::debug!(peer = %peer, err = %err, "comm: reverse channel refused");
                    }
                }
            });
        }
    });

    Ok(Arc::new(CommListener {
        id,
        kind: ListenerKind::Stream,
        bind_address: bound,
        forward_host,
        forward_port,
        closed: AtomicBool::new(false),
        task,
    }))
}

/// Bind a UDP socket and forward datagrams through the session, one channel
/// per remote peer. Flows idle out after [`FLOW_IDLE_TIMEOUT`].
pub async fn start_packet(
    session: Arc<CommSession>,
    id: String,
    bind_address: String,
    forward_host: String,
    forward_port: u16,
) -> anyhow::Result<Arc<CommListener>> {
    let socket = Arc::new(
        UdpSocket::bind(&bind_address)
            .await
            .with_context(|| format!("comm: bind {}", bind_address))?,
    );
    let bound = socket.local_addr()?.to_string();
    tracing::info!(listener = %id, bind = %bound, "comm: packet listener up");

    let flows: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
    let fwd_host = forward_host.clone();

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::debug!(err = %err, "comm: packet recv failed");
                    break;
                }
            };
            let datagram = buf[..n].to_vec();

            if let Some(tx) = flows.get(&peer) {
                if tx.send(datagram).await.is_ok() {
                    continue;
                }
                // Flow task died; fall through and redial.
                drop(tx);
                flows.remove(&peer);
                continue;
            }

            let (tx, rx) = mpsc::channel(64);
            if tx.send(datagram).await.is_err() {
                continue;
            }
            flows.insert(peer, tx);
            let session = session.clone();
            let socket = socket.clone();
            let flows = flows.clone();
            let info = channel_info(TransportProto::Udp, peer, &fwd_host, forward_port);
            tokio::spawn(async move {
                run_flow(session, info, socket, peer, rx).await;
                flows.remove(&peer);
            });
        }
    });

    Ok(Arc::new(CommListener {
        id,
        kind: ListenerKind::Packet,
        bind_address: bound,
        forward_host,
        forward_port,
        closed: AtomicBool::new(false),
        task,
    }))
}

/// One datagram flow: peer datagrams go up the channel with a u32 length
/// prefix, channel frames come back as datagrams to the peer.
async fn run_flow(
    session: Arc<CommSession>,
    info: ChannelInfo,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    let channel = match session.open_channel(info).await {
        Ok(ch) => ch,
        Err(err) => {
            tracing::debug!(peer = %peer, err = %err, "comm: packet channel refused");
            return;
        }
    };
    let (mut reader, mut writer) = tokio::io::split(channel);

    let downlink = tokio::spawn(async move {
        loop {
            let len = match reader.read_u32().await {
                Ok(len) if len as usize <= 65_535 => len as usize,
                _ => break,
            };
            let mut buf = vec![0u8; len];
            if reader.read_exact(&mut buf).await.is_err() {
                break;
            }
            if socket.send_to(&buf, peer).await.is_err() {
                break;
            }
        }
    });

    loop {
        let datagram = tokio::select! {
            d = rx.recv() => match d {
                Some(d) => d,
                None => break,
            },
            _ = tokio::time::sleep(FLOW_IDLE_TIMEOUT) => {
                tracing::debug!(peer = %peer, "comm: packet flow idle");
                break;
            }
        };
        if writer.write_u32(datagram.len() as u32).await.is_err()
            || writer.write_all(&datagram).await.is_err()
            || writer.flush().await.is_err()
        {
            break;
        }
    }
    downlink.abort();
}
