use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::sync::{mpsc, watch};

use crate::skein::{
    bufpool::BufPool,
    comm::{
        CommEvent, CommSession, handshake,
        listener::{self, ListenerRegistry},
        route::RouteRegistry,
    },
    config::{self, CommConfig, Config},
    connection::Connection,
    envelope::TransportProto,
    handlers::Dispatcher,
    logging,
    pivot::PivotRegistry,
    reconnect::{self, EndpointTable},
    transport,
    tunnel::{self, TunnelOptions},
};

const COMM_KEEPALIVE: Duration = Duration::from_secs(30);

/// Reserved tunnel id carrying the Comm session. Fixed so both ends of a
/// connection attach the same tunnel regardless of who initiates.
const COMM_TUNNEL_ID: u64 = 1;

/// Which side of the Comm handshake this node takes, decided by config: a
/// pinned remote fingerprint means we initiate; an authorized set means we
/// answer.
#[derive(Debug, Clone)]
enum CommRole {
    Initiate(String),
    Accept(Vec<String>),
}

fn comm_role(comm: &CommConfig) -> Option<CommRole> {
    if !comm.remote_fingerprint.is_empty() {
        return Some(CommRole::Initiate(comm.remote_fingerprint.clone()));
    }
    if !comm.authorized_fingerprints.is_empty() {
        return Some(CommRole::Accept(comm.authorized_fingerprints.clone()));
    }
    None
}

/// Process entry: load config, bring up logging, then supervise the
/// connection driver until a shutdown signal or a terminal driver error.
pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = Arc::new(config::load_config(&resolved.path)?);
    let _logging = logging::init(&cfg.logging).context("init logging")?;
    tracing::info!(
        config = %resolved.path.display(),
        source = ?resolved.source,
        endpoints = cfg.endpoints.len(),
        strategy = %cfg.strategy,
        "skein: starting"
    );

    let endpoints = Arc::new(EndpointTable::new(cfg.endpoints.clone()));
    let pool = Arc::new(BufPool::default());
    let pivots = PivotRegistry::new();
    let dispatcher = Dispatcher::new(cfg.clone(), endpoints.clone(), pool.clone(), pivots.clone());

    let identity = Arc::new(handshake::Identity::from_config(&cfg.comm.private_key)?);
    tracing::info!(fingerprint = %identity.fingerprint(), "skein: node identity");

    let (abort_tx, abort_rx) = watch::channel(false);
    let (conn_tx, mut conn_rx) = mpsc::channel::<Arc<Connection>>(1);

    let driver = {
        let cfg = cfg.clone();
        let endpoints = endpoints.clone();
        tokio::spawn(async move {
            let dial_cfg = cfg.clone();
            reconnect::run(
                &cfg,
                endpoints,
                move |uri| {
                    let cfg = dial_cfg.clone();
                    async move { transport::connect_uri(&uri, &cfg).await }
                },
                conn_tx,
                abort_rx,
            )
            .await
        })
    };

    loop {
        tokio::select! {
            maybe = conn_rx.recv() => {
                let Some(conn) = maybe else { break };
                if let Some(role) = comm_role(&cfg.comm) {
                    // Attach the comm tunnel before the dispatcher runs so
                    // the peer's first frames find it.
                    let stream = comm_attach(&cfg, conn.clone(), pool.clone()).await;
                    let identity = identity.clone();
                    tokio::spawn(async move {
                        if let Err(err) = comm_session(role, identity, stream).await {
                            tracing::warn!(err = %err, "skein: comm session ended");
                        }
                    });
                }
                tokio::spawn(dispatcher.clone().run(conn));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("skein: shutdown signal");
                let _ = abort_tx.send(true);
                break;
            }
        }
    }

    pivots.stop_all();
    drop(conn_rx);
    driver.await.context("join driver")??;
    tracing::info!("skein: stopped");
    Ok(())
}

/// Attach the reserved comm tunnel to a fresh connection, yielding the byte
/// stream the session handshake runs over.
async fn comm_attach(
    cfg: &Config,
    conn: Arc<Connection>,
    pool: Arc<BufPool>,
) -> tokio::io::DuplexStream {
    let opts = TunnelOptions {
        resend_threshold: cfg.tunnel.resend_threshold,
        grace_close: cfg.tunnel.grace_close,
        chunk_size: cfg.tunnel.chunk_size,
    };
    let (tun, stream) = tunnel::attach_stream(conn.clone(), COMM_TUNNEL_ID, opts, pool);
    conn.add_tunnel(tun).await;
    tracing::debug!(tunnel = COMM_TUNNEL_ID, "skein: comm tunnel attached");
    stream
}

/// Ride a Comm session on the connection's comm tunnel, on whichever side
/// of the handshake the config puts us.
async fn comm_session(
    role: CommRole,
    identity: Arc<handshake::Identity>,
    stream: tokio::io::DuplexStream,
) -> anyhow::Result<()> {
    let routes = Arc::new(RouteRegistry::default());
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let session = match role {
        CommRole::Initiate(pinned) => {
            CommSession::initiate(stream, &identity, &pinned, routes, ev_tx).await?
        }
        CommRole::Accept(authorized) => {
            CommSession::accept(stream, &identity, &authorized, routes, ev_tx).await?
        }
    };
    session.spawn_keepalive(COMM_KEEPALIVE);

    let listeners = Arc::new(ListenerRegistry::default());
    run_comm_events(session, ev_rx, listeners).await;
    Ok(())
}

/// Serve handler lifecycle requests from the peer until the session dies,
/// then tear the listeners down with it.
async fn run_comm_events(
    session: Arc<CommSession>,
    mut rx: mpsc::UnboundedReceiver<CommEvent>,
    listeners: Arc<ListenerRegistry>,
) {
    while let Some(ev) = rx.recv().await {
        match ev {
            CommEvent::HandlerOpen(h) => {
                let bind = format!("{}:{}", h.bind_host, h.bind_port);
                let res = match h.transport {
                    TransportProto::Tcp => {
                        listener::start_stream(
                            session.clone(),
                            h.id.clone(),
                            bind,
                            h.forward_host,
                            h.forward_port,
                        )
                        .await
                    }
                    TransportProto::Udp => {
                        listener::start_packet(
                            session.clone(),
                            h.id.clone(),
                            bind,
                            h.forward_host,
                            h.forward_port,
                        )
                        .await
                    }
                    TransportProto::NamedPipe => {
                        Err(anyhow::anyhow!("named pipe listeners not supported"))
                    }
                };
                match res {
                    Ok(l) => listeners.insert(l),
                    Err(err) => {
                        tracing::warn!(handler = %h.id, err = %err, "skein: handler open failed");
                    }
                }
            }
            CommEvent::HandlerClose(id) => {
                if !listeners.close(&id) {
                    tracing::debug!(handler = %id, "skein: close for unknown handler");
                }
            }
        }
    }
    listeners.close_all();
}
