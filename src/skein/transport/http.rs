use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;

use crate::skein::{
    config::Config,
    connection::{Connection, ConnectionIo},
    envelope::{self, Envelope},
    transport::{Backend, Uri},
};

/// Envelope relay over plain HTTP(S) long polling. One POST per outbound
/// batch, one hanging GET per inbound poll; the server parks the GET until
/// it has envelopes or the poll window expires.
pub struct HttpBackend;

const POLL_WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

#[async_trait]
impl Backend for HttpBackend {
    fn scheme(&self) -> &'static str {
        "http"
    }

    async fn connect(&self, uri: &Uri, cfg: &Config) -> anyhow::Result<Arc<Connection>> {
        let client = reqwest::Client::builder()
            .timeout(POLL_WINDOW + std::time::Duration::from_secs(10))
            .build()
            .context("http: build client")?;

        let base = base_url(uri);

        // Session init: the server hands back an opaque token scoping the
        // send and poll endpoints.
        let resp = client
            .post(format!("{base}/session"))
            .send()
            .await
            .with_context(|| format!("http: session init {}", base))?
            .error_for_status()
            .context("http: session init rejected")?;
        let token = resp.text().await.context("http: session token")?;
        let token = token.trim().to_string();
        if token.is_empty() {
            anyhow::bail!("http: empty session token from {}", base);
        }

        tracing::info!(uri = %uri, "http: session established");

        let (conn, io) = Connection::new(&uri.raw);
        let ConnectionIo { send_rx, recv_tx } = io;

        tokio::spawn(send_loop(
            client.clone(),
            base.clone(),
            token.clone(),
            send_rx,
            conn.clone(),
            cfg.max_errors,
        ));
        tokio::spawn(poll_loop(
            client,
            base,
            token,
            recv_tx,
            conn.clone(),
            cfg.max_errors,
            cfg.poll_interval,
        ));
        Ok(conn)
    }
}

fn base_url(uri: &Uri) -> String {
    let default_port = if uri.scheme == "https" { 443 } else { 80 };
    let path = uri.path.trim_end_matches('/');
    format!(
        "{}://{}{}",
        if uri.scheme == "https" { "https" } else { "http" },
        uri.address(default_port),
        path
    )
}

/// Parse a poll body holding zero or more concatenated frames.
async fn decode_batch(body: &[u8]) -> Result<Vec<Envelope>, envelope::EnvelopeError> {
    let mut cur = body;
    let mut out = Vec::new();
    while !cur.is_empty() {
        out.push(envelope::read_envelope(&mut cur).await?);
    }
    Ok(out)
}

async fn send_loop(
    client: reqwest::Client,
    base: String,
    token: String,
    mut send_rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
    conn: Arc<Connection>,
    max_errors: usize,
) {
    let mut closed = conn.closed();
    let mut failures = 0usize;
    loop {
        let env = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            env = send_rx.recv() => match env {
                Some(env) => env,
                None => break,
            },
        };
        let mut body = Vec::with_capacity(env.data.len() + 16);
        if envelope::write_envelope(&mut body, &env).await.is_err() {
            continue;
        }

        // Drain whatever else is queued into the same batch.
        while let Ok(env) = send_rx.try_recv() {
            if envelope::write_envelope(&mut body, &env).await.is_err() {
                break;
            }
        }

        let res = client
            .post(format!("{base}/send/{token}"))
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match res {
            Ok(_) => failures = 0,
            Err(err) => {
                failures += 1;
                tracing::debug!(err = %err, failures, "http: send failed");
                if failures >= max_errors {
                    tracing::warn!(uri = %conn.uri, "http: send error budget exhausted");
                    break;
                }
            }
        }
    }
    conn.cleanup();
}

async fn poll_loop(
    client: reqwest::Client,
    base: String,
    token: String,
    recv_tx: tokio::sync::mpsc::UnboundedSender<Envelope>,
    conn: Arc<Connection>,
    max_errors: usize,
    poll_interval: std::time::Duration,
) {
    let mut closed = conn.closed();
    let mut failures = 0usize;
    loop {
        let req = client.get(format!("{base}/poll/{token}")).send();
        let resp = tokio::select! {
            r = req => r,
            _ = closed.changed() => break,
        };
        match resp {
            Ok(resp) if resp.status() == StatusCode::NO_CONTENT => {
                failures = 0;
                tokio::time::sleep(poll_interval).await;
            }
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => {
                    failures = 0;
                    let body = match resp.bytes().await {
                        Ok(b) => b,
                        Err(_) => continue,
                    };
                    match decode_batch(&body).await {
                        Ok(envs) => {
                            for env in envs {
                                if recv_tx.send(env).is_err() {
                                    conn.cleanup();
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            tracing::debug!(err = %err, "http: bad poll body");
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::debug!(err = %err, failures, "http: poll rejected");
                    if failures >= max_errors {
                        break;
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            },
            Err(err) => {
                // Long-poll timeouts are routine, not failures.
                if err.is_timeout() {
                    failures = 0;
                    continue;
                }
                failures += 1;
                tracing::debug!(err = %err, failures, "http: poll failed");
                if failures >= max_errors {
                    tracing::warn!(uri = %conn.uri, "http: poll error budget exhausted");
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
    conn.cleanup();
}

#[cfg(test)]
mod tests {
    use crate::skein::envelope::{Ping, kind};

    use super::*;

    #[test]
    fn base_url_defaults_ports_by_scheme() {
        let u = Uri::parse("http://c2.example.com").unwrap();
        assert_eq!(base_url(&u), "http://c2.example.com:80");

        let u = Uri::parse("https://c2.example.com/updates/").unwrap();
        assert_eq!(base_url(&u), "https://c2.example.com:443/updates");

        let u = Uri::parse("http://c2.example.com:8888").unwrap();
        assert_eq!(base_url(&u), "http://c2.example.com:8888");
    }

    #[tokio::test]
    async fn batch_decodes_multiple_frames() {
        let mut body = Vec::new();
        for nonce in [1u32, 2, 3] {
            let env = Envelope::new(kind::PING, &Ping { nonce }).unwrap();
            envelope::write_envelope(&mut body, &env).await.unwrap();
        }

        let envs = decode_batch(&body).await.unwrap();
        assert_eq!(envs.len(), 3);
        assert_eq!(envs[2].decode::<Ping>().unwrap().nonce, 3);
    }

    #[tokio::test]
    async fn truncated_batch_is_an_error() {
        let mut body = Vec::new();
        let env = Envelope::new(kind::PING, &Ping { nonce: 1 }).unwrap();
        envelope::write_envelope(&mut body, &env).await.unwrap();
        body.truncate(body.len() - 1);

        assert!(decode_batch(&body).await.is_err());
    }
}
