use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::skein::{
    config::Config,
    connection::{Connection, ConnectionIo},
    envelope::{self, Envelope, MAX_FRAME_BYTES},
    transport::{Backend, Uri},
};

/// Envelope relay over DNS. Outbound bytes ride as base32 subdomain labels
/// under the parent zone; inbound bytes come back in TXT answers to poll
/// queries. Slow, but survives networks where everything else is blocked.
pub struct DnsBackend;

/// Raw bytes per data query. Labels cap at 63 chars and base32 costs 8/5,
/// so this stays well inside a 253-char name with room for the parent zone.
const MAX_QUERY_DATA: usize = 120;

const DEFAULT_RESOLVER: &str = "8.8.8.8:53";
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;

const TYPE_TXT: u16 = 16;

#[async_trait]
impl Backend for DnsBackend {
    fn scheme(&self) -> &'static str {
        "dns"
    }

    async fn connect(&self, uri: &Uri, cfg: &Config) -> anyhow::Result<Arc<Connection>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("dns: bind query socket")?;

        let mut client = DnsClient {
            socket,
            parent: uri.host.clone(),
            resolver: DEFAULT_RESOLVER.to_string(),
            session: String::new(),
            tx_id: rand::random(),
            send_seq: 0,
            poll_seq: 0,
        };
        client.handshake().await?;

        tracing::info!(uri = %uri, session = %client.session, "dns: session established");

        let (conn, io) = Connection::new(&uri.raw);
        tokio::spawn(drive(client, io, conn.clone(), cfg.poll_interval, cfg.max_errors));
        Ok(conn)
    }
}

struct DnsClient {
    socket: UdpSocket,
    parent: String,
    resolver: String,
    session: String,
    tx_id: u16,
    send_seq: u32,
    poll_seq: u32,
}

impl DnsClient {
    async fn handshake(&mut self) -> anyhow::Result<()> {
        let qname = format!("init.0.snew.{}", self.parent);
        let resp = self.query(&qname).await?;
        if resp.len() < 8 {
            anyhow::bail!("dns: short session reply ({} bytes)", resp.len());
        }
        self.session = base32_encode(&resp[..8]).to_ascii_lowercase();
        Ok(())
    }

    /// One data chunk out: `<b32 labels>.<seq>.s<session>.<parent>`.
    async fn send_chunk(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let encoded = base32_encode(chunk);
        let labels: Vec<&str> = encoded
            .as_bytes()
            .chunks(63)
            .map(|c| std::str::from_utf8(c).unwrap_or(""))
            .collect();
        let qname = format!(
            "{}.{}.s{}.{}",
            labels.join("."),
            self.send_seq,
            self.session,
            self.parent
        );
        self.send_seq = self.send_seq.wrapping_add(1);
        self.query(&qname).await?;
        Ok(())
    }

    /// Poll the zone for pending inbound bytes.
    async fn poll(&mut self) -> anyhow::Result<Vec<u8>> {
        let qname = format!("poll.{}.s{}.{}", self.poll_seq, self.session, self.parent);
        let data = self.query(&qname).await?;
        self.poll_seq = self.poll_seq.wrapping_add(1);
        Ok(data)
    }

    async fn close(&mut self) {
        if !self.session.is_empty() {
            let qname = format!("close.0.s{}.{}", self.session, self.parent);
            let _ = self.query(&qname).await;
        }
    }

    async fn query(&mut self, qname: &str) -> anyhow::Result<Vec<u8>> {
        self.tx_id = self.tx_id.wrapping_add(1);
        let packet = build_query(self.tx_id, qname);

        for attempt in 0..MAX_RETRIES {
            self.socket
                .send_to(&packet, &self.resolver)
                .await
                .context("dns: send query")?;

            let mut buf = [0u8; 1024];
            match tokio::time::timeout(QUERY_TIMEOUT, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => return parse_txt_response(self.tx_id, &buf[..len]),
                Ok(Err(err)) if attempt + 1 >= MAX_RETRIES => {
                    return Err(err).context("dns: recv response");
                }
                Ok(Err(_)) => {}
                Err(_) if attempt + 1 >= MAX_RETRIES => {
                    anyhow::bail!("dns: query {:?} timed out", qname);
                }
                Err(_) => {}
            }
        }
        anyhow::bail!("dns: query {:?} timed out", qname)
    }
}

/// Single driver task. Queries are strictly sequential on one socket, so
/// sends and polls interleave here instead of running as separate loops.
async fn drive(
    mut client: DnsClient,
    io: ConnectionIo,
    conn: Arc<Connection>,
    poll_interval: std::time::Duration,
    max_errors: usize,
) {
    let ConnectionIo {
        mut send_rx,
        recv_tx,
    } = io;
    let mut closed = conn.closed();
    let mut pending = Vec::new();
    let mut failures = 0usize;
    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            env = send_rx.recv() => match env {
                Some(env) => Step::Send(env),
                None => break,
            },
            _ = tick.tick() => Step::Poll,
            _ = closed.changed() => break,
        };

        let res = match step {
            Step::Send(env) => {
                let mut frame = Vec::with_capacity(env.data.len() + 16);
                if envelope::write_envelope(&mut frame, &env).await.is_err() {
                    continue;
                }
                let mut res = Ok(());
                for chunk in frame.chunks(MAX_QUERY_DATA) {
                    res = client.send_chunk(chunk).await;
                    if res.is_err() {
                        break;
                    }
                }
                res
            }
            Step::Poll => match client.poll().await {
                Ok(data) => {
                    pending.extend_from_slice(&data);
                    match drain_frames(&mut pending) {
                        Ok(envs) => {
                            for env in envs {
                                if recv_tx.send(env).is_err() {
                                    conn.cleanup();
                                    return;
                                }
                            }
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
                Err(err) => Err(err),
            },
        };

        match res {
            Ok(()) => failures = 0,
            Err(err) => {
                failures += 1;
                tracing::debug!(err = %err, failures, "dns: exchange failed");
                if failures >= max_errors {
                    tracing::warn!(uri = %conn.uri, "dns: error budget exhausted");
                    break;
                }
            }
        }
    }
    client.close().await;
    conn.cleanup();
}

enum Step {
    Send(Envelope),
    Poll,
}

/// Pop every complete frame off the front of the reassembly buffer,
/// leaving a trailing partial frame in place.
fn drain_frames(buf: &mut Vec<u8>) -> anyhow::Result<Vec<Envelope>> {
    let mut out = Vec::new();
    loop {
        if buf.len() < 4 {
            return Ok(out);
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MAX_FRAME_BYTES {
            anyhow::bail!("dns: oversized frame ({len} bytes)");
        }
        let total = 4 + len as usize;
        if buf.len() < total {
            return Ok(out);
        }
        let mut cur: &[u8] = &buf[..total];
        // Complete frame in hand, so the blocking read resolves immediately.
        let env = futures_util::FutureExt::now_or_never(envelope::read_envelope(&mut cur))
            .ok_or_else(|| anyhow::anyhow!("dns: frame parse stalled"))?
            .context("dns: parse frame")?;
        out.push(env);
        buf.drain(..total);
    }
}

fn build_query(tx_id: u16, qname: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    // Standard query, recursion desired.
    packet.extend_from_slice(&[0x01, 0x00]);
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in qname.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&TYPE_TXT.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // IN
    packet
}

/// Extract concatenated TXT strings from a response, checking the
/// transaction id and RCODE first.
fn parse_txt_response(tx_id: u16, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
    if packet.len() < 12 {
        anyhow::bail!("dns: response too short");
    }
    let got_id = u16::from_be_bytes([packet[0], packet[1]]);
    if got_id != tx_id {
        anyhow::bail!("dns: transaction id mismatch");
    }
    let rcode = packet[3] & 0x0F;
    if rcode != 0 {
        anyhow::bail!("dns: server returned RCODE={rcode}");
    }
    let ancount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    if ancount == 0 {
        return Ok(Vec::new());
    }

    // Skip the question section.
    let mut pos = 12;
    while pos < packet.len() && packet[pos] != 0 {
        let len = packet[pos] as usize;
        if len >= 0xC0 {
            pos += 2;
            break;
        }
        pos += len + 1;
    }
    if pos < packet.len() && packet[pos] == 0 {
        pos += 1;
    }
    pos += 4;

    let mut data = Vec::new();
    for _ in 0..ancount {
        // Skip the owner name, compressed or not.
        while pos < packet.len() {
            let b = packet[pos];
            if b == 0 {
                pos += 1;
                break;
            } else if b >= 0xC0 {
                pos += 2;
                break;
            }
            pos += b as usize + 1;
        }
        if pos + 10 > packet.len() {
            break;
        }
        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            break;
        }
        if rtype == TYPE_TXT {
            let mut txt_pos = pos;
            while txt_pos < pos + rdlength {
                let txt_len = packet[txt_pos] as usize;
                txt_pos += 1;
                if txt_pos + txt_len <= pos + rdlength {
                    data.extend_from_slice(&packet[txt_pos..txt_pos + txt_len]);
                }
                txt_pos += txt_len;
            }
        }
        pos += rdlength;
    }

    if data.is_empty() {
        return Ok(data);
    }
    base32_decode(std::str::from_utf8(&data).unwrap_or(""))
        .ok_or_else(|| anyhow::anyhow!("dns: bad base32 in TXT answer"))
}

const B32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32, no padding. Case-insensitive on decode since resolvers
/// may fold names.
fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer = 0u64;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(B32_ALPHABET[((buffer >> bits) & 0x1F) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(B32_ALPHABET[((buffer << (5 - bits)) & 0x1F) as usize] as char);
    }
    out
}

fn base32_decode(data: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 5 / 8);
    let mut buffer = 0u64;
    let mut bits = 0;
    for c in data.chars() {
        let c = c.to_ascii_uppercase();
        let val = B32_ALPHABET.iter().position(|&x| x == c as u8)?;
        buffer = (buffer << 5) | val as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use crate::skein::envelope::{Ping, kind};

    use super::*;

    #[test]
    fn base32_roundtrip() {
        for data in [b"".as_slice(), b"a", b"hello world", &[0u8, 255, 7, 128]] {
            let enc = base32_encode(data);
            assert!(enc.bytes().all(|b| B32_ALPHABET.contains(&b)));
            assert_eq!(base32_decode(&enc).unwrap(), data);
            assert_eq!(base32_decode(&enc.to_ascii_lowercase()).unwrap(), data);
        }
    }

    #[test]
    fn query_packet_has_qname_labels() {
        let q = build_query(0x1234, "abc.0.sxyz.tunnel.example.com");
        assert_eq!(&q[..2], &[0x12, 0x34]);
        assert_eq!(q[2], 0x01); // RD set
        assert_eq!(&q[4..6], &[0x00, 0x01]); // one question
        // First label is "abc".
        assert_eq!(q[12], 3);
        assert_eq!(&q[13..16], b"abc");
        // Type TXT at the tail.
        let n = q.len();
        assert_eq!(&q[n - 4..n - 2], &TYPE_TXT.to_be_bytes());
    }

    #[test]
    fn txt_response_parses_and_checks_id() {
        let payload = b"session!";
        let encoded = base32_encode(payload);

        let mut resp = Vec::new();
        resp.extend_from_slice(&0x0042u16.to_be_bytes());
        resp.extend_from_slice(&[0x81, 0x80]);
        resp.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        // Question: "x" + root, TXT IN.
        resp.extend_from_slice(&[1, b'x', 0]);
        resp.extend_from_slice(&TYPE_TXT.to_be_bytes());
        resp.extend_from_slice(&[0x00, 0x01]);
        // Answer: name pointer, TXT IN, TTL 60, rdata.
        resp.extend_from_slice(&[0xC0, 0x0C]);
        resp.extend_from_slice(&TYPE_TXT.to_be_bytes());
        resp.extend_from_slice(&[0x00, 0x01]);
        resp.extend_from_slice(&[0x00, 0x00, 0x00, 0x3C]);
        resp.extend_from_slice(&((encoded.len() + 1) as u16).to_be_bytes());
        resp.push(encoded.len() as u8);
        resp.extend_from_slice(encoded.as_bytes());

        assert_eq!(parse_txt_response(0x0042, &resp).unwrap(), payload);
        assert!(parse_txt_response(0x0043, &resp).is_err());
    }

    #[tokio::test]
    async fn frames_drain_across_chunk_boundaries() {
        let mut wire = Vec::new();
        for nonce in [10u32, 20] {
            let env = Envelope::new(kind::PING, &Ping { nonce }).unwrap();
            envelope::write_envelope(&mut wire, &env).await.unwrap();
        }

        let mut buf = Vec::new();
        let mut got = Vec::new();
        // Feed the wire bytes three at a time, as tiny poll answers would.
        for chunk in wire.chunks(3) {
            buf.extend_from_slice(chunk);
            got.extend(drain_frames(&mut buf).unwrap());
        }
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].decode::<Ping>().unwrap().nonce, 20);
        assert!(buf.is_empty());
    }
}
