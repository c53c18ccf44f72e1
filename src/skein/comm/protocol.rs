use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::skein::envelope::TransportProto;

const MAGIC_CONTROL: &[u8; 4] = b"SKCT"; // Skein Comm Control
const MAGIC_CHANNEL: &[u8; 4] = b"SKCH"; // Skein Comm Channel
const PROTOCOL_V1: u8 = 1;

pub const MAX_HEADER_JSON_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum CommProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metadata for one multiplexed byte channel. Sent once when the stream
/// opens; after the reply, the stream is raw piped bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: u64,
    #[serde(default)]
    pub transport: TransportProto,
    /// Free-form application tag for operator bookkeeping.
    #[serde(default)]
    pub application: String,
    /// Route this channel should leave through; 0 means the session peer
    /// dials from its own network.
    #[serde(default)]
    pub route_id: u64,
    #[serde(default)]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Accept or reject, written by the acceptor before any payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReply {
    pub accepted: bool,
    #[serde(default)]
    pub reason: String,
}

/// What a fresh yamux stream announces itself as.
#[derive(Debug)]
pub enum StreamHeader {
    Control,
    Channel(ChannelInfo),
}

/// Request on the control stream. Ids correlate replies; each side numbers
/// its own requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: u64,
    pub op: ControlOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlOp {
    Keepalive { nonce: u32 },
    Latency,
    HandlerOpen { handler: crate::skein::envelope::Handler },
    HandlerClose { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    pub id: u64,
    pub ok: bool,
    /// Op-specific payload; for latency, nanoseconds as a decimal string.
    #[serde(default)]
    pub payload: String,
}

pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    header: &StreamHeader,
) -> Result<(), CommProtocolError> {
    match header {
        StreamHeader::Control => {
            w.write_all(MAGIC_CONTROL).await?;
            w.write_u8(PROTOCOL_V1).await?;
        }
        StreamHeader::Channel(info) => {
            w.write_all(MAGIC_CHANNEL).await?;
            w.write_u8(PROTOCOL_V1).await?;
            write_json(w, info).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

pub async fn read_stream_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<StreamHeader, CommProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;

    let is_channel = if &magic == MAGIC_CONTROL {
        false
    } else if &magic == MAGIC_CHANNEL {
        true
    } else {
        return Err(CommProtocolError::BadMagic);
    };

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(CommProtocolError::BadVersion);
    }

    if is_channel {
        Ok(StreamHeader::Channel(read_json(r).await?))
    } else {
        Ok(StreamHeader::Control)
    }
}

pub async fn write_channel_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: &ChannelReply,
) -> Result<(), CommProtocolError> {
    write_json(w, reply).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_channel_reply<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ChannelReply, CommProtocolError> {
    read_json(r).await
}

pub async fn write_control_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &ControlRequest,
) -> Result<(), CommProtocolError> {
    write_json(w, req).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_control_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ControlRequest, CommProtocolError> {
    read_json(r).await
}

pub async fn write_control_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: &ControlReply,
) -> Result<(), CommProtocolError> {
    write_json(w, reply).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_control_reply<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ControlReply, CommProtocolError> {
    read_json(r).await
}

async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    value: &T,
) -> Result<(), CommProtocolError> {
    let b = serde_json::to_vec(value)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_HEADER_JSON_BYTES {
        return Err(CommProtocolError::PayloadTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    Ok(())
}

async fn read_json<R: AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(
    r: &mut R,
) -> Result<T, CommProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_HEADER_JSON_BYTES {
        return Err(CommProtocolError::PayloadTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ChannelInfo {
        ChannelInfo {
            id: 7,
            transport: TransportProto::Tcp,
            application: "ssh".into(),
            route_id: 0,
            local_host: "10.0.0.5".into(),
            local_port: 52100,
            remote_host: "172.16.1.20".into(),
            remote_port: 22,
        }
    }

    #[tokio::test]
    async fn channel_header_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let sent = info();
        let si = sent.clone();
        tokio::spawn(async move {
            write_stream_header(&mut a, &StreamHeader::Channel(si)).await
        });

        match read_stream_header(&mut b).await.unwrap() {
            StreamHeader::Channel(got) => {
                assert_eq!(got.id, sent.id);
                assert_eq!(got.remote_host, sent.remote_host);
                assert_eq!(got.remote_port, 22);
            }
            other => panic!("unexpected header: {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_header_is_bare() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move { write_stream_header(&mut a, &StreamHeader::Control).await });
        assert!(matches!(
            read_stream_header(&mut b).await.unwrap(),
            StreamHeader::Control
        ));
    }

    #[tokio::test]
    async fn bad_magic_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move { a.write_all(b"NOPE\x01").await });
        assert!(matches!(
            read_stream_header(&mut b).await.unwrap_err(),
            CommProtocolError::BadMagic
        ));
    }

    #[tokio::test]
    async fn oversized_header_rejected_before_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(MAGIC_CHANNEL).await.unwrap();
            a.write_u8(PROTOCOL_V1).await.unwrap();
            a.write_u32(MAX_HEADER_JSON_BYTES + 1).await.unwrap();
        });
        assert!(matches!(
            read_stream_header(&mut b).await.unwrap_err(),
            CommProtocolError::PayloadTooLarge(_)
        ));
    }

    #[tokio::test]
    async fn control_records_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            write_control_request(
                &mut a,
                &ControlRequest {
                    id: 3,
                    op: ControlOp::Latency,
                },
            )
            .await
            .unwrap();
            write_control_reply(
                &mut a,
                &ControlReply {
                    id: 3,
                    ok: true,
                    payload: "1250000".into(),
                },
            )
            .await
            .unwrap();
        });

        let req = read_control_request(&mut b).await.unwrap();
        assert_eq!(req.id, 3);
        assert!(matches!(req.op, ControlOp::Latency));
        let reply = read_control_reply(&mut b).await.unwrap();
        assert_eq!(reply.payload, "1250000");
    }
}
