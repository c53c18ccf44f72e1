use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame. Anything larger is a framing error, rejected
/// before allocation.
pub const MAX_FRAME_BYTES: u32 = 16 << 20; // 16 MiB

/// Frame header past the length prefix: 8-byte id + 4-byte kind.
const HEADER_BYTES: u32 = 12;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame too large: {0}")]
    TooLarge(u32),
    #[error("truncated frame: {0} bytes")]
    Truncated(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The framed unit of communication on every control channel.
///
/// `id` correlates request/response pairs, `kind` selects the payload schema,
/// `data` is an opaque serialized payload. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub id: u64,
    pub kind: u32,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: u32, payload: &T) -> Result<Self, EnvelopeError> {
        Ok(Self {
            id: 0,
            kind,
            data: serde_json::to_vec(payload)?,
        })
    }

    pub fn with_id<T: Serialize>(id: u64, kind: u32, payload: &T) -> Result<Self, EnvelopeError> {
        let mut env = Self::new(kind, payload)?;
        env.id = id;
        Ok(env)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Write one envelope: 4-byte little-endian length prefix, then the frame
/// (id, kind, payload bytes).
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    w: &mut W,
    env: &Envelope,
) -> Result<(), EnvelopeError> {
    let len = HEADER_BYTES as usize + env.data.len();
    let len: u32 = len.try_into().map_err(|_| EnvelopeError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_BYTES {
        return Err(EnvelopeError::TooLarge(len));
    }

    w.write_u32_le(len).await?;
    w.write_u64_le(env.id).await?;
    w.write_u32_le(env.kind).await?;
    w.write_all(&env.data).await?;
    w.flush().await?;
    Ok(())
}

/// Read one envelope, looping on partial reads. A frame shorter than its
/// header or larger than [`MAX_FRAME_BYTES`] is a framing error; the caller
/// treats any error as connection-fatal.
pub async fn read_envelope<R: AsyncRead + Unpin>(r: &mut R) -> Result<Envelope, EnvelopeError> {
    let len = r.read_u32_le().await?;
    if len > MAX_FRAME_BYTES {
        return Err(EnvelopeError::TooLarge(len));
    }
    if len < HEADER_BYTES {
        return Err(EnvelopeError::Truncated(len));
    }

    let id = r.read_u64_le().await?;
    let kind = r.read_u32_le().await?;

    let mut data = vec![0u8; (len - HEADER_BYTES) as usize];
    r.read_exact(&mut data).await?;
    Ok(Envelope { id, kind, data })
}

/// Message kinds carried in [`Envelope::kind`].
pub mod kind {
    pub const PING: u32 = 1;

    pub const TUNNEL_DATA: u32 = 10;
    pub const TUNNEL_CLOSE: u32 = 11;

    pub const HANDLER_START_REQ: u32 = 20;
    pub const HANDLER_START_RESP: u32 = 21;
    pub const HANDLER_STOP_REQ: u32 = 22;
    pub const HANDLER_STOP_RESP: u32 = 23;

    pub const TRANSPORTS_LIST_REQ: u32 = 30;
    pub const TRANSPORTS_LIST: u32 = 31;
    pub const TRANSPORT_ADD_REQ: u32 = 32;
    pub const TRANSPORT_ADD_RESP: u32 = 33;
    pub const TRANSPORT_SWITCH_REQ: u32 = 34;
    pub const TRANSPORT_SWITCH_RESP: u32 = 35;

    pub const RPORTFWD_LISTENERS_REQ: u32 = 40;
    pub const RPORTFWD_LISTENERS: u32 = 41;
    pub const RPORTFWD_START_REQ: u32 = 42;
    pub const RPORTFWD_START_RESP: u32 = 43;
    pub const RPORTFWD_STOP_REQ: u32 = 44;
    pub const RPORTFWD_STOP_RESP: u32 = 45;

    pub const PIVOT_LISTENERS_REQ: u32 = 50;
    pub const PIVOT_LISTENERS: u32 = 51;
    pub const PIVOT_START_LISTENER_REQ: u32 = 52;
    pub const PIVOT_START_LISTENER_RESP: u32 = 53;
    pub const PIVOT_STOP_LISTENER_REQ: u32 = 54;
    pub const PIVOT_STOP_LISTENER_RESP: u32 = 55;
    pub const PIVOT_PEER_ENVELOPE: u32 = 56;
    pub const PIVOT_PEER_FAILURE: u32 = 57;
    pub const PIVOT_PEER_PING: u32 = 58;
}

/// base64 text for opaque byte fields; JSON arrays of numbers are wasteful
/// on the tunnel hot path.
pub mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ping {
    pub nonce: u32,
}

/// One sequenced chunk of a tunnel's byte stream. `ack` piggybacks the
/// sender's last-delivered read sequence; `resend` asks the peer to
/// retransmit from `ack`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TunnelData {
    pub tunnel_id: u64,
    pub sequence: u64,
    pub ack: u64,
    #[serde(with = "b64", default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub resend: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TunnelClose {
    pub tunnel_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportProto {
    #[default]
    Tcp,
    Udp,
    NamedPipe,
}

impl std::fmt::Display for TransportProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportProto::Tcp => write!(f, "tcp"),
            TransportProto::Udp => write!(f, "udp"),
            TransportProto::NamedPipe => write!(f, "namedpipe"),
        }
    }
}

/// A bound endpoint a node forwards accepted connections from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handler {
    pub id: String,
    pub transport: TransportProto,
    #[serde(default)]
    pub bind_host: String,
    #[serde(default)]
    pub bind_port: u16,
    #[serde(default)]
    pub forward_host: String,
    #[serde(default)]
    pub forward_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerStartRequest {
    pub handler: Handler,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandlerStartResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerStopRequest {
    pub handler_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandlerStopResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportsList {
    pub available: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportAddRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSwitchRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RportFwdListener {
    pub id: String,
    pub bind_address: String,
    pub forward_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RportFwdListeners {
    pub listeners: Vec<RportFwdListener>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RportFwdStartListenerRequest {
    pub bind_address: String,
    pub forward_host: String,
    pub forward_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RportFwdStartListenerResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
    pub listener: Option<RportFwdListener>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RportFwdStopListenerRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RportFwdStopListenerResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotListenerInfo {
    pub id: u64,
    pub kind: String,
    pub bind_address: String,
    pub peers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PivotListeners {
    pub listeners: Vec<PivotListenerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotStartListenerRequest {
    pub kind: String,
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PivotStartListenerResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
    pub listener: Option<PivotListenerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotStopListenerRequest {
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PivotStopListenerResponse {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

/// Opaque envelope relayed on behalf of a downstream peer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PivotPeerEnvelope {
    pub peer_id: u64,
    #[serde(with = "b64", default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PivotPeerFailure {
    pub peer_id: u64,
    pub kind: String,
    #[serde(default)]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn envelope_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let env = Envelope {
            id: 42,
            kind: kind::TUNNEL_DATA,
            data: b"hello".to_vec(),
        };
        let env2 = env.clone();
        let w = tokio::spawn(async move { write_envelope(&mut a, &env2).await });
        let got = read_envelope(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got, env);
    }

    #[tokio::test]
    async fn envelope_roundtrip_empty_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let env = Envelope {
            id: 0,
            kind: kind::PING,
            data: vec![],
        };
        let env2 = env.clone();
        tokio::spawn(async move { write_envelope(&mut a, &env2).await });
        assert_eq!(read_envelope(&mut b).await.unwrap(), env);
    }

    #[tokio::test]
    async fn read_rejects_oversized_length_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            a.write_u32_le(MAX_FRAME_BYTES + 1).await.unwrap();
            // no payload needed
        });

        match read_envelope(&mut b).await.unwrap_err() {
            EnvelopeError::TooLarge(n) => assert!(n > MAX_FRAME_BYTES),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_rejects_frame_shorter_than_header() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            a.write_u32_le(4).await.unwrap();
            a.write_all(&[0u8; 4]).await.unwrap();
        });

        match read_envelope(&mut b).await.unwrap_err() {
            EnvelopeError::Truncated(4) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_read_surfaces_as_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            a.write_u32_le(100).await.unwrap();
            a.write_all(&[0u8; 20]).await.unwrap();
            // drop: peer sees EOF mid-frame
        });

        match read_envelope(&mut b).await.unwrap_err() {
            EnvelopeError::Io(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn typed_payload_roundtrip() {
        let td = TunnelData {
            tunnel_id: 7,
            sequence: 3,
            ack: 2,
            data: vec![0xde, 0xad, 0xbe, 0xef],
            closed: false,
            resend: false,
        };
        let env = Envelope::new(kind::TUNNEL_DATA, &td).unwrap();
        let got: TunnelData = env.decode().unwrap();
        assert_eq!(got.tunnel_id, 7);
        assert_eq!(got.sequence, 3);
        assert_eq!(got.data, vec![0xde, 0xad, 0xbe, 0xef]);
    }
}
