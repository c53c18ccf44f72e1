use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{PublicKey, StaticSecret};

const PROTO_LABEL: &[u8] = b"skein-comm-v1";

/// A static x25519 identity. The fingerprint is what peers pin.
pub struct Identity {
    secret: StaticSecret,
    pub public: PublicKey,
}

impl Identity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Decode a base64-encoded 32-byte secret, or generate a fresh identity
    /// when the config leaves it empty.
    pub fn from_config(encoded: &str) -> anyhow::Result<Self> {
        if encoded.is_empty() {
            return Ok(Self::generate());
        }
        let bytes = B64
            .decode(encoded)
            .map_err(|_| anyhow::anyhow!("comm: private key is not valid base64"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("comm: private key must be 32 bytes"))?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.public.as_bytes())
    }
}

/// base64(SHA-256(public key)).
pub fn fingerprint(public: &[u8; 32]) -> String {
    B64.encode(Sha256::digest(public))
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer key exchange was not contributory")]
    WeakKey,
    #[error("peer failed the key proof")]
    BadProof,
    #[error("peer fingerprint {presented} is not trusted")]
    Untrusted { presented: String },
}

#[derive(Debug)]
pub struct PeerInfo {
    pub fingerprint: String,
}

/// Client side: send our public key and nonce, verify the acceptor's proof
/// and pinned fingerprint, then prove our own key.
///
/// Wire layout is fixed-size both ways: 32-byte key, 32-byte nonce, and a
/// 32-byte SHA-256 proof over the shared secret and the full transcript.
pub async fn initiate<S>(
    stream: &mut S,
    identity: &Identity,
    pinned: &str,
) -> Result<PeerInfo, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    stream.write_all(identity.public.as_bytes()).await?;
    stream.write_all(&nonce).await?;
    stream.flush().await?;

    let mut peer_pub = [0u8; 32];
    stream.read_exact(&mut peer_pub).await?;
    let mut peer_nonce = [0u8; 32];
    stream.read_exact(&mut peer_nonce).await?;
    let mut peer_proof = [0u8; 32];
    stream.read_exact(&mut peer_proof).await?;

    let presented = fingerprint(&peer_pub);
    if presented != pinned {
        return Err(HandshakeError::Untrusted { presented });
    }

    let peer_key = PublicKey::from(peer_pub);
    let shared = identity.secret.diffie_hellman(&peer_key);
    if !shared.was_contributory() {
        return Err(HandshakeError::WeakKey);
    }

    let expect = proof(
        shared.as_bytes(),
        &peer_pub,
        identity.public.as_bytes(),
        &nonce,
        &peer_nonce,
    );
    if peer_proof != expect {
        return Err(HandshakeError::BadProof);
    }

    let ours = proof(
        shared.as_bytes(),
        identity.public.as_bytes(),
        &peer_pub,
        &peer_nonce,
        &nonce,
    );
    stream.write_all(&ours).await?;
    stream.flush().await?;

    Ok(PeerInfo { fingerprint: presented })
}

/// Server side: read the initiator's key and nonce, prove our key, then
/// verify the initiator's proof and check its fingerprint against the
/// authorized set.
pub async fn accept<S>(
    stream: &mut S,
    identity: &Identity,
    authorized: &[String],
) -> Result<PeerInfo, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut peer_pub = [0u8; 32];
    stream.read_exact(&mut peer_pub).await?;
    let mut peer_nonce = [0u8; 32];
    stream.read_exact(&mut peer_nonce).await?;

    let presented = fingerprint(&peer_pub);
    if !authorized.iter().any(|f| f == &presented) {
        return Err(HandshakeError::Untrusted { presented });
    }

    let peer_key = PublicKey::from(peer_pub);
    let shared = identity.secret.diffie_hellman(&peer_key);
    if !shared.was_contributory() {
        return Err(HandshakeError::WeakKey);
    }

    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ours = proof(
        shared.as_bytes(),
        identity.public.as_bytes(),
        &peer_pub,
        &peer_nonce,
        &nonce,
    );

    stream.write_all(identity.public.as_bytes()).await?;
    stream.write_all(&nonce).await?;
    stream.write_all(&ours).await?;
    stream.flush().await?;

    let mut peer_proof = [0u8; 32];
    stream.read_exact(&mut peer_proof).await?;
    let expect = proof(
        shared.as_bytes(),
        &peer_pub,
        identity.public.as_bytes(),
        &nonce,
        &peer_nonce,
    );
    if peer_proof != expect {
        return Err(HandshakeError::BadProof);
    }

    Ok(PeerInfo { fingerprint: presented })
}

/// proof = SHA-256(label || shared || prover_pub || other_pub || their_nonce
/// || our_nonce). Binding both keys and both nonces keeps each direction's
/// proof distinct and non-replayable.
fn proof(
    shared: &[u8; 32],
    prover: &[u8; 32],
    other: &[u8; 32],
    their_nonce: &[u8; 32],
    our_nonce: &[u8; 32],
) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(PROTO_LABEL);
    h.update(shared);
    h.update(prover);
    h.update(other);
    h.update(their_nonce);
    h.update(our_nonce);
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutual_handshake_succeeds() {
        let client = Identity::generate();
        let server = Identity::generate();
        let server_fp = server.fingerprint();
        let client_fp = client.fingerprint();

        let (mut a, mut b) = tokio::io::duplex(4096);
        let accept_task = tokio::spawn(async move {
            accept(&mut b, &server, &[client_fp]).await
        });

        let peer = initiate(&mut a, &client, &server_fp).await.unwrap();
        assert_eq!(peer.fingerprint, server_fp);

        let peer = accept_task.await.unwrap().unwrap();
        assert_eq!(peer.fingerprint, client.fingerprint());
    }

    #[tokio::test]
    async fn initiator_rejects_wrong_pin() {
        let client = Identity::generate();
        let server = Identity::generate();
        let client_fp = client.fingerprint();
        let imposter_fp = Identity::generate().fingerprint();

        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = accept(&mut b, &server, &[client_fp]).await;
        });

        let err = initiate(&mut a, &client, &imposter_fp).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Untrusted { .. }));
    }

    #[tokio::test]
    async fn acceptor_rejects_unknown_initiator() {
        let client = Identity::generate();
        let server = Identity::generate();
        let server_fp = server.fingerprint();

        let (mut a, mut b) = tokio::io::duplex(4096);
        let accept_task = tokio::spawn(async move {
            accept(&mut b, &server, &["someone-else".to_string()]).await
        });
        tokio::spawn(async move {
            let _ = initiate(&mut a, &client, &server_fp).await;
        });

        let err = accept_task.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::Untrusted { .. }));
    }

    #[test]
    fn identity_roundtrips_through_config() {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let encoded = B64.encode(secret.to_bytes());
        let id = Identity::from_config(&encoded).unwrap();
        assert_eq!(id.public, PublicKey::from(&secret));

        assert!(Identity::from_config("not base64!!").is_err());
        assert!(Identity::from_config("").is_ok());
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_eq!(a.fingerprint(), fingerprint(a.public.as_bytes()));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
