use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use rustls::{
    CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::WebPkiServerVerifier,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::skein::{
    config::{Config, MtlsConfig},
    connection::Connection,
    transport::{Backend, Uri, socket},
};

const DEFAULT_PORT: u16 = 8443;

/// Mutual TLS over TCP. The peer's certificate chain must verify against
/// the pinned CA; the name on the certificate is deliberately not checked,
/// since endpoints are routinely dialed by IP or through redirectors.
pub struct MtlsBackend;

#[async_trait]
impl Backend for MtlsBackend {
    fn scheme(&self) -> &'static str {
        "mtls"
    }

    async fn connect(&self, uri: &Uri, cfg: &Config) -> anyhow::Result<Arc<Connection>> {
        let tls_config = client_config(&cfg.mtls)?;
        let connector = TlsConnector::from(Arc::new(tls_config));

        let addr = uri.address(DEFAULT_PORT);
        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("mtls: dial {}", addr))?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(uri.host.clone())
            .with_context(|| format!("mtls: bad server name {:?}", uri.host))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("mtls: handshake with {}", addr))?;

        tracing::info!(uri = %uri, "mtls: connected");

        let (conn, io) = Connection::new(&uri.raw);
        socket::wire_stream(tls, io, conn.clone());
        Ok(conn)
    }
}

/// The dependency graph links both aws-lc-rs and ring (via reqwest), so
/// rustls cannot pick a process-level provider on its own. Idempotent; a
/// second install attempt is a no-op.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

pub fn client_config(m: &MtlsConfig) -> anyhow::Result<rustls::ClientConfig> {
    install_crypto_provider();
    let certs = read_certs(Path::new(&m.cert_file))?;
    let key = read_key(Path::new(&m.key_file))?;

    let mut roots = RootCertStore::empty();
    for ca in read_certs(Path::new(&m.ca_file))? {
        roots.add(ca).context("mtls: add ca cert")?;
    }
    if roots.is_empty() {
        anyhow::bail!("mtls: no CA certificates in {}", m.ca_file);
    }

    let webpki = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .context("mtls: build verifier")?;

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(CaOnlyVerifier { inner: webpki }))
        .with_client_auth_cert(certs, key)
        .context("mtls: client auth cert")?;
    Ok(config)
}

fn read_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("mtls: open {}", path.display()))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .with_context(|| format!("mtls: parse {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("mtls: no certificates in {}", path.display());
    }
    Ok(certs)
}

fn read_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("mtls: open {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("mtls: parse {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("mtls: no private key in {}", path.display()))
}

/// Verifies the chain against the root store only: a certificate signed by
/// the pinned CA is accepted for any name.
#[derive(Debug)]
struct CaOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for CaOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(v) => Ok(v),
            Err(rustls::Error::InvalidCertificate(e))
                if matches!(
                    e,
                    CertificateError::NotValidForName
                        | CertificateError::NotValidForNameContext { .. }
                ) =>
            {
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsAcceptor;

    use super::*;

    struct TestPki {
        dir: std::path::PathBuf,
        server_config: Arc<rustls::ServerConfig>,
    }

    /// CA + CA-signed server leaf + self-issued client leaf, written as PEM
    /// into a temp dir shaped like an mtls config.
    fn make_pki(name: &str, server_dns: &str) -> TestPki {
        install_crypto_provider();
        let mut dir = std::env::temp_dir();
        dir.push(format!("skein_mtls_{name}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server_cert = CertificateParams::new(vec![server_dns.to_string()])
            .unwrap()
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();

        let client_key = KeyPair::generate().unwrap();
        let client_cert = CertificateParams::new(vec!["client".to_string()])
            .unwrap()
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();

        std::fs::write(dir.join("ca.pem"), ca_cert.pem()).unwrap();
        std::fs::write(dir.join("client.pem"), client_cert.pem()).unwrap();
        std::fs::write(dir.join("client.key"), client_key.serialize_pem()).unwrap();

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![server_cert.der().clone()],
                PrivateKeyDer::try_from(server_key.serialize_der()).unwrap(),
            )
            .unwrap();

        TestPki {
            dir,
            server_config: Arc::new(server_config),
        }
    }

    fn mtls_config(dir: &Path) -> MtlsConfig {
        MtlsConfig {
            cert_file: dir.join("client.pem").to_string_lossy().into_owned(),
            key_file: dir.join("client.key").to_string_lossy().into_owned(),
            ca_file: dir.join("ca.pem").to_string_lossy().into_owned(),
        }
    }

    #[tokio::test]
    async fn handshake_ignores_name_but_pins_ca() {
        let pki = make_pki("pin", "backend.internal");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = TlsAcceptor::from(pki.server_config.clone());
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut buf = [0u8; 2];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
        });

        // Dialed by IP, so the name on the leaf never matches; the chain
        // still verifies against the pinned CA.
        let config = client_config(&mtls_config(&pki.dir)).unwrap();
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from(addr.ip().to_string()).unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();

        tls.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        server.await.unwrap();
        let _ = std::fs::remove_dir_all(&pki.dir);
    }

    #[tokio::test]
    async fn wrong_ca_is_rejected() {
        let server_pki = make_pki("wrong_ca_srv", "backend.internal");
        let client_pki = make_pki("wrong_ca_cli", "backend.internal");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(server_pki.server_config.clone());
        tokio::spawn(async move {
            if let Ok((tcp, _)) = listener.accept().await {
                let _ = acceptor.accept(tcp).await;
            }
        });

        // Client trusts a different CA; the handshake must fail.
        let config = client_config(&mtls_config(&client_pki.dir)).unwrap();
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from(addr.ip().to_string()).unwrap();
        assert!(connector.connect(name, tcp).await.is_err());

        let _ = std::fs::remove_dir_all(&server_pki.dir);
        let _ = std::fs::remove_dir_all(&client_pki.dir);
    }
}
