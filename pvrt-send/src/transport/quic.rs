//! QUIC transport (quinn).
//!
//! One bidirectional stream carries the whole negotiated handshake. The
//! receiver's certificate is self-signed; it is pinned by SHA-256 when a
//! digest is configured and accepted otherwise.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use pvrt_core::{Control, Frame, PvrtError, Result};

use super::link::{FrameLink, drive};
use super::{Endpoint, SendJob, SendReport, Transport, TransportKind, resolve};

/// ALPN both peers advertise.
pub const ALPN: &[u8] = b"pvrt";

/// Name presented in the TLS handshake; the verifier does not check it.
const SERVER_NAME: &str = "pvrt";

pub struct QuicTransport {
    cert_pin: Option<[u8; 32]>,
}

impl QuicTransport {
    pub fn new(cert_pin: Option<[u8; 32]>) -> Self {
        Self { cert_pin }
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    async fn send(&self, endpoint: &Endpoint, job: &SendJob) -> Result<SendReport> {
        let addr = resolve(endpoint).await?;
        let bind: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let crypto = client_crypto_config(self.cert_pin)?;
        let client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| PvrtError::Transport(format!("QUIC client config: {e}")))?,
        ));

        let mut quic = quinn::Endpoint::client(bind)?;
        quic.set_default_client_config(client_config);

        let conn = quic
            .connect(addr, SERVER_NAME)
            .map_err(|e| PvrtError::Transport(format!("QUIC connect {endpoint}: {e}")))?
            .await
            .map_err(|e| PvrtError::Transport(format!("QUIC handshake {endpoint}: {e}")))?;
        debug!(%addr, rtt = ?conn.rtt(), "QUIC connected");

        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| PvrtError::Transport(format!("QUIC open stream: {e}")))?;
        let mut link = QuicLink {
            send,
            recv,
            buf: BytesMut::with_capacity(8192),
        };
        let result = drive(TransportKind::Quic, std::slice::from_mut(&mut link), job).await;

        conn.close(0u32.into(), b"done");
        quic.wait_idle().await;
        if let Ok(report) = &result {
            info!(transfer_id = %job.transfer_id, bytes = report.bytes_sent, "QUIC transfer acknowledged");
        }
        result
    }
}

struct QuicLink {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    buf: BytesMut,
}

#[async_trait]
impl FrameLink for QuicLink {
    async fn send_bytes(&mut self, bytes: Bytes) -> Result<()> {
        self.send
            .write_all(&bytes)
            .await
            .map_err(|e| PvrtError::Transport(format!("QUIC write: {e}")))
    }

    async fn recv_control(&mut self) -> Result<Control> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return frame.control_message();
            }
            let mut chunk = [0u8; 4096];
            match self.recv.read(&mut chunk).await {
                Ok(Some(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(None) => {
                    return Err(PvrtError::Transport("QUIC stream closed before a reply".into()));
                }
                Err(e) => return Err(PvrtError::Transport(format!("QUIC read: {e}"))),
            }
        }
    }

    async fn finish(&mut self) -> Result<()> {
        self.send
            .finish()
            .map_err(|e| PvrtError::Transport(format!("QUIC finish: {e}")))
    }
}

// ── TLS ──────────────────────────────────────────────────────────

/// Client TLS configuration accepting a self-signed receiver certificate,
/// checked against `expected_cert_hash` when given.
pub fn client_crypto_config(expected_cert_hash: Option<[u8; 32]>) -> Result<rustls::ClientConfig> {
    use rustls::DigitallySignedStruct;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    #[derive(Debug)]
    struct CertHashVerifier {
        expected_hash: Option<[u8; 32]>,
        schemes: Vec<rustls::SignatureScheme>,
    }

    impl ServerCertVerifier for CertHashVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            if let Some(expected) = &self.expected_hash {
                if pvrt_core::sha256(end_entity.as_ref()) != *expected {
                    return Err(rustls::Error::General("certificate hash mismatch".to_string()));
                }
            }
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.schemes.clone()
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(CertHashVerifier {
        expected_hash: expected_cert_hash,
        schemes: provider.signature_verification_algorithms.supported_schemes(),
    });

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| PvrtError::Transport(format!("TLS config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}
