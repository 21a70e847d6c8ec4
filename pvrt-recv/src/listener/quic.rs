//! QUIC listener (quinn).
//!
//! Serves a fresh self-signed certificate; its SHA-256 is logged at
//! startup so senders can pin it. Every bidirectional stream is one
//! channel, ended by the sender finishing its half.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use tracing::{debug, info, warn};

use pvrt_core::{PvrtError, Reassembler, Result};

use super::{ChannelSession, wait_for_stop};

/// ALPN both peers advertise.
pub const ALPN: &[u8] = b"pvrt";

pub struct QuicListener {
    endpoint: quinn::Endpoint,
    cert_sha256: [u8; 32],
}

impl QuicListener {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "pvrt".to_string()])
            .map_err(|e| PvrtError::Transport(format!("certificate generation: {e}")))?;
        let cert_der = certified.cert.der().to_vec();
        let key_der = certified.key_pair.serialize_der();
        let cert_sha256 = pvrt_core::sha256(&cert_der);

        let tls = server_crypto_config(cert_der, key_der)?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(tls)
                .map_err(|e| PvrtError::Transport(format!("QUIC server config: {e}")))?,
        ));
        let endpoint = quinn::Endpoint::server(server_config, addr)?;
        Ok(Self {
            endpoint,
            cert_sha256,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn cert_sha256(&self) -> [u8; 32] {
        self.cert_sha256
    }

    /// Accept connections until `running` clears.
    pub async fn serve(self, reassembler: Reassembler, running: Arc<AtomicBool>) {
        info!(
            addr = ?self.endpoint.local_addr().ok(),
            cert_sha256 = %hex::encode(self.cert_sha256),
            "QUIC listener ready"
        );
        loop {
            let incoming = tokio::select! {
                incoming = self.endpoint.accept() => incoming,
                _ = wait_for_stop(running.clone()) => break,
            };
            let Some(incoming) = incoming else { break };
            let reassembler = reassembler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(incoming, reassembler).await {
                    debug!("QUIC connection ended: {e}");
                }
            });
        }
        self.endpoint.close(0u32.into(), b"shutdown");
        info!("QUIC listener stopped");
    }
}

async fn handle_connection(incoming: quinn::Incoming, reassembler: Reassembler) -> Result<()> {
    let conn = incoming
        .await
        .map_err(|e| PvrtError::Transport(format!("QUIC handshake: {e}")))?;
    let peer = conn.remote_address();
    debug!(%peer, "QUIC connection accepted");
    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(pair) => pair,
            Err(quinn::ConnectionError::ApplicationClosed(_)) | Err(quinn::ConnectionError::LocallyClosed) => {
                return Ok(());
            }
            Err(e) => return Err(PvrtError::Transport(format!("QUIC accept stream from {peer}: {e}"))),
        };
        let reassembler = reassembler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(send, recv, reassembler).await {
                warn!(%peer, "QUIC channel error: {e}");
            }
        });
    }
}

async fn handle_stream(mut send: quinn::SendStream, mut recv: quinn::RecvStream, reassembler: Reassembler) -> Result<()> {
    let mut session = ChannelSession::new(reassembler);
    let mut chunk = vec![0u8; 64 * 1024];
    let ack = loop {
        match recv.read(&mut chunk).await {
            Ok(Some(n)) => match session.feed(&chunk[..n]) {
                Ok(replies) => {
                    for reply in replies {
                        write(&mut send, &reply).await?;
                    }
                }
                Err(e) => break session.reject(&e)?,
            },
            Ok(None) => {
                break tokio::task::spawn_blocking(move || session.finish())
                    .await
                    .map_err(|e| PvrtError::Other(format!("assembly task: {e}")))??;
            }
            Err(e) => return Err(PvrtError::Transport(format!("QUIC read: {e}"))),
        }
    };
    write(&mut send, &ack).await?;
    send.finish()
        .map_err(|e| PvrtError::Transport(format!("QUIC finish: {e}")))?;
    let _ = send.stopped().await;
    Ok(())
}

async fn write(send: &mut quinn::SendStream, bytes: &Bytes) -> Result<()> {
    send.write_all(bytes)
        .await
        .map_err(|e| PvrtError::Transport(format!("QUIC write: {e}")))
}

/// Server TLS configuration from a DER certificate and PKCS#8 key.
pub fn server_crypto_config(cert: Vec<u8>, key: Vec<u8>) -> Result<rustls::ServerConfig> {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    let cert = CertificateDer::from(cert);
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key));

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| PvrtError::Transport(format!("TLS config: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| PvrtError::Transport(format!("TLS certificate: {e}")))?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_with_a_fresh_certificate() {
        let a = QuicListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = QuicListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(a.cert_sha256(), b.cert_sha256());
        assert_ne!(a.local_addr().unwrap().port(), 0);
    }
}
