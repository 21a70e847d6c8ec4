//! Coordinator behaviour against a receiver that is not there.

use std::sync::Arc;
use std::time::Duration;

use pvrt_core::{Blob, BlobSpec, IprogOptions, Palette, PaletteConfig, build_iprog};
use pvrt_send::{Coordinator, Mode, SendJob, SenderConfig, TransferState, TransportKind};
use tokio::net::TcpListener;

fn job(transfer_id: &str) -> SendJob {
    let blob = Blob::new(BlobSpec::new("unreachable", 1 << 20, 3)).unwrap();
    let palette = Palette::from_blob(
        &blob,
        PaletteConfig {
            len: 1 << 18,
            ..Default::default()
        },
    )
    .unwrap();
    let data = blob.read(4096, 20_000).unwrap();
    let iprog = build_iprog("f.bin", &data, &blob, &palette, &IprogOptions::default()).unwrap();
    SendJob::new(transfer_id, Arc::new(iprog))
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn config(port: u16) -> SenderConfig {
    let mut cfg = SenderConfig::default();
    cfg.network.host = "127.0.0.1".into();
    cfg.network.quic_port = port;
    cfg.network.tcp_port = port;
    cfg.network.http_port = port;
    cfg.network.timeout_ms = 2000;
    cfg.network.race_timeout_ms = 500;
    cfg
}

#[tokio::test]
async fn test_explicit_tcp_refused() {
    let coordinator = Coordinator::from_config(&config(closed_port().await)).unwrap();
    let status = coordinator
        .run(job("refused"), Mode::Explicit(TransportKind::Tcp))
        .await;

    assert_eq!(status.state, TransferState::Failed);
    assert_eq!(status.attempts.len(), 1);
    assert_eq!(status.attempts[0].transport, TransportKind::Tcp);
    assert!(status.path.is_none());
    assert_eq!(coordinator.status("refused"), Some(status));
}

#[tokio::test]
async fn test_auto_tries_every_transport() {
    let coordinator = Coordinator::from_config(&config(closed_port().await)).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(30), coordinator.run(job("nowhere"), Mode::Auto))
        .await
        .unwrap();

    assert_eq!(status.state, TransferState::Failed);
    let tried: Vec<_> = status.attempts.iter().map(|a| a.transport).collect();
    assert_eq!(tried.len(), TransportKind::ALL.len());
    for kind in TransportKind::ALL {
        assert!(tried.contains(&kind), "{kind} not attempted");
    }
    assert_eq!(&tried[2..], &[
        TransportKind::WsMulti,
        TransportKind::Ws,
        TransportKind::Tcp,
        TransportKind::Https
    ]);
    assert!(status.error.is_some());
}
