//! Integration tests: compile → frames → reassembly, over real TCP
//! connections on localhost.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pvrt_core::{
    AckStatus, Blob, BlobSpec, Control, Frame, FrameCodec, FrameSequencer, Iprog, IprogOptions,
    OutcomeState, Palette, PaletteConfig, Preface, Reassembler, Registry, WireItem,
    assign_round_robin, build_iprog, partition, sha256,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

// ── Helpers ──────────────────────────────────────────────────────

fn spec() -> BlobSpec {
    BlobSpec::new("integration", 4 << 20, 1234)
}

/// Sender side: its own blob instance, palette and IPROG.
fn sender_iprog(object: &[u8], window_size: usize, anchor: Option<u64>) -> Iprog {
    let blob = Blob::new(spec()).unwrap();
    let palette = Palette::from_blob(
        &blob,
        PaletteConfig {
            len: 1 << 20,
            ..Default::default()
        },
    )
    .unwrap();
    let options = IprogOptions {
        window_size,
        anchor,
        ..Default::default()
    };
    build_iprog("object.bin", object, &blob, &palette, &options).unwrap()
}

/// Mostly blob-backed bytes with a few edited stretches.
fn object(len: usize) -> Vec<u8> {
    let blob = Blob::new(spec()).unwrap();
    let mut data = blob.read(65536, len).unwrap();
    for at in (0..len).step_by(40_000) {
        let end = (at + 300).min(len);
        data[at..end].iter_mut().for_each(|b| *b = b.wrapping_mul(3));
    }
    data
}

fn receiver() -> (Arc<Registry>, Reassembler) {
    let registry = Arc::new(Registry::in_memory());
    registry.create_or_attach(&spec(), true).unwrap();
    let reassembler = Reassembler::new(registry.clone(), None);
    (registry, reassembler)
}

fn preface(tid: &str, iprog: &Iprog, channels: u16) -> Preface {
    Preface {
        transfer_id: tid.into(),
        channels,
        channel_id: 0,
        blob_fingerprint: spec().fingerprint(),
        object_sha256: iprog.sha256_bytes().unwrap(),
        psk: None,
        anchor: iprog.anchor,
        negotiate: true,
        binary_control: true,
    }
}

/// Preface plus every frame, as the whole-stream transports send it.
fn whole_payload(tid: &str, iprog: &Iprog) -> Vec<u8> {
    let manifest = iprog.manifest();
    let mut p = preface(tid, iprog, 1);
    p.negotiate = false;
    let mut payload = p.to_bytes().unwrap();
    let mut seq = FrameSequencer::new(false);
    let mut frames = vec![seq.manifest(&manifest).unwrap()];
    for w in &iprog.windows {
        frames.extend(seq.window(w.index, &w.pvrt, w.hash16).unwrap());
    }
    frames.push(seq.done(&manifest, iprog.sha256_bytes().unwrap()).unwrap());
    for f in frames {
        payload.extend_from_slice(&f.to_bytes().unwrap());
    }
    payload
}

/// Serve one channel: decode preface + frames, answer NEED, ACK at EOF.
async fn serve_channel(stream: TcpStream, reassembler: Reassembler) -> AckStatus {
    let mut framed = Framed::new(stream, FrameCodec::new());
    let Some(Ok(WireItem::Preface(p))) = framed.next().await else {
        panic!("expected a preface");
    };
    let mut ingest = reassembler.open(p).unwrap();
    let mut seq = FrameSequencer::new(true);

    while let Some(item) = framed.next().await {
        let WireItem::Frame(frame) = item.unwrap() else {
            panic!("second preface on one channel");
        };
        if let Some(reply) = ingest.on_frame(&frame).unwrap() {
            framed.send(seq.control(&reply).unwrap()).await.unwrap();
        }
    }
    let status = ingest.finish().unwrap();
    framed.send(seq.control(&Control::Ack { status }).unwrap()).await.unwrap();
    status
}

async fn next_control(framed: &mut Framed<TcpStream, FrameCodec>) -> Control {
    let item = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timeout")
        .expect("stream closed")
        .unwrap();
    match item {
        WireItem::Frame(f) => f.control_message().unwrap(),
        WireItem::Preface(_) => panic!("preface in reply direction"),
    }
}

// ── Round trips ──────────────────────────────────────────────────

#[tokio::test]
async fn test_single_channel_negotiated_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (registry, reassembler) = receiver();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve_channel(stream, reassembler).await
    });

    let data = object(150_000);
    let iprog = sender_iprog(&data, 65536, None);
    let manifest = iprog.manifest();

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::frames_only());
    let mut seq = FrameSequencer::new(true);

    framed.send(WireItem::Preface(preface("tcp-1", &iprog, 1))).await.unwrap();
    framed.send(WireItem::Frame(seq.manifest(&manifest).unwrap())).await.unwrap();

    let Control::Need { needed } = next_control(&mut framed).await else {
        panic!("expected NEED");
    };
    assert_eq!(needed, vec![0, 1, 2]);

    for idx in needed {
        let w = iprog.window(idx).unwrap();
        for f in seq.window(idx, &w.pvrt, w.hash16).unwrap() {
            framed.send(WireItem::Frame(f)).await.unwrap();
        }
    }
    let done = seq.done(&manifest, iprog.sha256_bytes().unwrap()).unwrap();
    framed.send(WireItem::Frame(done)).await.unwrap();
    framed.get_mut().shutdown().await.unwrap();

    assert_eq!(
        next_control(&mut framed).await,
        Control::Ack { status: AckStatus::Done }
    );
    assert_eq!(server.await.unwrap(), AckStatus::Done);

    let outcome = registry.outcome("tcp-1").unwrap();
    assert_eq!(outcome.state, OutcomeState::Done);
    let stored = registry.objects().get(&outcome.sha256.unwrap()).unwrap().unwrap();
    assert_eq!(stored.as_slice(), &data[..]);
}

#[tokio::test]
async fn test_multi_channel_assembles_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (registry, reassembler) = receiver();
    let channels = 3u16;

    let server = tokio::spawn(async move {
        let mut handles = Vec::new();
        for _ in 0..channels {
            let (stream, _) = listener.accept().await.unwrap();
            handles.push(tokio::spawn(serve_channel(stream, reassembler.clone())));
        }
        let mut statuses = Vec::new();
        for h in handles {
            statuses.push(h.await.unwrap());
        }
        statuses
    });

    let data = object(300_000);
    let iprog = sender_iprog(&data, 32_768, None);
    let manifest = iprog.manifest();
    let base = Preface {
        negotiate: false,
        ..preface("multi", &iprog, channels)
    };
    let all: Vec<u32> = (0..iprog.total_windows()).collect();
    let plan = assign_round_robin(&all, channels);

    let mut senders = Vec::new();
    for (ch, windows) in plan.into_iter().enumerate() {
        let p = base.for_channel(ch as u16);
        let iprog = iprog.clone();
        let manifest = manifest.clone();
        senders.push(tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::frames_only());
            let mut seq = FrameSequencer::new(true);
            let mut frames: Vec<Frame> = Vec::new();
            if ch == 0 {
                frames.push(seq.manifest(&manifest).unwrap());
            }
            for idx in windows {
                let w = iprog.window(idx).unwrap();
                frames.extend(seq.window(idx, &w.pvrt, w.hash16).unwrap());
            }
            if ch == channels as usize - 1 {
                frames.push(seq.done(&manifest, iprog.sha256_bytes().unwrap()).unwrap());
            }
            framed.send(WireItem::Preface(p)).await.unwrap();
            for f in frames {
                framed.send(WireItem::Frame(f)).await.unwrap();
            }
            framed.get_mut().shutdown().await.unwrap();
            next_control(&mut framed).await
        }));
    }

    let mut acks = Vec::new();
    for s in senders {
        acks.push(s.await.unwrap());
    }
    let done = acks
        .iter()
        .filter(|a| **a == Control::Ack { status: AckStatus::Done })
        .count();
    assert_eq!(done, 1, "exactly one channel completes the transfer: {acks:?}");

    let statuses = server.await.unwrap();
    assert_eq!(statuses.iter().filter(|s| **s == AckStatus::Done).count(), 1);
    assert_eq!(registry.outcome("multi").unwrap().state, OutcomeState::Done);
    assert_eq!(
        registry.outcome("multi").unwrap().sha256.unwrap(),
        hex::encode(sha256(&data))
    );
}

#[tokio::test]
async fn test_anchor_relative_whole_payload() {
    let (registry, reassembler) = receiver();
    let data = object(100_000);
    let iprog = sender_iprog(&data, 65536, Some(65_000));

    let payload = whole_payload("anchored", &iprog);
    assert_eq!(reassembler.ingest_whole(&payload).unwrap(), AckStatus::Done);
    assert_eq!(registry.outcome("anchored").unwrap().size, 100_000);
}

#[tokio::test]
async fn test_whole_payload_after_abandoned_attempt() {
    let (registry, reassembler) = receiver();
    let data = object(70_000);
    let iprog = sender_iprog(&data, 16_384, None);

    // A four-channel attempt gets its first preface accepted, then dies.
    drop(reassembler.open(preface("tid", &iprog, 4)).unwrap());

    let payload = whole_payload("tid", &iprog);
    assert_eq!(reassembler.ingest_whole(&payload).unwrap(), AckStatus::Done);
    assert_eq!(registry.outcome("tid").unwrap().state, OutcomeState::Done);
    assert_eq!(reassembler.live_sessions(), 0);
}

// ── Properties ───────────────────────────────────────────────────

#[test]
fn test_partition_of_150000() {
    let ranges = partition(150_000, 65536);
    assert_eq!(ranges.len(), 3);
    assert_eq!(
        ranges.iter().map(|r| r.len()).collect::<Vec<_>>(),
        vec![65536, 65536, 18928]
    );
}

#[test]
fn test_blob_reads_are_deterministic_across_instances() {
    let a = Blob::new(spec()).unwrap();
    let b = Blob::new(spec()).unwrap();
    assert_eq!(a.read(12_345, 4096).unwrap(), b.read(12_345, 4096).unwrap());
    let other = Blob::new(BlobSpec::new("integration", 4 << 20, 1235)).unwrap();
    assert_ne!(a.read(0, 64).unwrap(), other.read(0, 64).unwrap());
}

#[test]
fn test_iprog_reassembles_on_independent_blob() {
    let data = object(200_000);
    let iprog = sender_iprog(&data, 65536, None);
    let json = iprog.to_json().unwrap();
    let receiver_blob = Blob::new(spec()).unwrap();
    let back = Iprog::from_json(&json).unwrap();
    assert_eq!(back.reassemble(&receiver_blob).unwrap(), data);
}
