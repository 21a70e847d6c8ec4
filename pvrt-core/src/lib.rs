//! # pvrt-core
//!
//! Core library for blob-referenced window transfer.
//!
//! Both peers hold the same deterministic pseudorandom **blob**. A sender
//! expresses file content as references into that blob and ships only
//! the references, plus literal bytes for what the blob cannot express.
//!
//! This crate contains:
//! - **Blob**: `Blob`, `BlobSpec`: position-addressable generator with a progressive fill
//! - **Palette / compiler**: `Palette`, `compile`, `CompilePolicy`, `Segment`, `Transform`
//! - **Codecs**: PVRT containers, `Frame` / `Preface` / `FrameCodec`, `Control` messages
//! - **IPROG**: `build_iprog`, `Iprog`, window hashing and verification
//! - **Sync**: `needed`, round-robin assignment, `FrameSequencer`
//! - **Receiver**: `Reassembler`, `ChannelIngest`, `SessionPhase`, `Registry`
//! - **Worker**: `CompileWorker` running compiles off the async runtime
//! - **Offset index**: `ModuleDescriptor`
//! - **Error**: `PvrtError`, typed, `thiserror`-based

pub mod blob;
pub mod compiler;
pub mod container;
pub mod control;
pub mod error;
pub mod frame;
pub mod hash;
pub mod iprog;
pub mod offset_index;
pub mod palette;
pub mod rate;
pub mod reassembler;
pub mod registry;
pub mod segment;
pub mod session;
pub mod sync;
pub mod worker;

mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use blob::{Blob, BlobSpec, FillProgress};
pub use compiler::{CompilePolicy, Segments, compile, materialize};
pub use container::{Container, Section, build_container, parse_container};
pub use control::{AckStatus, Control, MAX_WINDOW_SIZE, Manifest, RtcAnswer, RtcOffer};
pub use error::{PvrtError, Result};
pub use frame::{
    Frame, FrameCodec, FrameFlags, MAX_FRAME_PAYLOAD, Preface, PrefaceFlags, WireItem, parse_frames,
    whole_message_codec,
};
pub use hash::{Hash16, sha256, sha256_hex};
pub use iprog::{DEFAULT_WINDOW_SIZE, Iprog, IprogOptions, build_iprog, partition};
pub use offset_index::{ModuleDescriptor, OffsetMode};
pub use palette::{Palette, PaletteConfig};
pub use rate::RateEstimator;
pub use reassembler::{ChannelIngest, Reassembler};
pub use registry::{ObjectStore, OutcomeState, Registry, TransferOutcome, WindowCache, WindowFailure};
pub use segment::{Segment, Transform};
pub use session::SessionPhase;
pub use sync::{FrameSequencer, assign_round_robin, needed};
pub use worker::CompileWorker;
