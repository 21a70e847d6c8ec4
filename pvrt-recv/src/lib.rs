//! # pvrt-recv
//!
//! Receiver service. Generates the configured blob at startup, then
//! accepts transfers on:
//!
//! - **QUIC**: one bidirectional stream per channel, self-signed certificate
//! - **TCP**: one length-delimited message per whole single-channel stream
//! - **HTTP**: WebSocket channels, WebRTC-style data channels negotiated over
//!   `/rtc/offer`, whole-stream `POST /ingest` and `GET /transfers/{id}`
//!
//! Every listener feeds the same `Reassembler`, so the channels of one
//! transfer may arrive over any mix of connections.

pub mod config;
pub mod listener;
pub mod service;
