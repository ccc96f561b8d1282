//! # tunmux-core
//!
//! Tunnel multiplexing core: many duplex byte streams carried as sequenced
//! frames inside one peer session.
//!
//! This crate contains:
//! - **Frames**: `Frame`, `Message`, `Outbound`, `FrameFlags`
//! - **Reorder**: `ReorderBuffer` restoring in-order delivery under a byte bound
//! - **Tunnel**: fan-in read-pump, single sink writer, one idempotent close
//! - **Registry**: the shared id → tunnel table with per-session sweeps
//! - **Dispatcher**: the boundary a transport drives (`deliver`, `create_tunnel`)
//! - **Codec / Network**: `FrameCodec` and `Link` for running it over a plain stream
//! - **Error**: `TunnelError`, a `thiserror`-based error type

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod network;
pub mod registry;
pub mod reorder;
pub mod tunnel;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{FrameCodec, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
pub use config::TunnelConfig;
pub use dispatcher::{Delivery, Dispatcher, OutboundReceiver};
pub use error::TunnelError;
pub use frame::{Frame, FrameFlags, Message, Outbound};
pub use network::Link;
pub use registry::Registry;
pub use reorder::{Offer, Release, ReorderBuffer};
pub use tunnel::{CloseReason, Sink, Source, Tunnel, TunnelHandle, TunnelPhase, TunnelStats};
