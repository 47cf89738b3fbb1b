//! # Shared Protocol Library
//!
//! Everything both ends of the wire must agree on: the message envelopes, the
//! event record and its canonical order, the frame-clock arithmetic, and the
//! structural hash used for divergence detection.
//!
//! The server never executes game logic; it relays events and keeps the
//! authoritative clock. Clients reconstruct the same world state locally, so
//! every definition in this crate is part of the determinism contract:
//! changing a constant, a sort key, or a hash prefix here desynchronizes
//! every client that was built against the old value.

pub mod event;
pub mod frame;
pub mod hash;
pub mod wire;

pub use event::{Event, EventKind};
pub use frame::FrameClock;
pub use hash::structural_hash;
pub use wire::{ClientMessage, ServerMessage, StatusEntry};

/// Simulation frame rate in frames per second.
pub const FRAME_RATE: u64 = 30;

/// How far behind the present the finalized past-horizon state sits.
///
/// Events stamped at or above the past horizon are still mutable; everything
/// below it has been folded into the authoritative state and can never be
/// revisited.
pub const PAST_HORIZON_FRAMES: u64 = FRAME_RATE / 2;

/// How far ahead of the present frame a client may stamp an event.
pub const FUTURE_HORIZON_FRAMES: u64 = 3 * FRAME_RATE / 2;

/// Nanoseconds per simulation frame, integer math.
///
/// Durations covering N frames are always computed by multiplying this value
/// rather than accumulating per-frame floats, so the clock cannot drift.
pub const FRAME_NANOS: u64 = 1_000_000_000 / FRAME_RATE;

/// Seconds of silence after which a live controller is disconnected.
pub const INACTIVITY_TIMEOUT_SECS: u64 = 5;

/// Hard cap on a single inbound websocket text message.
pub const MAX_MESSAGE_BYTES: usize = 20_000;

/// Hard cap on a user's opaque config string.
pub const MAX_CONFIG_BYTES: usize = 10_000;
