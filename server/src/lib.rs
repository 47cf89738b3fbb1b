//! # Lockstep Relay Server Library
//!
//! The authoritative relay and clock for deterministic lockstep multiplayer.
//! The server executes no game logic: it admits client events, sorts each
//! frame's bucket into a canonical order, advances a finalized past-horizon
//! state through a pluggable playset under a monotonic clock, and relays
//! everything to the other participants. Clients recompute the same world
//! locally; a periodic structural hash over the horizon state catches any
//! divergence.
//!
//! ## Module Organization
//!
//! - [`server`] — the single authoritative loop owning all mutable state
//! - [`instance`] — per-world state, the horizon advancer, subscriber fan-out
//! - [`controller`] — connection lifecycle and the per-session admission window
//! - [`playset`] — the deterministic game-logic trait and registry
//! - [`users`] — accounts, credentials, per-user config
//! - [`snapshot`] — whole-server persistence
//! - [`net`] — websocket transport tasks
//! - [`error`] — the client-facing error taxonomy
//!
//! ## Concurrency
//!
//! One tokio task owns the server; transport tasks and timers only ever post
//! messages into its channel. Handlers run to completion, so event ordering
//! between concurrent controllers is decided solely by the canonical sort at
//! advance time, never by socket scheduling.

pub mod controller;
pub mod error;
pub mod instance;
pub mod net;
pub mod playset;
pub mod server;
pub mod snapshot;
pub mod users;
