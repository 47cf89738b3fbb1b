//! The playset seam: pluggable deterministic game logic.
//!
//! The relay core owns ordering, timing, and admission; the playset owns what
//! the events *mean*. A playset must be deterministic and synchronous: given
//! the same state and the same event sequences it must produce the same
//! state, byte for byte once serialized, on every machine. Any
//! non-determinism inside `advance` is a playset defect the hash-sync will
//! eventually expose.
//!
//! Registration happens once at process startup; the registry is passed to
//! the server explicitly rather than living in a global.

use serde_json::{json, Value};
use shared::structural_hash;
use std::collections::HashMap;
use std::sync::Arc;

/// A controller joining the world this frame.
#[derive(Debug, Clone, Copy)]
pub struct ConnectSeat<'a> {
    pub controller: u32,
    pub username: &'a str,
    pub profile: &'a Value,
}

/// A one-shot command applied this frame.
#[derive(Debug, Clone, Copy)]
pub struct CommandCall<'a> {
    pub controller: u32,
    pub serial: u64,
    pub verb: &'a str,
    pub arg: Option<&'a str>,
}

/// One roster member's current input string, in ascending controller order.
#[derive(Debug, Clone, Copy)]
pub struct SeatInput<'a> {
    pub controller: u32,
    pub input: &'a str,
}

/// A controller leaving the world this frame.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectSeat {
    pub controller: u32,
}

/// Deterministic game-logic module.
///
/// Only `name` and `advance` are required; the defaults cover serialization,
/// copying, and hashing for any JSON-shaped state. A playset that accepts no
/// commands needs no `command_limit` override.
pub trait Playset: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &str;

    /// Folds one frame of events into `state`. The sequences arrive in
    /// canonical order and `inputs` covers the whole roster in ascending
    /// controller order; `state` is the only thing `advance` may mutate.
    fn advance(
        &self,
        state: &mut Value,
        connects: &[ConnectSeat<'_>],
        commands: &[CommandCall<'_>],
        inputs: &[SeatInput<'_>],
        disconnects: &[DisconnectSeat],
    );

    /// Wire/persistence form of the state.
    fn serialize(&self, state: &Value) -> String {
        state.to_string()
    }

    fn deserialize(&self, text: &str) -> Result<Value, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Independent copy of the state.
    fn copy(&self, state: &Value) -> Value {
        state.clone()
    }

    /// Hash for divergence detection; `None` disables hash-sync.
    fn hash(&self, state: &Value) -> Option<i64> {
        Some(structural_hash(state))
    }

    /// Per-window rate cap for `verb`; `None` means the verb (and by default
    /// every command) is rejected.
    fn command_limit(&self, verb: &str) -> Option<u32> {
        let _ = verb;
        None
    }

    /// Longest accepted command argument, in bytes.
    fn max_arg_len(&self) -> usize {
        1024
    }

    /// Longest accepted per-frame input string, in bytes.
    fn max_input_len(&self) -> usize {
        1024
    }
}

/// Startup-time registry of playsets by name.
#[derive(Default)]
pub struct PlaysetRegistry {
    playsets: HashMap<String, Arc<dyn Playset>>,
}

impl PlaysetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, playset: Arc<dyn Playset>) {
        let name = playset.name().to_string();
        if self.playsets.insert(name.clone(), playset).is_some() {
            log::warn!("playset {} registered twice, keeping the newer one", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Playset>> {
        self.playsets.get(name).cloned()
    }
}

/// Built-in demo playset.
///
/// State shape: `{"seats": {"<controller>": "<input>"}, "dots": [{"c", "x", "y"}]}`.
/// The `drop` command appends a dot at the coordinates given by an `x,y`
/// argument; inputs are mirrored into the seat map so the roster is visible
/// in the state.
pub struct DotsPlayset;

impl DotsPlayset {
    fn parse_coords(arg: Option<&str>) -> (i64, i64) {
        let text = arg.unwrap_or("");
        let mut parts = text.splitn(2, ',');
        let x = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
        let y = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
        (x, y)
    }
}

impl Playset for DotsPlayset {
    fn name(&self) -> &str {
        "dots"
    }

    fn advance(
        &self,
        state: &mut Value,
        connects: &[ConnectSeat<'_>],
        commands: &[CommandCall<'_>],
        inputs: &[SeatInput<'_>],
        disconnects: &[DisconnectSeat],
    ) {
        if !state.is_object() {
            *state = json!({ "seats": {}, "dots": [] });
        }
        let Value::Object(root) = state else { return };

        if let Value::Object(seats) = root.entry("seats").or_insert_with(|| json!({})) {
            for connect in connects {
                seats.insert(connect.controller.to_string(), json!(""));
            }
            for input in inputs {
                if let Some(slot) = seats.get_mut(&input.controller.to_string()) {
                    *slot = json!(input.input);
                }
            }
            for disconnect in disconnects {
                seats.remove(&disconnect.controller.to_string());
            }
        }

        if let Value::Array(dots) = root.entry("dots").or_insert_with(|| json!([])) {
            for command in commands {
                if command.verb == "drop" {
                    let (x, y) = Self::parse_coords(command.arg);
                    dots.push(json!({ "c": command.controller, "x": x, "y": y }));
                }
            }
        }
    }

    fn command_limit(&self, verb: &str) -> Option<u32> {
        match verb {
            "drop" => Some(4),
            _ => None,
        }
    }

    fn max_arg_len(&self) -> usize {
        64
    }

    fn max_input_len(&self) -> usize {
        32
    }
}
