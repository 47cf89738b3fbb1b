//! Event records and their canonical order.
//!
//! Every mutation of an instance's world state is carried by one of four
//! event kinds, stamped with the frame it takes effect at. Within a frame the
//! advancer applies events in a canonical total order so that replays and
//! concurrent clients converge no matter what order the messages arrived in:
//! kind first (connects, then commands, then frame inputs, then disconnects),
//! controller id second, command serial third.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four event kinds, in canonical application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    Connect,
    Command,
    Frame,
    Disconnect,
}

/// A single event in an instance's stream, in its wire shape.
///
/// Wire tags are single letters (`c`/`o`/`f`/`d`), field keys likewise; the
/// Rust names are the readable aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k")]
pub enum Event {
    /// A controller joined; folded into the roster before the playset runs.
    #[serde(rename = "c")]
    Connect {
        #[serde(rename = "f")]
        frame: u64,
        #[serde(rename = "c")]
        controller: u32,
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "x")]
        profile: Value,
    },
    /// A one-shot command with a per-window serial.
    #[serde(rename = "o")]
    Command {
        #[serde(rename = "f")]
        frame: u64,
        #[serde(rename = "c")]
        controller: u32,
        #[serde(rename = "s")]
        serial: u64,
        #[serde(rename = "o")]
        verb: String,
        #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
        arg: Option<String>,
    },
    /// A per-frame input string.
    #[serde(rename = "f")]
    Frame {
        #[serde(rename = "f")]
        frame: u64,
        #[serde(rename = "c")]
        controller: u32,
        #[serde(rename = "i")]
        input: String,
    },
    /// A controller left; removed from the roster after the playset runs.
    #[serde(rename = "d")]
    Disconnect {
        #[serde(rename = "f")]
        frame: u64,
        #[serde(rename = "c")]
        controller: u32,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connect { .. } => EventKind::Connect,
            Event::Command { .. } => EventKind::Command,
            Event::Frame { .. } => EventKind::Frame,
            Event::Disconnect { .. } => EventKind::Disconnect,
        }
    }

    pub fn frame(&self) -> u64 {
        match *self {
            Event::Connect { frame, .. }
            | Event::Command { frame, .. }
            | Event::Frame { frame, .. }
            | Event::Disconnect { frame, .. } => frame,
        }
    }

    pub fn controller(&self) -> u32 {
        match *self {
            Event::Connect { controller, .. }
            | Event::Command { controller, .. }
            | Event::Frame { controller, .. }
            | Event::Disconnect { controller, .. } => controller,
        }
    }

    /// The canonical sort key within one frame: kind rank, controller id,
    /// command serial (zero for non-commands).
    pub fn sort_key(&self) -> (u8, u32, u64) {
        let rank = match self.kind() {
            EventKind::Connect => 0,
            EventKind::Command => 1,
            EventKind::Frame => 2,
            EventKind::Disconnect => 3,
        };
        let serial = match *self {
            Event::Command { serial, .. } => serial,
            _ => 0,
        };
        (rank, self.controller(), serial)
    }

    /// Serializes the event with an extra `t` timing pong, for the copy sent
    /// back to the event's own sender.
    pub fn to_json_with_pong(&self, pong: u64) -> Value {
        let mut value = serde_json::to_value(self).expect("event serialization is infallible");
        if let Value::Object(map) = &mut value {
            map.insert("t".to_string(), Value::from(pong));
        }
        value
    }
}

/// Sorts one frame's event bucket into the canonical order.
pub fn canonical_sort(bucket: &mut [Event]) {
    bucket.sort_by_key(Event::sort_key);
}

/// One frame's events, canonically sorted and split by kind.
#[derive(Debug, Default)]
pub struct FrameBucket {
    pub connects: Vec<Event>,
    pub commands: Vec<Event>,
    pub frames: Vec<Event>,
    pub disconnects: Vec<Event>,
}

/// Sorts and partitions a frame's bucket for the advancer.
pub fn partition_frame_bucket(mut events: Vec<Event>) -> FrameBucket {
    canonical_sort(&mut events);
    let mut bucket = FrameBucket::default();
    for event in events {
        match event.kind() {
            EventKind::Connect => bucket.connects.push(event),
            EventKind::Command => bucket.commands.push(event),
            EventKind::Frame => bucket.frames.push(event),
            EventKind::Disconnect => bucket.disconnects.push(event),
        }
    }
    bucket
}
