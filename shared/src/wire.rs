//! Client/server message envelopes.
//!
//! Messages are JSON objects tagged by a single-letter (or camelCase, for the
//! account API) `k` field. The two directions are separate enums because the
//! tag letters are reused with different payloads: an inbound `f` is a frame
//! input submission, an outbound `f` is a relayed frame event.
//!
//! Relayed events (`c`/`o`/`f`/`d`) are serialized straight from
//! [`crate::event::Event`] and are not part of [`ServerMessage`].

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything a client may send.
///
/// A frame field that is not a JSON integer fails deserialization, which the
/// server reports as a malformed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k")]
pub enum ClientMessage {
    /// Request the instance list; answered with `U`, then the connection
    /// closes.
    #[serde(rename = "prelogin")]
    Prelogin,
    /// Log in to an instance.
    #[serde(rename = "l")]
    Login {
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "p")]
        password: String,
        #[serde(rename = "n")]
        instance: String,
    },
    /// Per-frame input string stamped at `frame`.
    #[serde(rename = "f")]
    FrameInput {
        #[serde(rename = "f")]
        frame: u64,
        #[serde(rename = "i")]
        input: String,
    },
    /// One-shot command stamped at `frame`.
    #[serde(rename = "o")]
    Command {
        #[serde(rename = "f")]
        frame: u64,
        #[serde(rename = "s")]
        serial: u64,
        #[serde(rename = "o")]
        verb: String,
        #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
        arg: Option<String>,
    },
    /// Global chat message.
    #[serde(rename = "g")]
    Chat {
        #[serde(rename = "m")]
        message: String,
    },
    #[serde(rename = "selfServeCreateUser")]
    SelfServeCreateUser {
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "p")]
        password: String,
        #[serde(rename = "d")]
        config: String,
    },
    #[serde(rename = "changeMyPassword")]
    ChangeMyPassword {
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "p")]
        password: String,
        #[serde(rename = "n")]
        new_password: String,
    },
    #[serde(rename = "getMyConfig")]
    GetMyConfig {
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "p")]
        password: String,
    },
    #[serde(rename = "setMyConfig")]
    SetMyConfig {
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "p")]
        password: String,
        #[serde(rename = "d")]
        config: String,
    },
    #[serde(rename = "cleanShutdown")]
    CleanShutdown {
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "p")]
        password: String,
        #[serde(rename = "r")]
        reason: String,
    },
    #[serde(rename = "dirtyShutdown")]
    DirtyShutdown {
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "p")]
        password: String,
        #[serde(rename = "r")]
        reason: String,
    },
}

/// One controller's roster entry as of the past horizon.
///
/// The same shape is used in the `S` snapshot message and the persistence
/// file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusEntry {
    #[serde(rename = "u")]
    pub username: String,
    #[serde(rename = "i", default)]
    pub last_input: String,
}

/// Everything the server may send besides relayed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k")]
pub enum ServerMessage {
    /// Prelogin answer: the default instance name and the full list.
    #[serde(rename = "U")]
    InstanceList {
        #[serde(rename = "n")]
        default_instance: String,
        #[serde(rename = "l")]
        instances: Vec<String>,
    },
    /// Login accepted; carries the first timing pong. For a waiting session
    /// this is the only message until promotion.
    #[serde(rename = "W")]
    LoginAccepted {
        #[serde(rename = "t")]
        pong: u64,
    },
    /// Initial state dump sent when a controller goes live.
    #[serde(rename = "S")]
    InitialState {
        #[serde(rename = "p")]
        playset: String,
        #[serde(rename = "c")]
        controller: u32,
        #[serde(rename = "x")]
        status: BTreeMap<u32, StatusEntry>,
        #[serde(rename = "g")]
        state: String,
        #[serde(rename = "f")]
        frame: u64,
        #[serde(rename = "e")]
        events: Vec<Event>,
        #[serde(rename = "r")]
        frame_rate: u64,
        #[serde(rename = "l")]
        chat_message_max: usize,
        #[serde(rename = "m")]
        chat_tokens: u32,
    },
    /// The past horizon advanced to `frame`; `hash` rides along on hash-sync
    /// frames.
    #[serde(rename = "F")]
    HorizonAdvance {
        #[serde(rename = "f")]
        frame: u64,
        #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
        hash: Option<i64>,
    },
    /// Relayed global chat line.
    #[serde(rename = "g")]
    ChatRelay {
        #[serde(rename = "c")]
        controller: u32,
        #[serde(rename = "u")]
        username: String,
        #[serde(rename = "m")]
        message: String,
    },
    /// One chat token replenished.
    #[serde(rename = "G")]
    ChatToken,
    /// Terminal error; the connection closes after this.
    #[serde(rename = "E")]
    Error {
        #[serde(rename = "e")]
        error: String,
    },
    /// Terminal success for the one-shot account API.
    #[serde(rename = "D")]
    Done {
        #[serde(rename = "d")]
        detail: String,
    },
}

impl ServerMessage {
    /// Wire text for this message.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("server message serialization is infallible")
    }
}
