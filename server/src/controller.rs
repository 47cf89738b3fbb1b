//! Controller records and the per-session admission window.
//!
//! A controller is one websocket connection and, after login, one player
//! seat. The lifecycle runs NEW (pre-login) to LIVE (seated) and from there
//! to OUTBOX (socket gone, disconnect event not yet past the horizon); a
//! login that collides with an OUTBOX holdover parks as INBOX until the old
//! disconnect crosses. Death is removal from the controller table.

use crate::error::ClientError;
use crate::net::{ConnId, Outbound};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Connected, not yet logged in.
    New,
    /// Logged in, waiting for a prior session's disconnect to cross the
    /// horizon. No inactivity timeout: the server owes the next message.
    Inbox,
    /// Seated and subscribed.
    Live,
    /// Socket gone; the record holds the username until the disconnect event
    /// crosses the horizon.
    Outbox,
}

/// One connection's server-side record.
#[derive(Debug)]
pub struct Controller {
    pub conn: ConnId,
    pub addr: SocketAddr,
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub lifecycle: Lifecycle,
    pub session: Option<Session>,
}

impl Controller {
    pub fn new(conn: ConnId, addr: SocketAddr, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            conn,
            addr,
            outbound,
            lifecycle: Lifecycle::New,
            session: None,
        }
    }
}

/// Login-bound state: seat identity plus the admission window.
///
/// The window is the frame span `min_frame..` currently open for this
/// controller. Admitting a frame input closes the window at that frame and
/// opens the next one; a command stamped beyond `min_frame` re-opens the
/// window there, which also resets the command serial and the per-verb rate
/// counters (serials may restart in a new window).
#[derive(Debug)]
pub struct Session {
    pub controller_id: u32,
    pub username: String,
    pub instance: String,
    pub min_frame: u64,
    pub last_command_serial: u64,
    pub rate_counters: HashMap<String, u32>,
    pub last_frame_input: String,
    pub chat_tokens: u32,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(
        controller_id: u32,
        username: String,
        instance: String,
        min_frame: u64,
        chat_tokens: u32,
    ) -> Self {
        Self {
            controller_id,
            username,
            instance,
            min_frame,
            last_command_serial: 0,
            rate_counters: HashMap::new(),
            last_frame_input: String::new(),
            chat_tokens,
            last_activity: Instant::now(),
        }
    }

    /// Re-opens the window at `frame` if the command is stamped beyond it.
    pub fn open_command_window(&mut self, frame: u64) {
        if frame > self.min_frame {
            self.min_frame = frame;
            self.last_command_serial = 0;
            self.rate_counters.clear();
        }
    }

    /// Serial and rate checks for a command in the current window; on
    /// success the serial and the verb's counter advance and the inactivity
    /// clock resets.
    pub fn admit_command(&mut self, serial: u64, verb: &str, cap: u32) -> Result<(), ClientError> {
        if serial == 0 || serial <= self.last_command_serial {
            return Err(ClientError::SerialOutOfOrder);
        }
        let counter = self.rate_counters.entry(verb.to_string()).or_insert(0);
        if *counter >= cap {
            return Err(ClientError::CommandRateExceeded);
        }
        *counter += 1;
        self.last_command_serial = serial;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Bookkeeping after a frame input is admitted at `frame`: the next
    /// window opens at `frame + 1` with fresh serial and rate counters.
    pub fn admit_frame_input(&mut self, frame: u64, input: String) {
        self.last_frame_input = input;
        self.min_frame = frame + 1;
        self.last_command_serial = 0;
        self.rate_counters.clear();
        self.last_activity = Instant::now();
    }
}
