//! Instance state, the horizon advancer, and subscriber fan-out.
//!
//! An instance is one named game world: the finalized past-horizon state,
//! the buckets of pending events keyed by frame, the roster as of the
//! horizon, and the live subscribers. The advancer is the only thing that
//! mutates the world state, one frame at a time, with each frame's bucket in
//! canonical order; everything the playset observes is therefore independent
//! of message ingress order.

use crate::net::{ConnId, Outbound};
use crate::playset::{CommandCall, ConnectSeat, DisconnectSeat, Playset, SeatInput};
use log::{debug, error};
use serde_json::Value;
use shared::event::{partition_frame_bucket, Event};
use shared::{FrameClock, ServerMessage, StatusEntry};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// A controller whose disconnect just crossed the horizon. The server uses
/// these to reap OUTBOX records and promote INBOX waiters.
#[derive(Debug)]
pub struct Departure {
    pub controller: u32,
    pub username: String,
}

/// What one advancer run produced.
#[derive(Debug, Default)]
pub struct AdvanceOutcome {
    pub advanced: u64,
    pub departures: Vec<Departure>,
    pub failed_sends: Vec<ConnId>,
    pub halted: bool,
}

pub struct Instance {
    pub name: String,
    pub playset: Arc<dyn Playset>,
    pub clock: FrameClock,
    /// Opaque playset world state as of the past horizon.
    pub state: Value,
    /// Who is connected as of the past horizon, ascending controller order.
    pub controller_status: BTreeMap<u32, StatusEntry>,
    /// Pending events, unordered within each frame bucket.
    pub events: HashMap<u64, Vec<Event>>,
    pub subscribers: HashMap<ConnId, mpsc::UnboundedSender<Outbound>>,
    pub suspended: bool,
    /// Set on an internal invariant violation; a halted instance never ticks
    /// again.
    pub halted: bool,
    /// Invalidates in-flight advance timers; bumped on every suspend and
    /// reschedule.
    pub timer_generation: u64,
    hash_sync_interval: u64,
    frame_broadcast_interval: u64,
}

impl Instance {
    /// Builds a rehydrated instance: horizon reset to frame 1, suspended,
    /// with a disconnect synthesized for every stored roster member (they
    /// are not actually connected, and the playset must observe them leave).
    pub fn new(
        name: String,
        playset: Arc<dyn Playset>,
        state: Value,
        controller_status: BTreeMap<u32, StatusEntry>,
        hash_sync_interval: u64,
        frame_broadcast_interval: u64,
        now: Instant,
    ) -> Self {
        let clock = FrameClock::rehydrated(now);
        let mut events: HashMap<u64, Vec<Event>> = HashMap::new();
        let goodbyes: Vec<Event> = controller_status
            .keys()
            .map(|&controller| Event::Disconnect {
                frame: clock.horizon_frame,
                controller,
            })
            .collect();
        if !goodbyes.is_empty() {
            events.insert(clock.horizon_frame, goodbyes);
        }
        Self {
            name,
            playset,
            clock,
            state,
            controller_status,
            events,
            subscribers: HashMap::new(),
            suspended: true,
            halted: false,
            timer_generation: 0,
            hash_sync_interval,
            frame_broadcast_interval,
        }
    }

    /// Stores an admitted event in its frame bucket. Callers have already
    /// validated `event.frame() >= horizon`.
    pub fn admit_event(&mut self, event: Event) {
        debug_assert!(event.frame() >= self.clock.horizon_frame);
        self.events.entry(event.frame()).or_default().push(event);
    }

    pub fn subscribe(&mut self, conn: ConnId, outbound: mpsc::UnboundedSender<Outbound>) {
        self.subscribers.insert(conn, outbound);
    }

    pub fn unsubscribe(&mut self, conn: ConnId) {
        self.subscribers.remove(&conn);
    }

    /// Sends `text` to every subscriber, returning the connections whose
    /// channel is gone. Failures never abort the fan-out.
    pub fn broadcast_text(&self, text: &str) -> Vec<ConnId> {
        let mut failed = Vec::new();
        for (&conn, outbound) in &self.subscribers {
            if outbound.send(Outbound::Text(text.to_string())).is_err() {
                failed.push(conn);
            }
        }
        failed
    }

    /// Relays an event to every subscriber. When the sender is among them and
    /// the event is a frame input, its copy alone is re-serialized with the
    /// timing pong.
    pub fn broadcast_event(&self, event: &Event, sender_pong: Option<(ConnId, u64)>) -> Vec<ConnId> {
        let plain =
            serde_json::to_string(event).expect("event serialization is infallible");
        let mut failed = Vec::new();
        for (&conn, outbound) in &self.subscribers {
            let text = match sender_pong {
                Some((sender, pong))
                    if sender == conn && matches!(event, Event::Frame { .. }) =>
                {
                    event.to_json_with_pong(pong).to_string()
                }
                _ => plain.clone(),
            };
            if outbound.send(Outbound::Text(text)).is_err() {
                failed.push(conn);
            }
        }
        failed
    }

    /// Echoes a deduplicated frame input only to its sender, pong attached.
    pub fn echo_event(&self, conn: ConnId, event: &Event, pong: u64) -> Vec<ConnId> {
        let mut failed = Vec::new();
        if let Some(outbound) = self.subscribers.get(&conn) {
            if outbound
                .send(Outbound::Text(event.to_json_with_pong(pong).to_string()))
                .is_err()
            {
                failed.push(conn);
            }
        }
        failed
    }

    /// Wakes a suspended instance, discarding idle time so there is no
    /// burst catch-up. Returns true if it was suspended.
    pub fn resume(&mut self, now: Instant) -> bool {
        if self.halted || !self.suspended {
            return false;
        }
        self.suspended = false;
        self.clock.clamp_for_resume(now);
        true
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
        self.timer_generation += 1;
    }

    pub fn halt(&mut self) {
        self.halted = true;
        self.suspended = true;
        self.timer_generation += 1;
    }

    /// The advancer goes dormant once there is nothing left to do.
    pub fn should_suspend(&self) -> bool {
        self.events.is_empty() && self.subscribers.is_empty()
    }

    /// All pending events, unsorted, for the initial-state dump.
    pub fn pending_events(&self) -> Vec<Event> {
        self.events.values().flatten().cloned().collect()
    }

    /// Advances the horizon as many frames as the clock owes.
    pub fn run_pending_advances(&mut self, now: Instant) -> AdvanceOutcome {
        let mut outcome = AdvanceOutcome::default();
        while !self.halted && self.clock.should_advance(now) {
            match self.advance_one_frame() {
                Ok(mut departures) => {
                    outcome.advanced += 1;
                    outcome.departures.append(&mut departures);
                    outcome.failed_sends.extend(self.emit_sync_notice());
                }
                Err(controller) => {
                    error!(
                        "instance {}: frame input from unknown controller {} at frame {}, halting",
                        self.name, controller, self.clock.horizon_frame
                    );
                    self.halt();
                    outcome.halted = true;
                }
            }
        }
        outcome
    }

    fn advance_one_frame(&mut self) -> Result<Vec<Departure>, u32> {
        let frame = self.clock.horizon_frame;
        let bucket = partition_frame_bucket(self.events.remove(&frame).unwrap_or_default());

        // Connects join the roster before the playset runs, so the frame's
        // own inputs and disconnects may refer to them.
        for event in &bucket.connects {
            if let Event::Connect {
                controller,
                username,
                ..
            } = event
            {
                self.controller_status.insert(
                    *controller,
                    StatusEntry {
                        username: username.clone(),
                        last_input: String::new(),
                    },
                );
            }
        }

        // A frame input from a controller the roster has never seen means
        // the canonical order or the lifecycle tracking is broken; there is
        // no way to continue deterministically.
        for event in &bucket.frames {
            if !self.controller_status.contains_key(&event.controller()) {
                return Err(event.controller());
            }
        }
        for event in &bucket.frames {
            if let Event::Frame {
                controller, input, ..
            } = event
            {
                if let Some(entry) = self.controller_status.get_mut(controller) {
                    entry.last_input = input.clone();
                }
            }
        }

        let connects: Vec<ConnectSeat<'_>> = bucket
            .connects
            .iter()
            .filter_map(|event| match event {
                Event::Connect {
                    controller,
                    username,
                    profile,
                    ..
                } => Some(ConnectSeat {
                    controller: *controller,
                    username,
                    profile,
                }),
                _ => None,
            })
            .collect();
        let commands: Vec<CommandCall<'_>> = bucket
            .commands
            .iter()
            .filter_map(|event| match event {
                Event::Command {
                    controller,
                    serial,
                    verb,
                    arg,
                    ..
                } => Some(CommandCall {
                    controller: *controller,
                    serial: *serial,
                    verb,
                    arg: arg.as_deref(),
                }),
                _ => None,
            })
            .collect();
        // Ascending controller order; BTreeMap iteration is the guarantee.
        let inputs: Vec<SeatInput<'_>> = self
            .controller_status
            .iter()
            .map(|(&controller, entry)| SeatInput {
                controller,
                input: &entry.last_input,
            })
            .collect();
        let disconnects: Vec<DisconnectSeat> = bucket
            .disconnects
            .iter()
            .map(|event| DisconnectSeat {
                controller: event.controller(),
            })
            .collect();

        let playset = Arc::clone(&self.playset);
        playset.advance(&mut self.state, &connects, &commands, &inputs, &disconnects);

        let mut departures = Vec::new();
        for event in &bucket.disconnects {
            let controller = event.controller();
            if let Some(entry) = self.controller_status.remove(&controller) {
                departures.push(Departure {
                    controller,
                    username: entry.username,
                });
            } else {
                debug!(
                    "instance {}: disconnect for controller {} not in roster",
                    self.name, controller
                );
            }
        }

        self.clock.advance_one();
        Ok(departures)
    }

    // Hash-sync frames carry the state hash; plain advance notices fill the
    // gaps on their own coarser schedule; most frames send nothing.
    fn emit_sync_notice(&self) -> Vec<ConnId> {
        let frame = self.clock.horizon_frame;
        if frame <= 1 {
            return Vec::new();
        }
        let since_start = frame - 1;
        if self.hash_sync_interval > 0 && since_start % self.hash_sync_interval == 0 {
            if let Some(hash) = self.playset.hash(&self.state) {
                let notice = ServerMessage::HorizonAdvance {
                    frame,
                    hash: Some(hash),
                };
                return self.broadcast_text(&notice.to_text());
            }
        }
        if self.frame_broadcast_interval > 0 && since_start % self.frame_broadcast_interval == 0 {
            let notice = ServerMessage::HorizonAdvance { frame, hash: None };
            return self.broadcast_text(&notice.to_text());
        }
        Vec::new()
    }
}
