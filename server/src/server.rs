//! The authoritative server loop.
//!
//! One task owns every piece of mutable state: the user directory, the
//! instance table, the controller table, and the username indexes. All
//! inputs funnel through a single channel as [`LoopMessage`]s: socket
//! lifecycle and inbound frames from the transport tasks, advance-timer and
//! timeout-sweep fires, chat-token refills. Handlers run to completion, so
//! the only ordering that can affect game outcome is the canonical event
//! sort applied at advance time.

use crate::controller::{Controller, Lifecycle, Session};
use crate::error::ClientError;
use crate::instance::{Departure, Instance};
use crate::net::{self, ConnId, Outbound};
use crate::playset::PlaysetRegistry;
use crate::snapshot::{self, InstanceSeed, ServerConfig, Snapshot, SnapshotError, StateSeed};
use crate::users::UserDirectory;
use log::{debug, error, info, warn};
use serde_json::Value;
use shared::event::Event;
use shared::{ClientMessage, ServerMessage, FRAME_RATE, FUTURE_HORIZON_FRAMES, INACTIVITY_TIMEOUT_SECS, MAX_CONFIG_BYTES};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Everything that can wake the server loop.
#[derive(Debug)]
pub enum LoopMessage {
    Opened {
        conn: ConnId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Inbound {
        conn: ConnId,
        text: String,
    },
    /// The transport already decided this connection must die.
    Violation {
        conn: ConnId,
        error: ClientError,
    },
    Closed {
        conn: ConnId,
    },
    AdvanceDue {
        instance: String,
        generation: u64,
    },
    SweepTimeouts,
    ChatTokenReady {
        conn: ConnId,
    },
}

/// Whether the remaining elements of an inbound batch should still run.
enum Flow {
    Continue,
    Stop,
}

/// How the loop was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Clean,
    Dirty,
}

pub struct Server {
    config: ServerConfig,
    users: UserDirectory,
    registry: PlaysetRegistry,
    instances: HashMap<String, Instance>,
    controllers: HashMap<ConnId, Controller>,
    /// Username -> the LIVE or OUTBOX controller holding it.
    by_username: HashMap<String, ConnId>,
    /// Username -> the INBOX controller waiting for it.
    inbox_by_username: HashMap<String, ConnId>,
    next_controller_id: u32,
    data_path: PathBuf,
    tx: mpsc::UnboundedSender<LoopMessage>,
    rx: mpsc::UnboundedReceiver<LoopMessage>,
    stopping: Option<ShutdownKind>,
}

impl Server {
    pub fn new(config: ServerConfig, registry: PlaysetRegistry, data_path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            users: UserDirectory::new(),
            registry,
            instances: HashMap::new(),
            controllers: HashMap::new(),
            by_username: HashMap::new(),
            inbox_by_username: HashMap::new(),
            next_controller_id: 1,
            data_path,
            tx,
            rx,
            stopping: None,
        }
    }

    /// Rehydrates a server from a snapshot: every instance restarts
    /// suspended at frame 1 with goodbyes queued for its stored roster.
    pub fn from_snapshot(
        snapshot: Snapshot,
        registry: PlaysetRegistry,
        data_path: PathBuf,
    ) -> Result<Self, SnapshotError> {
        let now = Instant::now();
        let mut server = Self::new(snapshot.config, registry, data_path);
        server.users = UserDirectory::from_records(snapshot.users);
        server.next_controller_id = snapshot.next_controller_id;
        for (name, seed) in snapshot.instances {
            let playset = server
                .registry
                .get(&seed.playset_name)
                .ok_or_else(|| SnapshotError::UnknownPlayset(seed.playset_name.clone()))?;
            let state = match seed.state {
                StateSeed::Inline(value) => value,
                StateSeed::Text(text) => playset
                    .deserialize(&text)
                    .map_err(|e| SnapshotError::BadState(name.clone(), e))?,
            };
            let instance = Instance::new(
                name.clone(),
                playset,
                state,
                seed.controller_status,
                server.config.hash_sync_interval,
                server.config.frame_broadcast_interval,
                now,
            );
            info!("instance {} rehydrated ({})", name, instance.playset.name());
            server.instances.insert(name, instance);
        }
        Ok(server)
    }

    /// Runs until an admin shutdown. Spawns the accept loop and the timeout
    /// sweeper, then drains the loop channel forever.
    pub async fn run(mut self, listener: TcpListener) -> ShutdownKind {
        let origins = Arc::new(self.config.allowed_origins.clone());
        let accept_task = tokio::spawn(net::accept_loop(listener, self.tx.clone(), origins));

        let sweep_tx = self.tx.clone();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if sweep_tx.send(LoopMessage::SweepTimeouts).is_err() {
                    break;
                }
            }
        });

        info!("relay server running");
        let kind = loop {
            // The loop holds its own sender, so recv never yields None.
            let Some(message) = self.rx.recv().await else {
                break ShutdownKind::Dirty;
            };
            self.handle_message(message);
            if let Some(kind) = self.stopping {
                break kind;
            }
        };

        accept_task.abort();
        sweep_task.abort();
        info!("relay server stopped ({:?})", kind);
        kind
    }

    fn handle_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Opened {
                conn,
                addr,
                outbound,
            } => {
                self.controllers
                    .insert(conn, Controller::new(conn, addr, outbound));
            }
            LoopMessage::Inbound { conn, text } => self.handle_inbound(conn, &text),
            LoopMessage::Violation { conn, error } => self.error_close(conn, error),
            LoopMessage::Closed { conn } => self.retire(conn),
            LoopMessage::AdvanceDue {
                instance,
                generation,
            } => self.handle_advance_due(&instance, generation),
            LoopMessage::SweepTimeouts => self.sweep_timeouts(),
            LoopMessage::ChatTokenReady { conn } => self.handle_chat_token(conn),
        }
    }

    // === inbound dispatch ===

    fn handle_inbound(&mut self, conn: ConnId, text: &str) {
        if !self.controllers.contains_key(&conn) {
            return;
        }
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return self.error_close(conn, ClientError::Malformed),
        };
        // An array body is a batch, dispatched element by element and
        // aborted at the first error.
        let elements = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        for element in elements {
            let message: ClientMessage = match serde_json::from_value(element) {
                Ok(m) => m,
                Err(_) => return self.error_close(conn, ClientError::Malformed),
            };
            match self.dispatch(conn, message) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return,
                Err(error) => return self.error_close(conn, error),
            }
        }
    }

    fn dispatch(&mut self, conn: ConnId, message: ClientMessage) -> Result<Flow, ClientError> {
        match message {
            ClientMessage::Prelogin => self.handle_prelogin(conn),
            ClientMessage::Login {
                username,
                password,
                instance,
            } => self.handle_login(conn, &username, &password, &instance),
            ClientMessage::FrameInput { frame, input } => {
                self.handle_frame_input(conn, frame, input)
            }
            ClientMessage::Command {
                frame,
                serial,
                verb,
                arg,
            } => self.handle_command(conn, frame, serial, verb, arg),
            ClientMessage::Chat { message } => self.handle_chat(conn, message),
            ClientMessage::SelfServeCreateUser {
                username,
                password,
                config,
            } => self.handle_self_serve(conn, &username, &password, config),
            ClientMessage::ChangeMyPassword {
                username,
                password,
                new_password,
            } => self.handle_change_password(conn, &username, &password, &new_password),
            ClientMessage::GetMyConfig { username, password } => {
                self.handle_get_config(conn, &username, &password)
            }
            ClientMessage::SetMyConfig {
                username,
                password,
                config,
            } => self.handle_set_config(conn, &username, &password, config),
            ClientMessage::CleanShutdown {
                username,
                password,
                reason,
            } => self.handle_shutdown(conn, &username, &password, &reason, ShutdownKind::Clean),
            ClientMessage::DirtyShutdown {
                username,
                password,
                reason,
            } => self.handle_shutdown(conn, &username, &password, &reason, ShutdownKind::Dirty),
        }
    }

    fn handle_prelogin(&mut self, conn: ConnId) -> Result<Flow, ClientError> {
        let mut names: Vec<String> = self.instances.keys().cloned().collect();
        names.sort();
        let default_instance = names.first().cloned().unwrap_or_default();
        self.send_and_close(
            conn,
            ServerMessage::InstanceList {
                default_instance,
                instances: names,
            },
        );
        Ok(Flow::Stop)
    }

    // === login and lifecycle ===

    fn handle_login(
        &mut self,
        conn: ConnId,
        username: &str,
        password: &str,
        instance_name: &str,
    ) -> Result<Flow, ClientError> {
        {
            let controller = self.controllers.get(&conn).ok_or(ClientError::Malformed)?;
            if controller.lifecycle != Lifecycle::New {
                return Err(ClientError::AlreadyLoggedIn);
            }
        }
        let profile = self
            .users
            .verify(username, password)
            .ok_or(ClientError::BadCredentials)?
            .config
            .clone();
        {
            let instance = self
                .instances
                .get(instance_name)
                .ok_or(ClientError::UnknownInstance)?;
            if instance.halted {
                return Err(ClientError::UnknownInstance);
            }
        }

        let holder_lifecycle = self
            .by_username
            .get(username)
            .copied()
            .map(|holder| self.controllers.get(&holder).map(|c| c.lifecycle));
        match holder_lifecycle {
            // The username's last session is gone but its disconnect has not
            // crossed the horizon yet. Park the new session until it does.
            Some(Some(Lifecycle::Outbox)) => {
                if self.inbox_by_username.contains_key(username) {
                    return Err(ClientError::AlreadyLoggedIn);
                }
                let controller_id = self.allocate_controller_id();
                let pong = self
                    .instances
                    .get(instance_name)
                    .map(|i| i.clock.timing_pong(Instant::now()))
                    .unwrap_or(0);
                let controller = self
                    .controllers
                    .get_mut(&conn)
                    .ok_or(ClientError::Internal)?;
                controller.lifecycle = Lifecycle::Inbox;
                controller.session = Some(Session::new(
                    controller_id,
                    username.to_string(),
                    instance_name.to_string(),
                    0,
                    self.config.chat_tokens_max,
                ));
                self.inbox_by_username.insert(username.to_string(), conn);
                self.send_to(conn, &ServerMessage::LoginAccepted { pong });
                info!(
                    "login {} parked as inbox (controller {})",
                    username, controller_id
                );
                Ok(Flow::Continue)
            }
            Some(Some(_)) => Err(ClientError::AlreadyLoggedIn),
            Some(None) => {
                // Stale index entry; treat the username as free.
                self.by_username.remove(username);
                let controller_id = self.allocate_controller_id();
                self.go_live(conn, controller_id, username, instance_name, profile, true);
                Ok(Flow::Continue)
            }
            None => {
                let controller_id = self.allocate_controller_id();
                self.go_live(conn, controller_id, username, instance_name, profile, true);
                Ok(Flow::Continue)
            }
        }
    }

    fn allocate_controller_id(&mut self) -> u32 {
        let id = self.next_controller_id;
        self.next_controller_id += 1;
        id
    }

    /// Seats a controller: stamps its connect event at the present frame,
    /// subscribes it, and sends the welcome and initial-state messages. Used
    /// both for fresh logins (with `W`) and inbox promotions (without).
    fn go_live(
        &mut self,
        conn: ConnId,
        controller_id: u32,
        username: &str,
        instance_name: &str,
        profile: String,
        send_welcome: bool,
    ) {
        let now = Instant::now();
        if !self.instances.contains_key(instance_name) {
            self.error_close(conn, ClientError::UnknownInstance);
            return;
        }
        let (resumed, present, pong, failed) = {
            let Some(instance) = self.instances.get_mut(instance_name) else {
                return;
            };
            let resumed = instance.resume(now);
            let present = instance.clock.present_frame();
            let pong = instance.clock.timing_pong(now);
            let connect = Event::Connect {
                frame: present,
                controller: controller_id,
                username: username.to_string(),
                profile: Value::String(profile),
            };
            instance.admit_event(connect.clone());
            // The newcomer is not subscribed yet; it sees its own connect in
            // the initial-state event dump instead.
            let failed = instance.broadcast_event(&connect, None);
            (resumed, present, pong, failed)
        };

        let outbound = {
            let Some(controller) = self.controllers.get_mut(&conn) else {
                return;
            };
            controller.lifecycle = Lifecycle::Live;
            controller.session = Some(Session::new(
                controller_id,
                username.to_string(),
                instance_name.to_string(),
                present,
                self.config.chat_tokens_max,
            ));
            controller.outbound.clone()
        };
        self.by_username.insert(username.to_string(), conn);

        let initial_state = {
            let Some(instance) = self.instances.get_mut(instance_name) else {
                return;
            };
            instance.subscribe(conn, outbound);
            ServerMessage::InitialState {
                playset: instance.playset.name().to_string(),
                controller: controller_id,
                status: instance.controller_status.clone(),
                state: instance.playset.serialize(&instance.state),
                frame: instance.clock.horizon_frame,
                events: instance.pending_events(),
                frame_rate: FRAME_RATE,
                chat_message_max: self.config.chat_message_max,
                chat_tokens: self.config.chat_tokens_max,
            }
        };
        if send_welcome {
            self.send_to(conn, &ServerMessage::LoginAccepted { pong });
        }
        self.send_to(conn, &initial_state);
        info!(
            "controller {} ({}) live in {} at frame {}",
            controller_id, username, instance_name, present
        );
        if resumed {
            self.schedule_tick(instance_name);
        }
        self.error_close_all(failed);
    }

    /// Lifecycle-aware cleanup for a connection that is gone (or being
    /// kicked). LIVE controllers become OUTBOX with a disconnect stamped at
    /// the present frame; everyone else just disappears.
    fn retire(&mut self, conn: ConnId) {
        let Some(controller) = self.controllers.get(&conn) else {
            return;
        };
        match controller.lifecycle {
            Lifecycle::New => {
                self.controllers.remove(&conn);
            }
            Lifecycle::Inbox => {
                let username = controller
                    .session
                    .as_ref()
                    .map(|s| s.username.clone());
                if let Some(username) = username {
                    if self.inbox_by_username.get(&username) == Some(&conn) {
                        self.inbox_by_username.remove(&username);
                    }
                }
                self.controllers.remove(&conn);
            }
            Lifecycle::Live => self.retire_live(conn),
            // Stays until its disconnect crosses the horizon.
            Lifecycle::Outbox => {}
        }
    }

    fn retire_live(&mut self, conn: ConnId) {
        let session_data = self
            .controllers
            .get(&conn)
            .and_then(|c| c.session.as_ref())
            .map(|s| (s.instance.clone(), s.controller_id, s.username.clone()));
        let Some((instance_name, controller_id, username)) = session_data else {
            self.controllers.remove(&conn);
            return;
        };
        if !self.instances.contains_key(&instance_name) {
            self.controllers.remove(&conn);
            self.by_username.remove(&username);
            return;
        }
        let Some(instance) = self.instances.get_mut(&instance_name) else {
            return;
        };
        instance.unsubscribe(conn);
        if instance.halted {
            // Nothing will ever cross this horizon again; skip the outbox.
            self.controllers.remove(&conn);
            if self.by_username.get(&username) == Some(&conn) {
                self.by_username.remove(&username);
            }
            return;
        }
        let present = instance.clock.present_frame();
        let event = Event::Disconnect {
            frame: present,
            controller: controller_id,
        };
        instance.admit_event(event.clone());
        let failed = instance.broadcast_event(&event, None);
        if let Some(controller) = self.controllers.get_mut(&conn) {
            controller.lifecycle = Lifecycle::Outbox;
        }
        info!(
            "controller {} ({}) disconnected at frame {}",
            controller_id, username, present
        );
        self.error_close_all(failed);
    }

    // === event admission (the validator cascade) ===

    fn handle_frame_input(
        &mut self,
        conn: ConnId,
        frame: u64,
        input: String,
    ) -> Result<Flow, ClientError> {
        let (instance_name, controller_id, min_frame, is_duplicate) = {
            let controller = self.controllers.get(&conn).ok_or(ClientError::Malformed)?;
            if controller.lifecycle != Lifecycle::Live {
                return Err(ClientError::NotLoggedIn);
            }
            let session = controller.session.as_ref().ok_or(ClientError::Internal)?;
            (
                session.instance.clone(),
                session.controller_id,
                session.min_frame,
                session.last_frame_input == input,
            )
        };
        let failed = {
            let instance = self
                .instances
                .get_mut(&instance_name)
                .ok_or(ClientError::Internal)?;
            // Too lagged to admit. Not an error: the client will learn from
            // the next advance notice that its timestamps are stale.
            if frame < instance.clock.horizon_frame {
                return Ok(Flow::Continue);
            }
            if frame < min_frame {
                return Err(ClientError::FrameOutOfOrder);
            }
            if frame > instance.clock.present_frame() + FUTURE_HORIZON_FRAMES {
                return Err(ClientError::FrameTooFast);
            }
            if input.len() > instance.playset.max_input_len() {
                return Err(ClientError::InputTooLong);
            }
            let event = Event::Frame {
                frame,
                controller: controller_id,
                input: input.clone(),
            };
            instance.admit_event(event.clone());
            let pong = instance.clock.timing_pong(Instant::now());
            if is_duplicate {
                // Stored either way, but an unchanged input is only worth a
                // pong to its sender.
                instance.echo_event(conn, &event, pong)
            } else {
                instance.broadcast_event(&event, Some((conn, pong)))
            }
        };
        if let Some(session) = self
            .controllers
            .get_mut(&conn)
            .and_then(|c| c.session.as_mut())
        {
            session.admit_frame_input(frame, input);
        }
        self.error_close_all(failed);
        Ok(Flow::Continue)
    }

    fn handle_command(
        &mut self,
        conn: ConnId,
        frame: u64,
        serial: u64,
        verb: String,
        arg: Option<String>,
    ) -> Result<Flow, ClientError> {
        let (instance_name, controller_id, min_frame) = {
            let controller = self.controllers.get(&conn).ok_or(ClientError::Malformed)?;
            if controller.lifecycle != Lifecycle::Live {
                return Err(ClientError::NotLoggedIn);
            }
            let session = controller.session.as_ref().ok_or(ClientError::Internal)?;
            (
                session.instance.clone(),
                session.controller_id,
                session.min_frame,
            )
        };
        let cap = {
            let instance = self
                .instances
                .get(&instance_name)
                .ok_or(ClientError::Internal)?;
            if frame < instance.clock.horizon_frame {
                return Ok(Flow::Continue);
            }
            if frame < min_frame {
                return Err(ClientError::FrameOutOfOrder);
            }
            if frame > instance.clock.present_frame() + FUTURE_HORIZON_FRAMES {
                return Err(ClientError::FrameTooFast);
            }
            let cap = instance
                .playset
                .command_limit(&verb)
                .ok_or(ClientError::UnknownVerb)?;
            if arg.as_deref().map(str::len).unwrap_or(0) > instance.playset.max_arg_len() {
                return Err(ClientError::ArgTooLong);
            }
            cap
        };
        {
            let session = self
                .controllers
                .get_mut(&conn)
                .and_then(|c| c.session.as_mut())
                .ok_or(ClientError::Internal)?;
            session.open_command_window(frame);
            session.admit_command(serial, &verb, cap)?;
        }
        let failed = {
            let instance = self
                .instances
                .get_mut(&instance_name)
                .ok_or(ClientError::Internal)?;
            let event = Event::Command {
                frame,
                controller: controller_id,
                serial,
                verb,
                arg,
            };
            instance.admit_event(event.clone());
            instance.broadcast_event(&event, None)
        };
        self.error_close_all(failed);
        Ok(Flow::Continue)
    }

    // === chat ===

    fn handle_chat(&mut self, conn: ConnId, message: String) -> Result<Flow, ClientError> {
        let (controller_id, username) = {
            let controller = self
                .controllers
                .get_mut(&conn)
                .ok_or(ClientError::Malformed)?;
            if controller.lifecycle != Lifecycle::Live {
                return Err(ClientError::NotLoggedIn);
            }
            if message.len() > self.config.chat_message_max {
                return Err(ClientError::ChatTooLong);
            }
            let session = controller.session.as_mut().ok_or(ClientError::Internal)?;
            if session.chat_tokens == 0 {
                return Err(ClientError::ChatRateExceeded);
            }
            session.chat_tokens -= 1;
            (session.controller_id, session.username.clone())
        };

        // One refill timer per spent token.
        let tx = self.tx.clone();
        let delay = Duration::from_millis(self.config.chat_token_refill_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LoopMessage::ChatTokenReady { conn });
        });

        let text = ServerMessage::ChatRelay {
            controller: controller_id,
            username,
            message,
        }
        .to_text();
        let mut failed = Vec::new();
        for instance in self.instances.values() {
            failed.extend(instance.broadcast_text(&text));
        }
        self.error_close_all(failed);
        Ok(Flow::Continue)
    }

    fn handle_chat_token(&mut self, conn: ConnId) {
        let max = self.config.chat_tokens_max;
        let Some(controller) = self.controllers.get_mut(&conn) else {
            return;
        };
        if controller.lifecycle != Lifecycle::Live {
            return;
        }
        let refilled = match controller.session.as_mut() {
            Some(session) if session.chat_tokens < max => {
                session.chat_tokens += 1;
                true
            }
            _ => false,
        };
        if refilled {
            let _ = controller
                .outbound
                .send(Outbound::Text(ServerMessage::ChatToken.to_text()));
        }
    }

    // === one-shot account API ===

    fn handle_self_serve(
        &mut self,
        conn: ConnId,
        username: &str,
        password: &str,
        config: String,
    ) -> Result<Flow, ClientError> {
        if !self.config.allow_self_serve {
            return Err(ClientError::SelfServeDisabled);
        }
        if config.len() > MAX_CONFIG_BYTES {
            return Err(ClientError::ConfigTooLarge);
        }
        let origin = self.controllers.get(&conn).map(|c| c.addr.to_string());
        self.users.create(username, password, config, false, origin)?;
        info!("self-serve account {} created", username);
        self.send_and_close(
            conn,
            ServerMessage::Done {
                detail: "created".to_string(),
            },
        );
        Ok(Flow::Stop)
    }

    fn handle_change_password(
        &mut self,
        conn: ConnId,
        username: &str,
        password: &str,
        new_password: &str,
    ) -> Result<Flow, ClientError> {
        self.users
            .verify(username, password)
            .ok_or(ClientError::BadCredentials)?;
        self.users.set_password(username, new_password)?;
        info!("password changed for {}", username);
        self.send_and_close(
            conn,
            ServerMessage::Done {
                detail: "password changed".to_string(),
            },
        );
        Ok(Flow::Stop)
    }

    fn handle_get_config(
        &mut self,
        conn: ConnId,
        username: &str,
        password: &str,
    ) -> Result<Flow, ClientError> {
        let config = self
            .users
            .verify(username, password)
            .ok_or(ClientError::BadCredentials)?
            .config
            .clone();
        self.send_and_close(conn, ServerMessage::Done { detail: config });
        Ok(Flow::Stop)
    }

    fn handle_set_config(
        &mut self,
        conn: ConnId,
        username: &str,
        password: &str,
        config: String,
    ) -> Result<Flow, ClientError> {
        self.users
            .verify(username, password)
            .ok_or(ClientError::BadCredentials)?;
        if config.len() > MAX_CONFIG_BYTES {
            return Err(ClientError::ConfigTooLarge);
        }
        self.users.set_config(username, config)?;
        self.send_and_close(
            conn,
            ServerMessage::Done {
                detail: "config saved".to_string(),
            },
        );
        Ok(Flow::Stop)
    }

    fn handle_shutdown(
        &mut self,
        conn: ConnId,
        username: &str,
        password: &str,
        reason: &str,
        kind: ShutdownKind,
    ) -> Result<Flow, ClientError> {
        let record = self
            .users
            .verify(username, password)
            .ok_or(ClientError::BadCredentials)?;
        if !record.admin {
            return Err(ClientError::NotAuthorized);
        }
        let snapshot = self.build_snapshot();
        let saved = match kind {
            ShutdownKind::Clean => snapshot::save_clean(&snapshot, &self.data_path),
            ShutdownKind::Dirty => snapshot::save_dirty(&snapshot, &self.data_path).map(|_| ()),
        };
        if let Err(e) = saved {
            error!("snapshot save failed: {}", e);
            return Err(ClientError::Internal);
        }
        warn!("{:?} shutdown requested by {}: {}", kind, username, reason);
        self.send_and_close(
            conn,
            ServerMessage::Done {
                detail: "shutting down".to_string(),
            },
        );
        self.stopping = Some(kind);
        Ok(Flow::Stop)
    }

    fn build_snapshot(&self) -> Snapshot {
        let instances = self
            .instances
            .iter()
            .map(|(name, instance)| {
                (
                    name.clone(),
                    InstanceSeed {
                        playset_name: instance.playset.name().to_string(),
                        state: StateSeed::Text(instance.playset.serialize(&instance.state)),
                        controller_status: instance.controller_status.clone(),
                    },
                )
            })
            .collect();
        Snapshot {
            config: self.config.clone(),
            users: self.users.records().clone(),
            next_controller_id: self.next_controller_id,
            instances,
        }
    }

    // === timers ===

    fn handle_advance_due(&mut self, name: &str, generation: u64) {
        let now = Instant::now();
        let outcome = {
            let Some(instance) = self.instances.get_mut(name) else {
                return;
            };
            if instance.suspended || instance.halted || instance.timer_generation != generation {
                return;
            }
            instance.run_pending_advances(now)
        };
        for departure in outcome.departures {
            self.handle_departure(departure);
        }
        self.error_close_all(outcome.failed_sends);
        if outcome.halted {
            self.halt_instance(name);
            return;
        }
        let suspended_now = {
            let Some(instance) = self.instances.get_mut(name) else {
                return;
            };
            if instance.should_suspend() {
                instance.suspend();
                debug!("instance {} suspended", name);
                true
            } else {
                false
            }
        };
        if !suspended_now {
            self.schedule_tick(name);
        }
    }

    /// A disconnect crossed the horizon: reap the OUTBOX record holding the
    /// username and promote a waiting INBOX session, which emits a fresh
    /// connect at the current present frame.
    fn handle_departure(&mut self, departure: Departure) {
        let Departure {
            controller,
            username,
        } = departure;
        if let Some(&holder) = self.by_username.get(&username) {
            let finished = self
                .controllers
                .get(&holder)
                .map(|c| {
                    c.lifecycle == Lifecycle::Outbox
                        && c.session.as_ref().map(|s| s.controller_id) == Some(controller)
                })
                .unwrap_or(false);
            if finished {
                self.controllers.remove(&holder);
                self.by_username.remove(&username);
                debug!("outbox record for {} reaped", username);
            }
        }
        if self.by_username.contains_key(&username) {
            return;
        }
        let Some(waiting) = self.inbox_by_username.remove(&username) else {
            return;
        };
        let Some((controller_id, instance_name)) = self
            .controllers
            .get(&waiting)
            .filter(|c| c.lifecycle == Lifecycle::Inbox)
            .and_then(|c| c.session.as_ref())
            .map(|s| (s.controller_id, s.instance.clone()))
        else {
            return;
        };
        let profile = self.users.config(&username).unwrap_or("").to_string();
        info!("promoting inbox controller {} ({})", controller_id, username);
        self.go_live(waiting, controller_id, &username, &instance_name, profile, false);
    }

    fn halt_instance(&mut self, name: &str) {
        let subscribers: Vec<ConnId> = self
            .instances
            .get(name)
            .map(|i| i.subscribers.keys().copied().collect())
            .unwrap_or_default();
        for conn in subscribers {
            self.error_close(conn, ClientError::Internal);
        }
    }

    fn schedule_tick(&mut self, name: &str) {
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        if instance.suspended || instance.halted {
            return;
        }
        instance.timer_generation += 1;
        let generation = instance.timer_generation;
        // No pacing ahead: a deadline in the past fires immediately.
        let due = instance.clock.next_advance_due().max(Instant::now());
        let tx = self.tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(due)).await;
            let _ = tx.send(LoopMessage::AdvanceDue {
                instance: name,
                generation,
            });
        });
    }

    fn sweep_timeouts(&mut self) {
        let timeout = Duration::from_secs(INACTIVITY_TIMEOUT_SECS);
        let now = Instant::now();
        let expired: Vec<ConnId> = self
            .controllers
            .values()
            .filter(|c| c.lifecycle == Lifecycle::Live)
            .filter(|c| {
                c.session
                    .as_ref()
                    .map(|s| now.duration_since(s.last_activity) > timeout)
                    .unwrap_or(false)
            })
            .map(|c| c.conn)
            .collect();
        for conn in expired {
            info!("connection {} timed out", conn);
            self.error_close(conn, ClientError::TimedOut);
        }
    }

    // === plumbing ===

    fn send_to(&self, conn: ConnId, message: &ServerMessage) {
        if let Some(controller) = self.controllers.get(&conn) {
            let _ = controller.outbound.send(Outbound::Text(message.to_text()));
        }
    }

    fn send_and_close(&mut self, conn: ConnId, message: ServerMessage) {
        if let Some(controller) = self.controllers.get(&conn) {
            let _ = controller.outbound.send(Outbound::Text(message.to_text()));
            let _ = controller.outbound.send(Outbound::Close);
        }
        self.retire(conn);
    }

    fn error_close(&mut self, conn: ConnId, error: ClientError) {
        debug!("closing connection {}: {}", conn, error);
        self.send_and_close(
            conn,
            ServerMessage::Error {
                error: error.to_string(),
            },
        );
    }

    // Broadcast targets whose writer is gone get the full error-close
    // treatment so their disconnects are stamped.
    fn error_close_all(&mut self, conns: Vec<ConnId>) {
        for conn in conns {
            self.error_close(conn, ClientError::Internal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playset::DotsPlayset;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn seeded_server(allow_self_serve: bool) -> Server {
        let mut registry = PlaysetRegistry::new();
        registry.register(Arc::new(DotsPlayset));
        let mut directory = UserDirectory::new();
        directory
            .create("alice", "pw", String::new(), false, None)
            .unwrap();
        directory
            .create("bob", "pw", String::new(), false, None)
            .unwrap();
        directory
            .create("root", "pw", String::new(), true, None)
            .unwrap();
        let users = directory.records().clone();

        let mut instances = BTreeMap::new();
        instances.insert(
            "room".to_string(),
            InstanceSeed {
                playset_name: "dots".to_string(),
                state: StateSeed::Inline(json!({ "seats": {}, "dots": [] })),
                controller_status: BTreeMap::new(),
            },
        );
        let mut config = ServerConfig::default();
        config.allow_self_serve = allow_self_serve;
        let snapshot = Snapshot {
            config,
            users,
            next_controller_id: 1,
            instances,
        };
        let dir = std::env::temp_dir().join(format!("relay-test-{}", std::process::id()));
        Server::from_snapshot(snapshot, registry, dir).unwrap()
    }

    fn open_conn(server: &mut Server, conn: ConnId) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        server.handle_message(LoopMessage::Opened {
            conn,
            addr: "127.0.0.1:4000".parse().unwrap(),
            outbound: tx,
        });
        rx
    }

    fn send(server: &mut Server, conn: ConnId, text: &str) {
        server.handle_message(LoopMessage::Inbound {
            conn,
            text: text.to_string(),
        });
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Text(text) = out {
                texts.push(text);
            }
        }
        texts
    }

    fn kinds(texts: &[String]) -> Vec<String> {
        texts
            .iter()
            .filter_map(|t| serde_json::from_str::<Value>(t).ok())
            .filter_map(|v| v["k"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_login_sends_welcome_then_state() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);

        let texts = drain(&mut rx);
        assert_eq!(kinds(&texts), vec!["W", "S"]);

        let state: Value = serde_json::from_str(&texts[1]).unwrap();
        assert_eq!(state["p"], json!("dots"));
        assert_eq!(state["c"], json!(1));
        assert_eq!(state["f"], json!(1));
        assert_eq!(state["r"], json!(30));
        // The newcomer's own connect is in the pending-event dump, stamped
        // at the present frame.
        let events = state["e"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["k"], json!("c"));
        assert_eq!(events[0]["f"], json!(16));
    }

    #[tokio::test]
    async fn test_bad_credentials_close() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"nope","n":"room"}"#);
        let texts = drain(&mut rx);
        assert_eq!(kinds(&texts), vec!["E"]);
        assert!(!server.controllers.contains_key(&1));
    }

    #[tokio::test]
    async fn test_unknown_instance_close() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"void"}"#);
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);
    }

    #[tokio::test]
    async fn test_second_login_conflicts_with_live() {
        let mut server = seeded_server(false);
        let mut rx1 = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx1);

        let mut rx2 = open_conn(&mut server, 2);
        send(&mut server, 2, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        assert_eq!(kinds(&drain(&mut rx2)), vec!["E"]);
        // The original session is untouched.
        assert_eq!(server.by_username.get("alice"), Some(&1));
    }

    #[tokio::test]
    async fn test_close_stamps_disconnect_and_enters_outbox() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        server.handle_message(LoopMessage::Closed { conn: 1 });

        let controller = server.controllers.get(&1).unwrap();
        assert_eq!(controller.lifecycle, Lifecycle::Outbox);
        assert_eq!(server.by_username.get("alice"), Some(&1));
        let instance = server.instances.get("room").unwrap();
        let disconnects = instance
            .pending_events()
            .into_iter()
            .filter(|e| matches!(e, Event::Disconnect { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_relogin_through_outbox_parks_as_inbox() {
        let mut server = seeded_server(false);
        let mut rx1 = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx1);
        server.handle_message(LoopMessage::Closed { conn: 1 });

        let mut rx2 = open_conn(&mut server, 2);
        send(&mut server, 2, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        let texts = drain(&mut rx2);
        assert_eq!(kinds(&texts), vec!["W"]);
        assert_eq!(
            server.controllers.get(&2).unwrap().lifecycle,
            Lifecycle::Inbox
        );

        // A third login for the same name fails while the inbox waits.
        let mut rx3 = open_conn(&mut server, 3);
        send(&mut server, 3, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        assert_eq!(kinds(&drain(&mut rx3)), vec!["E"]);
    }

    #[tokio::test]
    async fn test_departure_reaps_outbox_and_promotes_inbox() {
        let mut server = seeded_server(false);
        let mut rx1 = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx1);
        server.handle_message(LoopMessage::Closed { conn: 1 });

        let mut rx2 = open_conn(&mut server, 2);
        send(&mut server, 2, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx2);

        // The old session's disconnect crosses the horizon.
        server.handle_departure(Departure {
            controller: 1,
            username: "alice".to_string(),
        });

        assert!(!server.controllers.contains_key(&1));
        assert_eq!(
            server.controllers.get(&2).unwrap().lifecycle,
            Lifecycle::Live
        );
        assert_eq!(server.by_username.get("alice"), Some(&2));
        // Promotion sends the initial state without a second welcome.
        assert_eq!(kinds(&drain(&mut rx2)), vec!["S"]);
    }

    #[tokio::test]
    async fn test_advance_crosses_disconnect_and_suspends() {
        use shared::FrameClock;

        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);
        // Connect and disconnect both land at frame 16.
        server.handle_message(LoopMessage::Closed { conn: 1 });

        // Backdate the clock far enough for frame 16 to cross the horizon,
        // then fire the pending advance timer.
        let generation = {
            let instance = server.instances.get_mut("room").unwrap();
            instance.clock.horizon_instant =
                Instant::now() - FrameClock::frames(shared::PAST_HORIZON_FRAMES + 17);
            instance.timer_generation
        };
        server.handle_message(LoopMessage::AdvanceDue {
            instance: "room".to_string(),
            generation,
        });

        // The outbox record is reaped, the playset saw the join and the
        // leave, and the idle instance went dormant.
        assert!(server.controllers.is_empty());
        assert!(server.by_username.is_empty());
        let instance = server.instances.get("room").unwrap();
        assert!(instance.clock.horizon_frame > 16);
        assert_eq!(instance.state["seats"], json!({}));
        assert!(instance.events.is_empty());
        assert!(instance.suspended);
    }

    #[tokio::test]
    async fn test_frame_zero_is_silently_dropped() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        // Below the horizon: ignored without error.
        send(&mut server, 1, r#"{"k":"f","f":0,"i":"x"}"#);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(
            server.controllers.get(&1).unwrap().lifecycle,
            Lifecycle::Live
        );
    }

    #[tokio::test]
    async fn test_frame_below_window_errors() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        send(&mut server, 1, r#"{"k":"f","f":20,"i":"L"}"#);
        let first = drain(&mut rx);
        assert_eq!(kinds(&first), vec!["f"]);
        // Own copy carries the pong.
        let own: Value = serde_json::from_str(&first[0]).unwrap();
        assert!(own["t"].is_u64());

        // The window moved to 21; frame 20 is now out of order (it is still
        // above the horizon, so this is an error, not a silent drop).
        send(&mut server, 1, r#"{"k":"f","f":20,"i":"R"}"#);
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);
    }

    #[tokio::test]
    async fn test_future_horizon_boundary() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        // present = 16, future horizon = 61.
        send(&mut server, 1, r#"{"k":"f","f":61,"i":"L"}"#);
        assert_eq!(kinds(&drain(&mut rx)), vec!["f"]);

        let mut rx2 = open_conn(&mut server, 2);
        send(&mut server, 2, r#"{"k":"l","u":"bob","p":"pw","n":"room"}"#);
        drain(&mut rx2);
        send(&mut server, 2, r#"{"k":"f","f":62,"i":"L"}"#);
        let texts = drain(&mut rx2);
        assert_eq!(kinds(&texts), vec!["E"]);
    }

    #[tokio::test]
    async fn test_duplicate_input_echoes_only_to_sender() {
        let mut server = seeded_server(false);
        let mut rx1 = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx1);
        let mut rx2 = open_conn(&mut server, 2);
        send(&mut server, 2, r#"{"k":"l","u":"bob","p":"pw","n":"room"}"#);
        drain(&mut rx1);
        drain(&mut rx2);

        send(&mut server, 1, r#"{"k":"f","f":20,"i":"L"}"#);
        assert_eq!(kinds(&drain(&mut rx1)), vec!["f"]);
        assert_eq!(kinds(&drain(&mut rx2)), vec!["f"]);

        // Same input again: stored, but only the sender hears about it.
        send(&mut server, 1, r#"{"k":"f","f":21,"i":"L"}"#);
        assert_eq!(kinds(&drain(&mut rx1)), vec!["f"]);
        assert!(drain(&mut rx2).is_empty());
        let instance = server.instances.get("room").unwrap();
        let stored = instance
            .pending_events()
            .into_iter()
            .filter(|e| matches!(e, Event::Frame { .. }))
            .count();
        assert_eq!(stored, 2);
    }

    #[tokio::test]
    async fn test_command_validation_cascade() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        // Unknown verb closes.
        send(&mut server, 1, r#"{"k":"o","f":16,"s":1,"o":"warp"}"#);
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);

        // Fresh session: serial 0 is rejected.
        let mut rx2 = open_conn(&mut server, 2);
        send(&mut server, 2, r#"{"k":"l","u":"bob","p":"pw","n":"room"}"#);
        drain(&mut rx2);
        send(&mut server, 2, r#"{"k":"o","f":16,"s":0,"o":"drop"}"#);
        assert_eq!(kinds(&drain(&mut rx2)), vec!["E"]);
    }

    #[tokio::test]
    async fn test_command_serial_reuse_across_windows() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        send(&mut server, 1, r#"{"k":"o","f":16,"s":1,"o":"drop","a":"1,1"}"#);
        send(&mut server, 1, r#"{"k":"o","f":16,"s":2,"o":"drop","a":"2,2"}"#);
        // Later frame opens a new window; serial 1 is valid again.
        send(&mut server, 1, r#"{"k":"o","f":17,"s":1,"o":"drop","a":"3,3"}"#);
        assert_eq!(kinds(&drain(&mut rx)), vec!["o", "o", "o"]);
        assert_eq!(
            server.controllers.get(&1).unwrap().lifecycle,
            Lifecycle::Live
        );
    }

    #[tokio::test]
    async fn test_batch_aborts_on_first_error() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        send(
            &mut server,
            1,
            r#"[{"k":"f","f":20,"i":"a"},{"k":"o","f":20,"s":0,"o":"drop"},{"k":"f","f":21,"i":"b"}]"#,
        );
        let texts = drain(&mut rx);
        // First element relayed, second errors, third never runs.
        assert_eq!(kinds(&texts), vec!["f", "E"]);
    }

    #[tokio::test]
    async fn test_chat_tokens_and_refill() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        for _ in 0..5 {
            send(&mut server, 1, r#"{"k":"g","m":"hi"}"#);
        }
        let texts = drain(&mut rx);
        assert_eq!(kinds(&texts), vec!["g", "g", "g", "g", "g"]);

        // Sixth message exceeds the bucket.
        send(&mut server, 1, r#"{"k":"g","m":"hi"}"#);
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);
    }

    #[tokio::test]
    async fn test_chat_token_refill_message() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);
        send(&mut server, 1, r#"{"k":"g","m":"hi"}"#);
        drain(&mut rx);

        server.handle_message(LoopMessage::ChatTokenReady { conn: 1 });
        assert_eq!(kinds(&drain(&mut rx)), vec!["G"]);
        // At the cap, a stray refill produces nothing.
        server.handle_message(LoopMessage::ChatTokenReady { conn: 1 });
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_prelogin_lists_and_closes() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"prelogin"}"#);
        let texts = drain(&mut rx);
        assert_eq!(kinds(&texts), vec!["U"]);
        let listing: Value = serde_json::from_str(&texts[0]).unwrap();
        assert_eq!(listing["n"], json!("room"));
        assert_eq!(listing["l"], json!(["room"]));
        assert!(!server.controllers.contains_key(&1));
    }

    #[tokio::test]
    async fn test_self_serve_disabled_and_enabled() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(
            &mut server,
            1,
            r#"{"k":"selfServeCreateUser","u":"carol","p":"pw","d":""}"#,
        );
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);

        let mut server = seeded_server(true);
        let mut rx = open_conn(&mut server, 1);
        send(
            &mut server,
            1,
            r#"{"k":"selfServeCreateUser","u":"carol","p":"pw","d":""}"#,
        );
        assert_eq!(kinds(&drain(&mut rx)), vec!["D"]);
        assert!(server.users.verify("carol", "pw").is_some());
        let record = server.users.records().get("carol").unwrap();
        assert!(!record.admin);
        assert_eq!(record.self_serve_origin.as_deref(), Some("127.0.0.1:4000"));
    }

    #[tokio::test]
    async fn test_self_serve_stops_on_first_error() {
        let mut server = seeded_server(true);
        let mut rx = open_conn(&mut server, 1);
        send(
            &mut server,
            1,
            r#"{"k":"selfServeCreateUser","u":"1bad","p":"pw","d":""}"#,
        );
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);
        assert!(server.users.records().get("1bad").is_none());
    }

    #[tokio::test]
    async fn test_config_api_roundtrip() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(
            &mut server,
            1,
            r#"{"k":"setMyConfig","u":"alice","p":"pw","d":"prefs"}"#,
        );
        assert_eq!(kinds(&drain(&mut rx)), vec!["D"]);

        let mut rx = open_conn(&mut server, 2);
        send(&mut server, 2, r#"{"k":"getMyConfig","u":"alice","p":"pw"}"#);
        let texts = drain(&mut rx);
        let reply: Value = serde_json::from_str(&texts[0]).unwrap();
        assert_eq!(reply["d"], json!("prefs"));
    }

    #[tokio::test]
    async fn test_shutdown_requires_admin() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(
            &mut server,
            1,
            r#"{"k":"cleanShutdown","u":"alice","p":"pw","r":"nope"}"#,
        );
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);
        assert_eq!(server.stopping, None);
    }

    #[tokio::test]
    async fn test_clean_shutdown_saves_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let mut server = seeded_server(false);
        server.data_path = path.clone();

        let mut rx = open_conn(&mut server, 1);
        send(
            &mut server,
            1,
            r#"{"k":"cleanShutdown","u":"root","p":"pw","r":"maintenance"}"#,
        );
        assert_eq!(kinds(&drain(&mut rx)), vec!["D"]);
        assert_eq!(server.stopping, Some(ShutdownKind::Clean));

        let saved = snapshot::load(&path).unwrap().unwrap();
        assert!(saved.instances.contains_key("room"));
        assert!(saved.users.contains_key("alice"));
    }

    #[tokio::test]
    async fn test_sweep_times_out_idle_live_controllers() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"l","u":"alice","p":"pw","n":"room"}"#);
        drain(&mut rx);

        if let Some(session) = server
            .controllers
            .get_mut(&1)
            .and_then(|c| c.session.as_mut())
        {
            session.last_activity = Instant::now() - Duration::from_secs(10);
        }
        server.handle_message(LoopMessage::SweepTimeouts);

        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);
        assert_eq!(
            server.controllers.get(&1).unwrap().lifecycle,
            Lifecycle::Outbox
        );
    }

    #[tokio::test]
    async fn test_messages_before_login_error() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, r#"{"k":"f","f":20,"i":"L"}"#);
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);
    }

    #[tokio::test]
    async fn test_malformed_json_closes() {
        let mut server = seeded_server(false);
        let mut rx = open_conn(&mut server, 1);
        send(&mut server, 1, "not json");
        assert_eq!(kinds(&drain(&mut rx)), vec!["E"]);
    }
}
