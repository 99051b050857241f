//! The central arbiter: priority, BOP aggregation, status fan-out, and the
//! observatory state machine.
//!
//! One `Arbiter` value owns all global mutable state — the state word, the
//! priority holder, outstanding status gathers — and every mutation funnels
//! through its methods. It operates on a [`Block`] purely through staged
//! outbox lines, so the whole arbitration surface is unit-testable without a
//! single socket; the `server` module is just the I/O shell around it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use skyconf::SkyConfig;
use skycore::{
    Advance, Block, Command, CommandKind, ConnId, DeviceHandler, KeepaliveAction, KeepaliveConfig,
    Outcome, PeerRole,
};
use skyproto::state::{self, Period, BOP_MASK, ERROR_MASK, STATE_OFF, STATE_STANDBY};
use skyproto::value::{metainfo_line, selmetainfo_line, value_line};
use skyproto::{
    message_line, Completion, DeviceType, LineBuilder, MessageLevel, Params, ProtoError, SetOp,
    TypeWord, ValueData, ValueKind, WireEvent, ERR_COMMAND, ERR_KEY, ERR_PARAMS, ERR_PRIORITY,
    ERR_SYSTEM, ERR_UNKNOWN_VALUE,
};

use crate::ephem::{self, NextEvent};

/// Wait imposed before answering a failed client login, to slow down
/// credential guessing.
const AUTH_FAIL_DELAY: Duration = Duration::from_secs(5);

/// How a handled line is answered.
enum Disposition {
    /// Send `+0000 "OK"`.
    Ok,
    /// Protocol traffic; no completion.
    Silent,
    /// Completion will be sent later (scatter/gather, delayed auth).
    Deferred,
}

type Handled = Result<Disposition, (i32, String)>;

/// One of the arbiter's own published values.
#[derive(Debug)]
struct OwnValue {
    name: &'static str,
    type_word: TypeWord,
    description: &'static str,
    labels: Vec<String>,
    data: ValueData,
}

pub struct Arbiter {
    config: SkyConfig,
    keepalive: KeepaliveConfig,
    /// The global state word: period/standby/off, error bits, BOP bits.
    state: u32,
    next_event: Option<NextEvent>,
    /// Outstanding `status_info` gathers per requester.
    status_pending: HashMap<ConnId, u32>,
    /// Completions held back until their due time (failed-auth delay).
    delayed: Vec<(Instant, ConnId, Completion)>,
    /// Per-connection device handlers, attached at registration.
    handlers: HashMap<ConnId, DeviceHandler>,
    own_values: Vec<OwnValue>,
    key_seed: u32,
}

impl Arbiter {
    pub fn new(config: SkyConfig) -> Self {
        let keepalive = KeepaliveConfig::new(Duration::from_secs(config.timeouts.idle_secs));
        let own_values = build_own_values(&config);
        let key_seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(1)
            | 1;
        Self {
            config,
            keepalive,
            state: STATE_OFF,
            next_event: None,
            status_pending: HashMap::new(),
            delayed: Vec::new(),
            handlers: HashMap::new(),
            own_values,
            key_seed,
        }
    }

    /// Compute the initial state from the ephemeris and config.
    pub fn init(&mut self, wall: DateTime<Utc>) {
        let ev = ephem::next_event(&self.config.site, &self.config.horizons, wall);
        if self.config.arbiter.reboot_on {
            self.state = ev.current as u32;
            info!(period = ev.current.as_str(), "starting switched on");
        } else {
            self.state = STATE_OFF;
            info!("starting switched off");
        }
        self.refresh_state_values(&ev);
        self.next_event = Some(ev);
    }

    pub fn state(&self) -> u32 {
        self.state
    }

    pub fn keepalive_config(&self) -> &KeepaliveConfig {
        &self.keepalive
    }

    // --- inbound dispatch -------------------------------------------------

    /// Handle one decoded wire event from a connection.
    pub fn handle_event(&mut self, block: &mut Block, id: ConnId, event: WireEvent, now: Instant) {
        match event {
            WireEvent::Line(line) => self.handle_line(block, id, &line, now),
            // The arbiter is not a sink for bulk data; peers exchange images
            // directly. Tolerate and drop.
            WireEvent::BinaryOpen { chan, size, .. } => {
                warn!(conn = id.0, chan, size, "unexpected binary channel, ignoring");
            }
            WireEvent::BinaryChunk { .. } | WireEvent::BinaryClosed { .. } => {}
        }
    }

    /// Handle one inbound line: completion or command.
    pub fn handle_line(&mut self, block: &mut Block, id: ConnId, line: &str, now: Instant) {
        match Completion::parse(line) {
            Ok(Some(completion)) => {
                self.completion_received(block, id, &completion, now);
                self.sweep_queues(block, now);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                self.send_error(block, id, ERR_PARAMS, &e.to_string(), now);
                return;
            }
        }

        let (name, mut params) = match Params::parse_line(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.send_error(block, id, ERR_PARAMS, &e.to_string(), now);
                return;
            }
        };

        let handled = self.dispatch(block, id, &name, &mut params, now);
        match handled {
            Ok(Disposition::Ok) => {
                if let Some(conn) = block.get_mut(id) {
                    conn.send_completion(&Completion::ok(), now);
                }
            }
            Ok(Disposition::Silent) | Ok(Disposition::Deferred) => {}
            Err((code, message)) => self.send_error(block, id, code, &message, now),
        }
        self.sweep_queues(block, now);
    }

    fn dispatch(
        &mut self,
        block: &mut Block,
        id: ConnId,
        name: &str,
        params: &mut Params,
        now: Instant,
    ) -> Handled {
        match name {
            // Liveness probe, answered below the command queue.
            "ready" => {
                if let Some(conn) = block.get_mut(id) {
                    conn.send_line("ack", now);
                }
                Ok(Disposition::Silent)
            }
            "ack" => Ok(Disposition::Silent),

            "login" => self.cmd_login(block, id, params),
            "password" => self.cmd_password(block, id, params, now),
            "register" => self.cmd_register(block, id, params, now),
            "info" => self.cmd_info(block, id, now),
            "priority" | "prioritydeferred" => self.cmd_priority(block, id, name, params, now),
            "key" => self.cmd_key(block, id, params, now),
            "authorize" => self.cmd_authorize(block, id, params, now),
            "message_mask" => {
                let mask = params.next_u32("mask").map_err(param_err)?;
                params.end("message_mask").map_err(param_err)?;
                let conn = block.get_mut(id).ok_or_else(gone)?;
                conn.set_message_mask(mask);
                Ok(Disposition::Ok)
            }
            "status_info" => self.cmd_status_info(block, id, now),
            "on" | "standby" | "off" => self.cmd_switch(block, id, name, now),

            "S" => self.proto_state(block, id, params, now),
            "M" => self.proto_message(block, id, params, now),
            "metainfo" => self.proto_metainfo(block, id, params),
            "selmetainfo" => self.proto_selmetainfo(block, id, params),
            "value" => self.proto_value(block, id, params),
            "set_value" | "set_value_def" => self.cmd_set_value(block, id, params, now),

            other => Err((ERR_COMMAND, format!("unknown command {other:?}"))),
        }
    }

    // --- handshake --------------------------------------------------------

    fn cmd_login(&mut self, block: &mut Block, id: ConnId, params: &mut Params) -> Handled {
        let login = params.next_str("login").map_err(param_err)?;
        params.end("login").map_err(param_err)?;
        let conn = block.get_mut(id).ok_or_else(gone)?;
        if conn.role() != PeerRole::Undefined {
            return Err((ERR_COMMAND, "cannot switch peer type to client".to_string()));
        }
        conn.identify_client(&login);
        Ok(Disposition::Ok)
    }

    fn cmd_password(
        &mut self,
        block: &mut Block,
        id: ConnId,
        params: &mut Params,
        now: Instant,
    ) -> Handled {
        let password = params.next_str("password").map_err(param_err)?;
        params.end("password").map_err(param_err)?;
        let state_word = self.state;
        let conn = block.get_mut(id).ok_or_else(gone)?;
        let Some(login) = conn.login().map(String::from) else {
            return Err((ERR_SYSTEM, "password before login".to_string()));
        };
        if self.config.check_password(&login, &password) {
            conn.set_authorized(true);
            conn.send_line(format!("logged_as {}", id.0), now);
            conn.send_line(status_line(state_word), now);
            self.publish_own_values(block, id, now);
            self.announce_peer(block, id, now);
            info!(conn = id.0, login = %login, "client logged in");
            Ok(Disposition::Ok)
        } else {
            conn.set_authorized(false);
            warn!(conn = id.0, login = %login, "rejected client password");
            // The reply is held back to slow down repeat attacks.
            self.delayed.push((
                now + AUTH_FAIL_DELAY,
                id,
                Completion::error(ERR_SYSTEM, "invalid login or password"),
            ));
            Ok(Disposition::Deferred)
        }
    }

    fn cmd_register(
        &mut self,
        block: &mut Block,
        id: ConnId,
        params: &mut Params,
        now: Instant,
    ) -> Handled {
        let name = params.next_str("device name").map_err(param_err)?;
        let type_tag = params.next_u16("device type").map_err(param_err)?;
        let host = params.next_str("host").map_err(param_err)?;
        let port = params.next_u16("port").map_err(param_err)?;
        params.end("register").map_err(param_err)?;

        let device_type = DeviceType::from_u16(type_tag).map_err(param_err)?;
        {
            let conn = block.get(id).ok_or_else(gone)?;
            if conn.role() != PeerRole::Undefined {
                return Err((ERR_COMMAND, "cannot switch peer type to device".to_string()));
            }
        }
        if block.name_in_use(&name) {
            return Err((ERR_SYSTEM, "name already registered".to_string()));
        }

        let state_word = self.state;
        let holder = block.priority_client();
        {
            let conn = block.get_mut(id).expect("checked above");
            conn.identify_device(&name, device_type, &host, port);
            conn.send_line(status_line(state_word), now);
            if let Some(holder) = holder {
                conn.send_line(format!("PRIORITY {} 0", holder.0), now);
            }
            conn.send_line(format!("registered_as {}", id.0), now);
        }
        block.add_address(
            &name,
            skycore::Address { host: host.clone(), port, device_type },
        );
        self.handlers.insert(id, DeviceHandler::for_type(device_type));

        self.publish_own_values(block, id, now);
        self.announce_peer(block, id, now);
        info!(conn = id.0, device = %name, ty = device_type.as_str(), "device registered");
        Ok(Disposition::Ok)
    }

    // --- info listing -----------------------------------------------------

    fn cmd_info(&mut self, block: &mut Block, id: ConnId, now: Instant) -> Handled {
        {
            let conn = block.get(id).ok_or_else(gone)?;
            if conn.role() == PeerRole::Client && !conn.is_authorized() {
                return Err((ERR_SYSTEM, "not authorized".to_string()));
            }
        }
        let lines: Vec<String> = block.iter().filter_map(peer_info_line).collect();
        let conn = block.get_mut(id).expect("checked above");
        for line in lines {
            conn.send_line(line, now);
        }
        for value in &self.own_values {
            conn.send_line(value_line(value.name, &value.data), now);
        }
        Ok(Disposition::Ok)
    }

    // --- priority ---------------------------------------------------------

    fn cmd_priority(
        &mut self,
        block: &mut Block,
        id: ConnId,
        name: &str,
        params: &mut Params,
        now: Instant,
    ) -> Handled {
        let value = params.next_i32("priority").map_err(param_err)?;
        let timeout = if name == "prioritydeferred" {
            let secs = params.next_i64("timeout").map_err(param_err)?;
            Utc::now().timestamp() + secs
        } else {
            0
        };
        params.end("priority").map_err(param_err)?;

        {
            let conn = block.get_mut(id).ok_or_else(gone)?;
            if conn.role() == PeerRole::Client && !conn.is_authorized() {
                return Err((ERR_PRIORITY, "not authorized".to_string()));
            }
            conn.set_priority(value);
        }
        self.change_priority(block, timeout, now);
        Ok(Disposition::Ok)
    }

    /// Re-arbitrate who holds priority and broadcast the result.
    ///
    /// Highest priority value wins; ties keep the incumbent when it is still
    /// present. A holder change clears the old flag, sets the new one, and
    /// every connection hears `PRIORITY <id> <timeout>`.
    pub fn change_priority(&mut self, block: &mut Block, timeout: i64, now: Instant) {
        let mut new_holder: Option<ConnId> = None;
        let mut new_max = 0;

        // Incumbent keeps the slot on ties.
        if let Some(cur) = block.priority_client() {
            if let Some(conn) = block.get(cur) {
                new_holder = Some(cur);
                new_max = conn.priority();
            }
        }
        for conn in block.iter() {
            if conn.priority() > new_max {
                new_holder = Some(conn.id());
                new_max = conn.priority();
            }
        }

        if block.priority_client() != new_holder {
            if let Some(old) = block.priority_client() {
                if let Some(conn) = block.get_mut(old) {
                    conn.set_have_priority(false);
                }
            }
            if let Some(new) = new_holder {
                if let Some(conn) = block.get_mut(new) {
                    conn.set_have_priority(true);
                }
            }
            block.set_priority_client(new_holder);
            info!(
                holder = new_holder.map(|c| c.0),
                priority = new_max,
                "priority holder changed"
            );
        }

        let holder_num = new_holder.map(|c| c.0 as i64).unwrap_or(-1);
        block.send_all(&format!("PRIORITY {holder_num} {timeout}"), now);

        let holder_label = new_holder
            .and_then(|h| block.get(h))
            .map(|c| c.label().to_string())
            .unwrap_or_else(|| "(null)".to_string());
        self.set_own_value(block, "priority_client", ValueData::Text(holder_label), now);
        self.set_own_value(block, "priority", ValueData::Integer(new_max as i64), now);
    }

    // --- device keys ------------------------------------------------------

    fn cmd_key(&mut self, block: &mut Block, id: ConnId, params: &mut Params, now: Instant) -> Handled {
        let device = params.next_str("device name").map_err(param_err)?;
        params.end("key").map_err(param_err)?;
        if block.find_by_name(&device).is_none() {
            return Err((ERR_SYSTEM, "cannot find device with name".to_string()));
        }
        let key = self.next_key();
        let conn = block.get_mut(id).ok_or_else(gone)?;
        conn.set_auth_key(key);
        conn.send_line(format!("authorization_key {device} {key}"), now);
        Ok(Disposition::Ok)
    }

    fn cmd_authorize(
        &mut self,
        block: &mut Block,
        id: ConnId,
        params: &mut Params,
        now: Instant,
    ) -> Handled {
        let client_num = params.next_u32("client id").map_err(param_err)?;
        let key = params.next_u32("key").map_err(param_err)?;
        params.end("authorize").map_err(param_err)?;

        let client_id = ConnId(client_num);
        let client_key = match block.get(client_id) {
            // Client vanished while the device processed our data.
            None => {
                return Err((ERR_SYSTEM, "client vanished during auth sequence".to_string()))
            }
            Some(client) => client.auth_key(),
        };

        let verdict = match client_key {
            None => Err("client didn't ask for authorization"),
            Some(expected) if expected != key => Err("invalid authorization key"),
            Some(_) => Ok(()),
        };

        let conn = block.get_mut(id).ok_or_else(gone)?;
        match verdict {
            Ok(()) => {
                conn.send_line(format!("authorization_ok {client_num}"), now);
                Ok(Disposition::Ok)
            }
            Err(reason) => {
                conn.send_line(format!("authorization_failed {client_num}"), now);
                Err((ERR_KEY, reason.to_string()))
            }
        }
    }

    fn next_key(&mut self) -> u32 {
        self.key_seed = self.key_seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        self.key_seed.max(1)
    }

    // --- status fan-out ---------------------------------------------------

    /// A peer asked for a fresh aggregated status: scatter a status query to
    /// every other non-client connection, gather completions in any order,
    /// and only then answer the requester.
    fn cmd_status_info(&mut self, block: &mut Block, id: ConnId, now: Instant) -> Handled {
        let requester_role = block.get(id).ok_or_else(gone)?.role();
        let requester_name = block.get(id).and_then(|c| c.name().map(String::from));

        let mut targets = Vec::new();
        for conn in block.iter() {
            if conn.id() == id || conn.role() != PeerRole::Device {
                continue;
            }
            if requester_role == PeerRole::Device {
                // A device only waits on devices configured to block it.
                let requester = requester_name.as_deref().unwrap_or("");
                let target = conn.name().unwrap_or("");
                if !self.config.blocks(requester, target) {
                    continue;
                }
            }
            targets.push(conn.id());
        }

        if targets.is_empty() {
            self.finish_status_info(block, id, now);
            return Ok(Disposition::Deferred);
        }

        for target in &targets {
            if let Some(conn) = block.get_mut(*target) {
                conn.queue_command(
                    Command::new("status_info")
                        .with_kind(CommandKind::StatusQuery { requester: id })
                        .with_originator(id),
                );
            }
        }
        *self.status_pending.entry(id).or_insert(0) += 1;
        debug!(conn = id.0, targets = targets.len(), "status_info scatter");
        Ok(Disposition::Deferred)
    }

    /// Check whether a requester's gather is complete and, if so, answer it.
    /// The gather condition: no connection still holds a command with this
    /// requester as originator.
    fn update_status_wait(&mut self, block: &mut Block, requester: ConnId, now: Instant) {
        loop {
            match self.status_pending.get(&requester) {
                None | Some(0) => return,
                Some(_) => {}
            }
            if block.originator_pending(requester, None) {
                return;
            }
            self.finish_status_info(block, requester, now);
            let count = self.status_pending.get_mut(&requester).expect("checked");
            *count -= 1;
            if *count == 0 {
                self.status_pending.remove(&requester);
            }
        }
    }

    fn update_status_wait_all(&mut self, block: &mut Block, now: Instant) {
        let requesters: Vec<ConnId> = self.status_pending.keys().copied().collect();
        for requester in requesters {
            self.update_status_wait(block, requester, now);
        }
    }

    fn finish_status_info(&mut self, block: &mut Block, requester: ConnId, now: Instant) {
        let state = self.state;
        let bop = self.state_for_connection(block, requester);
        if let Some(conn) = block.get_mut(requester) {
            conn.send_line(status_line(state), now);
            conn.send_line(format!("BOP {bop}"), now);
            conn.send_completion(&Completion::ok(), now);
        }
    }

    // --- completions from peers -------------------------------------------

    fn completion_received(
        &mut self,
        block: &mut Block,
        id: ConnId,
        completion: &Completion,
        now: Instant,
    ) {
        let Some(conn) = block.get_mut(id) else { return };
        let Some(cmd) = conn.completion_received(completion) else {
            return;
        };
        let kind = cmd.kind();
        let outcome = Command::default_outcome(completion);
        conn.apply_outcome(cmd, outcome);

        if let CommandKind::StatusQuery { requester } = kind {
            if outcome == Outcome::Done {
                self.update_status_wait(block, requester, now);
            }
        }
    }

    // --- peer state + BOP aggregation -------------------------------------

    fn proto_state(&mut self, block: &mut Block, id: ConnId, params: &mut Params, now: Instant) -> Handled {
        let word = params.next_u32("state").map_err(param_err)?;
        params.end("S").map_err(param_err)?;
        let conn = block.get_mut(id).ok_or_else(gone)?;
        let old = conn.remote_state();
        conn.set_remote_state(word);
        if let Some(handler) = self.handlers.get_mut(&id) {
            let conn = block.get(id).expect("present");
            handler.state_changed(conn, old, word);
        }
        if (old ^ word) & BOP_MASK != 0 {
            self.bop_mask_changed(block, now);
        }
        Ok(Disposition::Silent)
    }

    /// Re-broadcast a peer's log message to every connection whose message
    /// mask admits the level.
    fn proto_message(&mut self, block: &mut Block, id: ConnId, params: &mut Params, now: Instant) -> Handled {
        let level_bit = params.next_u32("level").map_err(param_err)?;
        let origin = params.next_str("origin").map_err(param_err)?;
        let text = params.next_str("text").map_err(param_err)?;
        params.end("M").map_err(param_err)?;
        let Some(level) = MessageLevel::from_mask_bit(level_bit) else {
            return Err((ERR_PARAMS, format!("unknown message level {level_bit}")));
        };

        let line = message_line(level, &origin, &text);
        let targets: Vec<ConnId> = block
            .iter()
            .filter(|c| c.id() != id && c.message_mask() & level.as_u32() != 0)
            .map(|c| c.id())
            .collect();
        for target in targets {
            if let Some(conn) = block.get_mut(target) {
                conn.send_line(line.clone(), now);
            }
        }
        Ok(Disposition::Silent)
    }

    /// Recompute the global BOP word (OR of every device's bits), and when it
    /// changed: update the state word, re-evaluate gated commands, broadcast
    /// the new state, and send each device its blocking-table-filtered word.
    pub fn bop_mask_changed(&mut self, block: &mut Block, now: Instant) {
        let mut bop = 0;
        for conn in block.iter() {
            bop |= conn.bop_state();
        }
        let changed = (self.state & BOP_MASK) != bop;
        self.state = (self.state & !BOP_MASK) | bop;
        if changed {
            info!(bop = %format!("{bop:#010x}"), "global BOP word changed");
        }
        self.broadcast_status(block, now);
        self.sweep_queues(block, now);
    }

    /// The state word as seen by one connection: clients get the full word,
    /// devices get BOP bits only from devices configured to block them.
    pub fn state_for_connection(&self, block: &Block, id: ConnId) -> u32 {
        let Some(conn) = block.get(id) else { return self.state };
        if conn.role() != PeerRole::Device {
            return self.state;
        }
        let requester = conn.name().unwrap_or("");
        let mut word = self.state & !BOP_MASK & !ERROR_MASK;
        for other in block.iter() {
            let Some(other_name) = other.name() else { continue };
            if self.config.blocks(requester, other_name) {
                word |= other.bop_state();
            }
        }
        word
    }

    fn broadcast_status(&mut self, block: &mut Block, now: Instant) {
        block.send_all(&status_line(self.state), now);
        let devices: Vec<ConnId> = block
            .iter()
            .filter(|c| c.role() == PeerRole::Device)
            .map(|c| c.id())
            .collect();
        for id in devices {
            let word = self.state_for_connection(block, id);
            if let Some(conn) = block.get_mut(id) {
                conn.send_line(format!("BOP {word}"), now);
            }
        }
    }

    // --- state machine ----------------------------------------------------

    fn cmd_switch(&mut self, block: &mut Block, id: ConnId, name: &str, now: Instant) -> Handled {
        let conn = block.get(id).ok_or_else(gone)?;
        if conn.role() == PeerRole::Client && !conn.is_authorized() {
            return Err((ERR_SYSTEM, "not authorized".to_string()));
        }
        let who = conn.label().to_string();
        let current = self
            .next_event
            .as_ref()
            .map(|ev| ev.current)
            .unwrap_or(Period::Day);
        let new_word = match name {
            "on" => current as u32,
            "standby" => STATE_STANDBY | current as u32,
            "off" => STATE_OFF,
            _ => unreachable!("matched above"),
        };
        self.change_state(block, new_word, &who, now);
        Ok(Disposition::Ok)
    }

    /// Switch the period/standby/off part of the state word and broadcast.
    pub fn change_state(&mut self, block: &mut Block, new_word: u32, who: &str, now: Instant) {
        let overlay = self.state & (BOP_MASK | ERROR_MASK);
        let new_state = overlay | (new_word & !(BOP_MASK | ERROR_MASK));
        if new_state == self.state {
            return;
        }
        info!(
            from = %state::describe(self.state),
            to = %state::describe(new_state),
            by = who,
            "state switched"
        );
        self.state = new_state;
        self.broadcast_status(block, now);
        self.sweep_queues(block, now);
    }

    /// Time-driven period transitions, evaluated from the idle sweep.
    fn poll_state_machine(&mut self, block: &mut Block, wall: DateTime<Utc>, now: Instant) {
        if state::is_off(self.state) {
            return;
        }
        let due = self.next_event.as_ref().is_none_or(|ev| wall >= ev.at);
        if !due {
            return;
        }
        let ev = ephem::next_event(&self.config.site, &self.config.horizons, wall);
        let old_period = state::period_of(self.state);
        let standby = self.state & STATE_STANDBY;

        let new_word = if old_period == Some(Period::Morning) && ev.current == Period::Day {
            // The configured morning behavior decides how the day begins.
            if self.config.arbiter.morning_off {
                STATE_OFF
            } else if self.config.arbiter.morning_standby {
                STATE_STANDBY | ev.current as u32
            } else {
                standby | ev.current as u32
            }
        } else {
            standby | ev.current as u32
        };
        self.change_state(block, new_word, "idle routine", now);
        self.refresh_state_values(&ev);
        self.broadcast_own_value(block, "next_state", now);
        self.broadcast_own_value(block, "next_state_change", now);
        self.next_event = Some(ev);
    }

    fn refresh_state_values(&mut self, ev: &NextEvent) {
        self.set_own_data("next_state", ValueData::Selection(ev.next as u32));
        self.set_own_data("next_state_change", ValueData::Time(ev.at.timestamp() as f64));
    }

    // --- values -----------------------------------------------------------

    fn proto_metainfo(&mut self, block: &mut Block, id: ConnId, params: &mut Params) -> Handled {
        let type_word = TypeWord(params.next_u32("type word").map_err(param_err)?);
        let name = params.next_str("value name").map_err(param_err)?;
        let description = params.next_str("description").map_err(param_err)?;
        params.end("metainfo").map_err(param_err)?;
        let conn = block.get_mut(id).ok_or_else(gone)?;
        conn.values_mut()
            .declare(type_word, &name, &description)
            .map_err(param_err)?;
        Ok(Disposition::Silent)
    }

    fn proto_selmetainfo(&mut self, block: &mut Block, id: ConnId, params: &mut Params) -> Handled {
        let name = params.next_str("value name").map_err(param_err)?;
        let label = params.next_str("label").map_err(param_err)?;
        params.end("selmetainfo").map_err(param_err)?;
        let conn = block.get_mut(id).ok_or_else(gone)?;
        conn.values_mut().add_label(&name, &label).map_err(|_| {
            (ERR_UNKNOWN_VALUE, format!("unknown value {name:?}"))
        })?;
        Ok(Disposition::Silent)
    }

    fn proto_value(&mut self, block: &mut Block, id: ConnId, params: &mut Params) -> Handled {
        let name = params.next_str("value name").map_err(param_err)?;
        let conn = block.get_mut(id).ok_or_else(gone)?;
        if !conn.values().contains(&name) {
            return Err((ERR_UNKNOWN_VALUE, format!("unknown value {name:?}")));
        }
        conn.values_mut()
            .update_from_wire(&name, params)
            .map_err(param_err)?;
        if let Some(handler) = self.handlers.get_mut(&id) {
            let conn = block.get(id).expect("present");
            handler.value_changed(conn, &name);
        }
        Ok(Disposition::Silent)
    }

    /// A peer asks to change one of the arbiter's own values.
    fn cmd_set_value(&mut self, block: &mut Block, id: ConnId, params: &mut Params, now: Instant) -> Handled {
        let name = params.next_str("value name").map_err(param_err)?;
        let op = SetOp::parse(&params.next_str("operator").map_err(param_err)?).map_err(param_err)?;

        let Some(idx) = self.own_values.iter().position(|v| v.name == name) else {
            return Err((ERR_UNKNOWN_VALUE, format!("unknown value {name:?}")));
        };
        if !self.own_values[idx].type_word.is_writable() {
            return Err((ERR_SYSTEM, format!("value {name:?} is not writable")));
        }
        let kind = self.own_values[idx].type_word.kind().map_err(param_err)?;
        let operand = ValueData::parse(kind, params).map_err(param_err)?;
        params.end("set_value").map_err(param_err)?;

        let next = op
            .apply(&self.own_values[idx].data, operand)
            .map_err(param_err)?;
        let name_static = self.own_values[idx].name;
        self.apply_own_side_effects(name_static, &next);
        self.set_own_value(block, name_static, next, now);
        Ok(Disposition::Ok)
    }

    /// Writable arbiter values that feed back into config.
    fn apply_own_side_effects(&mut self, name: &str, data: &ValueData) {
        if let ValueData::Boolean(b) = data {
            match name {
                "morning_off" => self.config.arbiter.morning_off = *b,
                "morning_standby" => self.config.arbiter.morning_standby = *b,
                _ => {}
            }
        }
    }

    fn set_own_data(&mut self, name: &str, data: ValueData) {
        if let Some(v) = self.own_values.iter_mut().find(|v| v.name == name) {
            v.data = data;
        }
    }

    fn set_own_value(&mut self, block: &mut Block, name: &str, data: ValueData, now: Instant) {
        self.set_own_data(name, data);
        self.broadcast_own_value(block, name, now);
    }

    fn broadcast_own_value(&mut self, block: &mut Block, name: &str, now: Instant) {
        if let Some(v) = self.own_values.iter().find(|v| v.name == name) {
            block.send_value_all(v.name, &v.data, now);
        }
    }

    /// Mirror every arbiter value to a freshly registered peer.
    fn publish_own_values(&self, block: &mut Block, id: ConnId, now: Instant) {
        let Some(conn) = block.get_mut(id) else { return };
        for v in &self.own_values {
            conn.send_line(metainfo_line(v.type_word, v.name, v.description), now);
            for label in &v.labels {
                conn.send_line(selmetainfo_line(v.name, label), now);
            }
            conn.send_line(value_line(v.name, &v.data), now);
        }
    }

    // --- peer announcements -----------------------------------------------

    /// Tell everyone about a new peer, and the new peer about everyone.
    fn announce_peer(&self, block: &mut Block, new_id: ConnId, now: Instant) {
        let new_line = block.get(new_id).and_then(peer_info_line);
        let existing: Vec<(ConnId, Option<String>)> = block
            .iter()
            .filter(|c| c.id() != new_id)
            .map(|c| (c.id(), peer_info_line(c)))
            .collect();

        for (other_id, info) in &existing {
            if let (Some(line), Some(conn)) = (&new_line, block.get_mut(*other_id)) {
                conn.send_line(line.clone(), now);
            }
            if let (Some(line), Some(conn)) = (info, block.get_mut(new_id)) {
                conn.send_line(line.clone(), now);
            }
        }
    }

    // --- connection teardown ----------------------------------------------

    /// Tear down one connection: re-arbitrate priority first if it was the
    /// holder, run every queued command's loss path exactly once, clear
    /// dangling originator ids, re-aggregate BOP, and unblock any stalled
    /// status gathers.
    pub fn remove_connection(&mut self, block: &mut Block, id: ConnId, now: Instant) {
        let Some(conn) = block.get_mut(id) else { return };
        let label = conn.label().to_string();
        let was_holder = conn.have_priority();
        conn.set_priority(-1);
        conn.set_have_priority(false);

        if was_holder {
            // Re-arbitration happens before the removal completes.
            block.set_priority_client(None);
            self.change_priority(block, 0, now);
        }

        match block.delete_connection(id) {
            Ok(mut conn) => {
                let lost = conn.drain_commands();
                let mut stalled_requesters = Vec::new();
                for cmd in &lost {
                    if let CommandKind::StatusQuery { requester } = cmd.kind() {
                        stalled_requesters.push(requester);
                    }
                }
                info!(conn = id.0, peer = %label, commands_lost = lost.len(), "connection torn down");
                for requester in stalled_requesters {
                    self.update_status_wait(block, requester, now);
                }
            }
            Err(e) => {
                warn!(conn = id.0, error = %e, "connection removal refused");
                return;
            }
        }

        self.handlers.remove(&id);
        self.status_pending.remove(&id);
        block.clear_originator_refs(id);
        self.bop_mask_changed(block, now);
        // Make sure the departed peer is not the last one blocking a gather.
        self.update_status_wait_all(block, now);
    }

    // --- idle sweep -------------------------------------------------------

    /// The periodic housekeeping pass: delayed completions, keepalive, the
    /// time-driven state machine, and queue re-evaluation.
    pub fn idle(&mut self, block: &mut Block, now: Instant, wall: DateTime<Utc>) {
        // Due delayed completions.
        let due: Vec<(ConnId, Completion)> = {
            let mut kept = Vec::new();
            let mut fired = Vec::new();
            for (at, id, completion) in self.delayed.drain(..) {
                if at <= now {
                    fired.push((id, completion));
                } else {
                    kept.push((at, id, completion));
                }
            }
            self.delayed = kept;
            fired
        };
        for (id, completion) in due {
            if let Some(conn) = block.get_mut(id) {
                conn.send_completion(&completion, now);
            }
        }

        // Keepalive: probe the quiet, drop the dead.
        let mut dead = Vec::new();
        for conn in block.iter_mut() {
            match conn.keepalive(now, &self.keepalive) {
                KeepaliveAction::None => {}
                KeepaliveAction::Probe => conn.probe(now),
                KeepaliveAction::Dead => dead.push(conn.id()),
            }
        }
        for id in dead {
            warn!(conn = id.0, "peer timed out");
            self.remove_connection(block, id, now);
        }

        self.poll_state_machine(block, wall, now);
        self.sweep_queues(block, now);
    }

    /// Advance every connection's command queue against the current BOP word.
    fn sweep_queues(&mut self, block: &mut Block, now: Instant) {
        let global_bop = self.state & BOP_MASK;
        for conn in block.iter_mut() {
            if conn.advance_queue(global_bop, now) == Advance::NeedStatusQuery {
                // The arbiter holds the authoritative status; a snapshot is
                // complete by definition here.
                conn.head_snapshot_complete();
                conn.advance_queue(global_bop, now);
            }
        }
    }

    // --- small helpers ----------------------------------------------------

    fn send_error(&mut self, block: &mut Block, id: ConnId, code: i32, message: &str, now: Instant) {
        if let Some(conn) = block.get_mut(id) {
            conn.send_completion(&Completion::error(code, message), now);
        }
    }
}

fn status_line(state: u32) -> String {
    format!("S {state}")
}

/// The `info` listing line for one peer, once identified.
fn peer_info_line(conn: &skycore::Connection) -> Option<String> {
    match conn.role() {
        PeerRole::Client => Some(
            LineBuilder::new("user")
                .arg(conn.id().0)
                .arg(conn.priority())
                .arg(if conn.have_priority() { '*' } else { '-' })
                .arg(conn.login().unwrap_or("?"))
                .finish(),
        ),
        PeerRole::Device => Some(
            LineBuilder::new("device")
                .arg(conn.id().0)
                .arg(conn.name().unwrap_or("?"))
                .arg(conn.host().unwrap_or("?"))
                .arg(conn.port().unwrap_or(0))
                .arg(conn.device_type().unwrap_or(DeviceType::Generic).as_u16())
                .finish(),
        ),
        PeerRole::Undefined => None,
    }
}

fn param_err(e: ProtoError) -> (i32, String) {
    (ERR_PARAMS, e.to_string())
}

fn gone() -> (i32, String) {
    (ERR_SYSTEM, "connection gone".to_string())
}

fn build_own_values(config: &SkyConfig) -> Vec<OwnValue> {
    let period_labels: Vec<String> = [
        Period::Day,
        Period::Evening,
        Period::Dusk,
        Period::Night,
        Period::Dawn,
        Period::Morning,
    ]
    .iter()
    .map(|p| p.as_str().to_string())
    .collect();

    vec![
        OwnValue {
            name: "morning_off",
            type_word: TypeWord::new(ValueKind::Boolean).writable(),
            description: "switch to off at the morning",
            labels: Vec::new(),
            data: ValueData::Boolean(config.arbiter.morning_off),
        },
        OwnValue {
            name: "morning_standby",
            type_word: TypeWord::new(ValueKind::Boolean).writable(),
            description: "switch to standby at the morning",
            labels: Vec::new(),
            data: ValueData::Boolean(config.arbiter.morning_standby),
        },
        OwnValue {
            name: "priority_client",
            type_word: TypeWord::new(ValueKind::Text),
            description: "client which has priority",
            labels: Vec::new(),
            data: ValueData::Text("(null)".to_string()),
        },
        OwnValue {
            name: "priority",
            type_word: TypeWord::new(ValueKind::Integer),
            description: "current priority level",
            labels: Vec::new(),
            data: ValueData::Integer(0),
        },
        OwnValue {
            name: "next_state_change",
            type_word: TypeWord::new(ValueKind::Time),
            description: "time of next state change",
            labels: Vec::new(),
            data: ValueData::Time(f64::NAN),
        },
        OwnValue {
            name: "next_state",
            type_word: TypeWord::new(ValueKind::Selection),
            description: "next server state",
            labels: period_labels,
            data: ValueData::Selection(0),
        },
        OwnValue {
            name: "longitude",
            type_word: TypeWord::new(ValueKind::Double),
            description: "observatory longitude",
            labels: Vec::new(),
            data: ValueData::Double(config.site.longitude),
        },
        OwnValue {
            name: "latitude",
            type_word: TypeWord::new(ValueKind::Double),
            description: "observatory latitude",
            labels: Vec::new(),
            data: ValueData::Double(config.site.latitude),
        },
        OwnValue {
            name: "night_horizon",
            type_word: TypeWord::new(ValueKind::Double),
            description: "observatory night horizon",
            labels: Vec::new(),
            data: ValueData::Double(config.horizons.night_deg),
        },
        OwnValue {
            name: "day_horizon",
            type_word: TypeWord::new(ValueKind::Double),
            description: "observatory day horizon",
            labels: Vec::new(),
            data: ValueData::Double(config.horizons.day_deg),
        },
        OwnValue {
            name: "evening_time",
            type_word: TypeWord::new(ValueKind::Integer),
            description: "time needed to cool down cameras",
            labels: Vec::new(),
            data: ValueData::Integer(config.horizons.evening_secs),
        },
        OwnValue {
            name: "morning_time",
            type_word: TypeWord::new(ValueKind::Integer),
            description: "time needed to heat up cameras",
            labels: Vec::new(),
            data: ValueData::Integer(config.horizons.morning_secs),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_generation_nonzero_and_varying() {
        let mut arbiter = Arbiter::new(SkyConfig::default());
        let a = arbiter.next_key();
        let b = arbiter.next_key();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn own_values_cover_published_state() {
        let arbiter = Arbiter::new(SkyConfig::default());
        let names: Vec<_> = arbiter.own_values.iter().map(|v| v.name).collect();
        for expected in ["priority_client", "priority", "next_state", "morning_off"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        let next_state = arbiter
            .own_values
            .iter()
            .find(|v| v.name == "next_state")
            .unwrap();
        assert_eq!(next_state.labels.len(), 6);
    }
}
