//! One peer: socket-side state machine, command queue, mirrored values.
//!
//! A `Connection` owns everything known about a single peer: its place in
//! the life-cycle, its identity once the handshake names it, the FIFO of
//! pending commands with the single running command, a mirror of the values
//! it has declared, liveness clocks, and the incremental wire decoder for its
//! inbound bytes. Outbound traffic is staged in an outbox of frames that the
//! owning reactor drains to the socket writer; tests read the outbox
//! directly, no socket required.
//!
//! Invariants: at most one command is in flight at any time; the queue is
//! strict FIFO with front insertion as the only reordering primitive; a
//! completion line is matched against the running command only.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use skyproto::state::BOP_MASK;
use skyproto::wire::{binary_open_line, data_header_line};
use skyproto::{Completion, DeviceType, ProtoError, WireEvent, WireReader};

use crate::command::{Command, Outcome, SendAction};
use crate::keepalive::{KeepaliveAction, KeepaliveClock, KeepaliveConfig};
use crate::value_store::ValueStore;
use crate::ConnId;

/// Connection life-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted but nothing known yet.
    Unknown,
    /// Outbound connect in progress.
    Connecting,
    /// Socket up, handshake not finished.
    Connected,
    /// Client sent `login`, password outstanding.
    AuthPending,
    /// Handshake complete; normal operation.
    AuthOk,
    /// Credentials rejected.
    AuthFailed,
    /// Marked for reaping by the owning Block on the next pass.
    Delete,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Unknown => "unknown",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::AuthPending => "auth-pending",
            ConnState::AuthOk => "auth-ok",
            ConnState::AuthFailed => "auth-failed",
            ConnState::Delete => "delete",
        }
    }
}

/// What kind of peer identified itself on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Nothing identified yet.
    Undefined,
    /// A registered device daemon.
    Device,
    /// A logged-in (or logging-in) client.
    Client,
}

/// One staged outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutFrame {
    Line(String),
    Raw(Bytes),
}

/// Result of one attempt to advance the command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Queue empty, nothing to do.
    Idle,
    /// A command is already in flight.
    Busy,
    /// The head command was written and is now running.
    Transmitted,
    /// The head command is gated by BOP bits; re-evaluated on the next event.
    Blocked,
    /// The head command needs a status snapshot fanned out first.
    NeedStatusQuery,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    state: ConnState,
    role: PeerRole,
    /// Device name from `register`.
    name: Option<String>,
    /// Client login from `login`.
    login: Option<String>,
    device_type: Option<DeviceType>,
    host: Option<String>,
    port: Option<u16>,
    /// Password accepted (clients only).
    authorized: bool,
    /// One-time key issued for the device `authorize` flow.
    auth_key: Option<u32>,
    /// Requested priority level; negative means none.
    priority: i32,
    have_priority: bool,
    /// Message levels this peer wants fanned out to it.
    message_mask: u32,
    /// Peer's last reported state word, including its BOP bits.
    remote_state: u32,
    queue: VecDeque<Command>,
    running: Option<Command>,
    values: ValueStore,
    outbox: VecDeque<OutFrame>,
    reader: WireReader,
    clock: KeepaliveClock,
}

impl Connection {
    /// A connection accepted on the listening socket.
    pub fn accepted(id: ConnId, now: Instant) -> Self {
        Self::with_state(id, ConnState::Connected, now)
    }

    /// An outbound connection not yet established.
    pub fn connecting(id: ConnId, now: Instant) -> Self {
        Self::with_state(id, ConnState::Connecting, now)
    }

    fn with_state(id: ConnId, state: ConnState, now: Instant) -> Self {
        Self {
            id,
            state,
            role: PeerRole::Undefined,
            name: None,
            login: None,
            device_type: None,
            host: None,
            port: None,
            authorized: false,
            auth_key: None,
            priority: -1,
            have_priority: false,
            message_mask: 0,
            remote_state: 0,
            queue: VecDeque::new(),
            running: None,
            values: ValueStore::new(),
            outbox: VecDeque::new(),
            reader: WireReader::new(),
            clock: KeepaliveClock::new(now),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub fn mark_delete(&mut self) {
        self.state = ConnState::Delete;
    }

    pub fn is_delete(&self) -> bool {
        self.state == ConnState::Delete
    }

    /// A connection holding priority must not be reaped until priority has
    /// been reassigned.
    pub fn deletable(&self) -> bool {
        !self.have_priority
    }

    // --- identity ---------------------------------------------------------

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Record a device `register` handshake.
    pub fn identify_device(&mut self, name: &str, ty: DeviceType, host: &str, port: u16) {
        self.role = PeerRole::Device;
        self.name = Some(name.to_string());
        self.device_type = Some(ty);
        self.host = Some(host.to_string());
        self.port = Some(port);
        self.state = ConnState::AuthOk;
    }

    /// Record a client `login`; the password is still outstanding.
    pub fn identify_client(&mut self, login: &str) {
        self.role = PeerRole::Client;
        self.login = Some(login.to_string());
        self.state = ConnState::AuthPending;
    }

    /// Password verdict for a client connection.
    pub fn set_authorized(&mut self, ok: bool) {
        self.authorized = ok;
        self.state = if ok { ConnState::AuthOk } else { ConnState::AuthFailed };
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    /// Whatever identifies this peer best, for logs.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.login.as_deref())
            .unwrap_or("(unidentified)")
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        self.device_type
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn auth_key(&self) -> Option<u32> {
        self.auth_key
    }

    pub fn set_auth_key(&mut self, key: u32) {
        self.auth_key = Some(key);
    }

    pub fn message_mask(&self) -> u32 {
        self.message_mask
    }

    pub fn set_message_mask(&mut self, mask: u32) {
        self.message_mask = mask;
    }

    // --- priority ---------------------------------------------------------

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn have_priority(&self) -> bool {
        self.have_priority
    }

    pub fn set_have_priority(&mut self, have: bool) {
        self.have_priority = have;
    }

    // --- peer state word --------------------------------------------------

    pub fn remote_state(&self) -> u32 {
        self.remote_state
    }

    pub fn set_remote_state(&mut self, word: u32) {
        self.remote_state = word;
    }

    /// The peer's currently asserted BOP bits.
    pub fn bop_state(&self) -> u32 {
        self.remote_state & BOP_MASK
    }

    // --- values -----------------------------------------------------------

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueStore {
        &mut self.values
    }

    // --- outbound ---------------------------------------------------------

    /// Stage one line for transmission.
    pub fn send_line(&mut self, line: impl Into<String>, now: Instant) {
        let mut line = line.into();
        line.push('\n');
        self.outbox.push_back(OutFrame::Line(line));
        self.clock.sent(now);
    }

    pub fn send_completion(&mut self, completion: &Completion, now: Instant) {
        self.send_line(completion.to_line(), now);
    }

    /// Stage a whole binary channel: header, one data chunk, payload.
    pub fn send_binary(&mut self, chan: u16, data_type: u16, payload: Bytes, now: Instant) {
        self.send_line(binary_open_line(chan, payload.len() as u64, data_type), now);
        self.send_line(data_header_line(chan, payload.len()), now);
        self.outbox.push_back(OutFrame::Raw(payload));
    }

    /// Drain staged frames for the socket writer.
    pub fn take_outbox(&mut self) -> Vec<OutFrame> {
        self.outbox.drain(..).collect()
    }

    /// Test helper: staged lines, without draining raw frames.
    pub fn staged_lines(&self) -> Vec<&str> {
        self.outbox
            .iter()
            .filter_map(|f| match f {
                OutFrame::Line(l) => Some(l.trim_end_matches('\n')),
                OutFrame::Raw(_) => None,
            })
            .collect()
    }

    // --- inbound ----------------------------------------------------------

    /// Append received bytes and refresh the liveness clock.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) {
        self.reader.feed(bytes);
        self.clock.received(now);
    }

    /// Next decoded protocol element, if a full one is buffered.
    pub fn next_event(&mut self) -> Result<Option<WireEvent>, ProtoError> {
        self.reader.next_event()
    }

    // --- command queue ----------------------------------------------------

    /// Append a command in submission order.
    pub fn queue_command(&mut self, cmd: Command) {
        self.queue.push_back(cmd);
    }

    /// Insert ahead of everything queued; used by liveness and management
    /// commands to preempt ordinary domain commands.
    pub fn queue_front(&mut self, cmd: Command) {
        self.queue.push_front(cmd);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> Option<&Command> {
        self.running.as_ref()
    }

    pub fn has_running(&self) -> bool {
        self.running.is_some()
    }

    /// Try to move the head command onto the wire.
    ///
    /// The BOP gate is evaluated here, immediately before the write, never
    /// earlier. Strict FIFO: a gated head blocks everything behind it.
    pub fn advance_queue(&mut self, global_bop: u32, now: Instant) -> Advance {
        if self.running.is_some() {
            return Advance::Busy;
        }
        let Some(head) = self.queue.front_mut() else {
            return Advance::Idle;
        };
        match head.poll_send(global_bop) {
            SendAction::Transmit => {
                let cmd = self.queue.pop_front().expect("head exists");
                debug!(conn = self.id.0, command = cmd.text(), "transmitting command");
                self.send_line(cmd.text().to_string(), now);
                self.running = Some(cmd);
                Advance::Transmitted
            }
            SendAction::QueryStatus => Advance::NeedStatusQuery,
            SendAction::Defer => Advance::Blocked,
        }
    }

    /// The status snapshot for the head command finished collecting.
    pub fn head_snapshot_complete(&mut self) {
        if let Some(head) = self.queue.front_mut() {
            head.snapshot_complete();
        }
    }

    /// Match a completion line against the running command.
    ///
    /// Returns the finished command for kind dispatch; an out-of-band
    /// completion with no running command is logged and dropped.
    pub fn completion_received(&mut self, completion: &Completion) -> Option<Command> {
        match self.running.take() {
            Some(cmd) => Some(cmd),
            None => {
                warn!(
                    conn = self.id.0,
                    code = completion.code,
                    "completion with no running command, dropping"
                );
                None
            }
        }
    }

    /// Apply the outcome decided for a finished command.
    pub fn apply_outcome(&mut self, cmd: Command, outcome: Outcome) {
        match outcome {
            Outcome::Done => {}
            Outcome::Keep => self.running = Some(cmd),
            Outcome::Requeue => {
                let mut cmd = cmd;
                cmd.reset_for_requeue();
                self.queue.push_front(cmd);
            }
        }
    }

    /// Remove every queued and running command, for the connection-loss path.
    /// Each command comes back exactly once.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        let mut all: Vec<Command> = self.queue.drain(..).collect();
        if let Some(running) = self.running.take() {
            all.push(running);
        }
        all
    }

    /// Does any queued or running command carry this originator?
    pub fn originator_pending(&self, originator: ConnId) -> bool {
        self.queue
            .iter()
            .chain(self.running.iter())
            .any(|c| c.originator() == Some(originator))
    }

    /// Clear dangling references to a destroyed connection.
    pub fn clear_originator(&mut self, originator: ConnId) {
        for cmd in self.queue.iter_mut().chain(self.running.iter_mut()) {
            if cmd.originator() == Some(originator) {
                cmd.clear_originator();
            }
        }
    }

    // --- liveness ---------------------------------------------------------

    pub fn keepalive(&self, now: Instant, config: &KeepaliveConfig) -> KeepaliveAction {
        self.clock.poll(now, config)
    }

    /// Send the `ready` probe.
    pub fn probe(&mut self, now: Instant) {
        self.send_line("ready", now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use skyproto::state::BOP_TEL_MOVE;

    fn conn() -> Connection {
        Connection::accepted(ConnId(1), Instant::now())
    }

    #[test]
    fn single_command_in_flight() {
        let now = Instant::now();
        let mut c = conn();
        c.queue_command(Command::new("first"));
        c.queue_command(Command::new("second"));

        assert_eq!(c.advance_queue(0, now), Advance::Transmitted);
        // Second command must wait for the first completion.
        assert_eq!(c.advance_queue(0, now), Advance::Busy);
        assert_eq!(c.running().unwrap().text(), "first");
        assert_eq!(c.staged_lines(), vec!["first"]);
    }

    #[test]
    fn fifo_order_with_front_preemption() {
        let now = Instant::now();
        let mut c = conn();
        c.queue_command(Command::new("c1"));
        c.queue_command(Command::new("c2"));
        c.queue_front(Command::new("urgent"));

        let mut sent = Vec::new();
        for _ in 0..3 {
            assert_eq!(c.advance_queue(0, now), Advance::Transmitted);
            sent.push(c.running().unwrap().text().to_string());
            let cmd = c.completion_received(&Completion::ok()).unwrap();
            c.apply_outcome(cmd, Outcome::Done);
        }
        assert_eq!(sent, vec!["urgent", "c1", "c2"]);
    }

    #[test]
    fn gated_head_blocks_queue_until_bop_clears() {
        let now = Instant::now();
        let mut c = conn();
        c.queue_command(Command::new("move 10 20").with_bop_mask(BOP_TEL_MOVE));
        c.queue_command(Command::new("harmless"));

        // Telescope moving: nothing goes out, not even the ungated follower.
        assert_eq!(c.advance_queue(BOP_TEL_MOVE, now), Advance::Blocked);
        assert!(c.staged_lines().is_empty());

        // Bit cleared: the gated command goes first.
        assert_eq!(c.advance_queue(0, now), Advance::Transmitted);
        assert_eq!(c.running().unwrap().text(), "move 10 20");
    }

    #[test]
    fn out_of_band_completion_dropped() {
        let mut c = conn();
        assert!(c.completion_received(&Completion::ok()).is_none());
    }

    #[test]
    fn requeue_outcome_resubmits_at_head() {
        let now = Instant::now();
        let mut c = conn();
        c.queue_command(Command::new("expose 30"));
        c.queue_command(Command::new("later"));
        assert_eq!(c.advance_queue(0, now), Advance::Transmitted);

        let cmd = c
            .completion_received(&Completion::error(skyproto::ERR_BLOCKED, "busy"))
            .unwrap();
        let outcome = Command::default_outcome(&Completion::error(skyproto::ERR_BLOCKED, "busy"));
        c.apply_outcome(cmd, outcome);

        assert_eq!(c.advance_queue(0, now), Advance::Transmitted);
        assert_eq!(c.running().unwrap().text(), "expose 30");
    }

    #[test]
    fn drain_returns_each_command_exactly_once() {
        let now = Instant::now();
        let mut c = conn();
        c.queue_command(Command::new("a"));
        c.queue_command(Command::new("b"));
        assert_eq!(c.advance_queue(0, now), Advance::Transmitted);

        let drained = c.drain_commands();
        let texts: Vec<_> = drained.iter().map(|c| c.text().to_string()).collect();
        assert_eq!(texts, vec!["b", "a"]);
        assert!(c.drain_commands().is_empty());
        assert!(!c.has_running());
    }

    #[test]
    fn originator_tracking() {
        let mut c = conn();
        c.queue_command(Command::new("status_info").with_originator(ConnId(7)));
        assert!(c.originator_pending(ConnId(7)));
        assert!(!c.originator_pending(ConnId(8)));

        c.clear_originator(ConnId(7));
        assert!(!c.originator_pending(ConnId(7)));
    }

    #[test]
    fn outbound_connection_starts_connecting() {
        let mut c = Connection::connecting(ConnId(5), Instant::now());
        assert_eq!(c.state(), ConnState::Connecting);
        c.set_state(ConnState::Connected);
        c.identify_device("IMGP", DeviceType::ImageProcessor, "proc1", 5561);
        assert_eq!(c.state(), ConnState::AuthOk);
    }

    #[test]
    fn device_identification_moves_to_auth_ok() {
        let mut c = conn();
        assert_eq!(c.state(), ConnState::Connected);
        c.identify_device("CAM", DeviceType::Camera, "localhost", 5554);
        assert_eq!(c.state(), ConnState::AuthOk);
        assert_eq!(c.role(), PeerRole::Device);
        assert_eq!(c.name(), Some("CAM"));
    }

    #[test]
    fn client_auth_flow() {
        let mut c = conn();
        c.identify_client("observer");
        assert_eq!(c.state(), ConnState::AuthPending);
        c.set_authorized(false);
        assert_eq!(c.state(), ConnState::AuthFailed);
        c.set_authorized(true);
        assert_eq!(c.state(), ConnState::AuthOk);
    }

    #[test]
    fn binary_send_stages_header_and_payload() {
        let now = Instant::now();
        let mut c = conn();
        c.send_binary(1, 2, Bytes::from_static(b"imagedata"), now);
        let frames = c.take_outbox();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], OutFrame::Line("binary 1 9 2\n".into()));
        assert_eq!(frames[1], OutFrame::Line("data 1 9\n".into()));
        assert_eq!(frames[2], OutFrame::Raw(Bytes::from_static(b"imagedata")));
    }
}
