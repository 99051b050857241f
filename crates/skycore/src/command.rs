//! The command object model.
//!
//! A command is an immutable text line plus the state that governs when it
//! may be written to the wire and what happens to its completion. Commands
//! whose BOP mask is zero bypass gating entirely. A gated command that also
//! needs a fresh status snapshot walks the call-in-progress (CIP) machine:
//! the gate is re-verified immediately before every wire write, never only at
//! queue time, because the global condition can change between check and
//! send. The three observable waiting points are distinct states so tests
//! can assert exact sequencing.

use skyproto::state::{BOP_EXPOSURE, BOP_WILL_EXPOSE};
use skyproto::Completion;

use crate::ConnId;

/// What a completion handler decides about the finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Discard the command; the queue advances.
    Done,
    /// Leave it running; more reply lines are expected.
    Keep,
    /// Resubmit unchanged at the head of the queue.
    Requeue,
}

/// Meta-command discrimination for completion routing.
///
/// One variant per command that the engine or arbiter must recognize when its
/// completion (or loss) comes back; everything else is `Plain`. Closed on
/// purpose: dispatch over this enum is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Ordinary domain command; completion is the caller's business.
    Plain,
    /// A status query fanned out on behalf of `requester` during
    /// `status_info` gather.
    StatusQuery { requester: ConnId },
}

/// Call-in-progress: where a snapshot-verified command stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cip {
    /// Nothing issued yet.
    NotCalled,
    /// Status query is out; waiting for the collected snapshot.
    Wait,
    /// Snapshot collected; command may transmit once the gate is clear.
    Run,
    /// The real command went out; waiting for its final completion.
    Return,
}

/// What the queue engine should do with the head command right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAction {
    /// Write the command line.
    Transmit,
    /// Issue a nested status query first, then wait.
    QueryStatus,
    /// Stay queued; re-evaluated on the next relevant event.
    Defer,
}

impl Cip {
    /// Transition taken every time the engine considers sending the command.
    ///
    /// `gated` is whether the BOP gate is closed *right now*; `verify` is
    /// whether the command demands a fresh snapshot before its first
    /// transmission.
    pub fn on_send_attempt(self, gated: bool, verify: bool) -> (Cip, SendAction) {
        match self {
            Cip::NotCalled if verify => (Cip::Wait, SendAction::QueryStatus),
            Cip::NotCalled | Cip::Run => {
                if gated {
                    (self, SendAction::Defer)
                } else {
                    (Cip::Return, SendAction::Transmit)
                }
            }
            Cip::Wait => (Cip::Wait, SendAction::Defer),
            Cip::Return => (Cip::Return, SendAction::Defer),
        }
    }

    /// The nested status query finished collecting.
    pub fn on_snapshot_complete(self) -> Cip {
        match self {
            Cip::Wait => Cip::Run,
            other => other,
        }
    }
}

/// A queued or running command.
#[derive(Debug)]
pub struct Command {
    text: String,
    bop_mask: u32,
    /// Safe to run while an exposure is in progress (filter moves, focus).
    during_exposure: bool,
    /// Demand a fresh status snapshot before the first transmission.
    verify_status: bool,
    kind: CommandKind,
    originator: Option<ConnId>,
    cip: Cip,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bop_mask: 0,
            during_exposure: false,
            verify_status: false,
            kind: CommandKind::Plain,
            originator: None,
            cip: Cip::NotCalled,
        }
    }

    /// Gate transmission on the given BOP bits.
    pub fn with_bop_mask(mut self, mask: u32) -> Self {
        self.bop_mask = mask;
        self
    }

    /// Allow interleaving with an active or imminent exposure.
    pub fn while_exposing(mut self) -> Self {
        self.during_exposure = true;
        self
    }

    /// Require a status snapshot before the first wire write.
    pub fn verified(mut self) -> Self {
        self.verify_status = true;
        self
    }

    pub fn with_kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_originator(mut self, originator: ConnId) -> Self {
        self.originator = Some(originator);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn originator(&self) -> Option<ConnId> {
        self.originator
    }

    /// Clear a dangling originator after that connection went away.
    pub fn clear_originator(&mut self) {
        self.originator = None;
    }

    pub fn cip(&self) -> Cip {
        self.cip
    }

    /// The mask actually enforced, after the exposure escape hatch.
    pub fn effective_mask(&self) -> u32 {
        if self.during_exposure {
            self.bop_mask & !(BOP_EXPOSURE | BOP_WILL_EXPOSE)
        } else {
            self.bop_mask
        }
    }

    /// Is this command gated by the current global BOP word?
    pub fn gated_by(&self, global_bop: u32) -> bool {
        self.effective_mask() & global_bop != 0
    }

    /// Decide what to do with this command right now.
    pub fn poll_send(&mut self, global_bop: u32) -> SendAction {
        if self.effective_mask() == 0 && !self.verify_status {
            // Ungated commands bypass the CIP machine entirely.
            self.cip = Cip::Return;
            return SendAction::Transmit;
        }
        let (next, action) = self.cip.on_send_attempt(self.gated_by(global_bop), self.verify_status);
        self.cip = next;
        action
    }

    /// The nested status query finished; the command may now transmit.
    pub fn snapshot_complete(&mut self) {
        self.cip = self.cip.on_snapshot_complete();
    }

    /// Reset execution state for a requeued submission.
    pub fn reset_for_requeue(&mut self) {
        self.cip = Cip::NotCalled;
    }

    /// Default outcome interpretation of a completion line: requeue on the
    /// "blocked, try later" code, discard otherwise. Callers with richer
    /// semantics dispatch on `kind()` before falling back to this.
    pub fn default_outcome(completion: &Completion) -> Outcome {
        if completion.code == skyproto::ERR_BLOCKED {
            Outcome::Requeue
        } else {
            Outcome::Done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyproto::state::{BOP_READOUT, BOP_TEL_MOVE};

    #[test]
    fn ungated_command_transmits_immediately() {
        let mut cmd = Command::new("filter_set 3");
        assert_eq!(cmd.poll_send(BOP_TEL_MOVE | BOP_EXPOSURE), SendAction::Transmit);
        assert_eq!(cmd.cip(), Cip::Return);
    }

    #[test]
    fn gated_command_defers_until_bits_clear() {
        let mut cmd = Command::new("move 83.6 22.0").with_bop_mask(BOP_TEL_MOVE);
        assert_eq!(cmd.poll_send(BOP_TEL_MOVE), SendAction::Defer);
        assert_eq!(cmd.poll_send(BOP_TEL_MOVE), SendAction::Defer);
        assert_eq!(cmd.poll_send(0), SendAction::Transmit);
    }

    #[test]
    fn verified_command_walks_cip_states() {
        let mut cmd = Command::new("expose 30").with_bop_mask(BOP_TEL_MOVE).verified();
        assert_eq!(cmd.cip(), Cip::NotCalled);
        // First attempt issues the nested query regardless of the gate.
        assert_eq!(cmd.poll_send(0), SendAction::QueryStatus);
        assert_eq!(cmd.cip(), Cip::Wait);
        // Still waiting: nothing happens until the snapshot lands.
        assert_eq!(cmd.poll_send(0), SendAction::Defer);
        cmd.snapshot_complete();
        assert_eq!(cmd.cip(), Cip::Run);
        // Gate closed between snapshot and send: the re-verify catches it.
        assert_eq!(cmd.poll_send(BOP_TEL_MOVE), SendAction::Defer);
        assert_eq!(cmd.cip(), Cip::Run);
        assert_eq!(cmd.poll_send(0), SendAction::Transmit);
        assert_eq!(cmd.cip(), Cip::Return);
    }

    #[test]
    fn exposure_escape_hatch_masks_exposure_bits() {
        let mut cmd = Command::new("filter_set 2")
            .with_bop_mask(BOP_EXPOSURE | BOP_READOUT)
            .while_exposing();
        // Exposure running: still allowed through.
        assert_eq!(cmd.poll_send(BOP_EXPOSURE), SendAction::Transmit);

        let mut gated = Command::new("filter_set 2")
            .with_bop_mask(BOP_EXPOSURE | BOP_READOUT)
            .while_exposing();
        // Readout is not excused.
        assert_eq!(gated.poll_send(BOP_READOUT), SendAction::Defer);
    }

    #[test]
    fn requeue_resets_cip() {
        let mut cmd = Command::new("expose 30").with_bop_mask(BOP_TEL_MOVE).verified();
        assert_eq!(cmd.poll_send(0), SendAction::QueryStatus);
        cmd.snapshot_complete();
        assert_eq!(cmd.poll_send(0), SendAction::Transmit);
        cmd.reset_for_requeue();
        assert_eq!(cmd.cip(), Cip::NotCalled);
        assert_eq!(cmd.poll_send(0), SendAction::QueryStatus);
    }

    #[test]
    fn blocked_completion_maps_to_requeue() {
        let blocked = Completion::error(skyproto::ERR_BLOCKED, "busy, try later");
        assert_eq!(Command::default_outcome(&blocked), Outcome::Requeue);
        let ok = Completion::ok();
        assert_eq!(Command::default_outcome(&ok), Outcome::Done);
    }
}
