//! Per-command descriptors and the delivered-history ring.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use paxoi_types::{Ballot, Command, CommandId, Dep, SHash, Value};

use crate::message::{MFastAck, Propose};
use crate::msgset::MsgSet;
use crate::quorum::Quorum;

// ============================================================================
// Phase
// ============================================================================

/// Lifecycle of one command on one replica.
///
/// Monotone non-decreasing within a ballot; a descriptor that reached
/// [`Phase::Deliver`] is garbage-collected after its history slot is
/// assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Phase {
    #[default]
    Start,
    PreAccept,
    Accept,
    Commit,
    Deliver,
}

// ============================================================================
// Command Descriptor
// ============================================================================

/// Acknowledgement channel delivered to a stopped worker; the worker
/// signals back on it before exiting.
pub type StopAck = oneshot::Sender<()>;

/// Per-command state on one replica.
///
/// Created lazily when either the proposal or the first ack for the
/// command arrives; destroyed after DELIVER once the history slot
/// comes back, or dropped wholesale during recovery.
#[derive(Debug)]
pub struct CommandDesc {
    pub phase: Phase,
    /// Ballot this descriptor was created at.
    pub ballot: Ballot,
    pub cmd: Option<Command>,
    pub dep: Dep,
    pub hs: Vec<SHash>,
    /// Present only on replicas that received the client proposal.
    pub propose: Option<Propose>,
    /// Reply value: locally executed or leader-supplied.
    pub val: Option<Value>,
    pub fast_path: MsgSet<MFastAck>,
    pub slow_path: MsgSet<MFastAck>,
    /// This replica has sent its own acknowledgement for the command.
    pub acked: bool,
    /// The reply handshake ran at propose time (optimistic execution).
    pub optimistically_delivered: bool,
    /// History slot received before the DELIVER transition.
    pub slot: Option<usize>,
    /// A deliver job for this command is running on a worker.
    pub active: bool,
    /// The deliver handshake ran inline on the event loop.
    pub seq: bool,
    /// Pre-emption lane to the active worker job.
    pub stop: Option<oneshot::Sender<StopAck>>,
}

impl CommandDesc {
    pub fn new(ballot: Ballot, fast_quorum: Quorum, slow_quorum: Quorum) -> Self {
        Self {
            phase: Phase::Start,
            ballot,
            cmd: None,
            dep: Dep::new(),
            hs: Vec::new(),
            propose: None,
            val: None,
            fast_path: MsgSet::new(fast_quorum, MFastAck::compatible),
            slow_path: MsgSet::new(slow_quorum, MFastAck::compatible),
            acked: false,
            optimistically_delivered: false,
            slot: None,
            active: false,
            seq: false,
            stop: None,
        }
    }

    /// Advances the phase, which never goes backwards within a ballot.
    pub fn advance(&mut self, phase: Phase) {
        debug_assert!(
            phase >= self.phase,
            "phase regression {:?} -> {:?}",
            self.phase,
            phase
        );
        if phase > self.phase {
            self.phase = phase;
        }
    }

    /// Rebuilds both message sets for a new ballot.
    pub fn reinit_acks(&mut self, fast_quorum: Quorum, slow_quorum: Quorum) {
        self.fast_path.reinit(fast_quorum, MFastAck::compatible);
        self.slow_path.reinit(slow_quorum, MFastAck::compatible);
    }

    pub fn is_committed(&self) -> bool {
        self.phase >= Phase::Commit
    }

    pub fn is_delivered(&self) -> bool {
        self.phase >= Phase::Deliver
    }
}

// ============================================================================
// History Ring
// ============================================================================

/// Number of delivered commands the history ring remembers.
pub const HISTORY_SIZE: usize = 10_001;

/// Snapshot of one delivered command.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub cmd_id: CommandId,
    pub ballot: Ballot,
    pub cmd: Option<Command>,
    pub dep: Dep,
    pub hs: Vec<SHash>,
    pub val: Value,
}

/// Bounded circular buffer of recently delivered commands.
///
/// Slot assignment lives with the reply channel (it owns the
/// monotonically advancing counter); the ring only stores what it is
/// handed. Recovery snapshots the ring when building a Sync.
#[derive(Debug)]
pub struct History {
    slots: Vec<Option<HistoryEntry>>,
}

impl History {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(HISTORY_SIZE);
        slots.resize_with(HISTORY_SIZE, || None);
        Self { slots }
    }

    pub fn insert(&mut self, slot: usize, entry: HistoryEntry) {
        self.slots[slot % HISTORY_SIZE] = Some(entry);
    }

    pub fn get(&self, slot: usize) -> Option<&HistoryEntry> {
        self.slots[slot % HISTORY_SIZE].as_ref()
    }

    /// Looks up a delivered entry by command id.
    pub fn find(&self, cmd_id: CommandId) -> Option<&HistoryEntry> {
        self.entries().find(|e| e.cmd_id == cmd_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxoi_types::{ClientId, SeqNum};

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Start < Phase::PreAccept);
        assert!(Phase::PreAccept < Phase::Accept);
        assert!(Phase::Accept < Phase::Commit);
        assert!(Phase::Commit < Phase::Deliver);
    }

    #[test]
    fn advance_is_monotone() {
        let mut desc = CommandDesc::new(
            Ballot::ZERO,
            Quorum::three_quarters_of(3),
            Quorum::majority_of(3),
        );
        desc.advance(Phase::PreAccept);
        desc.advance(Phase::Commit);
        // Re-asserting an already-passed phase is a no-op.
        desc.advance(Phase::Commit);
        assert_eq!(desc.phase, Phase::Commit);
        assert!(desc.is_committed());
        assert!(!desc.is_delivered());
    }

    #[test]
    fn history_ring_wraps() {
        let mut history = History::new();
        let entry = |n: i32| HistoryEntry {
            cmd_id: CommandId::new(ClientId::new(1), SeqNum::new(n)),
            ballot: Ballot::ZERO,
            cmd: None,
            dep: Dep::new(),
            hs: Vec::new(),
            val: Value::empty(),
        };

        history.insert(0, entry(0));
        history.insert(HISTORY_SIZE, entry(1)); // same slot, wrapped
        let got = history.get(0).expect("occupied");
        assert_eq!(got.cmd_id.seq_num, SeqNum::new(1));
        assert_eq!(history.entries().count(), 1);
    }
}
