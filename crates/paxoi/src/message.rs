//! Paxoi protocol messages.
//!
//! ## Normal operation
//! - [`MFastAck`] — Replica → All + client: my dependency checksum for a command
//! - [`MSlowAck`] — wire-identical to a fast ack, sent when adopting the leader's ordering
//! - [`MLightSlowAck`] — checksum-absent slow acknowledgement (command id only)
//! - [`MAcks`], [`MOptAcks`] — aggregates unpacked into individual acks
//! - [`MAccept`] — Leader → All / Follower → client: commit signal with the reply value
//! - [`MReply`], [`MReadReply`] — Leader → client replies
//!
//! ## Recovery
//! - [`MNewLeader`] — new leader announces a higher ballot
//! - [`MNewLeaderAck`] — ack carrying the replica's highest commit ballot
//! - [`MShareState`] — request for a synchronization snapshot
//! - [`MSync`] / [`MLightSync`] — state snapshot / no-divergence shortcut
//!
//! ## Housekeeping
//! - [`MCollect`] — delivered-id announcements for garbage collection
//! - [`MPing`] / [`MPingRep`] — peer latency probes
//!
//! Every message carries its sender and ballot. The wire encoding is
//! the `paxoi-wire` frame codec over the [`Message`] sum type; each
//! inbound frame is routed to the typed inbox for its kind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use paxoi_types::{Ballot, ClientId, Command, CommandId, Dep, ReplicaId, SHash, Value};

use crate::desc::Phase;

// ============================================================================
// Acknowledgements
// ============================================================================

/// A replica's dependency report for one command.
///
/// `checksum` is `None` when the message is a reshaped light slow
/// ack: the sender acknowledges the command without vouching for any
/// particular dependency set. The fast-path compatibility predicate
/// admits such entries unconditionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MFastAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub dep: Dep,
    pub checksum: Option<Vec<SHash>>,
}

impl MFastAck {
    /// Compatibility predicate for fast-path message sets.
    ///
    /// A candidate is compatible when there is no leader message yet,
    /// when it carries no checksum (the light-slow sentinel), or when
    /// its checksum sequence equals the leader's element by element.
    pub fn compatible(msg: &MFastAck, leader: Option<&MFastAck>) -> bool {
        let Some(leader) = leader else {
            return true;
        };
        match (&msg.checksum, &leader.checksum) {
            (None, _) => true,
            (Some(m), Some(l)) => paxoi_types::shashes_eq(m, l),
            (Some(_), None) => false,
        }
    }
}

/// Wire-identical to [`MFastAck`]; sent by a follower that adopted the
/// leader's dependency ordering for a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MSlowAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub dep: Dep,
    pub checksum: Option<Vec<SHash>>,
}

impl From<MSlowAck> for MFastAck {
    fn from(sa: MSlowAck) -> Self {
        MFastAck {
            replica: sa.replica,
            ballot: sa.ballot,
            cmd_id: sa.cmd_id,
            dep: sa.dep,
            checksum: sa.checksum,
        }
    }
}

/// Checksum-absent slow acknowledgement: identifies the command only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MLightSlowAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
}

impl MLightSlowAck {
    /// Reshapes into a checksum-absent fast ack, which the fast-path
    /// compatibility predicate admits unconditionally.
    pub fn into_fast_ack(self) -> MFastAck {
        MFastAck {
            replica: self.replica,
            ballot: self.ballot,
            cmd_id: self.cmd_id,
            dep: Dep::new(),
            checksum: None,
        }
    }
}

/// Aggregate of fast and light-slow acks in one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MAcks {
    pub fast_acks: Vec<MFastAck>,
    pub light_slow_acks: Vec<MLightSlowAck>,
}

/// One entry of an [`MOptAcks`] batch.
///
/// A slow-path entry is signalled by the nil-dep sentinel (see
/// [`nil_dep_of`]) rather than a missing field, so the batch stays a
/// flat array on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub cmd_id: CommandId,
    pub dep: Dep,
    pub checksum: Option<Vec<SHash>>,
}

/// Per-sender batch of acks, one entry per command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MOptAcks {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub acks: Vec<Ack>,
}

/// The dependency sentinel marking an [`Ack`] as slow-path: a
/// dependency list containing exactly the command's own id.
pub fn nil_dep_of(cmd_id: CommandId) -> Dep {
    Dep::from_ids(vec![cmd_id])
}

/// Recognizes the slow-path sentinel produced by [`nil_dep_of`].
pub fn is_nil_dep_of_cmd_id(cmd_id: CommandId, dep: &Dep) -> bool {
    dep.len() == 1 && dep.ids()[0] == cmd_id
}

// ============================================================================
// Proposals
// ============================================================================

/// Wire form of a client proposal.
///
/// Carried on client connections and, under optimistic execution, by
/// followers forwarding proposals to the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MPropose {
    pub client_id: ClientId,
    pub cmd_id: CommandId,
    pub command: Command,
    pub timestamp: i64,
}

// ============================================================================
// Replies and Commit Signals
// ============================================================================

/// Leader → client: optimistic-execution reply. Doubles as the
/// leader's fast ack on the client side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MReply {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub checksum: Option<Vec<SHash>>,
    pub rep: Value,
}

/// Reply for the read-only fast path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MReadReply {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub rep: Value,
}

/// Commit signal carrying the reply value.
///
/// Broadcast by the leader to mark COMMIT on followers, and sent by a
/// collocated follower to its client under optimistic execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MAccept {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub rep: Value,
}

// ============================================================================
// Recovery
// ============================================================================

/// New leader announces a higher ballot; receivers enter recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MNewLeader {
    pub replica: ReplicaId,
    pub ballot: Ballot,
}

/// Acknowledgement of [`MNewLeader`]; `cballot` is the highest ballot
/// at which the sender has ever committed a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MNewLeaderAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cballot: Ballot,
}

/// Request for a synchronization snapshot from a fresh replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MShareState {
    pub replica: ReplicaId,
    pub ballot: Ballot,
}

/// Synchronization snapshot: the authoritative per-command tables at
/// the new ballot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MSync {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub phases: HashMap<CommandId, Phase>,
    pub cmds: HashMap<CommandId, Command>,
    pub deps: HashMap<CommandId, Dep>,
}

/// No-divergence shortcut: return to normal without table replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MLightSync {
    pub replica: ReplicaId,
    pub ballot: Ballot,
}

// ============================================================================
// Housekeeping
// ============================================================================

/// Announcement of locally delivered command ids, for distributed
/// garbage collection of delivered-markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MCollect {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub ids: Vec<CommandId>,
}

/// Peer latency probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MPing {
    pub replica: ReplicaId,
    pub ballot: Ballot,
}

/// Reply to [`MPing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MPingRep {
    pub replica: ReplicaId,
    pub ballot: Ballot,
}

// ============================================================================
// Envelope
// ============================================================================

/// Sum of every Paxoi message kind; what travels in a wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Propose(MPropose),
    FastAck(MFastAck),
    SlowAck(MSlowAck),
    LightSlowAck(MLightSlowAck),
    Acks(MAcks),
    OptAcks(MOptAcks),
    Reply(MReply),
    ReadReply(MReadReply),
    Accept(MAccept),
    NewLeader(MNewLeader),
    NewLeaderAck(MNewLeaderAck),
    ShareState(MShareState),
    Sync(MSync),
    LightSync(MLightSync),
    Collect(MCollect),
    Ping(MPing),
    PingRep(MPingRep),
}

impl Message {
    /// Human-readable name of the message kind.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Propose(_) => "Propose",
            Message::FastAck(_) => "FastAck",
            Message::SlowAck(_) => "SlowAck",
            Message::LightSlowAck(_) => "LightSlowAck",
            Message::Acks(_) => "Acks",
            Message::OptAcks(_) => "OptAcks",
            Message::Reply(_) => "Reply",
            Message::ReadReply(_) => "ReadReply",
            Message::Accept(_) => "Accept",
            Message::NewLeader(_) => "NewLeader",
            Message::NewLeaderAck(_) => "NewLeaderAck",
            Message::ShareState(_) => "ShareState",
            Message::Sync(_) => "Sync",
            Message::LightSync(_) => "LightSync",
            Message::Collect(_) => "Collect",
            Message::Ping(_) => "Ping",
            Message::PingRep(_) => "PingRep",
        }
    }

    /// The sender's ballot.
    pub fn ballot(&self) -> Ballot {
        match self {
            Message::Propose(_) => Ballot::ZERO,
            Message::FastAck(m) => m.ballot,
            Message::SlowAck(m) => m.ballot,
            Message::LightSlowAck(m) => m.ballot,
            Message::Acks(_) => Ballot::ZERO,
            Message::OptAcks(m) => m.ballot,
            Message::Reply(m) => m.ballot,
            Message::ReadReply(m) => m.ballot,
            Message::Accept(m) => m.ballot,
            Message::NewLeader(m) => m.ballot,
            Message::NewLeaderAck(m) => m.ballot,
            Message::ShareState(m) => m.ballot,
            Message::Sync(m) => m.ballot,
            Message::LightSync(m) => m.ballot,
            Message::Collect(m) => m.ballot,
            Message::Ping(m) => m.ballot,
            Message::PingRep(m) => m.ballot,
        }
    }
}

// ============================================================================
// Client-Facing Types
// ============================================================================

/// Reply shape for collocated clients without optimistic execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeReplyTS {
    pub ok: bool,
    pub cmd_id: CommandId,
    pub value: Value,
    pub timestamp: i64,
}

/// A client proposal as it enters a replica's propose inbox.
#[derive(Debug)]
pub struct Propose {
    pub client_id: ClientId,
    pub cmd_id: CommandId,
    pub command: Command,
    pub timestamp: i64,
    /// Whether the proposing client shares this replica's process.
    pub collocated: bool,
    /// Local reply lane for collocated clients.
    pub reply: Option<tokio::sync::mpsc::UnboundedSender<ProposeReplyTS>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxoi_types::{ClientId, Key, SeqNum};

    fn cmd_id(client: i32, seq: i32) -> CommandId {
        CommandId::new(ClientId::new(client), SeqNum::new(seq))
    }

    fn fast_ack(replica: i32, checksum: Option<Vec<SHash>>) -> MFastAck {
        MFastAck {
            replica: ReplicaId::new(replica),
            ballot: Ballot::ZERO,
            cmd_id: cmd_id(1, 1),
            dep: Dep::new(),
            checksum,
        }
    }

    #[test]
    fn compatibility_without_leader_is_unconditional() {
        let msg = fast_ack(1, Some(vec![SHash::digest(b"a")]));
        assert!(MFastAck::compatible(&msg, None));
    }

    #[test]
    fn checksum_absent_candidates_are_always_compatible() {
        let leader = fast_ack(0, Some(vec![SHash::digest(b"a")]));
        let slow = fast_ack(1, None);
        assert!(MFastAck::compatible(&slow, Some(&leader)));
    }

    #[test]
    fn checksums_must_match_element_wise() {
        let leader = fast_ack(0, Some(vec![SHash::digest(b"a")]));
        let same = fast_ack(1, Some(vec![SHash::digest(b"a")]));
        let diff = fast_ack(2, Some(vec![SHash::digest(b"b")]));
        assert!(MFastAck::compatible(&same, Some(&leader)));
        assert!(!MFastAck::compatible(&diff, Some(&leader)));
    }

    #[test]
    fn nil_dep_sentinel_roundtrip() {
        let id = cmd_id(3, 9);
        let dep = nil_dep_of(id);
        assert!(is_nil_dep_of_cmd_id(id, &dep));
        assert!(!is_nil_dep_of_cmd_id(cmd_id(3, 8), &dep));
        assert!(!is_nil_dep_of_cmd_id(id, &Dep::new()));
    }

    #[test]
    fn every_message_kind_roundtrips() {
        let dep = Dep::from_ids(vec![cmd_id(1, 1)]);
        let hs = Some(dep.checksum_vec());
        let mut phases = HashMap::new();
        phases.insert(cmd_id(1, 1), Phase::Commit);
        let mut cmds = HashMap::new();
        cmds.insert(cmd_id(1, 1), Command::put(Key::new(1), Value::from("x")));
        let mut deps = HashMap::new();
        deps.insert(cmd_id(1, 1), dep.clone());

        let all = vec![
            Message::Propose(MPropose {
                client_id: ClientId::new(1),
                cmd_id: cmd_id(1, 1),
                command: Command::put(Key::new(1), Value::from("x")),
                timestamp: 7,
            }),
            Message::FastAck(fast_ack(0, hs.clone())),
            Message::SlowAck(MSlowAck {
                replica: ReplicaId::new(1),
                ballot: Ballot::new(2),
                cmd_id: cmd_id(1, 1),
                dep: dep.clone(),
                checksum: hs.clone(),
            }),
            Message::LightSlowAck(MLightSlowAck {
                replica: ReplicaId::new(1),
                ballot: Ballot::ZERO,
                cmd_id: cmd_id(1, 1),
            }),
            Message::Acks(MAcks {
                fast_acks: vec![fast_ack(0, None)],
                light_slow_acks: Vec::new(),
            }),
            Message::OptAcks(MOptAcks {
                replica: ReplicaId::new(2),
                ballot: Ballot::ZERO,
                acks: vec![Ack {
                    cmd_id: cmd_id(1, 1),
                    dep: nil_dep_of(cmd_id(1, 1)),
                    checksum: None,
                }],
            }),
            Message::Reply(MReply {
                replica: ReplicaId::new(0),
                ballot: Ballot::ZERO,
                cmd_id: cmd_id(1, 1),
                checksum: hs,
                rep: Value::from("x"),
            }),
            Message::ReadReply(MReadReply {
                replica: ReplicaId::new(0),
                ballot: Ballot::ZERO,
                cmd_id: cmd_id(1, 1),
                rep: Value::empty(),
            }),
            Message::Accept(MAccept {
                replica: ReplicaId::new(0),
                ballot: Ballot::ZERO,
                cmd_id: cmd_id(1, 1),
                rep: Value::from("x"),
            }),
            Message::NewLeader(MNewLeader {
                replica: ReplicaId::new(1),
                ballot: Ballot::new(4),
            }),
            Message::NewLeaderAck(MNewLeaderAck {
                replica: ReplicaId::new(2),
                ballot: Ballot::new(4),
                cballot: Ballot::ZERO,
            }),
            Message::ShareState(MShareState {
                replica: ReplicaId::new(1),
                ballot: Ballot::new(4),
            }),
            Message::Sync(MSync {
                replica: ReplicaId::new(1),
                ballot: Ballot::new(4),
                phases,
                cmds,
                deps,
            }),
            Message::LightSync(MLightSync {
                replica: ReplicaId::new(1),
                ballot: Ballot::new(4),
            }),
            Message::Collect(MCollect {
                replica: ReplicaId::new(0),
                ballot: Ballot::ZERO,
                ids: vec![cmd_id(1, 1)],
            }),
            Message::Ping(MPing {
                replica: ReplicaId::new(0),
                ballot: Ballot::ZERO,
            }),
            Message::PingRep(MPingRep {
                replica: ReplicaId::new(1),
                ballot: Ballot::ZERO,
            }),
        ];

        for msg in all {
            let bytes = paxoi_wire::encode(&msg).expect("encode");
            let back: Message = paxoi_wire::decode(&bytes).expect("decode");
            assert_eq!(back, msg, "{} did not round-trip", msg.name());
        }
    }
}
