//! CURP batch messages.

use serde::{Deserialize, Serialize};

use paxoi_types::{Ballot, CommandId, ReplicaId, Value};

/// Leader → All: accept this command at this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MAccept {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub instance: i32,
    pub rep: Value,
}

/// Witness → All: the instance is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MAcceptAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub instance: i32,
}

/// One coalesced outbound frame: everything both inbound streams had
/// accumulated when the batcher woke.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MAAcks {
    pub acks: Vec<MAcceptAck>,
    pub accepts: Vec<MAccept>,
}
