//! Master and replica-control RPC frames.
//!
//! Both planes use `paxoi-wire` framing over plain TCP:
//!
//! - replicas and clients dial the **master port** with
//!   [`MasterRequest`] frames (`Register`, `GetLeader`,
//!   `GetReplicaList`);
//! - the master dials each replica's **control port** (replica port +
//!   1000) with [`ControlRequest`] frames (`Ping`, `BeTheLeader`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use paxoi_types::ReplicaId;

/// How long a control-plane dial or reply may take before the target
/// counts as unreachable.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Master-Facing RPCs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterRequest {
    Register { addr: String, port: u16 },
    GetLeader,
    GetReplicaList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterReply {
    Register(RegisterReply),
    GetLeader(GetLeaderReply),
    ReplicaList(ReplicaListReply),
}

/// Reply to `Register`; `ready` only once all `n` replicas are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub ready: bool,
    pub replica_id: ReplicaId,
    pub node_list: Vec<String>,
    pub is_leader: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLeaderReply {
    pub leader_id: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaListReply {
    pub ready: bool,
    pub replica_list: Vec<String>,
    pub alive_list: Vec<bool>,
}

// ============================================================================
// Replica Control RPCs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    Ping,
    BeTheLeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlReply {
    Pong,
    BeTheLeader {
        /// The replica that actually took leadership.
        leader: ReplicaId,
        /// Its designated successor.
        next_leader: ReplicaId,
    },
}

/// One control round trip against a replica's control port.
pub async fn call_control(
    addr: &str,
    request: ControlRequest,
) -> Result<ControlReply, crate::MasterError> {
    tokio::time::timeout(CONTROL_TIMEOUT, dial_control(addr, request))
        .await
        .map_err(|_| crate::MasterError::Unreachable(addr.to_string(), "timeout".into()))?
}

async fn dial_control(
    addr: &str,
    request: ControlRequest,
) -> Result<ControlReply, crate::MasterError> {
    let mut stream = TcpStream::connect(addr).await?;
    paxoi_wire::write_frame(&mut stream, &request).await?;
    let reply: Option<ControlReply> = paxoi_wire::read_frame(&mut stream).await?;
    reply.ok_or_else(|| {
        crate::MasterError::Unreachable(addr.to_string(), "connection closed".into())
    })
}

impl From<std::io::Error> for crate::MasterError {
    fn from(e: std::io::Error) -> Self {
        crate::MasterError::Io(e.to_string())
    }
}

impl From<paxoi_wire::WireError> for crate::MasterError {
    fn from(e: paxoi_wire::WireError) -> Self {
        crate::MasterError::Io(e.to_string())
    }
}
