//! Paxoi state-machine replication.
//!
//! A leader-driven consensus protocol with fast and slow decision
//! paths, per-command dependency tracking, and content checksums.
//! Commands commit on the **fast path** when ⌈3n/4⌉ replicas report
//! byte-identical dependency checksums, and on the **slow path** with
//! ⌊n/2⌋+1 acknowledgements regardless of checksum; clients mirror the
//! same decision logic and learn outcomes without a leader round trip.
//!
//! # Architecture
//!
//! ```text
//! Client ──Propose──► every replica
//!                        │ dep = pending conflicts, hs = checksum(dep)
//!                        ├──FastAck──► peers + client
//!                        │
//!        fast: ⌈3n/4⌉ matching checksums ─┐
//!        slow: ⌊n/2⌋+1 acks (any checksum)─┤─► COMMIT ─► DELIVER
//!                        │                 │      │
//!                        │◄───Accept───────┘      └─► reply channel
//! ```
//!
//! On leader failure the master designates a successor, which runs the
//! recovery subprotocol: `NewLeader` → majority of `NewLeaderAck` →
//! `ShareState` from the freshest replica → `Sync` snapshot → NORMAL.
//!
//! # Crate Layout
//!
//! - [`quorum`]: majority / three-quarters / active-quorum predicates
//! - [`msgset`]: quorum accumulation with exactly-once firing
//! - [`message`]: the wire message set
//! - [`desc`]: per-command descriptors and the history ring
//! - [`replica`]: the event loop, normal path, and recovery
//! - [`reply`]: the reply channel task
//! - [`client`]: client-side commit detection
//! - [`conflict`]: pluggable conflict relations
//! - [`transport`]: typed inboxes, in-process and TCP meshes

pub mod client;
pub mod conflict;
pub mod desc;
pub mod message;
pub mod msgset;
pub mod quorum;
pub mod replica;
pub mod reply;
pub mod transport;

pub use client::{Client, Decision};
pub use conflict::ConflictRelation;
pub use desc::{CommandDesc, HISTORY_SIZE, History, Phase};
pub use message::{Message, Propose, ProposeReplyTS};
pub use msgset::{Fired, MsgSet};
pub use quorum::{Quorum, QuorumFile};
pub use replica::{
    BeTheLeaderInfo, ControlEvent, LoopEvent, Replica, ReplicaConfig, Status,
};
pub use reply::ReplyChan;
pub use transport::{ChannelMesh, Hello, InboxReceivers, Inboxes, Mesh, TcpMesh, inboxes};
