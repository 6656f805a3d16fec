//! Foundation types for the Paxoi replication protocol.
//!
//! This crate defines the identifiers and value types shared by every
//! other crate in the workspace:
//!
//! - [`ReplicaId`], [`ClientId`], [`SeqNum`]: participant identities
//! - [`CommandId`]: the (client, sequence) pair naming one request
//! - [`Ballot`]: leader-epoch counter encoding the proposer identity
//! - [`SHash`]: 32-byte digest used to compare dependency sets
//! - [`Dep`]: ordered dependency list with a canonical checksum
//! - [`Command`], [`Value`], [`KvStore`]: the replicated application
//!
//! All wire-visible types derive `Serialize`/`Deserialize`; the wire
//! codec itself lives in `paxoi-wire`.

mod command;
mod dep;

pub use command::{Command, Key, KvStore, OpKind, Value};
pub use dep::Dep;

use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Participant Identifiers
// ============================================================================

/// Identifier of one replica in the cluster.
///
/// Replica ids are dense: a cluster of `n` replicas uses ids `0..n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(i32);

impl ReplicaId {
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Index into per-replica vectors.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ReplicaId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Identifier of one client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(i32);

impl ClientId {
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-client request sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNum(i32);

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub const fn new(n: i32) -> Self {
        Self(n)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Command Identifier
// ============================================================================

/// Unique name of one client request: (client, sequence number).
///
/// Ordering is lexicographic (client first), which fixes the canonical
/// order used when checksumming dependency sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId {
    pub client_id: ClientId,
    pub seq_num: SeqNum,
}

impl CommandId {
    pub const fn new(client_id: ClientId, seq_num: SeqNum) -> Self {
        Self { client_id, seq_num }
    }

    /// Canonical 8-byte encoding fed into dependency checksums.
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.client_id.as_i32().to_le_bytes());
        out[4..].copy_from_slice(&self.seq_num.as_i32().to_le_bytes());
        out
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.seq_num)
    }
}

// ============================================================================
// Ballot
// ============================================================================

/// Leader-epoch counter.
///
/// A ballot encodes both the election generation and the proposer: the
/// replica `b mod n` is the leader at ballot `b` in a cluster of `n`.
/// Ballots only ever increase on a replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot(i32);

impl Ballot {
    pub const ZERO: Ballot = Ballot(0);

    pub const fn new(b: i32) -> Self {
        Self(b)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// The replica leading at this ballot in a cluster of `n`.
    pub fn leader(self, n: usize) -> ReplicaId {
        ReplicaId::new(self.0.rem_euclid(n as i32))
    }

    /// Election generation (how many leader transitions preceded it).
    pub fn generation(self, n: usize) -> i32 {
        self.0 / n as i32
    }

    /// Smallest ballot strictly greater than `self` led by `replica`.
    ///
    /// Used when a replica takes over leadership: the new ballot must
    /// both supersede everything seen and name the new leader.
    pub fn next_for(self, replica: ReplicaId, n: usize) -> Ballot {
        let n = n as i32;
        let mut b = (self.0 / n + 1) * n + replica.as_i32();
        if b <= self.0 {
            b += n;
        }
        Ballot(b)
    }
}

impl Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SHash
// ============================================================================

/// Length of dependency checksums in bytes (BLAKE3).
pub const SHASH_LENGTH: usize = 32;

/// A 32-byte digest of a canonicalized dependency set.
///
/// Two replicas that computed the same canonical dependency sequence
/// produce bytewise-equal digests; the commit fast path compares these
/// instead of shipping dependency contents.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SHash([u8; SHASH_LENGTH]);

impl SHash {
    pub const fn from_bytes(bytes: [u8; SHASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; SHASH_LENGTH] {
        &self.0
    }

    /// Digest of an arbitrary byte string.
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl Debug for SHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SHash({:02x}{:02x}{:02x}{:02x}…)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl Display for SHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for SHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Element-wise equality of two checksum sequences.
pub fn shashes_eq(a: &[SHash], b: &[SHash]) -> bool {
    a == b
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn command_id_ordering_is_client_first() {
        let a = CommandId::new(ClientId::new(1), SeqNum::new(9));
        let b = CommandId::new(ClientId::new(2), SeqNum::new(1));
        assert!(a < b);
    }

    #[test_case(0, 3, 0; "ballot zero leads replica zero")]
    #[test_case(1, 3, 1; "ballot one leads replica one")]
    #[test_case(5, 3, 2; "wraps modulo cluster size")]
    #[test_case(6, 3, 0; "second generation back to zero")]
    fn ballot_leader(ballot: i32, n: usize, leader: i32) {
        assert_eq!(Ballot::new(ballot).leader(n), ReplicaId::new(leader));
    }

    #[test]
    fn next_ballot_names_the_new_leader_and_increases() {
        let n = 3;
        let b = Ballot::ZERO;
        let b1 = b.next_for(ReplicaId::new(1), n);
        assert!(b1 > b);
        assert_eq!(b1.leader(n), ReplicaId::new(1));

        // Taking over again from a later ballot still increases.
        let b2 = b1.next_for(ReplicaId::new(0), n);
        assert!(b2 > b1);
        assert_eq!(b2.leader(n), ReplicaId::new(0));
    }

    #[test]
    fn next_ballot_for_current_leader_advances_a_generation() {
        let n = 3;
        let b = Ballot::new(4); // leader 1
        let again = b.next_for(ReplicaId::new(1), n);
        assert!(again > b);
        assert_eq!(again.leader(n), ReplicaId::new(1));
    }

    #[test]
    fn shash_digest_is_stable() {
        let a = SHash::digest(b"paxoi");
        let b = SHash::digest(b"paxoi");
        let c = SHash::digest(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn command_id_bytes_are_little_endian() {
        let id = CommandId::new(ClientId::new(1), SeqNum::new(2));
        assert_eq!(id.to_bytes(), [1, 0, 0, 0, 2, 0, 0, 0]);
    }
}
