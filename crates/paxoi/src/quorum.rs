//! Quorum predicates.
//!
//! Three quorum shapes drive commit decisions:
//!
//! - **Majority** (`⌊n/2⌋+1`): the slow path and recovery handshakes.
//! - **Three-quarters** (`⌈3n/4⌉`): the fast path.
//! - **Active quorum**: a fixed replica set loaded from the quorum
//!   configuration file, keyed by ballot. Restricts which replicas'
//!   checksums count toward a fast commit in skewed deployments.
//!
//! A quorum is a predicate over replica ids plus a size; accumulators
//! must consult [`Quorum::contains`] rather than counting raw
//! messages, because an active quorum admits only its members.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use paxoi_types::{Ballot, ReplicaId};

// ============================================================================
// Quorum
// ============================================================================

/// A quorum predicate over replica ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quorum {
    /// Any `⌊n/2⌋+1` replicas.
    Majority { n: usize },

    /// Any `⌈3n/4⌉` replicas.
    ThreeQuarters { n: usize },

    /// Exactly this replica set (an active quorum).
    Fixed { members: BTreeSet<ReplicaId> },
}

impl Quorum {
    pub fn majority_of(n: usize) -> Self {
        Quorum::Majority { n }
    }

    pub fn three_quarters_of(n: usize) -> Self {
        Quorum::ThreeQuarters { n }
    }

    pub fn fixed(members: impl IntoIterator<Item = ReplicaId>) -> Self {
        Quorum::Fixed {
            members: members.into_iter().collect(),
        }
    }

    /// Whether `replica`'s messages count toward this quorum.
    pub fn contains(&self, replica: ReplicaId) -> bool {
        match self {
            Quorum::Majority { .. } | Quorum::ThreeQuarters { .. } => true,
            Quorum::Fixed { members } => members.contains(&replica),
        }
    }

    /// Number of counting replicas required to fire.
    pub fn size(&self) -> usize {
        match self {
            Quorum::Majority { n } => n / 2 + 1,
            Quorum::ThreeQuarters { n } => (3 * n).div_ceil(4),
            Quorum::Fixed { members } => members.len(),
        }
    }
}

// ============================================================================
// Quorum Configuration File
// ============================================================================

/// The ballot → active-quorum mapping loaded from the quorum file.
///
/// File format: one entry per line, `<ballot> <id> <id> …`, with `#`
/// comments and blank lines ignored. Ballots absent from the file fall
/// back to the three-quarters quorum.
#[derive(Debug, Clone, Default)]
pub struct QuorumFile {
    entries: HashMap<i32, BTreeSet<ReplicaId>>,
}

impl QuorumFile {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, QuorumFileError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| QuorumFileError::Io(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, QuorumFileError> {
        let mut entries = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let ballot: i32 = fields
                .next()
                .expect("non-empty line has a first field")
                .parse()
                .map_err(|_| QuorumFileError::Malformed(lineno + 1))?;
            let members = fields
                .map(|f| f.parse::<i32>().map(ReplicaId::new))
                .collect::<Result<BTreeSet<_>, _>>()
                .map_err(|_| QuorumFileError::Malformed(lineno + 1))?;
            if members.is_empty() {
                return Err(QuorumFileError::Malformed(lineno + 1));
            }
            entries.insert(ballot, members);
        }
        Ok(Self { entries })
    }

    /// The active quorum at `ballot`, or `None` when unconfigured.
    pub fn active_quorum(&self, ballot: Ballot) -> Option<Quorum> {
        self.entries.get(&ballot.as_i32()).map(|members| Quorum::Fixed {
            members: members.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuorumFileError {
    #[error("cannot read quorum file {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("malformed quorum file entry at line {0}")]
    Malformed(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(3, 2; "three replicas")]
    #[test_case(5, 3; "five replicas")]
    #[test_case(7, 4; "seven replicas")]
    fn majority_sizes(n: usize, q: usize) {
        assert_eq!(Quorum::majority_of(n).size(), q);
    }

    #[test_case(3, 3; "three replicas")]
    #[test_case(4, 3; "four replicas")]
    #[test_case(5, 4; "five replicas")]
    #[test_case(7, 6; "seven replicas")]
    fn three_quarter_sizes(n: usize, q: usize) {
        assert_eq!(Quorum::three_quarters_of(n).size(), q);
    }

    #[test]
    fn size_quorums_admit_everyone() {
        let q = Quorum::majority_of(3);
        for id in 0..5 {
            assert!(q.contains(ReplicaId::new(id)));
        }
    }

    #[test]
    fn fixed_quorum_admits_only_members() {
        let q = Quorum::fixed([ReplicaId::new(0), ReplicaId::new(2)]);
        assert!(q.contains(ReplicaId::new(0)));
        assert!(!q.contains(ReplicaId::new(1)));
        assert!(q.contains(ReplicaId::new(2)));
        assert_eq!(q.size(), 2);
    }

    #[test]
    fn quorum_file_parses_entries_and_comments() {
        let qf = QuorumFile::parse("# skewed deployment\n0 0 1\n\n3 1 2\n").expect("parse");
        let aq = qf.active_quorum(Ballot::new(0)).expect("entry for 0");
        assert!(aq.contains(ReplicaId::new(0)));
        assert!(aq.contains(ReplicaId::new(1)));
        assert!(!aq.contains(ReplicaId::new(2)));
        assert!(qf.active_quorum(Ballot::new(1)).is_none());
    }

    #[test]
    fn quorum_file_rejects_garbage() {
        assert!(QuorumFile::parse("zero 1 2").is_err());
        assert!(QuorumFile::parse("4").is_err());
    }

    #[test]
    fn quorum_file_loads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("quorums.conf");
        std::fs::write(&path, "1 0 1 2\n").expect("write");
        let qf = QuorumFile::load(&path).expect("load");
        assert_eq!(qf.active_quorum(Ballot::new(1)).expect("entry").size(), 3);
    }
}
