//! Pluggable conflict relations.
//!
//! Dependency sets must capture every pair of non-commutative
//! commands. How "non-commutative" is judged is deployment policy:
//! the identity relation is always safe, the per-key relation admits
//! more fast paths for key-value workloads.

use paxoi_types::Command;

/// The relation deciding which pending commands a new command depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictRelation {
    /// Every pair of commands conflicts.
    All,

    /// Commands conflict iff they touch the same key and at least one
    /// writes.
    PerKey,
}

impl ConflictRelation {
    pub fn conflicts(self, a: &Command, b: &Command) -> bool {
        match self {
            ConflictRelation::All => true,
            ConflictRelation::PerKey => a.conflicts_with(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxoi_types::{Key, Value};

    #[test]
    fn identity_relation_conflicts_everything() {
        let a = Command::get(Key::new(1));
        let b = Command::get(Key::new(2));
        assert!(ConflictRelation::All.conflicts(&a, &b));
    }

    #[test]
    fn per_key_relation_needs_a_shared_key_and_a_write() {
        let put1 = Command::put(Key::new(1), Value::from("x"));
        let get1 = Command::get(Key::new(1));
        let get2 = Command::get(Key::new(2));
        assert!(ConflictRelation::PerKey.conflicts(&put1, &get1));
        assert!(!ConflictRelation::PerKey.conflicts(&put1, &get2));
        assert!(!ConflictRelation::PerKey.conflicts(&get1, &get1));
    }
}
