//! Dependency sets.
//!
//! A [`Dep`] is the ordered list of command ids a command depends on
//! (every prior conflicting command known to the acknowledging
//! replica). It is conceptually a set, but checksum reproducibility
//! requires a fixed order: replicas agree on the digest only if they
//! agree on the *sequence*, so every digest is computed over the
//! canonically sorted, deduplicated list.

use serde::{Deserialize, Serialize};

use crate::{CommandId, SHash};

/// Ordered list of command ids a command depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dep(Vec<CommandId>);

impl Dep {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_ids(ids: Vec<CommandId>) -> Self {
        Self(ids)
    }

    pub fn push(&mut self, id: CommandId) {
        self.0.push(id);
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.0.contains(id)
    }

    pub fn ids(&self) -> &[CommandId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorts and deduplicates in place.
    ///
    /// Must be applied before [`Dep::checksum`]; two replicas that
    /// agree on the set then agree on the digest.
    pub fn canonicalize(&mut self) {
        self.0.sort_unstable();
        self.0.dedup();
    }

    /// Digest of the canonical encoding of this dependency list.
    ///
    /// The empty list has a well-defined digest (the hash of the empty
    /// byte string), so "no dependencies" is itself comparable.
    pub fn checksum(&self) -> SHash {
        let mut canonical = self.clone();
        canonical.canonicalize();
        let mut hasher = blake3::Hasher::new();
        for id in &canonical.0 {
            hasher.update(&id.to_bytes());
        }
        SHash::from_bytes(*hasher.finalize().as_bytes())
    }

    /// The checksum sequence carried by acknowledgement messages.
    pub fn checksum_vec(&self) -> Vec<SHash> {
        vec![self.checksum()]
    }
}

impl FromIterator<CommandId> for Dep {
    fn from_iter<I: IntoIterator<Item = CommandId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Dep {
    type Item = &'a CommandId;
    type IntoIter = std::slice::Iter<'a, CommandId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, SeqNum};
    use proptest::prelude::*;

    fn cmd_id(client: i32, seq: i32) -> CommandId {
        CommandId::new(ClientId::new(client), SeqNum::new(seq))
    }

    #[test]
    fn checksum_ignores_presentation_order() {
        let a = Dep::from_ids(vec![cmd_id(1, 1), cmd_id(2, 1), cmd_id(1, 2)]);
        let b = Dep::from_ids(vec![cmd_id(2, 1), cmd_id(1, 2), cmd_id(1, 1)]);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn checksum_distinguishes_different_sets() {
        let a = Dep::from_ids(vec![cmd_id(1, 1)]);
        let b = Dep::from_ids(vec![cmd_id(1, 2)]);
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn empty_dep_has_a_digest() {
        let empty = Dep::new();
        assert_eq!(empty.checksum(), Dep::new().checksum());
        assert_eq!(empty.checksum_vec().len(), 1);
    }

    #[test]
    fn duplicates_do_not_change_the_digest() {
        let a = Dep::from_ids(vec![cmd_id(1, 1), cmd_id(1, 1)]);
        let b = Dep::from_ids(vec![cmd_id(1, 1)]);
        assert_eq!(a.checksum(), b.checksum());
    }

    proptest! {
        // Checksum determinism across permutations.
        #[test]
        fn checksum_is_permutation_invariant(
            ids in proptest::collection::vec((0..16i32, 0..64i32), 0..12),
            seed in any::<u64>(),
        ) {
            let dep: Dep = ids.iter().map(|&(c, s)| cmd_id(c, s)).collect();

            // Deterministic shuffle driven by the seed.
            let mut shuffled: Vec<CommandId> =
                ids.iter().map(|&(c, s)| cmd_id(c, s)).collect();
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state % (i as u64 + 1)) as usize;
                shuffled.swap(i, j);
            }

            prop_assert_eq!(dep.checksum(), Dep::from_ids(shuffled).checksum());
        }
    }
}
