//! Quorum-accumulating message sets.
//!
//! A [`MsgSet`] collects acknowledgements of one logical kind for one
//! (command, ballot) and reports — exactly once — when a quorum of
//! *compatible* messages from distinct replicas has arrived. Fast-path
//! and slow-path detection on replicas and clients, and the
//! new-leader handshake during recovery, are all instances.
//!
//! Unlike a callback-holding container, [`MsgSet::add`] *returns* the
//! fired quorum to the caller, which routes it to the right command
//! descriptor by id. Handlers stay free of reference cycles and the
//! firing site is explicit in the calling code.

use paxoi_types::ReplicaId;

use crate::quorum::Quorum;

/// Compatibility predicate: is `msg` acceptable given the current
/// leader message (if any)?
pub type AcceptFn<M> = fn(&M, Option<&M>) -> bool;

/// The result of a quorum firing: the leader's message (when the set
/// tracks one) plus every accepted message, the leader's included.
#[derive(Debug, Clone)]
pub struct Fired<M> {
    pub leader_msg: Option<M>,
    pub msgs: Vec<M>,
}

/// Accumulates messages until a quorum of compatible ones is present.
#[derive(Debug)]
pub struct MsgSet<M> {
    quorum: Quorum,
    accept: AcceptFn<M>,
    /// Whether firing requires the leader's message to have arrived.
    /// Recovery ack sets have no leader-message notion.
    needs_leader: bool,
    leader: Option<(ReplicaId, M)>,
    /// One held message per source replica, first arrival wins.
    held: Vec<(ReplicaId, M)>,
    fired: bool,
}

impl<M: Clone> MsgSet<M> {
    /// A set whose quorum must include the leader's own message.
    ///
    /// The leader's message carries the canonical commit values, so a
    /// quorum without it is not actionable; the set holds its fire
    /// until the leader message arrives.
    pub fn new(quorum: Quorum, accept: AcceptFn<M>) -> Self {
        Self {
            quorum,
            accept,
            needs_leader: true,
            leader: None,
            held: Vec::new(),
            fired: false,
        }
    }

    /// A set with no leader-message notion (recovery handshakes).
    pub fn leaderless(quorum: Quorum, accept: AcceptFn<M>) -> Self {
        Self {
            quorum,
            accept,
            needs_leader: false,
            leader: None,
            held: Vec::new(),
            fired: false,
        }
    }

    /// Offers a message; returns the quorum if this arrival fired it.
    ///
    /// Fires at most once per instance ([`MsgSet::reinit`] resets the
    /// flag). Messages from replicas outside the quorum's `contains`
    /// predicate are held but do not count toward its size.
    pub fn add(&mut self, from: ReplicaId, is_from_leader: bool, msg: M) -> Option<Fired<M>> {
        if is_from_leader {
            self.leader = Some((from, msg));
        } else if !self.held.iter().any(|(id, _)| *id == from) {
            self.held.push((from, msg));
        }

        if self.fired {
            return None;
        }
        let leader_id = self.leader.as_ref().map(|(id, _)| *id);
        let leader_msg = self.leader.as_ref().map(|(_, m)| m);
        if self.needs_leader && leader_msg.is_none() {
            return None;
        }

        let accepted: Vec<(ReplicaId, &M)> = self
            .held
            .iter()
            .filter(|(id, _)| Some(*id) != leader_id)
            .filter(|(_, m)| (self.accept)(m, leader_msg))
            .map(|(id, m)| (*id, m))
            .collect();

        let mut counting = accepted
            .iter()
            .filter(|(id, _)| self.quorum.contains(*id))
            .count();
        if let Some(id) = leader_id {
            if self.quorum.contains(id) {
                counting += 1;
            }
        }
        if counting < self.quorum.size() {
            return None;
        }

        self.fired = true;
        let mut msgs: Vec<M> = Vec::with_capacity(accepted.len() + 1);
        if let Some((_, m)) = &self.leader {
            msgs.push(m.clone());
        }
        msgs.extend(accepted.into_iter().map(|(_, m)| m.clone()));
        Some(Fired {
            leader_msg: self.leader.as_ref().map(|(_, m)| m.clone()),
            msgs,
        })
    }

    /// Whether this set already fired.
    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// The leader's message, when it has arrived.
    pub fn leader_msg(&self) -> Option<&M> {
        self.leader.as_ref().map(|(_, m)| m)
    }

    /// Discards every held message and the leader message.
    pub fn clear(&mut self) {
        self.leader = None;
        self.held.clear();
    }

    /// In-place rebuild for a new ballot: new quorum and predicate,
    /// everything held released, the fired flag reset.
    pub fn reinit(&mut self, quorum: Quorum, accept: AcceptFn<M>) {
        self.quorum = quorum;
        self.accept = accept;
        self.leader = None;
        self.held.clear();
        self.fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxoi_types::ReplicaId;

    fn always<M>(_: &M, _: Option<&M>) -> bool {
        true
    }

    fn matching(msg: &u64, leader: Option<&u64>) -> bool {
        match leader {
            None => true,
            Some(l) => msg == l,
        }
    }

    fn rid(id: i32) -> ReplicaId {
        ReplicaId::new(id)
    }

    #[test]
    fn fires_once_at_quorum_with_leader() {
        let mut set: MsgSet<u64> = MsgSet::new(Quorum::majority_of(3), always);
        assert!(set.add(rid(0), true, 7).is_none());
        let fired = set.add(rid(1), false, 7).expect("quorum of two");
        assert_eq!(fired.leader_msg, Some(7));
        assert_eq!(fired.msgs.len(), 2);

        // Further arrivals never re-fire.
        assert!(set.add(rid(2), false, 7).is_none());
        assert!(set.has_fired());
    }

    #[test]
    fn holds_fire_until_leader_message_arrives() {
        let mut set: MsgSet<u64> = MsgSet::new(Quorum::majority_of(3), always);
        assert!(set.add(rid(1), false, 7).is_none());
        assert!(set.add(rid(2), false, 7).is_none());
        // Quorum-size messages are present but the leader's is not.
        let fired = set.add(rid(0), true, 7).expect("leader completes it");
        assert_eq!(fired.msgs.len(), 3);
    }

    #[test]
    fn incompatible_messages_do_not_count() {
        let mut set: MsgSet<u64> = MsgSet::new(Quorum::three_quarters_of(3), matching);
        assert!(set.add(rid(0), true, 7).is_none());
        assert!(set.add(rid(1), false, 8).is_none()); // disagrees
        assert!(set.add(rid(2), false, 7).is_none()); // 2 of 3 required
    }

    #[test]
    fn fast_quorum_fires_on_three_matching_of_three() {
        let mut set: MsgSet<u64> = MsgSet::new(Quorum::three_quarters_of(3), matching);
        assert!(set.add(rid(0), true, 7).is_none());
        assert!(set.add(rid(1), false, 7).is_none());
        let fired = set.add(rid(2), false, 7).expect("all three match");
        assert_eq!(fired.msgs.len(), 3);
    }

    #[test]
    fn late_compatible_message_counts_after_leader_arrives() {
        // A message incompatible with nothing (no leader yet) is held,
        // then counted once the leader message defines compatibility.
        let mut set: MsgSet<u64> = MsgSet::new(Quorum::three_quarters_of(3), matching);
        assert!(set.add(rid(1), false, 7).is_none());
        assert!(set.add(rid(2), false, 7).is_none());
        let fired = set.add(rid(0), true, 7).expect("leader + two held");
        assert_eq!(fired.msgs.len(), 3);
    }

    #[test]
    fn leaderless_set_fires_without_leader() {
        let mut set: MsgSet<u64> = MsgSet::leaderless(Quorum::majority_of(3), always);
        assert!(set.add(rid(1), false, 1).is_none());
        let fired = set.add(rid(2), false, 2).expect("majority");
        assert!(fired.leader_msg.is_none());
        assert_eq!(fired.msgs.len(), 2);
    }

    #[test]
    fn active_quorum_ignores_non_members() {
        let aq = Quorum::fixed([rid(0), rid(1)]);
        let mut set: MsgSet<u64> = MsgSet::leaderless(aq, always);
        assert!(set.add(rid(2), false, 1).is_none());
        assert!(set.add(rid(3), false, 1).is_none());
        assert!(set.add(rid(0), false, 1).is_none());
        let fired = set.add(rid(1), false, 1).expect("both members present");
        // Non-members were held, not counted.
        assert_eq!(fired.msgs.len(), 4);
    }

    #[test]
    fn duplicate_sources_count_once() {
        let mut set: MsgSet<u64> = MsgSet::new(Quorum::majority_of(5), always);
        assert!(set.add(rid(0), true, 7).is_none());
        assert!(set.add(rid(1), false, 7).is_none());
        assert!(set.add(rid(1), false, 7).is_none());
        assert!(set.add(rid(2), false, 7).is_some());
    }

    #[test]
    fn leader_source_is_not_double_counted() {
        let mut set: MsgSet<u64> = MsgSet::new(Quorum::majority_of(3), always);
        assert!(set.add(rid(0), false, 7).is_none());
        // The same replica later identified as leader: one vote, not two.
        assert!(set.add(rid(0), true, 7).is_none());
        assert!(set.add(rid(1), false, 7).is_some());
    }

    #[test]
    fn reinit_resets_the_fired_flag_and_contents() {
        let mut set: MsgSet<u64> = MsgSet::new(Quorum::majority_of(3), always);
        set.add(rid(0), true, 7);
        assert!(set.add(rid(1), false, 7).is_some());

        set.reinit(Quorum::majority_of(3), always);
        assert!(!set.has_fired());
        assert!(set.add(rid(0), true, 9).is_none());
        assert!(set.add(rid(2), false, 9).is_some());
    }
}
