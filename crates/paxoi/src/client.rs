//! Client-side commit detection.
//!
//! A Paxoi client broadcasts its command to every replica and then
//! mirrors the replicas' own decision logic over the acknowledgements
//! it receives, learning the outcome without a round trip through the
//! leader: the same two message sets, the same compatibility
//! predicate, the same fast/slow quorums.
//!
//! This type is sans-I/O: the owner feeds it every message arriving on
//! the client connection and gets back a [`Decision`] when a command's
//! outcome is known.

use std::collections::HashSet;

use tracing::debug;

use paxoi_types::{Ballot, ClientId, CommandId, Value};

use crate::message::{
    MAccept, MAcks, MFastAck, MLightSlowAck, MOptAcks, MReply, Message, is_nil_dep_of_cmd_id,
};
use crate::msgset::MsgSet;
use crate::quorum::Quorum;

/// A command outcome the client learned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub cmd_id: CommandId,
    pub value: Value,
}

/// Mirror of the replica-side quorum logic, one instance per client.
pub struct Client {
    id: ClientId,
    n: usize,
    ballot: Option<Ballot>,
    delivered: HashSet<CommandId>,
    fast_path_h: MsgSet<MFastAck>,
    slow_path_h: MsgSet<MFastAck>,
    /// Degenerate the fast quorum to majority: disables fast
    /// decisions in exchange for lower message-set memory.
    fixed_majority: bool,
    /// Commands that went down the slow path, and their count.
    already_slow: HashSet<CommandId>,
    slow_paths: usize,
    /// Value carried by the latest leader reply or accept.
    val: Option<Value>,
    /// Read-only mode: reads do not count toward slow-path stats.
    pub reading: bool,
}

impl Client {
    pub fn new(id: ClientId, n: usize, fixed_majority: bool) -> Self {
        let (fq, sq) = Self::quorums(n, fixed_majority);
        Self {
            id,
            n,
            ballot: None,
            delivered: HashSet::new(),
            fast_path_h: MsgSet::new(fq, MFastAck::compatible),
            slow_path_h: MsgSet::new(sq, MFastAck::compatible),
            fixed_majority,
            already_slow: HashSet::new(),
            slow_paths: 0,
            val: None,
            reading: false,
        }
    }

    fn quorums(n: usize, fixed_majority: bool) -> (Quorum, Quorum) {
        let fq = if fixed_majority {
            Quorum::majority_of(n)
        } else {
            Quorum::three_quarters_of(n)
        };
        (fq, Quorum::majority_of(n))
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    /// How many commands resolved through the slow path.
    pub fn slow_paths(&self) -> usize {
        self.slow_paths
    }

    /// Feeds one message from the connection; returns the decision it
    /// completed, if any.
    pub fn handle_message(&mut self, msg: Message) -> Option<Decision> {
        match msg {
            Message::Reply(r) => self.handle_reply(r),
            Message::Accept(a) => self.handle_accept(a),
            Message::FastAck(f) => self.handle_fast_ack(f, false),
            Message::LightSlowAck(ls) => self.handle_light_slow_ack(ls),
            Message::Acks(acks) => self.handle_acks(acks),
            Message::OptAcks(oa) => self.handle_opt_acks(oa),
            Message::ReadReply(r) => {
                // Read replies resolve directly; no quorum needed.
                Some(Decision {
                    cmd_id: r.cmd_id,
                    value: r.rep,
                })
            }
            _ => None,
        }
    }

    // ========================================================================
    // Handlers (mirroring the replica's decision logic)
    // ========================================================================

    pub fn handle_fast_ack(&mut self, f: MFastAck, from_leader: bool) -> Option<Decision> {
        match self.ballot {
            None => self.ballot = Some(f.ballot),
            Some(b) if b < f.ballot => {
                self.ballot = Some(f.ballot);
                self.reinit_fast_and_slow_acks();
            }
            Some(b) if b > f.ballot => return None,
            Some(_) => {}
        }

        if self.delivered.contains(&f.cmd_id) {
            return None;
        }

        let cmd_id = f.cmd_id;
        let fired = self.fast_path_h.add(f.replica, from_leader, f);
        fired.and_then(|fired| self.decide(cmd_id, fired.leader_msg.is_some()))
    }

    pub fn handle_light_slow_ack(&mut self, ls: MLightSlowAck) -> Option<Decision> {
        if self.delivered.contains(&ls.cmd_id) {
            return None;
        }
        self.note_slow_path(ls.cmd_id);

        let f = ls.into_fast_ack();
        let first = self.handle_fast_ack(f.clone(), false);
        if first.is_some() {
            return first;
        }
        if self.delivered.contains(&f.cmd_id) {
            return None;
        }
        let cmd_id = f.cmd_id;
        let fired = self.slow_path_h.add(f.replica, false, f);
        fired.and_then(|fired| self.decide(cmd_id, fired.leader_msg.is_some()))
    }

    /// The leader's optimistic reply: both the value and the leader's
    /// fast ack in one message.
    pub fn handle_reply(&mut self, r: MReply) -> Option<Decision> {
        if self.delivered.contains(&r.cmd_id) {
            return None;
        }
        let f = MFastAck {
            replica: r.replica,
            ballot: r.ballot,
            cmd_id: r.cmd_id,
            dep: paxoi_types::Dep::new(),
            checksum: r.checksum,
        };
        self.val = Some(r.rep);

        let first = self.handle_fast_ack(f.clone(), true);
        if first.is_some() {
            return first;
        }
        if self.delivered.contains(&f.cmd_id) {
            return None;
        }
        let cmd_id = f.cmd_id;
        let fired = self.slow_path_h.add(f.replica, true, f);
        fired.and_then(|fired| self.decide(cmd_id, fired.leader_msg.is_some()))
    }

    /// A follower's commit signal resolves the command outright.
    pub fn handle_accept(&mut self, a: MAccept) -> Option<Decision> {
        if self.delivered.contains(&a.cmd_id) {
            return None;
        }
        self.delivered.insert(a.cmd_id);
        self.val = Some(a.rep.clone());
        debug!(cmd_id = %a.cmd_id, slow_paths = self.slow_paths, "commit signal");
        self.reinit_fast_and_slow_acks();
        Some(Decision {
            cmd_id: a.cmd_id,
            value: a.rep,
        })
    }

    pub fn handle_acks(&mut self, acks: MAcks) -> Option<Decision> {
        let mut decision = None;
        for f in acks.fast_acks {
            decision = decision.or(self.handle_fast_ack(f, false));
        }
        for ls in acks.light_slow_acks {
            decision = decision.or(self.handle_light_slow_ack(ls));
        }
        decision
    }

    /// Unpacks a batched ack; nil-dep entries are slow-path votes.
    pub fn handle_opt_acks(&mut self, oa: MOptAcks) -> Option<Decision> {
        let mut decision = None;
        for ack in oa.acks {
            let slow = is_nil_dep_of_cmd_id(ack.cmd_id, &ack.dep);
            let f = MFastAck {
                replica: oa.replica,
                ballot: oa.ballot,
                cmd_id: ack.cmd_id,
                dep: paxoi_types::Dep::new(),
                checksum: if slow { None } else { ack.checksum },
            };
            if slow {
                self.note_slow_path(f.cmd_id);
            }
            let first = self.handle_fast_ack(f.clone(), false);
            let second = if first.is_none()
                && f.checksum.is_none()
                && !self.delivered.contains(&f.cmd_id)
            {
                let cmd_id = f.cmd_id;
                self.slow_path_h
                    .add(f.replica, false, f)
                    .and_then(|fired| self.decide(cmd_id, fired.leader_msg.is_some()))
            } else {
                None
            };
            decision = decision.or(first).or(second);
        }
        decision
    }

    // ========================================================================
    // Decision
    // ========================================================================

    fn decide(&mut self, cmd_id: CommandId, has_leader: bool) -> Option<Decision> {
        if !has_leader || self.delivered.contains(&cmd_id) {
            return None;
        }
        self.delivered.insert(cmd_id);
        debug!(%cmd_id, slow_paths = self.slow_paths, "commit detected");
        self.reinit_fast_and_slow_acks();
        Some(Decision {
            cmd_id,
            value: self.val.clone().unwrap_or_default(),
        })
    }

    fn note_slow_path(&mut self, cmd_id: CommandId) {
        if !self.reading && !self.already_slow.contains(&cmd_id) {
            self.slow_paths += 1;
            self.already_slow.insert(cmd_id);
        }
    }

    fn reinit_fast_and_slow_acks(&mut self) {
        let (fq, sq) = Self::quorums(self.n, self.fixed_majority);
        self.fast_path_h.reinit(fq, MFastAck::compatible);
        self.slow_path_h.reinit(sq, MFastAck::compatible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxoi_types::{Dep, ReplicaId, SHash, SeqNum};

    fn cmd_id() -> CommandId {
        CommandId::new(ClientId::new(1), SeqNum::new(1))
    }

    fn fast_ack(replica: i32, checksum: Option<Vec<SHash>>) -> MFastAck {
        MFastAck {
            replica: ReplicaId::new(replica),
            ballot: Ballot::ZERO,
            cmd_id: cmd_id(),
            dep: Dep::new(),
            checksum,
        }
    }

    fn reply(replica: i32, checksum: Option<Vec<SHash>>, val: &str) -> MReply {
        MReply {
            replica: ReplicaId::new(replica),
            ballot: Ballot::ZERO,
            cmd_id: cmd_id(),
            checksum,
            rep: Value::from(val),
        }
    }

    #[test]
    fn fast_path_decision_with_matching_checksums() {
        let mut client = Client::new(ClientId::new(1), 3, false);
        let hs = Some(Dep::new().checksum_vec());

        assert!(client.handle_reply(reply(0, hs.clone(), "x")).is_none());
        assert!(client.handle_fast_ack(fast_ack(1, hs.clone()), false).is_none());
        let decision = client
            .handle_fast_ack(fast_ack(2, hs), false)
            .expect("three matching acks");
        assert_eq!(decision.value, Value::from("x"));
        assert_eq!(client.slow_paths(), 0);
    }

    #[test]
    fn slow_path_fires_first_on_divergent_checksums() {
        // Two fast acks with the leader's checksum plus one light slow
        // ack: the slow set (leader + slow votes) reaches majority
        // before the fast set reaches three of three.
        let mut client = Client::new(ClientId::new(1), 3, false);
        let hs = Some(Dep::new().checksum_vec());

        assert!(client.handle_reply(reply(0, hs, "x")).is_none());
        let decision = client
            .handle_light_slow_ack(MLightSlowAck {
                replica: ReplicaId::new(1),
                ballot: Ballot::ZERO,
                cmd_id: cmd_id(),
            })
            .expect("leader plus one slow vote is a majority");
        assert_eq!(decision.value, Value::from("x"));
        assert_eq!(client.slow_paths(), 1);
    }

    #[test]
    fn slow_path_counter_is_guarded_per_command() {
        let mut client = Client::new(ClientId::new(1), 5, false);
        for replica in 1..=3 {
            client.handle_light_slow_ack(MLightSlowAck {
                replica: ReplicaId::new(replica),
                ballot: Ballot::ZERO,
                cmd_id: cmd_id(),
            });
        }
        assert_eq!(client.slow_paths(), 1);
    }

    #[test]
    fn accept_resolves_immediately() {
        let mut client = Client::new(ClientId::new(1), 3, false);
        let decision = client
            .handle_accept(MAccept {
                replica: ReplicaId::new(2),
                ballot: Ballot::ZERO,
                cmd_id: cmd_id(),
                rep: Value::from("y"),
            })
            .expect("commit signal");
        assert_eq!(decision.value, Value::from("y"));

        // Later acks for the same command are ignored.
        assert!(client
            .handle_fast_ack(fast_ack(0, None), true)
            .is_none());
    }

    #[test]
    fn stale_ballot_acks_are_dropped() {
        let mut client = Client::new(ClientId::new(1), 3, false);
        let mut newer = fast_ack(0, None);
        newer.ballot = Ballot::new(3);
        client.handle_fast_ack(newer, true);

        let old = fast_ack(1, None);
        assert!(client.handle_fast_ack(old, false).is_none());
    }

    #[test]
    fn ballot_advance_reinitializes_the_sets() {
        let mut client = Client::new(ClientId::new(1), 3, false);
        let hs = Some(Dep::new().checksum_vec());

        // Two acks at ballot 0...
        client.handle_reply(reply(0, hs.clone(), "x"));
        client.handle_fast_ack(fast_ack(1, hs.clone()), false);

        // ...then the ballot advances: the old votes must not count.
        let mut newer = fast_ack(2, hs);
        newer.ballot = Ballot::new(3);
        assert!(client.handle_fast_ack(newer, false).is_none());
    }

    #[test]
    fn fixed_majority_degenerates_the_fast_quorum() {
        let mut client = Client::new(ClientId::new(1), 5, true);
        let hs = Some(Dep::new().checksum_vec());

        client.handle_reply(reply(0, hs.clone(), "x"));
        client.handle_fast_ack(fast_ack(1, hs.clone()), false);
        let decision = client
            .handle_fast_ack(fast_ack(2, hs), false)
            .expect("majority of five with matching checksums");
        assert_eq!(decision.value, Value::from("x"));
    }
}
