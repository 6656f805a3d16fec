//! The recovery subprotocol.
//!
//! Triggered when a replica sees `MNewLeader` at a higher ballot
//! (its own master-driven promotion included):
//!
//! 1. status leaves NORMAL, the ballot advances, every active
//!    descriptor worker is stopped behind a barrier;
//! 2. the new leader gathers a majority of `MNewLeaderAck` and asks a
//!    replica with the highest commit ballot (preferring the active
//!    quorum of that ballot) to share state;
//! 3. the share-state recipient broadcasts a `MSync` snapshot built
//!    from its history ring and its live descriptors — or `MLightSync`
//!    when there is nothing to reconcile;
//! 4. handling the snapshot replaces the per-command tables,
//!    re-enqueues undelivered committed work, and restores NORMAL.
//!
//! While not NORMAL, the event loop drains only the recovery inboxes;
//! normal traffic stays buffered, so no descriptor is created at a
//! ballot about to be superseded.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use paxoi_types::{Ballot, ReplicaId};

use crate::desc::Phase;
use crate::message::{
    MLightSync, MNewLeader, MNewLeaderAck, MShareState, MSync, Message,
};
use crate::quorum::Quorum;

use super::{BeTheLeaderInfo, Replica, Status};

impl Replica {
    // ========================================================================
    // Master-Driven Promotion
    // ========================================================================

    /// Handles the master's `BeTheLeader` call: pick the next ballot
    /// this replica leads, announce it, and run recovery as initiator.
    pub(crate) async fn be_the_leader(&mut self, reply: oneshot::Sender<BeTheLeaderInfo>) {
        let ballot = self.ballot.next_for(self.cfg.id, self.cfg.n);
        info!(replica = %self.cfg.id, %ballot, "designated leader by the master");

        let _ = reply.send(BeTheLeaderInfo {
            leader: self.cfg.id,
            next_leader: self.next_leader(),
        });

        if self.cfg.aq_reconf {
            self.suggest_active_quorum(ballot);
        }

        self.mesh.send_to_all(Message::NewLeader(MNewLeader {
            replica: self.cfg.id,
            ballot,
        }));
        self.begin_recovery(ballot, self.cfg.id).await;
    }

    /// Logs the latency-optimal majority coterie for the new ballot.
    /// The quorum file stays authoritative; this is operator guidance.
    fn suggest_active_quorum(&self, ballot: Ballot) {
        let mut peers: Vec<(ReplicaId, std::time::Duration)> = self
            .latencies
            .iter()
            .map(|(&id, &rtt)| (id, rtt))
            .collect();
        peers.sort_by_key(|(_, rtt)| *rtt);
        let take = self.cfg.n / 2; // self plus the fastest half
        let coterie: Vec<i32> = std::iter::once(self.cfg.id.as_i32())
            .chain(peers.iter().take(take).map(|(id, _)| id.as_i32()))
            .collect();
        info!(%ballot, ?coterie, "latency-optimal active quorum for this ballot");
    }

    // ========================================================================
    // NewLeader
    // ========================================================================

    pub(crate) async fn handle_new_leader(&mut self, nl: MNewLeader) {
        if nl.ballot <= self.ballot {
            trace!(ballot = %nl.ballot, "stale NewLeader dropped");
            return;
        }
        info!(replica = %self.cfg.id, from = %nl.replica, ballot = %nl.ballot, "entering recovery");
        self.begin_recovery(nl.ballot, nl.replica).await;
    }

    /// Common entry into recovery at `ballot`, initiated by
    /// `initiator` (possibly this replica).
    pub(crate) async fn begin_recovery(&mut self, ballot: Ballot, initiator: ReplicaId) {
        self.status = if initiator == self.cfg.id {
            Status::Preparing
        } else {
            Status::Recovering
        };
        self.ballot = ballot;
        self.stop_descs().await;
        self.new_leader_acks
            .reinit(Quorum::majority_of(self.cfg.n), |_, _| true);

        let ack = MNewLeaderAck {
            replica: self.cfg.id,
            ballot,
            cballot: self.cballot,
        };
        if initiator == self.cfg.id {
            self.handle_new_leader_ack(ack).await;
        } else {
            self.mesh.send_to(initiator, Message::NewLeaderAck(ack));
        }
    }

    // ========================================================================
    // NewLeaderAck
    // ========================================================================

    pub(crate) async fn handle_new_leader_ack(&mut self, ack: MNewLeaderAck) {
        if ack.ballot != self.ballot || self.status != Status::Preparing {
            trace!(ballot = %ack.ballot, "unexpected NewLeaderAck dropped");
            return;
        }

        let Some(fired) = self.new_leader_acks.add(ack.replica, false, ack) else {
            return;
        };

        // The freshest state lives with the highest commit ballot.
        let max_cballot = fired
            .msgs
            .iter()
            .map(|a| a.cballot)
            .max()
            .expect("quorum is non-empty");
        let holders: Vec<ReplicaId> = fired
            .msgs
            .iter()
            .filter(|a| a.cballot == max_cballot)
            .map(|a| a.replica)
            .collect();
        debug!(%max_cballot, ?holders, "new-leader acks gathered");

        let recipients = self.share_state_recipients(max_cballot, &holders);
        for recipient in recipients {
            let ss = MShareState {
                replica: self.cfg.id,
                ballot: self.ballot,
            };
            if recipient == self.cfg.id {
                self.handle_share_state(ss).await;
            } else {
                self.mesh.send_to(recipient, Message::ShareState(ss));
            }
        }
    }

    /// Who should share state: a holder inside AQ(cballot) if any,
    /// else this replica when it is itself a holder, else every
    /// holder.
    fn share_state_recipients(
        &self,
        cballot: Ballot,
        holders: &[ReplicaId],
    ) -> Vec<ReplicaId> {
        if let Some(aq) = self.cfg.qfile.active_quorum(cballot) {
            let mut in_aq = holders.iter().copied().filter(|r| aq.contains(*r));
            if let Some(first) = in_aq.next() {
                // Prefer asking ourselves over a round trip.
                return if holders.contains(&self.cfg.id) && aq.contains(self.cfg.id) {
                    vec![self.cfg.id]
                } else {
                    vec![first]
                };
            }
        }
        if holders.contains(&self.cfg.id) {
            vec![self.cfg.id]
        } else {
            holders.to_vec()
        }
    }

    // ========================================================================
    // ShareState
    // ========================================================================

    /// Builds the synchronization snapshot from the history ring and
    /// every descriptor carrying a proposal, then broadcasts it. With
    /// nothing to reconcile, a light sync suffices.
    pub(crate) async fn handle_share_state(&mut self, ss: MShareState) {
        if ss.ballot != self.ballot {
            trace!(ballot = %ss.ballot, "stale ShareState dropped");
            return;
        }

        let mut phases = HashMap::new();
        let mut cmds = HashMap::new();
        let mut deps = HashMap::new();

        for entry in self.history.entries() {
            phases.insert(entry.cmd_id, Phase::Commit);
            if let Some(cmd) = &entry.cmd {
                cmds.insert(entry.cmd_id, cmd.clone());
            }
            deps.insert(entry.cmd_id, entry.dep.clone());
        }

        let mut live = 0usize;
        for (id, desc) in &self.cmd_descs {
            if desc.propose.is_some() {
                // Delivered-phase snapshots count as committed state.
                let phase = desc.phase.min(Phase::Commit);
                phases.insert(*id, phase);
                if let Some(cmd) = &desc.cmd {
                    cmds.insert(*id, cmd.clone());
                }
                deps.insert(*id, desc.dep.clone());
                live += 1;
            }
        }

        if live == 0 && phases.is_empty() {
            let ls = MLightSync {
                replica: self.cfg.id,
                ballot: self.ballot,
            };
            info!(ballot = %self.ballot, "nothing to reconcile, light sync");
            self.mesh.send_to_all(Message::LightSync(ls));
            self.handle_light_sync(ls).await;
        } else {
            let sync = MSync {
                replica: self.cfg.id,
                ballot: self.ballot,
                phases,
                cmds,
                deps,
            };
            info!(
                ballot = %self.ballot,
                entries = sync.phases.len(),
                "sharing synchronization snapshot"
            );
            self.mesh.send_to_all(Message::Sync(sync.clone()));
            self.handle_sync(sync).await;
        }
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Adopts the snapshot: per-command tables are replaced with the
    /// sender's versions, committed-but-undelivered work is
    /// re-enqueued, and the replica returns to NORMAL.
    pub(crate) async fn handle_sync(&mut self, sync: MSync) {
        if sync.ballot < self.ballot {
            trace!(ballot = %sync.ballot, "stale Sync dropped");
            return;
        }
        self.ballot = sync.ballot;

        let mut to_deliver = Vec::new();
        for (&cmd_id, &phase) in &sync.phases {
            if self.delivered.contains_key(&cmd_id) || self.history.find(cmd_id).is_some() {
                continue;
            }
            self.ensure_desc(cmd_id);
            let desc = self
                .cmd_descs
                .get_mut(&cmd_id)
                .expect("descriptor just ensured");
            if let Some(cmd) = sync.cmds.get(&cmd_id) {
                desc.cmd = Some(cmd.clone());
            }
            if let Some(dep) = sync.deps.get(&cmd_id) {
                desc.dep = dep.clone();
                desc.hs = dep.checksum_vec();
            }
            if phase >= Phase::Commit {
                desc.advance(Phase::Commit);
                to_deliver.push(cmd_id);
            } else if phase > desc.phase {
                desc.phase = phase;
            }
        }

        // Everything still pending restarts its quorums at this ballot.
        let fq = self.fast_quorum();
        let sq = self.slow_quorum();
        for desc in self.cmd_descs.values_mut() {
            if !desc.is_delivered() {
                desc.reinit_acks(fq.clone(), sq.clone());
            }
        }

        self.status = Status::Normal;
        info!(replica = %self.cfg.id, ballot = %self.ballot, "synchronized, back to normal");

        for cmd_id in to_deliver {
            self.try_deliver(cmd_id).await;
        }
    }

    /// No-divergence shortcut: adopt the ballot and resume.
    pub(crate) async fn handle_light_sync(&mut self, ls: MLightSync) {
        if ls.ballot < self.ballot {
            trace!(ballot = %ls.ballot, "stale LightSync dropped");
            return;
        }
        self.ballot = ls.ballot;

        let fq = self.fast_quorum();
        let sq = self.slow_quorum();
        for desc in self.cmd_descs.values_mut() {
            if !desc.is_delivered() {
                desc.reinit_acks(fq.clone(), sq.clone());
            }
        }

        self.status = Status::Normal;
        info!(replica = %self.cfg.id, ballot = %self.ballot, "light-synchronized, back to normal");
    }
}
