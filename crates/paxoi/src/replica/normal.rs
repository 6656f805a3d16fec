//! Normal-path handlers: proposals, acknowledgements, commit, deliver.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use paxoi_types::{Ballot, Command, CommandId, Dep, SHash, Value};

use crate::desc::{CommandDesc, HistoryEntry, Phase};
use crate::message::{
    MAccept, MAcks, MFastAck, MLightSlowAck, MOptAcks, MPropose, MReply, MSlowAck, Message,
    Propose, ProposeReplyTS, is_nil_dep_of_cmd_id,
};
use crate::msgset::Fired;
use crate::reply::{ProposeMeta, ReadArgs, ReplyArgs};

use super::{LoopEvent, Replica};

impl Replica {
    // ========================================================================
    // Proposals
    // ========================================================================

    pub(crate) async fn handle_propose(&mut self, p: Propose) {
        if self.delivered.contains_key(&p.cmd_id) || self.history.find(p.cmd_id).is_some() {
            self.re_reply(&p);
            return;
        }

        // Read-only fast path: answered from local state, no consensus.
        if self.cfg.lread && p.command.is_read() {
            let val = self.store.read(p.command.key);
            self.reply_chan.read_reply(ReadArgs {
                cmd_id: p.cmd_id,
                ballot: self.ballot,
                client_id: p.client_id,
                val,
            });
            return;
        }

        let cmd_id = p.cmd_id;
        let dep = self.compute_dep(cmd_id, &p.command);
        let hs = dep.checksum_vec();
        let forward_to_leader = !self.is_leader() && self.cfg.opt_exec;

        self.ensure_desc(cmd_id);
        let fast_ack = {
            let desc = self
                .cmd_descs
                .get_mut(&cmd_id)
                .expect("descriptor just ensured");
            if desc.propose.is_some() {
                // Duplicate in-flight proposal: no new FastAck.
                trace!(%cmd_id, "duplicate proposal for in-flight command");
                return;
            }
            if desc.cmd.is_none() {
                desc.cmd = Some(p.command.clone());
            }
            desc.propose = Some(p);
            if desc.phase > Phase::Start {
                // Already past pre-accept (synced or accept-created);
                // the proposal only attaches for the eventual reply.
                return;
            }
            desc.advance(Phase::PreAccept);
            desc.dep = dep.clone();
            desc.hs = hs.clone();
            if forward_to_leader {
                // Optimistic execution: followers hand the proposal to
                // the leader instead of broadcasting their own ack.
                None
            } else {
                desc.acked = true;
                Some(MFastAck {
                    replica: self.cfg.id,
                    ballot: self.ballot,
                    cmd_id,
                    dep,
                    checksum: Some(hs),
                })
            }
        };

        match fast_ack {
            Some(f) => {
                self.mesh.send_to_all(Message::FastAck(f.clone()));
                self.send_to_origin_client(cmd_id, Message::FastAck(f.clone()));
                self.offer_ack(f, false).await;

                // The leader's report may have arrived before this
                // proposal did; reconcile against it now.
                self.reconcile_with_leader(cmd_id).await;

                if self.cfg.opt_exec && self.is_leader() {
                    self.optimistic_deliver(cmd_id).await;
                }
            }
            None => {
                let forward = {
                    let desc = &self.cmd_descs[&cmd_id];
                    let p = desc.propose.as_ref().expect("propose just attached");
                    MPropose {
                        client_id: p.client_id,
                        cmd_id,
                        command: p.command.clone(),
                        timestamp: p.timestamp,
                    }
                };
                self.mesh.send_to(self.leader(), Message::Propose(forward));
            }
        }
    }

    /// Idempotent reply for a proposal whose command already delivered.
    fn re_reply(&self, p: &Propose) {
        // Between DELIVER and the history-slot handback the cached
        // value still lives on the descriptor.
        let val = self
            .history
            .find(p.cmd_id)
            .map(|e| e.val.clone())
            .or_else(|| self.cmd_descs.get(&p.cmd_id).and_then(|d| d.val.clone()))
            .unwrap_or_default();
        debug!(cmd_id = %p.cmd_id, "duplicate proposal, replying from history");

        if p.collocated && !self.cfg.opt_exec {
            if let Some(lane) = &p.reply {
                let _ = lane.send(ProposeReplyTS {
                    ok: true,
                    cmd_id: p.cmd_id,
                    value: val,
                    timestamp: p.timestamp,
                });
            }
        } else if self.cfg.opt_exec && self.is_leader() {
            self.mesh.send_to_client(
                p.client_id,
                Message::Reply(MReply {
                    replica: self.cfg.id,
                    ballot: self.ballot,
                    cmd_id: p.cmd_id,
                    checksum: None,
                    rep: val,
                }),
            );
        } else {
            self.mesh.send_to_client(
                p.client_id,
                Message::Accept(MAccept {
                    replica: self.cfg.id,
                    ballot: self.ballot,
                    cmd_id: p.cmd_id,
                    rep: val,
                }),
            );
        }
    }

    /// The dependency set for a new command: every pending,
    /// non-delivered conflicting command this replica has sequenced,
    /// transitively closed when configured, canonically sorted.
    ///
    /// Descriptors created by acknowledgements alone (no proposal seen
    /// yet, phase START) are excluded: only commands processed in this
    /// replica's proposal order may appear, which keeps the leader's
    /// committed dependency graph acyclic.
    fn compute_dep(&self, cmd_id: CommandId, cmd: &Command) -> Dep {
        let mut dep: Dep = self
            .cmd_descs
            .iter()
            .filter(|(id, d)| {
                **id != cmd_id && d.phase >= Phase::PreAccept && !d.is_delivered()
            })
            .filter(|(_, d)| {
                d.cmd
                    .as_ref()
                    .is_some_and(|c| self.cfg.conflict.conflicts(c, cmd))
            })
            .map(|(id, _)| *id)
            .collect();

        if self.cfg.transitive {
            let direct: Vec<CommandId> = dep.ids().to_vec();
            for id in direct {
                if let Some(d) = self.cmd_descs.get(&id) {
                    for dep_id in d.dep.ids() {
                        if *dep_id != cmd_id {
                            dep.push(*dep_id);
                        }
                    }
                }
            }
        }

        dep.canonicalize();
        dep
    }

    /// Sends to the proposing client, when this replica knows it.
    fn send_to_origin_client(&self, cmd_id: CommandId, msg: Message) {
        if let Some(desc) = self.cmd_descs.get(&cmd_id) {
            if let Some(p) = &desc.propose {
                self.mesh.send_to_client(p.client_id, msg);
            }
        }
    }

    // ========================================================================
    // Acknowledgements
    // ========================================================================

    pub(crate) async fn handle_fast_ack(&mut self, f: MFastAck) {
        self.offer_ack(f, false).await;
    }

    /// Wire-identical to a fast ack; additionally counts toward the
    /// slow path (the sender accepted the leader's ordering).
    pub(crate) async fn handle_slow_ack(&mut self, sa: MSlowAck) {
        self.offer_ack(sa.into(), true).await;
    }

    /// Reshaped into a checksum-absent fast ack so it contributes to
    /// the fast set, then counted on the slow path as well.
    pub(crate) async fn handle_light_slow_ack(&mut self, ls: MLightSlowAck) {
        self.offer_ack(ls.into_fast_ack(), true).await;
    }

    pub(crate) async fn handle_acks(&mut self, acks: MAcks) {
        for f in acks.fast_acks {
            self.handle_fast_ack(f).await;
        }
        for ls in acks.light_slow_acks {
            self.handle_light_slow_ack(ls).await;
        }
    }

    /// Unpacks a per-sender ack batch; the nil-dep sentinel marks
    /// slow-path entries.
    pub(crate) async fn handle_opt_acks(&mut self, oa: MOptAcks) {
        for ack in oa.acks {
            let slow = is_nil_dep_of_cmd_id(ack.cmd_id, &ack.dep);
            let f = MFastAck {
                replica: oa.replica,
                ballot: oa.ballot,
                cmd_id: ack.cmd_id,
                dep: if slow { Dep::new() } else { ack.dep },
                checksum: if slow { None } else { ack.checksum },
            };
            self.offer_ack(f, slow).await;
        }
    }

    /// Common acknowledgement path.
    ///
    /// `also_slow`: the ack counts on the slow path (light and full
    /// slow acks). The leader's own ack always counts on both paths.
    async fn offer_ack(&mut self, f: MFastAck, also_slow: bool) {
        if f.ballot < self.ballot {
            trace!(cmd_id = %f.cmd_id, ballot = %f.ballot, "stale-ballot ack dropped");
            return;
        }
        if f.ballot > self.ballot {
            self.bump_ballot(f.ballot);
        }
        if self.delivered.contains_key(&f.cmd_id) {
            return;
        }

        let cmd_id = f.cmd_id;
        let from_leader = f.replica == self.leader();
        self.ensure_desc(cmd_id);

        let mut fires: Vec<Fired<MFastAck>> = Vec::new();

        // A follower seeing the leader's dependency report either
        // confirms its own matching report or adopts the leader's
        // ordering with a light slow ack.
        if from_leader && f.replica != self.cfg.id && f.checksum.is_some() {
            if let Some((own, own_slow)) = self.react_to_leader_ack(&f) {
                let desc = self
                    .cmd_descs
                    .get_mut(&cmd_id)
                    .expect("descriptor ensured above");
                if let Some(x) = desc.fast_path.add(own.replica, false, own.clone()) {
                    fires.push(x);
                }
                if own_slow {
                    if let Some(x) = desc.slow_path.add(own.replica, false, own) {
                        fires.push(x);
                    }
                }
            }
        }

        {
            let desc = self
                .cmd_descs
                .get_mut(&cmd_id)
                .expect("descriptor ensured above");
            if let Some(x) = desc.fast_path.add(f.replica, from_leader, f.clone()) {
                fires.push(x);
            }
            if also_slow || from_leader {
                if let Some(x) = desc.slow_path.add(f.replica, from_leader, f) {
                    fires.push(x);
                }
            }
        }

        for fired in fires {
            self.commit_from_fired(cmd_id, fired).await;
        }
    }

    /// Late reconciliation for a proposal processed after the
    /// leader's fast ack was already held in the descriptor's set.
    async fn reconcile_with_leader(&mut self, cmd_id: CommandId) {
        let leader_ack = {
            let Some(desc) = self.cmd_descs.get(&cmd_id) else {
                return;
            };
            match desc.fast_path.leader_msg() {
                Some(m) if m.replica != self.cfg.id && m.checksum.is_some() => m.clone(),
                _ => return,
            }
        };

        let mut fires: Vec<Fired<MFastAck>> = Vec::new();
        if let Some((own, own_slow)) = self.react_to_leader_ack(&leader_ack) {
            let desc = self
                .cmd_descs
                .get_mut(&cmd_id)
                .expect("descriptor present");
            if let Some(x) = desc.fast_path.add(own.replica, false, own.clone()) {
                fires.push(x);
            }
            if own_slow {
                if let Some(x) = desc.slow_path.add(own.replica, false, own) {
                    fires.push(x);
                }
            }
        }
        for fired in fires {
            self.commit_from_fired(cmd_id, fired).await;
        }
    }

    /// Reaction to the leader's dependency report for a command this
    /// replica has a pending report of its own for.
    ///
    /// Matching checksums: nothing to do unless our ack was withheld
    /// (optimistic-execution followers), in which case it goes out
    /// now. Diverging checksums: adopt the leader's ordering, move to
    /// ACCEPT, and broadcast a light slow ack.
    ///
    /// Returns this replica's own contribution and whether it counts
    /// on the slow path.
    fn react_to_leader_ack(&mut self, leader_ack: &MFastAck) -> Option<(MFastAck, bool)> {
        enum Reaction {
            Confirm(MFastAck),
            Adopt,
        }

        let mesh = Arc::clone(&self.mesh);
        let self_id = self.cfg.id;
        let ballot = self.ballot;
        let cmd_id = leader_ack.cmd_id;

        let (reaction, client_id) = {
            let desc = self.cmd_descs.get_mut(&cmd_id)?;
            // Only reports this replica actually computed can be
            // confirmed or reconciled.
            if desc.phase != Phase::PreAccept || (!desc.acked && desc.propose.is_none()) {
                return None;
            }
            let client = desc.propose.as_ref().map(|p| p.client_id);
            let leader_hs = leader_ack.checksum.as_deref().unwrap_or(&[]);
            if paxoi_types::shashes_eq(&desc.hs, leader_hs) {
                if desc.acked {
                    // Our broadcast ack already counts everywhere.
                    return None;
                }
                desc.acked = true;
                (
                    Reaction::Confirm(MFastAck {
                        replica: self_id,
                        ballot,
                        cmd_id,
                        dep: desc.dep.clone(),
                        checksum: Some(desc.hs.clone()),
                    }),
                    client,
                )
            } else {
                desc.dep = leader_ack.dep.clone();
                desc.hs = leader_hs.to_vec();
                desc.acked = true;
                desc.advance(Phase::Accept);
                (Reaction::Adopt, client)
            }
        };

        match reaction {
            Reaction::Confirm(f) => {
                mesh.send_to_all(Message::FastAck(f.clone()));
                if let Some(c) = client_id {
                    mesh.send_to_client(c, Message::FastAck(f.clone()));
                }
                Some((f, false))
            }
            Reaction::Adopt => {
                debug!(%cmd_id, "dependency disagreement, adopting the leader's ordering");
                let ls = MLightSlowAck {
                    replica: self_id,
                    ballot,
                    cmd_id,
                };
                mesh.send_to_all(Message::LightSlowAck(ls));
                if let Some(c) = client_id {
                    mesh.send_to_client(c, Message::LightSlowAck(ls));
                }
                Some((ls.into_fast_ack(), true))
            }
        }
    }

    // ========================================================================
    // Accept (Commit Signal)
    // ========================================================================

    pub(crate) async fn handle_accept(&mut self, a: MAccept) {
        if a.ballot < self.ballot {
            trace!(cmd_id = %a.cmd_id, "stale-ballot accept dropped");
            return;
        }
        if a.ballot > self.ballot {
            self.bump_ballot(a.ballot);
        }
        if a.replica != self.leader() {
            warn!(cmd_id = %a.cmd_id, from = %a.replica, "accept from non-leader dropped");
            return;
        }
        if self.delivered.contains_key(&a.cmd_id) {
            // A later Accept for a delivered command is idempotent.
            return;
        }

        let cmd_id = a.cmd_id;
        self.ensure_desc(cmd_id);
        {
            let desc = self
                .cmd_descs
                .get_mut(&cmd_id)
                .expect("descriptor ensured above");
            desc.val = Some(a.rep);
            desc.advance(Phase::Commit);
        }
        self.try_deliver(cmd_id).await;
    }

    // ========================================================================
    // Commit
    // ========================================================================

    async fn commit_from_fired(&mut self, cmd_id: CommandId, fired: Fired<MFastAck>) {
        // The leader's message carries the canonical commit values.
        let Some(leader_msg) = fired.leader_msg else {
            return;
        };
        self.commit(cmd_id, leader_msg.dep, leader_msg.checksum.unwrap_or_default())
            .await;
    }

    /// Shared commit callback for both paths; at most once per
    /// descriptor.
    async fn commit(&mut self, cmd_id: CommandId, dep: Dep, hs: Vec<SHash>) {
        {
            let Some(desc) = self.cmd_descs.get_mut(&cmd_id) else {
                return;
            };
            if desc.is_committed() {
                return;
            }
            desc.dep = dep;
            desc.hs = hs;
            desc.advance(Phase::Commit);
            debug!(%cmd_id, "committed");
        }
        self.try_deliver(cmd_id).await;
    }

    // ========================================================================
    // Deliver
    // ========================================================================

    /// Delivers `cmd_id` and everything it unblocks, respecting
    /// dependency order.
    pub(crate) async fn try_deliver(&mut self, cmd_id: CommandId) {
        let mut queue = vec![cmd_id];
        while let Some(id) = queue.pop() {
            let missing = {
                let Some(desc) = self.cmd_descs.get(&id) else {
                    continue;
                };
                if !desc.is_committed() || desc.is_delivered() {
                    continue;
                }
                desc.dep
                    .ids()
                    .iter()
                    .copied()
                    .find(|d| *d != id && !self.locally_delivered(*d))
            };
            if let Some(dep) = missing {
                self.waiting.entry(dep).or_default().push(id);
                continue;
            }
            let woken = self.deliver_one(id).await;
            queue.extend(woken);
        }
    }

    fn locally_delivered(&self, id: CommandId) -> bool {
        self.delivered.contains_key(&id) || self.history.find(id).is_some()
    }

    /// Executes one committed command, hands it to the reply channel,
    /// and returns the commands its delivery unblocked.
    async fn deliver_one(&mut self, cmd_id: CommandId) -> Vec<CommandId> {
        let cmd = {
            let desc = self
                .cmd_descs
                .get_mut(&cmd_id)
                .expect("caller checked presence");
            desc.advance(Phase::Deliver);
            desc.cmd.clone()
        };

        let executed = match (&cmd, self.cfg.exec) {
            (Some(c), true) => self.store.execute(c),
            _ => Value::empty(),
        };

        let is_leader = self.is_leader();
        let ballot = self.ballot;
        let (args, accept_rep, already_replied, early_slot) = {
            let desc = self.cmd_descs.get_mut(&cmd_id).expect("still present");
            if desc.val.is_none() {
                desc.val = Some(executed);
            }
            let val = desc.val.clone().expect("set above");
            let reply_val = if self.cfg.dreply {
                val.clone()
            } else {
                Value::empty()
            };
            let propose = desc.propose.as_ref().map(|p| ProposeMeta {
                client_id: p.client_id,
                timestamp: p.timestamp,
                collocated: p.collocated,
                reply: p.reply.clone(),
            });
            let args = ReplyArgs {
                cmd_id,
                ballot,
                is_leader,
                dep: desc.dep.clone(),
                hs: desc.hs.clone(),
                val: reply_val,
                propose,
                finish: oneshot::channel().0, // replaced at dispatch
            };
            (args, val, desc.optimistically_delivered, desc.slot)
        };

        self.cballot = self.cballot.max(ballot);
        self.delivered.insert(cmd_id, None);
        self.collect_buf.push(cmd_id);

        // The leader's Accept marks COMMIT on replicas whose own
        // quorum has not fired.
        if is_leader {
            self.mesh.send_to_all(Message::Accept(MAccept {
                replica: self.cfg.id,
                ballot,
                cmd_id,
                rep: accept_rep,
            }));
        }

        let woken = self.waiting.remove(&cmd_id).unwrap_or_default();

        if already_replied {
            // Optimistic execution ran the reply handshake at propose
            // time; finish now if its slot already came back.
            if let Some(slot) = early_slot {
                self.finish_delivery(cmd_id, slot);
            }
            return woken;
        }

        self.dispatch_reply(cmd_id, args).await;
        woken
    }

    /// Runs the reply handshake on a worker when one is free, inline
    /// (`seq`) otherwise.
    async fn dispatch_reply(&mut self, cmd_id: CommandId, mut args: ReplyArgs) {
        let (finish_tx, finish_rx) = oneshot::channel();
        args.finish = finish_tx;
        self.reply_chan.reply(args);

        match Arc::clone(&self.workers).try_acquire_owned() {
            Ok(permit) => {
                let (stop_tx, stop_rx) = oneshot::channel();
                {
                    let desc = self
                        .cmd_descs
                        .get_mut(&cmd_id)
                        .expect("descriptor delivering");
                    desc.active = true;
                    desc.seq = false;
                    desc.stop = Some(stop_tx);
                }
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    tokio::select! {
                        slot = finish_rx => {
                            if let Ok(slot) = slot {
                                let _ = internal.send(LoopEvent::Delivered { cmd_id, slot });
                            }
                        }
                        ack = stop_rx => {
                            // Pre-empted by recovery; acknowledge the barrier.
                            if let Ok(ack) = ack {
                                let _ = ack.send(());
                            }
                        }
                    }
                });
            }
            Err(_) => {
                // Worker pool exhausted: sequential descriptor.
                if let Some(desc) = self.cmd_descs.get_mut(&cmd_id) {
                    desc.seq = true;
                }
                if let Ok(slot) = finish_rx.await {
                    self.finish_delivery(cmd_id, slot);
                }
            }
        }
    }

    /// History insertion and descriptor GC once both the slot and the
    /// DELIVER transition have happened.
    pub(crate) fn finish_delivery(&mut self, cmd_id: CommandId, slot: usize) {
        let entry = {
            let Some(desc) = self.cmd_descs.get_mut(&cmd_id) else {
                return;
            };
            if desc.phase < Phase::Deliver {
                // Optimistic reply finished before commit; hold the
                // slot until the command actually delivers.
                desc.slot = Some(slot);
                return;
            }
            HistoryEntry {
                cmd_id,
                ballot: desc.ballot,
                cmd: desc.cmd.clone(),
                dep: desc.dep.clone(),
                hs: desc.hs.clone(),
                val: desc.val.clone().unwrap_or_default(),
            }
        };
        self.history.insert(slot, entry);
        self.delivered.insert(cmd_id, Some(slot));
        // Dropping the descriptor releases both message sets.
        self.cmd_descs.remove(&cmd_id);
        debug!(%cmd_id, slot, "delivered");
    }

    /// Optimistic execution on the leader: execute and reply at
    /// propose time; commit catches up through the quorums.
    async fn optimistic_deliver(&mut self, cmd_id: CommandId) {
        let cmd = {
            let Some(desc) = self.cmd_descs.get(&cmd_id) else {
                return;
            };
            desc.cmd.clone()
        };
        let executed = match (&cmd, self.cfg.exec) {
            (Some(c), true) => self.store.execute(c),
            _ => Value::empty(),
        };

        let ballot = self.ballot;
        let args = {
            let desc = self.cmd_descs.get_mut(&cmd_id).expect("still present");
            desc.val = Some(executed.clone());
            desc.optimistically_delivered = true;
            let propose = desc.propose.as_ref().map(|p| ProposeMeta {
                client_id: p.client_id,
                timestamp: p.timestamp,
                collocated: p.collocated,
                reply: p.reply.clone(),
            });
            ReplyArgs {
                cmd_id,
                ballot,
                is_leader: true,
                dep: desc.dep.clone(),
                hs: desc.hs.clone(),
                val: executed,
                propose,
                finish: oneshot::channel().0, // replaced at dispatch
            }
        };
        self.dispatch_reply(cmd_id, args).await;
    }

    // ========================================================================
    // Shared Helpers
    // ========================================================================

    /// Lazily creates the descriptor for `cmd_id` at the current
    /// ballot.
    pub(crate) fn ensure_desc(&mut self, cmd_id: CommandId) {
        if !self.cmd_descs.contains_key(&cmd_id) {
            let desc = CommandDesc::new(self.ballot, self.fast_quorum(), self.slow_quorum());
            self.cmd_descs.insert(cmd_id, desc);
        }
    }

    /// Adopts a higher ballot observed in normal traffic: message sets
    /// restart under the new ballot's quorums.
    pub(crate) fn bump_ballot(&mut self, ballot: Ballot) {
        debug!(old = %self.ballot, new = %ballot, "adopting higher ballot");
        self.ballot = ballot;
        let fq = self.fast_quorum();
        let sq = self.slow_quorum();
        for desc in self.cmd_descs.values_mut() {
            if !desc.is_delivered() {
                desc.reinit_acks(fq.clone(), sq.clone());
            }
        }
    }
}
