//! The Paxoi replica.
//!
//! One event-loop task per replica demultiplexes the typed inboxes and
//! drives the per-command descriptors. Deliver handshakes (client
//! reply, history-slot assignment) run on up to
//! [`ReplicaConfig::max_desc_routines`] worker tasks fed by the event
//! loop; a descriptor whose handshake runs inline is marked `seq`.
//!
//! During recovery only the recovery inboxes are drained; everything
//! else stays buffered until the replica returns to normal status, so
//! no descriptor is created at a ballot about to be superseded.

mod normal;
mod recovery;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use paxoi_types::{Ballot, CommandId, KvStore, ReplicaId};

use crate::conflict::ConflictRelation;
use crate::desc::{CommandDesc, History};
use crate::message::{MCollect, MNewLeaderAck, MPing, MPingRep, Message};
use crate::msgset::MsgSet;
use crate::quorum::{Quorum, QuorumFile};
use crate::reply::ReplyChan;
use crate::transport::{InboxReceivers, Mesh};

// ============================================================================
// Configuration
// ============================================================================

/// Upper bound on concurrently active deliver workers per replica.
pub const DEFAULT_MAX_DESC_ROUTINES: usize = 100;

/// Static configuration of one replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub id: ReplicaId,
    pub n: usize,
    /// Execute commands against the store.
    pub exec: bool,
    /// Reply with the executed value (otherwise reply empty at commit).
    pub dreply: bool,
    /// Optimistic execution: reply before commit, clients detect the
    /// outcome from acknowledgement quorums.
    pub opt_exec: bool,
    /// Answer read-only commands from local state, bypassing consensus.
    pub lread: bool,
    /// Log a latency-optimal coterie suggestion on leader change.
    pub aq_reconf: bool,
    /// Treat the conflict relation as transitive.
    pub transitive: bool,
    pub conflict: ConflictRelation,
    pub max_desc_routines: usize,
    pub qfile: QuorumFile,
}

impl ReplicaConfig {
    pub fn new(id: ReplicaId, n: usize) -> Self {
        Self {
            id,
            n,
            exec: true,
            dreply: true,
            opt_exec: false,
            lread: false,
            aq_reconf: true,
            transitive: true,
            conflict: ConflictRelation::PerKey,
            max_desc_routines: DEFAULT_MAX_DESC_ROUTINES,
            qfile: QuorumFile::empty(),
        }
    }
}

// ============================================================================
// Status and Events
// ============================================================================

/// Replica status. Only recovery inboxes are drained while not normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normal,
    /// Gathering new-leader acks (the designated leader only).
    Preparing,
    /// Waiting for the synchronization snapshot.
    Recovering,
}

/// Events the replica sends itself from worker tasks.
#[derive(Debug)]
pub enum LoopEvent {
    /// A deliver handshake finished; the command owns `slot` now.
    Delivered { cmd_id: CommandId, slot: usize },
}

/// Reply to a `BeTheLeader` control call.
#[derive(Debug, Clone, Copy)]
pub struct BeTheLeaderInfo {
    /// The replica that actually took leadership.
    pub leader: ReplicaId,
    /// The designated successor on this leader's failure.
    pub next_leader: ReplicaId,
}

/// Control-plane requests injected by the master connection.
#[derive(Debug)]
pub enum ControlEvent {
    Ping {
        reply: oneshot::Sender<()>,
    },
    BeTheLeader {
        reply: oneshot::Sender<BeTheLeaderInfo>,
    },
}

// ============================================================================
// Replica
// ============================================================================

/// One Paxoi replica: the per-command descriptor table and everything
/// the event loop needs to drive it.
pub struct Replica {
    pub(crate) cfg: ReplicaConfig,
    pub(crate) ballot: Ballot,
    /// Highest ballot at which this replica ever delivered a command.
    pub(crate) cballot: Ballot,
    pub(crate) status: Status,
    pub(crate) store: KvStore,
    pub(crate) cmd_descs: HashMap<CommandId, CommandDesc>,
    /// Locally delivered commands and their history slot (once known).
    pub(crate) delivered: HashMap<CommandId, Option<usize>>,
    /// Committed commands blocked on an undelivered dependency.
    pub(crate) waiting: HashMap<CommandId, Vec<CommandId>>,
    pub(crate) history: History,
    pub(crate) new_leader_acks: MsgSet<MNewLeaderAck>,
    pub(crate) mesh: Arc<dyn Mesh>,
    pub(crate) reply_chan: ReplyChan,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) internal_tx: mpsc::UnboundedSender<LoopEvent>,
    internal_rx: Option<mpsc::UnboundedReceiver<LoopEvent>>,
    /// Delivered ids awaiting the next collect broadcast.
    pub(crate) collect_buf: Vec<CommandId>,
    pub(crate) collect_votes: HashMap<CommandId, HashSet<ReplicaId>>,
    /// Observed peer round-trip times, for next-leader designation.
    pub(crate) latencies: HashMap<ReplicaId, Duration>,
    ping_sent: Option<Instant>,
}

impl Replica {
    pub fn new(cfg: ReplicaConfig, mesh: Arc<dyn Mesh>, reply_chan: ReplyChan) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(cfg.max_desc_routines));
        let slow = Quorum::majority_of(cfg.n);
        Self {
            new_leader_acks: MsgSet::leaderless(slow, accept_any_new_leader_ack),
            ballot: Ballot::ZERO,
            cballot: Ballot::ZERO,
            status: Status::Normal,
            store: KvStore::new(),
            cmd_descs: HashMap::new(),
            delivered: HashMap::new(),
            waiting: HashMap::new(),
            history: History::new(),
            mesh,
            reply_chan,
            workers,
            internal_tx,
            internal_rx: Some(internal_rx),
            collect_buf: Vec::new(),
            collect_votes: HashMap::new(),
            latencies: HashMap::new(),
            ping_sent: None,
            cfg,
        }
    }

    // ========================================================================
    // Identity Helpers
    // ========================================================================

    pub(crate) fn leader(&self) -> ReplicaId {
        self.ballot.leader(self.cfg.n)
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.leader() == self.cfg.id
    }

    /// The fast-path quorum at the current ballot: the configured
    /// active quorum when one exists, three-quarters otherwise.
    pub(crate) fn fast_quorum(&self) -> Quorum {
        self.cfg
            .qfile
            .active_quorum(self.ballot)
            .unwrap_or_else(|| Quorum::three_quarters_of(self.cfg.n))
    }

    pub(crate) fn slow_quorum(&self) -> Quorum {
        Quorum::majority_of(self.cfg.n)
    }

    /// The alive peer with the lowest observed ping round-trip,
    /// falling back to the ring successor.
    pub(crate) fn next_leader(&self) -> ReplicaId {
        self.latencies
            .iter()
            .filter(|(&id, _)| id != self.cfg.id)
            .min_by_key(|(_, rtt)| **rtt)
            .map(|(&id, _)| id)
            .unwrap_or_else(|| {
                ReplicaId::new((self.cfg.id.as_i32() + 1).rem_euclid(self.cfg.n as i32))
            })
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Runs the replica until shutdown.
    pub async fn run(
        mut self,
        mut rx: InboxReceivers,
        mut control: mpsc::UnboundedReceiver<ControlEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut internal_rx = self
            .internal_rx
            .take()
            .expect("run() called once per replica");

        let mut ping_tick = tokio::time::interval(Duration::from_secs(1));
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut collect_tick = tokio::time::interval(Duration::from_millis(500));
        collect_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(replica = %self.cfg.id, n = self.cfg.n, "replica running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.status == Status::Normal {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    Some(p) = rx.propose.recv() => self.handle_propose(p).await,
                    Some(f) = rx.fast_ack.recv() => self.handle_fast_ack(f).await,
                    Some(s) = rx.slow_ack.recv() => self.handle_slow_ack(s).await,
                    Some(ls) = rx.light_slow_ack.recv() => self.handle_light_slow_ack(ls).await,
                    Some(a) = rx.acks.recv() => self.handle_acks(a).await,
                    Some(oa) = rx.opt_acks.recv() => self.handle_opt_acks(oa).await,
                    Some(a) = rx.accept.recv() => self.handle_accept(a).await,
                    Some(nl) = rx.new_leader.recv() => self.handle_new_leader(nl).await,
                    Some(nla) = rx.new_leader_ack.recv() => self.handle_new_leader_ack(nla).await,
                    Some(ss) = rx.share_state.recv() => self.handle_share_state(ss).await,
                    Some(s) = rx.sync.recv() => self.handle_sync(s).await,
                    Some(ls) = rx.light_sync.recv() => self.handle_light_sync(ls).await,
                    Some(c) = rx.collect.recv() => self.handle_collect(c),
                    Some(p) = rx.ping.recv() => self.handle_ping(p),
                    Some(pr) = rx.ping_rep.recv() => self.handle_ping_rep(pr),
                    Some(ev) = internal_rx.recv() => self.handle_internal(ev),
                    Some(c) = control.recv() => self.handle_control(c).await,
                    _ = ping_tick.tick() => self.broadcast_ping(),
                    _ = collect_tick.tick() => self.flush_collect(),
                    else => break,
                }
            } else {
                // Recovery: normal traffic stays buffered in its
                // inboxes; only the recovery handshake makes progress.
                tokio::select! {
                    _ = shutdown.changed() => {}
                    Some(nl) = rx.new_leader.recv() => self.handle_new_leader(nl).await,
                    Some(nla) = rx.new_leader_ack.recv() => self.handle_new_leader_ack(nla).await,
                    Some(ss) = rx.share_state.recv() => self.handle_share_state(ss).await,
                    Some(s) = rx.sync.recv() => self.handle_sync(s).await,
                    Some(ls) = rx.light_sync.recv() => self.handle_light_sync(ls).await,
                    else => break,
                }
            }
        }

        info!(replica = %self.cfg.id, "replica stopped");
    }

    // ========================================================================
    // Internal and Control Events
    // ========================================================================

    fn handle_internal(&mut self, ev: LoopEvent) {
        match ev {
            LoopEvent::Delivered { cmd_id, slot } => self.finish_delivery(cmd_id, slot),
        }
    }

    async fn handle_control(&mut self, ev: ControlEvent) {
        match ev {
            ControlEvent::Ping { reply } => {
                let _ = reply.send(());
            }
            ControlEvent::BeTheLeader { reply } => self.be_the_leader(reply).await,
        }
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    fn broadcast_ping(&mut self) {
        self.ping_sent = Some(Instant::now());
        self.mesh.send_to_all(Message::Ping(MPing {
            replica: self.cfg.id,
            ballot: self.ballot,
        }));
    }

    fn handle_ping(&mut self, p: MPing) {
        self.mesh.send_to(
            p.replica,
            Message::PingRep(MPingRep {
                replica: self.cfg.id,
                ballot: self.ballot,
            }),
        );
    }

    fn handle_ping_rep(&mut self, pr: MPingRep) {
        if let Some(sent) = self.ping_sent {
            self.latencies.insert(pr.replica, sent.elapsed());
        }
    }

    /// Broadcasts the delivered ids accumulated since the last flush.
    fn flush_collect(&mut self) {
        if self.collect_buf.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.collect_buf);
        let collect = MCollect {
            replica: self.cfg.id,
            ballot: self.ballot,
            ids,
        };
        self.mesh.send_to_all(Message::Collect(collect.clone()));
        self.handle_collect(collect);
    }

    /// Records collect votes; a delivered-marker is dropped once every
    /// replica announced the id.
    fn handle_collect(&mut self, c: MCollect) {
        for id in c.ids {
            let votes = self.collect_votes.entry(id).or_default();
            votes.insert(c.replica);
            if votes.len() == self.cfg.n {
                self.collect_votes.remove(&id);
                self.delivered.remove(&id);
                debug!(cmd_id = %id, "delivered-marker collected");
            }
        }
    }

    // ========================================================================
    // Descriptor Pre-emption
    // ========================================================================

    /// Stops every active, non-sequential deliver worker and waits for
    /// each to acknowledge. The barrier recovery runs behind.
    pub(crate) async fn stop_descs(&mut self) {
        let mut acks = Vec::new();
        for desc in self.cmd_descs.values_mut() {
            if desc.active && !desc.seq {
                if let Some(stop) = desc.stop.take() {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    if stop.send(ack_tx).is_ok() {
                        acks.push(ack_rx);
                    }
                }
                desc.active = false;
            }
        }
        let stopped = acks.len();
        for ack in acks {
            let _ = ack.await;
        }
        if stopped > 0 {
            debug!(replica = %self.cfg.id, stopped, "active descriptors stopped");
        }
    }
}

/// New-leader acks have no compatibility constraint.
fn accept_any_new_leader_ack(_: &MNewLeaderAck, _: Option<&MNewLeaderAck>) -> bool {
    true
}
