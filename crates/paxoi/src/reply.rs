//! The reply channel.
//!
//! One task per replica serializes every client-visible reply and owns
//! the history-slot counter. Three reply shapes exist, selected per
//! command:
//!
//! - collocated client, no optimistic execution: a local
//!   [`ProposeReplyTS`] on the proposal's reply lane;
//! - optimistic execution on the leader: [`MReply`] to the client,
//!   doubling as the leader's fast ack;
//! - optimistic execution on a collocated follower: [`MAccept`] to the
//!   client, the commit signal through the client.
//!
//! After queueing the reply the task advances `history_size` modulo
//! [`HISTORY_SIZE`] and hands the previous slot back to the command's
//! deliver job, which uses it as its garbage-collection key.
//!
//! Read replies (the read-only fast path) use a separate queue and
//! produce [`MReadReply`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use paxoi_types::{Ballot, ClientId, CommandId, Dep, ReplicaId, SHash, Value};

use crate::desc::HISTORY_SIZE;
use crate::message::{MAccept, MReadReply, MReply, Message, ProposeReplyTS};
use crate::transport::Mesh;

/// The proposal fields the reply task needs.
#[derive(Debug, Clone)]
pub struct ProposeMeta {
    pub client_id: ClientId,
    pub timestamp: i64,
    pub collocated: bool,
    pub reply: Option<mpsc::UnboundedSender<ProposeReplyTS>>,
}

/// One delivered command's reply request.
#[derive(Debug)]
pub struct ReplyArgs {
    pub cmd_id: CommandId,
    pub ballot: Ballot,
    pub is_leader: bool,
    pub dep: Dep,
    pub hs: Vec<SHash>,
    pub val: Value,
    /// None on replicas that never saw the proposal.
    pub propose: Option<ProposeMeta>,
    /// Receives the assigned history slot.
    pub finish: oneshot::Sender<usize>,
}

/// One read-only fast-path reply request.
#[derive(Debug)]
pub struct ReadArgs {
    pub cmd_id: CommandId,
    pub ballot: Ballot,
    pub client_id: ClientId,
    pub val: Value,
}

/// Handle to the reply task.
#[derive(Clone)]
pub struct ReplyChan {
    args: mpsc::UnboundedSender<ReplyArgs>,
    read_args: mpsc::UnboundedSender<ReadArgs>,
}

impl ReplyChan {
    /// Spawns the reply task for `replica`.
    pub fn spawn(
        replica: ReplicaId,
        opt_exec: bool,
        mesh: Arc<dyn Mesh>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ReplyChan {
        let (args_tx, mut args_rx) = mpsc::unbounded_channel::<ReplyArgs>();
        let (read_tx, mut read_rx) = mpsc::unbounded_channel::<ReadArgs>();

        tokio::spawn(async move {
            // Exclusively owned here; every increment happens on this task.
            let mut history_size: usize = 0;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    args = args_rx.recv() => {
                        let Some(args) = args else { return };
                        handle_reply(replica, opt_exec, &mesh, args, &mut history_size);
                    }
                    args = read_rx.recv() => {
                        let Some(args) = args else { return };
                        let reply = MReadReply {
                            replica,
                            ballot: args.ballot,
                            cmd_id: args.cmd_id,
                            rep: args.val,
                        };
                        mesh.send_to_client(args.client_id, Message::ReadReply(reply));
                    }
                }
            }
        });

        ReplyChan {
            args: args_tx,
            read_args: read_tx,
        }
    }

    /// Queues a delivered command's reply; the slot arrives on `finish`.
    pub fn reply(&self, args: ReplyArgs) {
        let _ = self.args.send(args);
    }

    /// Queues a read-only reply.
    pub fn read_reply(&self, args: ReadArgs) {
        let _ = self.read_args.send(args);
    }
}

fn handle_reply(
    replica: ReplicaId,
    opt_exec: bool,
    mesh: &Arc<dyn Mesh>,
    args: ReplyArgs,
    history_size: &mut usize,
) {
    if let Some(propose) = &args.propose {
        if propose.collocated && !opt_exec {
            if let Some(lane) = &propose.reply {
                let _ = lane.send(ProposeReplyTS {
                    ok: true,
                    cmd_id: args.cmd_id,
                    value: args.val.clone(),
                    timestamp: propose.timestamp,
                });
            }
        } else if opt_exec && args.is_leader {
            let reply = MReply {
                replica,
                ballot: args.ballot,
                cmd_id: args.cmd_id,
                checksum: Some(args.hs.clone()),
                rep: args.val.clone(),
            };
            mesh.send_to_client(propose.client_id, Message::Reply(reply));
        } else if propose.collocated && opt_exec {
            let acc = MAccept {
                replica,
                ballot: args.ballot,
                cmd_id: args.cmd_id,
                rep: args.val.clone(),
            };
            mesh.send_to_client(propose.client_id, Message::Accept(acc));
        }
    }

    // Slot assignment advances even when no client reply goes out; the
    // deliver job keys its history insertion on it.
    *history_size = (*history_size % HISTORY_SIZE) + 1;
    let slot = *history_size - 1;
    debug!(cmd_id = %args.cmd_id, slot, "history slot assigned");
    let _ = args.finish.send(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelMesh, inboxes};
    use paxoi_types::{ClientId, SeqNum};
    use std::collections::HashMap;

    fn test_mesh() -> Arc<ChannelMesh> {
        let mut table = HashMap::new();
        let (tx, _rx) = inboxes();
        table.insert(ReplicaId::new(0), tx);
        ChannelMesh::full_mesh(table).remove(&ReplicaId::new(0)).unwrap()
    }

    fn args(seq: i32, finish: oneshot::Sender<usize>, propose: Option<ProposeMeta>) -> ReplyArgs {
        ReplyArgs {
            cmd_id: CommandId::new(ClientId::new(1), SeqNum::new(seq)),
            ballot: Ballot::ZERO,
            is_leader: true,
            dep: Dep::new(),
            hs: Vec::new(),
            val: Value::from("v"),
            propose,
            finish,
        }
    }

    #[tokio::test]
    async fn slots_advance_monotonically() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let chan = ReplyChan::spawn(ReplicaId::new(0), false, test_mesh(), shutdown_rx);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        chan.reply(args(1, tx1, None));
        chan.reply(args(2, tx2, None));

        assert_eq!(rx1.await.expect("slot 0"), 0);
        assert_eq!(rx2.await.expect("slot 1"), 1);
    }

    #[tokio::test]
    async fn collocated_reply_uses_the_local_lane() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let chan = ReplyChan::spawn(ReplicaId::new(0), false, test_mesh(), shutdown_rx);

        let (lane_tx, mut lane_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        chan.reply(args(
            1,
            tx,
            Some(ProposeMeta {
                client_id: ClientId::new(1),
                timestamp: 42,
                collocated: true,
                reply: Some(lane_tx),
            }),
        ));

        let _slot = rx.await.expect("slot");
        let reply = lane_rx.recv().await.expect("local reply");
        assert!(reply.ok);
        assert_eq!(reply.timestamp, 42);
        assert_eq!(reply.value, Value::from("v"));
    }

    #[tokio::test]
    async fn opt_exec_leader_reply_reaches_the_client() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mesh = test_mesh();
        let client = ClientId::new(7);
        let mut client_rx = mesh.register_client(client);
        let chan = ReplyChan::spawn(ReplicaId::new(0), true, mesh, shutdown_rx);

        let (tx, rx) = oneshot::channel();
        chan.reply(args(
            1,
            tx,
            Some(ProposeMeta {
                client_id: client,
                timestamp: 0,
                collocated: false,
                reply: None,
            }),
        ));

        let _slot = rx.await.expect("slot");
        match client_rx.recv().await.expect("client message") {
            Message::Reply(r) => assert_eq!(r.rep, Value::from("v")),
            other => panic!("expected MReply, got {}", other.name()),
        }
    }
}
