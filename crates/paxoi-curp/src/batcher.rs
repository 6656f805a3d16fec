//! The drain-both coalescer.

use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::message::{MAAcks, MAccept, MAcceptAck};

/// Handle feeding the batcher task.
///
/// One worker reads both inbound channels; whenever either delivers a
/// message it drains *both* without blocking, packages the contents
/// into one [`MAAcks`], and hands it to the sink. At most one outbound
/// frame goes out per arrival cycle regardless of arrival rate. The
/// triggering message leads its own sublist; order within each sublist
/// is arrival order, and no ordering between the two sublists is
/// promised.
#[derive(Clone)]
pub struct Batcher {
    acks: mpsc::UnboundedSender<MAcceptAck>,
    accs: mpsc::UnboundedSender<MAccept>,
}

impl Batcher {
    /// Spawns the batcher task; `sink` broadcasts each batch.
    pub fn spawn<S>(mut sink: S, mut shutdown: watch::Receiver<bool>) -> Batcher
    where
        S: FnMut(MAAcks) + Send + 'static,
    {
        let (acks_tx, mut acks_rx) = mpsc::unbounded_channel::<MAcceptAck>();
        let (accs_tx, mut accs_rx) = mpsc::unbounded_channel::<MAccept>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    ack = acks_rx.recv() => {
                        let Some(ack) = ack else { return };
                        let mut batch = MAAcks {
                            acks: vec![ack],
                            accepts: Vec::new(),
                        };
                        drain(&mut acks_rx, &mut batch.acks);
                        drain(&mut accs_rx, &mut batch.accepts);
                        trace!(acks = batch.acks.len(), accepts = batch.accepts.len(), "batch out");
                        sink(batch);
                    }
                    acc = accs_rx.recv() => {
                        let Some(acc) = acc else { return };
                        let mut batch = MAAcks {
                            acks: Vec::new(),
                            accepts: vec![acc],
                        };
                        drain(&mut accs_rx, &mut batch.accepts);
                        drain(&mut acks_rx, &mut batch.acks);
                        trace!(acks = batch.acks.len(), accepts = batch.accepts.len(), "batch out");
                        sink(batch);
                    }
                }
            }
        });

        Batcher {
            acks: acks_tx,
            accs: accs_tx,
        }
    }

    pub fn send_accept(&self, acc: MAccept) {
        let _ = self.accs.send(acc);
    }

    pub fn send_accept_ack(&self, ack: MAcceptAck) {
        let _ = self.acks.send(ack);
    }
}

/// Moves everything currently buffered without waiting.
fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>, out: &mut Vec<T>) {
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxoi_types::{Ballot, ClientId, CommandId, ReplicaId, SeqNum, Value};
    use std::time::Duration;

    fn accept(instance: i32) -> MAccept {
        MAccept {
            replica: ReplicaId::new(0),
            ballot: Ballot::ZERO,
            cmd_id: CommandId::new(ClientId::new(1), SeqNum::new(instance)),
            instance,
            rep: Value::empty(),
        }
    }

    fn ack(replica: i32, instance: i32) -> MAcceptAck {
        MAcceptAck {
            replica: ReplicaId::new(replica),
            ballot: Ballot::ZERO,
            instance,
        }
    }

    async fn recv_batch(rx: &mut mpsc::UnboundedReceiver<MAAcks>) -> MAAcks {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("batch within deadline")
            .expect("sink open")
    }

    #[tokio::test]
    async fn sleeping_batcher_coalesces_everything_pending() {
        // One accept and two acks arrive while the batcher task has
        // not yet been scheduled: a single MAAcks carries all three.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let batcher = Batcher::spawn(
            move |batch| {
                let _ = out_tx.send(batch);
            },
            shutdown_rx,
        );

        batcher.send_accept(accept(1));
        batcher.send_accept_ack(ack(1, 1));
        batcher.send_accept_ack(ack(2, 1));

        let batch = recv_batch(&mut out_rx).await;
        assert_eq!(batch.accepts, vec![accept(1)]);
        assert_eq!(batch.acks, vec![ack(1, 1), ack(2, 1)]);
    }

    #[tokio::test]
    async fn batches_union_equals_offered_messages() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let batcher = Batcher::spawn(
            move |batch| {
                let _ = out_tx.send(batch);
            },
            shutdown_rx,
        );

        let mut offered_acks = Vec::new();
        let mut offered_accepts = Vec::new();
        for i in 0..20 {
            if i % 3 == 0 {
                offered_accepts.push(accept(i));
                batcher.send_accept(accept(i));
            } else {
                offered_acks.push(ack(i % 5, i));
                batcher.send_accept_ack(ack(i % 5, i));
            }
        }

        let mut got_acks = Vec::new();
        let mut got_accepts = Vec::new();
        while got_acks.len() + got_accepts.len()
            < offered_acks.len() + offered_accepts.len()
        {
            let batch = recv_batch(&mut out_rx).await;
            assert!(!batch.acks.is_empty() || !batch.accepts.is_empty());
            got_acks.extend(batch.acks);
            got_accepts.extend(batch.accepts);
        }

        // Arrival order is preserved within each sublist, so the
        // concatenation across batches equals what was offered.
        assert_eq!(got_acks, offered_acks);
        assert_eq!(got_accepts, offered_accepts);
    }

    #[tokio::test]
    async fn trigger_leads_its_own_sublist() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let batcher = Batcher::spawn(
            move |batch| {
                let _ = out_tx.send(batch);
            },
            shutdown_rx,
        );

        batcher.send_accept_ack(ack(1, 7));
        let batch = recv_batch(&mut out_rx).await;
        assert_eq!(batch.acks[0], ack(1, 7));
        assert!(batch.accepts.is_empty());
    }
}
