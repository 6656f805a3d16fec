//! The Paxoi orchestration master.
//!
//! A single process that bootstraps a cluster and reassigns
//! leadership on failure:
//!
//! - **Register** collects the `n` replica identities, measures a
//!   round-trip time to each control port, and crowns the
//!   lowest-latency replica initial leader;
//! - a **liveness loop** pings every replica on a fixed cadence and,
//!   when the leader stops answering, calls `BeTheLeader` on the
//!   designated successor (falling back to iterating the replica list);
//! - **GetLeader** / **GetReplicaList** serve the current view,
//!   the latter blocking until the alive vector exists.
//!
//! The master is the single source of truth for "next leader".

pub mod rpc;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use paxoi_types::ReplicaId;

use rpc::{
    ControlReply, ControlRequest, GetLeaderReply, MasterReply, MasterRequest, RegisterReply,
    ReplicaListReply, call_control,
};

/// Liveness ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(3);

/// Ping attempts per liveness round before a replica counts as dead.
const PING_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("i/o error: {0}")]
    Io(String),

    #[error("replica {0} unreachable: {1}")]
    Unreachable(String, String),

    #[error("designated leader refused promotion: {0}")]
    LeaderRefused(String),
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone)]
struct Node {
    addr: String,
    port: u16,
}

impl Node {
    fn node_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    fn control_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port + 1000)
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: Vec<Node>,
    alive: Vec<bool>,
    leader: Vec<bool>,
    latencies: Vec<Duration>,
    next_leader: Option<ReplicaId>,
    finish_init: bool,
}

impl State {
    fn leader_index(&self) -> Option<usize> {
        self.leader.iter().position(|&l| l)
    }

    fn set_leader(&mut self, index: usize) {
        self.leader.iter_mut().for_each(|l| *l = false);
        self.leader[index] = true;
    }
}

// ============================================================================
// Master
// ============================================================================

pub struct Master {
    n: usize,
    state: Mutex<State>,
    init_tx: watch::Sender<bool>,
}

impl Master {
    pub fn new(n: usize) -> Arc<Master> {
        let (init_tx, _) = watch::channel(false);
        Arc::new(Master {
            n,
            state: Mutex::new(State::default()),
            init_tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("master state lock")
    }

    // ========================================================================
    // RPC Operations
    // ========================================================================

    /// Registers a replica (idempotent by `addr:port`) and, once all
    /// `n` are known, elects the lowest-latency one initial leader.
    pub async fn register(&self, addr: String, port: u16) -> RegisterReply {
        let node = Node {
            addr: if addr.is_empty() {
                "127.0.0.1".to_string()
            } else {
                addr
            },
            port,
        };

        let known = {
            let st = self.lock();
            st.nodes.iter().position(|x| x.node_addr() == node.node_addr())
        };

        let index = match known {
            Some(index) => index,
            None => {
                // Measure the round trip outside the lock.
                let rtt = match measure_rtt(&node.control_addr()).await {
                    Ok(rtt) => rtt,
                    Err(e) => {
                        warn!(addr = %node.control_addr(), error = %e, "cannot measure latency");
                        Duration::from_secs(3600)
                    }
                };
                info!(node = %node.node_addr(), ?rtt, "replica registered");

                let mut st = self.lock();
                // Another registration may have raced us.
                match st.nodes.iter().position(|x| x.node_addr() == node.node_addr()) {
                    Some(index) => index,
                    None => {
                        st.nodes.push(node);
                        st.alive.push(true);
                        st.leader.push(false);
                        st.latencies.push(rtt);
                        st.nodes.len() - 1
                    }
                }
            }
        };

        let mut st = self.lock();
        if st.nodes.len() < self.n {
            return RegisterReply {
                ready: false,
                replica_id: ReplicaId::new(index as i32),
                node_list: Vec::new(),
                is_leader: false,
            };
        }

        if st.leader_index().is_none() {
            let lowest = st
                .latencies
                .iter()
                .enumerate()
                .min_by_key(|(_, rtt)| **rtt)
                .map(|(i, _)| i)
                .expect("n registered nodes");
            st.set_leader(lowest);
            info!(replica = lowest, "initial leader elected by latency");
        }

        RegisterReply {
            ready: true,
            replica_id: ReplicaId::new(index as i32),
            node_list: st.nodes.iter().map(Node::node_addr).collect(),
            is_leader: st.leader[index],
        }
    }

    pub fn get_leader(&self) -> GetLeaderReply {
        let st = self.lock();
        GetLeaderReply {
            leader_id: ReplicaId::new(st.leader_index().unwrap_or(0) as i32),
        }
    }

    /// Blocks until the liveness loop computed the alive vector.
    pub async fn get_replica_list(&self) -> ReplicaListReply {
        let mut init_rx = self.init_tx.subscribe();
        let _ = init_rx.wait_for(|done| *done).await;

        let st = self.lock();
        ReplicaListReply {
            ready: st.nodes.len() == self.n,
            replica_list: st.nodes.iter().map(Node::node_addr).collect(),
            alive_list: st.alive.clone(),
        }
    }

    // ========================================================================
    // Server
    // ========================================================================

    /// Accepts master-port connections and serves RPC frames.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                accepted = listener.accept() => {
                    let Ok((mut stream, peer)) = accepted else { continue };
                    debug!(%peer, "master connection");
                    let master = Arc::clone(&self);
                    tokio::spawn(async move {
                        loop {
                            let request: Option<MasterRequest> =
                                match paxoi_wire::read_frame(&mut stream).await {
                                    Ok(r) => r,
                                    Err(e) => {
                                        warn!(error = %e, "malformed master request");
                                        return;
                                    }
                                };
                            let Some(request) = request else { return };
                            let reply = match request {
                                MasterRequest::Register { addr, port } => {
                                    MasterReply::Register(master.register(addr, port).await)
                                }
                                MasterRequest::GetLeader => {
                                    MasterReply::GetLeader(master.get_leader())
                                }
                                MasterRequest::GetReplicaList => {
                                    MasterReply::ReplicaList(master.get_replica_list().await)
                                }
                            };
                            if paxoi_wire::write_frame(&mut stream, &reply).await.is_err() {
                                return;
                            }
                        }
                    });
                }
            }
        }
    }

    // ========================================================================
    // Liveness Loop
    // ========================================================================

    /// Bootstraps leadership, then pings every replica on a fixed
    /// cadence, promoting the successor when the leader dies.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MasterError> {
        // Wait until all n replicas registered.
        loop {
            if self.lock().nodes.len() == self.n {
                break;
            }
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Drive the initial leader through its promotion handshake.
        let (leader_index, control_addr) = {
            let st = self.lock();
            let index = st.leader_index().expect("leader elected at registration");
            (index, st.nodes[index].control_addr())
        };
        match call_control(&control_addr, ControlRequest::BeTheLeader).await {
            Ok(ControlReply::BeTheLeader {
                leader,
                next_leader,
            }) => {
                let mut st = self.lock();
                let actual = leader.as_i32();
                if actual >= 0 && (actual as usize) < st.nodes.len() {
                    st.set_leader(actual as usize);
                } else {
                    st.set_leader(leader_index);
                }
                st.next_leader = Some(next_leader);
                info!(leader = %leader, "initial leader confirmed");
            }
            Ok(other) => {
                return Err(MasterError::LeaderRefused(format!(
                    "unexpected reply {other:?}"
                )));
            }
            Err(e) => return Err(MasterError::LeaderRefused(e.to_string())),
        }

        // First liveness round completes initialization.
        self.ping_round().await;
        {
            let mut st = self.lock();
            st.finish_init = true;
        }
        let _ = self.init_tx.send(true);
        info!("alive vector initialized");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(PING_INTERVAL) => {}
            }

            let leader_died = self.ping_round().await;
            if !leader_died {
                continue;
            }

            let next = { self.lock().next_leader };
            if let Some(next) = next {
                if self.be_the_leader(next.as_usize()).await.is_ok() {
                    continue;
                }
            }
            let count = { self.lock().nodes.len() };
            for index in 0..count {
                if self.be_the_leader(index).await.is_ok() {
                    break;
                }
            }
        }
    }

    /// Pings every replica; returns whether the leader went dead.
    async fn ping_round(&self) -> bool {
        let nodes: Vec<(usize, String)> = {
            let st = self.lock();
            st.nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (i, n.control_addr()))
                .collect()
        };

        let mut leader_died = false;
        for (index, addr) in nodes {
            let mut alive = false;
            for _ in 0..PING_ATTEMPTS {
                if call_control(&addr, ControlRequest::Ping).await.is_ok() {
                    alive = true;
                    break;
                }
            }
            let mut st = self.lock();
            st.alive[index] = alive;
            if !alive && st.leader[index] {
                warn!(replica = index, "leader stopped answering pings");
                st.leader[index] = false;
                leader_died = true;
            }
        }
        leader_died
    }

    /// Promotes `index` if it is alive and accepts.
    async fn be_the_leader(&self, index: usize) -> Result<(), MasterError> {
        let addr = {
            let st = self.lock();
            if index >= st.nodes.len() || !st.alive[index] {
                return Err(MasterError::Unreachable(
                    format!("replica {index}"),
                    "dead".into(),
                ));
            }
            st.nodes[index].control_addr()
        };

        match call_control(&addr, ControlRequest::BeTheLeader).await? {
            ControlReply::BeTheLeader {
                leader,
                next_leader,
            } => {
                let mut st = self.lock();
                let actual = leader.as_i32();
                let chosen = if actual >= 0 && (actual as usize) < st.nodes.len() {
                    actual as usize
                } else {
                    index
                };
                st.set_leader(chosen);
                st.next_leader = Some(next_leader);
                info!(replica = chosen, "replica is the new leader");
                Ok(())
            }
            other => Err(MasterError::LeaderRefused(format!(
                "unexpected reply {other:?}"
            ))),
        }
    }
}

/// Round-trip time of one control ping.
async fn measure_rtt(addr: &str) -> Result<Duration, MasterError> {
    let start = Instant::now();
    call_control(addr, ControlRequest::Ping).await?;
    Ok(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A minimal control endpoint answering pings and promotions.
    async fn spawn_control_stub() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    while let Ok(Some(req)) =
                        paxoi_wire::read_frame::<_, ControlRequest>(&mut stream).await
                    {
                        let reply = match req {
                            ControlRequest::Ping => ControlReply::Pong,
                            ControlRequest::BeTheLeader => ControlReply::BeTheLeader {
                                leader: ReplicaId::new(0),
                                next_leader: ReplicaId::new(1),
                            },
                        };
                        if paxoi_wire::write_frame(&mut stream, &reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn registration_becomes_ready_at_n() {
        let master = Master::new(2);
        let p1 = spawn_control_stub().await;
        let p2 = spawn_control_stub().await;

        let first = master
            .register("127.0.0.1".into(), p1 - 1000)
            .await;
        assert!(!first.ready);
        assert_eq!(first.replica_id, ReplicaId::new(0));

        let second = master
            .register("127.0.0.1".into(), p2 - 1000)
            .await;
        assert!(second.ready);
        assert_eq!(second.replica_id, ReplicaId::new(1));
        assert_eq!(second.node_list.len(), 2);

        // Exactly one leader was elected.
        let st = master.lock();
        assert_eq!(st.leader.iter().filter(|&&l| l).count(), 1);
    }

    #[tokio::test]
    async fn registration_is_idempotent_by_address() {
        let master = Master::new(3);
        let p1 = spawn_control_stub().await;

        let first = master.register("127.0.0.1".into(), p1 - 1000).await;
        let again = master.register("127.0.0.1".into(), p1 - 1000).await;
        assert_eq!(first.replica_id, again.replica_id);
        assert_eq!(master.lock().nodes.len(), 1);
    }

    #[tokio::test]
    async fn get_leader_reports_the_flagged_replica() {
        let master = Master::new(1);
        let p1 = spawn_control_stub().await;
        let reply = master.register("127.0.0.1".into(), p1 - 1000).await;
        assert!(reply.ready);
        assert!(reply.is_leader);
        assert_eq!(master.get_leader().leader_id, ReplicaId::new(0));
    }

    #[tokio::test]
    async fn replica_list_blocks_until_initialized() {
        let master = Master::new(1);
        let p1 = spawn_control_stub().await;
        master.register("127.0.0.1".into(), p1 - 1000).await;

        let waiter = {
            let master = Arc::clone(&master);
            tokio::spawn(async move { master.get_replica_list().await })
        };

        // The barrier holds until the alive vector exists.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        master.lock().finish_init = true;
        let _ = master.init_tx.send(true);

        let reply = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("released by the barrier")
            .expect("task");
        assert!(reply.ready);
        assert_eq!(reply.alive_list, vec![true]);
    }
}
