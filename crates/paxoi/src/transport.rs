//! Message transport: typed inboxes, an in-process mesh, and the TCP
//! mesh used by the server binary.
//!
//! The protocol core never touches sockets. It consumes a [`Mesh`]
//! (outbound) and a set of typed inbox channels (inbound); the
//! transport decodes frames and routes each message kind to its own
//! channel, so the event loop demultiplexes over compile-time-known
//! variants.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use paxoi_types::{ClientId, ReplicaId};

use crate::message::{
    MAccept, MAcks, MCollect, MFastAck, MLightSlowAck, MLightSync, MNewLeader, MNewLeaderAck,
    MOptAcks, MPing, MPingRep, MPropose, MShareState, MSlowAck, MSync, Message, Propose,
};

// ============================================================================
// Mesh
// ============================================================================

/// Outbound message fan-out, as seen by the protocol core.
pub trait Mesh: Send + Sync + 'static {
    /// Sends to one peer replica. Best-effort; unreachable peers drop.
    fn send_to(&self, to: ReplicaId, msg: Message);

    /// Sends to every peer replica except the local one.
    fn send_to_all(&self, msg: Message);

    /// Sends to a connected client.
    fn send_to_client(&self, client: ClientId, msg: Message);
}

// ============================================================================
// Typed Inboxes
// ============================================================================

/// Sender halves of the typed inboxes; held by the transport router.
#[derive(Clone)]
pub struct Inboxes {
    pub propose: mpsc::UnboundedSender<Propose>,
    pub fast_ack: mpsc::UnboundedSender<MFastAck>,
    pub slow_ack: mpsc::UnboundedSender<MSlowAck>,
    pub light_slow_ack: mpsc::UnboundedSender<MLightSlowAck>,
    pub acks: mpsc::UnboundedSender<MAcks>,
    pub opt_acks: mpsc::UnboundedSender<MOptAcks>,
    pub accept: mpsc::UnboundedSender<MAccept>,
    pub new_leader: mpsc::UnboundedSender<MNewLeader>,
    pub new_leader_ack: mpsc::UnboundedSender<MNewLeaderAck>,
    pub share_state: mpsc::UnboundedSender<MShareState>,
    pub sync: mpsc::UnboundedSender<MSync>,
    pub light_sync: mpsc::UnboundedSender<MLightSync>,
    pub collect: mpsc::UnboundedSender<MCollect>,
    pub ping: mpsc::UnboundedSender<MPing>,
    pub ping_rep: mpsc::UnboundedSender<MPingRep>,
}

/// Receiver halves of the typed inboxes; owned by the event loop.
pub struct InboxReceivers {
    pub propose: mpsc::UnboundedReceiver<Propose>,
    pub fast_ack: mpsc::UnboundedReceiver<MFastAck>,
    pub slow_ack: mpsc::UnboundedReceiver<MSlowAck>,
    pub light_slow_ack: mpsc::UnboundedReceiver<MLightSlowAck>,
    pub acks: mpsc::UnboundedReceiver<MAcks>,
    pub opt_acks: mpsc::UnboundedReceiver<MOptAcks>,
    pub accept: mpsc::UnboundedReceiver<MAccept>,
    pub new_leader: mpsc::UnboundedReceiver<MNewLeader>,
    pub new_leader_ack: mpsc::UnboundedReceiver<MNewLeaderAck>,
    pub share_state: mpsc::UnboundedReceiver<MShareState>,
    pub sync: mpsc::UnboundedReceiver<MSync>,
    pub light_sync: mpsc::UnboundedReceiver<MLightSync>,
    pub collect: mpsc::UnboundedReceiver<MCollect>,
    pub ping: mpsc::UnboundedReceiver<MPing>,
    pub ping_rep: mpsc::UnboundedReceiver<MPingRep>,
}

/// Creates the paired inbox channels.
pub fn inboxes() -> (Inboxes, InboxReceivers) {
    let (propose_tx, propose_rx) = mpsc::unbounded_channel();
    let (fast_ack_tx, fast_ack_rx) = mpsc::unbounded_channel();
    let (slow_ack_tx, slow_ack_rx) = mpsc::unbounded_channel();
    let (light_slow_ack_tx, light_slow_ack_rx) = mpsc::unbounded_channel();
    let (acks_tx, acks_rx) = mpsc::unbounded_channel();
    let (opt_acks_tx, opt_acks_rx) = mpsc::unbounded_channel();
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let (new_leader_tx, new_leader_rx) = mpsc::unbounded_channel();
    let (new_leader_ack_tx, new_leader_ack_rx) = mpsc::unbounded_channel();
    let (share_state_tx, share_state_rx) = mpsc::unbounded_channel();
    let (sync_tx, sync_rx) = mpsc::unbounded_channel();
    let (light_sync_tx, light_sync_rx) = mpsc::unbounded_channel();
    let (collect_tx, collect_rx) = mpsc::unbounded_channel();
    let (ping_tx, ping_rx) = mpsc::unbounded_channel();
    let (ping_rep_tx, ping_rep_rx) = mpsc::unbounded_channel();

    (
        Inboxes {
            propose: propose_tx,
            fast_ack: fast_ack_tx,
            slow_ack: slow_ack_tx,
            light_slow_ack: light_slow_ack_tx,
            acks: acks_tx,
            opt_acks: opt_acks_tx,
            accept: accept_tx,
            new_leader: new_leader_tx,
            new_leader_ack: new_leader_ack_tx,
            share_state: share_state_tx,
            sync: sync_tx,
            light_sync: light_sync_tx,
            collect: collect_tx,
            ping: ping_tx,
            ping_rep: ping_rep_tx,
        },
        InboxReceivers {
            propose: propose_rx,
            fast_ack: fast_ack_rx,
            slow_ack: slow_ack_rx,
            light_slow_ack: light_slow_ack_rx,
            acks: acks_rx,
            opt_acks: opt_acks_rx,
            accept: accept_rx,
            new_leader: new_leader_rx,
            new_leader_ack: new_leader_ack_rx,
            share_state: share_state_rx,
            sync: sync_rx,
            light_sync: light_sync_rx,
            collect: collect_rx,
            ping: ping_rx,
            ping_rep: ping_rep_rx,
        },
    )
}

impl Inboxes {
    /// Routes one inbound message to its typed channel.
    ///
    /// Client-facing kinds (replies) have no replica inbox; receiving
    /// one here means a confused peer and is dropped with a warning.
    pub fn route(&self, msg: Message) {
        match msg {
            Message::Propose(p) => drop(self.propose.send(Propose {
                client_id: p.client_id,
                cmd_id: p.cmd_id,
                command: p.command,
                timestamp: p.timestamp,
                collocated: false,
                reply: None,
            })),
            Message::FastAck(m) => drop(self.fast_ack.send(m)),
            Message::SlowAck(m) => drop(self.slow_ack.send(m)),
            Message::LightSlowAck(m) => drop(self.light_slow_ack.send(m)),
            Message::Acks(m) => drop(self.acks.send(m)),
            Message::OptAcks(m) => drop(self.opt_acks.send(m)),
            Message::Accept(m) => drop(self.accept.send(m)),
            Message::NewLeader(m) => drop(self.new_leader.send(m)),
            Message::NewLeaderAck(m) => drop(self.new_leader_ack.send(m)),
            Message::ShareState(m) => drop(self.share_state.send(m)),
            Message::Sync(m) => drop(self.sync.send(m)),
            Message::LightSync(m) => drop(self.light_sync.send(m)),
            Message::Collect(m) => drop(self.collect.send(m)),
            Message::Ping(m) => drop(self.ping.send(m)),
            Message::PingRep(m) => drop(self.ping_rep.send(m)),
            Message::Reply(m) => {
                warn!(kind = "Reply", cmd_id = %m.cmd_id, "client-facing message at a replica, dropping");
            }
            Message::ReadReply(m) => {
                warn!(kind = "ReadReply", cmd_id = %m.cmd_id, "client-facing message at a replica, dropping");
            }
        }
    }
}

// ============================================================================
// In-Process Mesh
// ============================================================================

/// Channel-backed mesh connecting replicas in one process.
///
/// Used by the multi-replica scenario tests; delivery order per link
/// matches send order, like a TCP stream.
pub struct ChannelMesh {
    self_id: ReplicaId,
    peers: HashMap<ReplicaId, Inboxes>,
    clients: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>,
}

impl ChannelMesh {
    /// Builds one mesh handle per replica over a shared peer table.
    pub fn full_mesh(peer_inboxes: HashMap<ReplicaId, Inboxes>) -> HashMap<ReplicaId, Arc<ChannelMesh>> {
        let clients = Arc::new(Mutex::new(HashMap::new()));
        peer_inboxes
            .keys()
            .map(|&id| {
                (
                    id,
                    Arc::new(ChannelMesh {
                        self_id: id,
                        peers: peer_inboxes.clone(),
                        clients: Arc::clone(&clients),
                    }),
                )
            })
            .collect()
    }

    /// Registers a client sink shared by every replica's mesh handle.
    pub fn register_client(&self, client: ClientId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients
            .lock()
            .expect("client table lock")
            .insert(client, tx);
        rx
    }
}

impl Mesh for ChannelMesh {
    fn send_to(&self, to: ReplicaId, msg: Message) {
        if let Some(inbox) = self.peers.get(&to) {
            inbox.route(msg);
        }
    }

    fn send_to_all(&self, msg: Message) {
        for (&id, inbox) in &self.peers {
            if id != self.self_id {
                inbox.route(msg.clone());
            }
        }
    }

    fn send_to_client(&self, client: ClientId, msg: Message) {
        if let Some(tx) = self
            .clients
            .lock()
            .expect("client table lock")
            .get(&client)
        {
            let _ = tx.send(msg);
        }
    }
}

// ============================================================================
// TCP Mesh
// ============================================================================

/// First frame on every connection, identifying the dialer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Hello {
    Replica(ReplicaId),
    Client(ClientId),
}

/// Frames a client sends to a replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    Propose(MPropose),
}

/// TCP mesh: one outbound queue per peer with reconnecting writer
/// tasks, and a listener routing inbound frames to the typed inboxes.
pub struct TcpMesh {
    self_id: ReplicaId,
    peer_txs: HashMap<ReplicaId, mpsc::UnboundedSender<Message>>,
    client_txs: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>,
}

impl TcpMesh {
    /// Starts the mesh: binds `listen`, dials every peer, and routes
    /// inbound traffic into `inboxes`.
    pub async fn start(
        self_id: ReplicaId,
        peers: HashMap<ReplicaId, SocketAddr>,
        listen: SocketAddr,
        inboxes: Inboxes,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Arc<TcpMesh>> {
        let listener = TcpListener::bind(listen).await?;
        info!(replica = %self_id, addr = %listen, "replica mesh listening");

        let client_txs: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Outbound writers, one per peer, reconnecting on failure.
        let mut peer_txs = HashMap::new();
        for (&peer, &addr) in &peers {
            if peer == self_id {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            peer_txs.insert(peer, tx);
            tokio::spawn(peer_writer(self_id, peer, addr, rx, shutdown.clone()));
        }

        let mesh = Arc::new(TcpMesh {
            self_id,
            peer_txs,
            client_txs: Arc::clone(&client_txs),
        });

        // Inbound acceptor.
        let accept_inboxes = inboxes.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut shutdown = accept_shutdown;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                debug!(%peer_addr, "inbound connection");
                                tokio::spawn(serve_connection(
                                    stream,
                                    accept_inboxes.clone(),
                                    Arc::clone(&client_txs),
                                ));
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(mesh)
    }
}

impl Mesh for TcpMesh {
    fn send_to(&self, to: ReplicaId, msg: Message) {
        if let Some(tx) = self.peer_txs.get(&to) {
            let _ = tx.send(msg);
        }
    }

    fn send_to_all(&self, msg: Message) {
        for (&id, tx) in &self.peer_txs {
            if id != self.self_id {
                let _ = tx.send(msg.clone());
            }
        }
    }

    fn send_to_client(&self, client: ClientId, msg: Message) {
        if let Some(tx) = self
            .client_txs
            .lock()
            .expect("client table lock")
            .get(&client)
        {
            let _ = tx.send(msg);
        }
    }
}

/// Dials `addr` and forwards queued messages, reconnecting on error.
async fn peer_writer(
    self_id: ReplicaId,
    peer: ReplicaId,
    addr: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    'reconnect: loop {
        if *shutdown.borrow() {
            return;
        }
        let mut stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                debug!(%peer, error = %e, "peer dial failed, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };
        if paxoi_wire::write_frame(&mut stream, &Hello::Replica(self_id))
            .await
            .is_err()
        {
            continue;
        }
        info!(%peer, %addr, "peer link up");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { return };
                    if let Err(e) = paxoi_wire::write_frame(&mut stream, &msg).await {
                        warn!(%peer, error = %e, "peer link lost, reconnecting");
                        continue 'reconnect;
                    }
                }
            }
        }
    }
}

/// Serves one inbound connection after its hello frame.
async fn serve_connection(
    mut stream: TcpStream,
    inboxes: Inboxes,
    client_txs: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>,
) {
    let hello: Hello = match paxoi_wire::read_frame(&mut stream).await {
        Ok(Some(h)) => h,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "malformed hello, dropping connection");
            return;
        }
    };

    match hello {
        Hello::Replica(_) => loop {
            match paxoi_wire::read_frame::<_, Message>(&mut stream).await {
                Ok(Some(msg)) => inboxes.route(msg),
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "malformed frame, dropping connection");
                    return;
                }
            }
        },
        Hello::Client(client_id) => {
            // Split: writer task drains the client's queue, reader
            // feeds proposals into the propose inbox.
            let (read_half, write_half) = stream.into_split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
            client_txs
                .lock()
                .expect("client table lock")
                .insert(client_id, tx);

            tokio::spawn(async move {
                let mut write_half = write_half;
                while let Some(msg) = rx.recv().await {
                    if paxoi_wire::write_frame(&mut write_half, &msg).await.is_err() {
                        return;
                    }
                }
            });

            let mut read_half = read_half;
            loop {
                match paxoi_wire::read_frame::<_, ClientFrame>(&mut read_half).await {
                    Ok(Some(ClientFrame::Propose(p))) => {
                        let _ = inboxes.propose.send(Propose {
                            client_id: p.client_id,
                            cmd_id: p.cmd_id,
                            command: p.command,
                            timestamp: p.timestamp,
                            collocated: false,
                            reply: None,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, client = %client_id, "malformed client frame");
                        break;
                    }
                }
            }
            client_txs
                .lock()
                .expect("client table lock")
                .remove(&client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxoi_types::{Ballot, ClientId, CommandId, SeqNum};

    #[tokio::test]
    async fn router_delivers_to_the_typed_inbox() {
        let (inboxes, mut rx) = inboxes();
        inboxes.route(Message::Ping(MPing {
            replica: ReplicaId::new(2),
            ballot: Ballot::ZERO,
        }));
        let ping = rx.ping.recv().await.expect("routed");
        assert_eq!(ping.replica, ReplicaId::new(2));
    }

    #[tokio::test]
    async fn channel_mesh_excludes_self_on_broadcast() {
        let mut table = HashMap::new();
        let mut receivers = HashMap::new();
        for id in 0..3 {
            let (tx, rx) = inboxes();
            table.insert(ReplicaId::new(id), tx);
            receivers.insert(ReplicaId::new(id), rx);
        }
        let meshes = ChannelMesh::full_mesh(table);

        meshes[&ReplicaId::new(0)].send_to_all(Message::Ping(MPing {
            replica: ReplicaId::new(0),
            ballot: Ballot::ZERO,
        }));

        assert!(receivers
            .get_mut(&ReplicaId::new(1))
            .unwrap()
            .ping
            .try_recv()
            .is_ok());
        assert!(receivers
            .get_mut(&ReplicaId::new(2))
            .unwrap()
            .ping
            .try_recv()
            .is_ok());
        assert!(receivers
            .get_mut(&ReplicaId::new(0))
            .unwrap()
            .ping
            .try_recv()
            .is_err());
    }

    #[tokio::test]
    async fn channel_mesh_routes_client_messages() {
        let mut table = HashMap::new();
        let (tx, _rx) = inboxes();
        table.insert(ReplicaId::new(0), tx);
        let meshes = ChannelMesh::full_mesh(table);
        let mesh = &meshes[&ReplicaId::new(0)];

        let client = ClientId::new(9);
        let mut client_rx = mesh.register_client(client);
        mesh.send_to_client(
            client,
            Message::ReadReply(crate::message::MReadReply {
                replica: ReplicaId::new(0),
                ballot: Ballot::ZERO,
                cmd_id: CommandId::new(client, SeqNum::new(1)),
                rep: paxoi_types::Value::empty(),
            }),
        );
        assert!(client_rx.try_recv().is_ok());
    }
}
