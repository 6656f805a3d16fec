//! The Paxoi replica server binary.
//!
//! Registers with the master, joins the replica mesh, and runs one
//! Paxoi replica until interrupted:
//!
//! ```bash
//! paxoi-server --port 7070 --maddr 10.0.0.1 --mport 7087
//! ```
//!
//! The control endpoint (`port + 1000`) answers the master's `Ping`
//! and `BeTheLeader` calls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use paxoi::replica::{ControlEvent, Replica, ReplicaConfig};
use paxoi::{ConflictRelation, QuorumFile, ReplyChan, TcpMesh, inboxes};
use paxoi_master::rpc::{ControlReply, ControlRequest, MasterReply, MasterRequest};
use paxoi_types::ReplicaId;

/// Paxoi replica server.
#[derive(Parser)]
#[command(name = "paxoi-server", version, about)]
struct Cli {
    /// Port to listen on for replica and client traffic.
    #[arg(long, default_value_t = 7070)]
    port: u16,

    /// Master address.
    #[arg(long = "maddr", default_value = "")]
    master_addr: String,

    /// Master port.
    #[arg(long = "mport", default_value_t = 7087)]
    master_port: u16,

    /// Address of this machine, as other nodes should reach it.
    #[arg(long = "addr", default_value = "")]
    addr: String,

    /// Execute commands.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    exec: bool,

    /// Execute commands optimistically.
    #[arg(long = "optexec", default_value_t = false)]
    opt_exec: bool,

    /// Reply to clients only after the command has executed.
    #[arg(long = "dreply", default_value_t = true, action = clap::ArgAction::Set)]
    dreply: bool,

    /// Answer reads from local state.
    #[arg(long = "lread", default_value_t = false)]
    lread: bool,

    /// The conflict relation is transitive.
    #[arg(long = "tconf", default_value_t = true, action = clap::ArgAction::Set)]
    transitive: bool,

    /// Maximum tolerated failures (defaults to a minority).
    #[arg(long = "maxfailures", default_value_t = -1)]
    max_failures: i32,

    /// Quorum configuration file (ballot → active quorum).
    #[arg(long = "qfile")]
    qfile: Option<PathBuf>,

    /// Number of command-descriptor worker routines.
    #[arg(long = "desc", default_value_t = 100)]
    desc_routines: usize,

    /// Automatically suggest a reconfigured active quorum on leader change.
    #[arg(long = "AQreconf", default_value_t = true, action = clap::ArgAction::Set)]
    aq_reconf: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    info!(port = cli.port, "server starting");

    let qfile = match &cli.qfile {
        Some(path) => QuorumFile::load(path)
            .with_context(|| format!("loading quorum file {}", path.display()))?,
        None => QuorumFile::empty(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Control endpoint first: the master pings it during registration.
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let control_listener = TcpListener::bind(("0.0.0.0", cli.port + 1000))
        .await
        .with_context(|| format!("cannot bind control port {}", cli.port + 1000))?;
    tokio::spawn(serve_control(
        control_listener,
        control_tx,
        shutdown_rx.clone(),
    ));

    // Register with the master; fatal when it stays unreachable.
    let master = format!("{}:{}", cli.master_addr, cli.master_port);
    let (replica_id, node_list) = register_with_master(&master, &cli)
        .await
        .context("couldn't connect to master, aborting")?;

    let n = node_list.len();
    let max_failures = if cli.max_failures < 0 {
        (n - 1) / 2
    } else {
        cli.max_failures as usize
    };
    info!(%replica_id, n, max_failures, "registered; tolerating {max_failures} failures");

    let peers: HashMap<ReplicaId, SocketAddr> = node_list
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let addr = node
                .parse()
                .with_context(|| format!("bad node address {node}"));
            addr.map(|a| (ReplicaId::new(i as i32), a))
        })
        .collect::<anyhow::Result<_>>()?;

    let (inbox_txs, inbox_rxs) = inboxes();
    let listen: SocketAddr = ([0, 0, 0, 0], cli.port).into();
    let mesh = TcpMesh::start(replica_id, peers, listen, inbox_txs, shutdown_rx.clone())
        .await
        .context("cannot start the replica mesh")?;

    let mut cfg = ReplicaConfig::new(replica_id, n);
    cfg.exec = cli.exec;
    cfg.dreply = cli.dreply;
    cfg.opt_exec = cli.opt_exec;
    cfg.lread = cli.lread;
    cfg.aq_reconf = cli.aq_reconf;
    cfg.transitive = cli.transitive;
    cfg.conflict = ConflictRelation::PerKey;
    cfg.max_desc_routines = cli.desc_routines;
    cfg.qfile = qfile;

    let reply_chan = ReplyChan::spawn(replica_id, cli.opt_exec, mesh.clone(), shutdown_rx.clone());
    let replica = Replica::new(cfg, mesh, reply_chan);
    let replica_task = tokio::spawn(replica.run(inbox_rxs, control_rx, shutdown_rx));

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), replica_task).await;
    Ok(())
}

/// Registers with the master, retrying with jittered backoff.
async fn register_with_master(
    master: &str,
    cli: &Cli,
) -> anyhow::Result<(ReplicaId, Vec<String>)> {
    const RETRIES: usize = 10;
    let mut backoff = Duration::from_millis(100);

    for attempt in 0..=RETRIES {
        match try_register(master, cli).await {
            Ok(Some(result)) => return Ok(result),
            Ok(None) => {
                // Master is up but the cluster is not complete yet.
            }
            Err(e) if attempt == RETRIES => return Err(e),
            Err(e) => {
                warn!(error = %e, attempt, "master registration failed, retrying");
            }
        }
        let jitter = rand::thread_rng().gen_range(0..50);
        tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
        backoff = (backoff * 2).min(Duration::from_secs(2));
    }
    bail!("registration retries exhausted against {master}");
}

async fn try_register(master: &str, cli: &Cli) -> anyhow::Result<Option<(ReplicaId, Vec<String>)>> {
    let mut stream = TcpStream::connect(master)
        .await
        .with_context(|| format!("dialing master {master}"))?;
    let request = MasterRequest::Register {
        addr: cli.addr.clone(),
        port: cli.port,
    };
    paxoi_wire::write_frame(&mut stream, &request).await?;
    let reply: Option<MasterReply> = paxoi_wire::read_frame(&mut stream).await?;
    match reply {
        Some(MasterReply::Register(r)) if r.ready => Ok(Some((r.replica_id, r.node_list))),
        Some(MasterReply::Register(_)) => Ok(None),
        other => bail!("unexpected master reply: {other:?}"),
    }
}

/// Serves the master's control calls by injecting events into the
/// replica loop and relaying the answers.
async fn serve_control(
    listener: TcpListener,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
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
                let Ok((mut stream, _)) = accepted else { continue };
                let control_tx = control_tx.clone();
                tokio::spawn(async move {
                    while let Ok(Some(request)) =
                        paxoi_wire::read_frame::<_, ControlRequest>(&mut stream).await
                    {
                        let reply = match request {
                            ControlRequest::Ping => {
                                let (tx, rx) = oneshot::channel();
                                if control_tx.send(ControlEvent::Ping { reply: tx }).is_err() {
                                    return;
                                }
                                match rx.await {
                                    Ok(()) => ControlReply::Pong,
                                    Err(_) => return,
                                }
                            }
                            ControlRequest::BeTheLeader => {
                                let (tx, rx) = oneshot::channel();
                                if control_tx
                                    .send(ControlEvent::BeTheLeader { reply: tx })
                                    .is_err()
                                {
                                    return;
                                }
                                match rx.await {
                                    Ok(info) => ControlReply::BeTheLeader {
                                        leader: info.leader,
                                        next_leader: info.next_leader,
                                    },
                                    Err(_) => return,
                                }
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
