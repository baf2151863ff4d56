//! Async node runtime.
//!
//! [`NodeRuntime`] owns the event loop around a [`ConsensusNode`]: it feeds
//! transport events, scheduler wake-ups, deferred tasks and gateway
//! commands into the node and performs the [`Outbound`] effects it returns.
//! [`NodeClient`] is the handle embedders (the HTTP gateway) use to talk to
//! a running node.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ChainConfig;
use crate::consensus::{
    BlockValidator, ConsensusError, ConsensusNode, Deferred, ForkChoice, Ledger, LedgerStore,
    Outbound, load_or_create_wallet,
};
use crate::metrics::ConsensusMetrics;
use crate::p2p::{Message, PeerId, Transport, TransportError, TransportEvent};
use crate::storage::{RocksDbLedgerStore, StorageError};
use crate::types::Transaction;
use crate::validation::{BaseValidity, IntegrityValidity};
use crate::{DefaultConsensusNode, DefaultForkChoice};

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("node runtime is not running")]
    Stopped,
}

/// Requests from embedders, served inside the node loop.
#[derive(Debug)]
pub enum NodeCommand {
    SubmitTransaction {
        payload: String,
        reply: oneshot::Sender<Result<Transaction, ConsensusError>>,
    },
}

pub type SharedNode<S, V, F> = Arc<Mutex<ConsensusNode<S, V, F>>>;

/// Handle to a running node: commands go through the loop, read-only
/// queries lock the node directly.
pub struct NodeClient<S, V, F> {
    node: SharedNode<S, V, F>,
    commands: mpsc::Sender<NodeCommand>,
}

impl<S, V, F> Clone for NodeClient<S, V, F> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            commands: self.commands.clone(),
        }
    }
}

impl<S, V, F> NodeClient<S, V, F> {
    pub fn node(&self) -> &SharedNode<S, V, F> {
        &self.node
    }

    /// Signs, pools and broadcasts a transaction carrying `payload`.
    pub async fn submit_transaction(&self, payload: String) -> Result<Transaction, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::SubmitTransaction { payload, reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        Ok(rx.await.map_err(|_| RuntimeError::Stopped)??)
    }
}

pub struct NodeRuntime<S, V, F> {
    node: SharedNode<S, V, F>,
    transport: Transport,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<NodeCommand>,
    command_tx: mpsc::Sender<NodeCommand>,
    deferred_tx: mpsc::UnboundedSender<Deferred>,
    deferred_rx: mpsc::UnboundedReceiver<Deferred>,
}

impl<S, V, F> NodeRuntime<S, V, F>
where
    S: LedgerStore + Send + 'static,
    V: BlockValidator + Send + 'static,
    F: ForkChoice + Send + 'static,
{
    pub fn new(node: ConsensusNode<S, V, F>, transport: Transport, events: mpsc::Receiver<TransportEvent>) -> Self {
        let (command_tx, commands) = mpsc::channel(64);
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        Self {
            node: Arc::new(Mutex::new(node)),
            transport,
            events,
            commands,
            command_tx,
            deferred_tx,
            deferred_rx,
        }
    }

    pub fn client(&self) -> NodeClient<S, V, F> {
        NodeClient {
            node: self.node.clone(),
            commands: self.command_tx.clone(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Dials each of `peers` in the background until it answers.
    pub fn dial(&self, peers: &[String], retry: Duration) {
        for addr in peers {
            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                loop {
                    match transport.connect(&addr).await {
                        Ok(peer) => {
                            info!(%addr, peer, "connected to configured peer");
                            break;
                        }
                        Err(e) => {
                            debug!(%addr, error = %e, "dial failed, retrying");
                            tokio::time::sleep(retry).await;
                        }
                    }
                }
            });
        }
    }

    /// Runs the node loop until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("node runtime started");
        loop {
            let now = unix_time_ms();
            let wake = self.node.lock().await.next_wakeup(now);
            let sleep = tokio::time::sleep(Duration::from_millis(wake.saturating_sub(now)));

            tokio::select! {
                _ = &mut shutdown => {
                    info!("node runtime stopping");
                    break;
                }
                _ = sleep => {
                    let out = self.node.lock().await.tick(unix_time_ms());
                    self.dispatch(out, None).await;
                }
                Some(event) = self.events.recv() => self.on_event(event).await,
                Some(task) = self.deferred_rx.recv() => {
                    let out = self.node.lock().await.run_deferred(task, unix_time_ms());
                    self.dispatch(out, None).await;
                }
                Some(command) = self.commands.recv() => self.on_command(command).await,
            }
        }
    }

    async fn on_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, addr } => {
                debug!(peer, %addr, "peer connected, sending chain and round");
                let hello = self.node.lock().await.hello();
                for msg in hello {
                    if let Err(e) = self.transport.send(peer, &msg).await {
                        debug!(peer, error = %e, "hello failed");
                    }
                }
            }
            TransportEvent::Message { peer, message } => {
                let kind = message.kind();
                let result = self.node.lock().await.handle_message(message, unix_time_ms());
                match result {
                    Ok(out) => self.dispatch(out, Some(peer)).await,
                    Err(ConsensusError::DuplicateDelivery) => {}
                    Err(e @ (ConsensusError::SignatureInvalid(_) | ConsensusError::Blacklisted(_))) => {
                        warn!(peer, kind, reason = e.kind(), error = %e, "message dropped");
                    }
                    Err(e) => debug!(peer, kind, reason = e.kind(), error = %e, "message dropped"),
                }
            }
            TransportEvent::Disconnected { peer } => debug!(peer, "peer disconnected"),
        }
    }

    async fn on_command(&self, command: NodeCommand) {
        match command {
            NodeCommand::SubmitTransaction { payload, reply } => {
                let result = self.node.lock().await.submit_transaction(payload, unix_time_ms());
                let result = match result {
                    Ok((tx, out)) => {
                        self.dispatch(out, None).await;
                        Ok(tx)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn dispatch(&self, out: Vec<Outbound>, origin: Option<PeerId>) {
        for effect in out {
            match effect {
                Outbound::Broadcast(msg) => self.broadcast(&msg).await,
                Outbound::Reply(msg) => match origin {
                    Some(peer) => {
                        if let Err(e) = self.transport.send(peer, &msg).await {
                            debug!(peer, kind = msg.kind(), error = %e, "reply failed");
                        }
                    }
                    None => self.broadcast(&msg).await,
                },
                Outbound::Schedule { delay_ms, task } => {
                    let tx = self.deferred_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let _ = tx.send(task);
                    });
                }
            }
        }
    }

    async fn broadcast(&self, msg: &Message) {
        match self.transport.broadcast(msg).await {
            Ok(sent) => debug!(kind = msg.kind(), peers = sent, "broadcast"),
            Err(e) => warn!(kind = msg.kind(), error = %e, "broadcast failed"),
        }
    }
}

/// Opens the RocksDB ledger, loads (or creates) the node key, binds the
/// transport and dials the configured peers.
pub async fn start_default_node(
    cfg: &ChainConfig,
    metrics: Option<ConsensusMetrics>,
) -> Result<NodeRuntime<RocksDbLedgerStore, crate::DefaultBlockValidator, DefaultForkChoice>, RuntimeError> {
    let mut store = RocksDbLedgerStore::open(&cfg.storage)?;
    let wallet = load_or_create_wallet(&mut store, &mut OsRng)?;

    let validator = crate::DefaultBlockValidator::new(BaseValidity::new(&cfg.consensus), IntegrityValidity);
    let ledger = Ledger::open(store, validator)?;
    let mut node: DefaultConsensusNode =
        ConsensusNode::new(cfg.consensus.clone(), wallet, ledger, DefaultForkChoice::default())?;
    if let Some(metrics) = metrics {
        node = node.with_metrics(metrics);
    }

    let (transport, local_addr, events) =
        Transport::bind(cfg.p2p.listen_addr, cfg.p2p.max_message_bytes, cfg.p2p.queue_len).await?;
    info!(%local_addr, peers = cfg.p2p.peers.len(), "p2p ready");

    let runtime = NodeRuntime::new(node, transport, events);
    runtime.dial(&cfg.p2p.peers, Duration::from_millis(cfg.p2p.reconnect_ms));
    Ok(runtime)
}
