//! In-memory cluster harness for the IBFT engine.
//!
//! Spins up N validators in one process, wired together through a
//! simulated gossip network with fault-injection hooks (partitions,
//! drops, jitter). Each node owns a real [`ibft::Sequence`] engine and
//! an in-memory chain; the cluster can start, stop, and restart nodes
//! and wait for heights, which is everything the end-to-end scenarios
//! need.
//!
//! The harness runs in real time on short, configurable timeouts; it is
//! a test fixture, not a deterministic simulator.

mod backend;
mod transport;

pub use backend::Chain;
pub use transport::{PartitionHook, RandomDropHook, TransportHook};

use backend::{BuildLog, ChainBackend, InsertFaults, NodeKey};
use ibft::{Config, IbftState, Sequence};
use ibft_types::{NodeId, SealedProposal};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use transport::{GossipNetwork, NetTransport};

/// Harness errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A node failed to reach the requested height in time.
    #[error("timed out waiting for node {node} to reach height {height} (at {reached})")]
    HeightTimeout {
        node: NodeId,
        height: u64,
        reached: u64,
    },
}

/// Cluster topology and timing.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of validators.
    pub num_nodes: usize,
    /// Node name prefix; nodes are `{prefix}_0 .. {prefix}_{n-1}`.
    pub prefix: String,
    /// Base round timeout handed to every engine.
    pub timeout: Duration,
    /// How far in the future freshly built proposals are released.
    pub proposal_delay: Duration,
    /// Upper bound on per-delivery gossip jitter; zero delivers inline.
    pub max_jitter: Duration,
    /// Seed for jitter and proposal payloads.
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            prefix: "node".into(),
            timeout: Duration::from_secs(2),
            proposal_delay: Duration::from_millis(200),
            max_jitter: Duration::from_millis(10),
            seed: 0,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Node {
    chain: Arc<Chain>,
    faults: Arc<InsertFaults>,
    builds: Arc<BuildLog>,
    running: Option<Running>,
}

/// A set of in-process validators sharing one gossip network.
pub struct Cluster {
    config: ClusterConfig,
    ids: Vec<NodeId>,
    network: Arc<GossipNetwork>,
    nodes: HashMap<NodeId, Node>,
}

impl Cluster {
    /// Create a stopped cluster; call [`start_all`](Self::start_all) or
    /// [`start`](Self::start) to bring nodes up.
    pub fn new(config: ClusterConfig) -> Self {
        let ids: Vec<NodeId> = (0..config.num_nodes)
            .map(|i| NodeId::from(format!("{}_{i}", config.prefix)))
            .collect();
        let network = GossipNetwork::new(config.max_jitter, config.seed);
        let nodes = ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Node {
                        chain: Chain::new(),
                        faults: Arc::new(InsertFaults::default()),
                        builds: Arc::new(BuildLog::default()),
                        running: None,
                    },
                )
            })
            .collect();
        Self {
            config,
            ids,
            network,
            nodes,
        }
    }

    /// All node ids in order.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.ids
    }

    /// The chain of a node (live even while the node is stopped).
    pub fn chain(&self, id: &NodeId) -> Arc<Chain> {
        self.nodes[id].chain.clone()
    }

    /// Current sealed height of a node.
    pub fn height(&self, id: &NodeId) -> u64 {
        self.nodes[id].chain.height()
    }

    /// Payloads a node's backend has rejected, with their heights.
    pub fn rejected(&self, id: &NodeId) -> Vec<(u64, Vec<u8>)> {
        self.nodes[id].faults.rejected()
    }

    /// Every payload a node's backend has built so far.
    pub fn built(&self, id: &NodeId) -> Vec<Vec<u8>> {
        self.nodes[id].builds.all()
    }

    /// Arm `failures` one-shot insert rejections on every node.
    pub fn arm_insert_failures(&self, failures: usize) {
        for node in self.nodes.values() {
            node.faults.arm(failures);
        }
    }

    /// Install (or clear) the transport hook.
    pub fn set_hook(&self, hook: Option<Arc<dyn TransportHook>>) {
        self.network.set_hook(hook);
    }

    /// Start every stopped node.
    pub fn start_all(&mut self) {
        for id in self.ids.clone() {
            self.start(&id);
        }
    }

    /// Start one node. Restarted nodes first adopt the longest log
    /// visible across connected peers, then run from there.
    pub fn start(&mut self, id: &NodeId) {
        let index = self
            .ids
            .iter()
            .position(|known| known == id)
            .unwrap_or_else(|| panic!("unknown node {id}"));
        if self.nodes[id].running.is_some() {
            return;
        }

        let chains: HashMap<NodeId, Arc<Chain>> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.chain.clone()))
            .collect();
        let node = self.nodes.get_mut(id).expect("known node");

        sync_with_network(id, &node.chain, &chains, &self.network);

        let backend = ChainBackend::new(
            id.clone(),
            self.ids.clone(),
            node.chain.clone(),
            chains.clone(),
            self.network.clone(),
            self.config.proposal_delay,
            node.faults.clone(),
            node.builds.clone(),
            ChaCha8Rng::seed_from_u64(self.config.seed ^ (index as u64 + 1)),
        );
        let engine_config = Config::default()
            .with_timeout(self.config.timeout)
            .with_proposal_timeout(self.config.timeout);
        let sequence = Sequence::new(
            NodeKey::new(id.clone()),
            backend,
            NetTransport::new(self.network.clone()),
            engine_config,
        );
        self.network.register(id.clone(), sequence.handle());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(node_main(
            sequence,
            cancel.clone(),
            id.clone(),
            node.chain.clone(),
            chains,
            self.network.clone(),
        ));
        node.running = Some(Running { cancel, task });
        info!(node = %id, "node started");
    }

    /// Stop one node, waiting for its task to wind down.
    pub async fn stop(&mut self, id: &NodeId) {
        let node = self.nodes.get_mut(id).expect("known node");
        if let Some(running) = node.running.take() {
            self.network.deregister(id);
            running.cancel.cancel();
            let _ = running.task.await;
            info!(node = %id, "node stopped");
        }
    }

    /// Stop every running node.
    pub async fn shutdown(mut self) {
        for id in self.ids.clone() {
            self.stop(&id).await;
        }
    }

    /// Wait until every node in `nodes` has sealed `height` proposals.
    pub async fn wait_for_height(
        &self,
        height: u64,
        nodes: &[NodeId],
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if nodes.iter().all(|id| self.height(id) >= height) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let lagging = nodes
                    .iter()
                    .min_by_key(|id| self.height(id))
                    .expect("at least one node");
                return Err(ClusterError::HeightTimeout {
                    node: lagging.clone(),
                    height,
                    reached: self.height(lagging),
                });
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Assert that every node that sealed a height agrees on its
    /// payload (the safety property).
    pub fn assert_agreement(&self, up_to: u64) {
        for number in 0..up_to {
            let mut agreed: Option<(NodeId, SealedProposal)> = None;
            for id in &self.ids {
                let Some(sealed) = self.nodes[id].chain.get(number) else {
                    continue;
                };
                assert_eq!(sealed.number, number, "height mismatch on {id}");
                match &agreed {
                    None => agreed = Some((id.clone(), sealed)),
                    Some((first, expected)) => {
                        assert_eq!(
                            expected.proposal, sealed.proposal,
                            "nodes {first} and {id} sealed different proposals at height {number}"
                        );
                    }
                }
            }
        }
    }
}

/// Main task of one node: run sequences until cancelled, resyncing from
/// the network whenever the engine gives up on a height.
async fn node_main(
    mut sequence: Sequence<ChainBackend, NetTransport, NodeKey>,
    cancel: CancellationToken,
    id: NodeId,
    chain: Arc<Chain>,
    peers: HashMap<NodeId, Arc<Chain>>,
    network: Arc<GossipNetwork>,
) {
    loop {
        sequence.run(&cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        match sequence.state() {
            IbftState::Done => {
                debug!(node = %id, height = chain.height(), "sequence sealed");
            }
            IbftState::Sync => {
                sync_with_network(&id, &chain, &peers, &network);
            }
            // run only returns in a non-terminal state when cancelled
            _ => return,
        }
        sequence.begin_sequence();
    }
}

/// Adopt the longest sealed-proposal log visible across connected
/// peers.
fn sync_with_network(
    id: &NodeId,
    chain: &Arc<Chain>,
    peers: &HashMap<NodeId, Arc<Chain>>,
    network: &Arc<GossipNetwork>,
) {
    let best = peers
        .iter()
        .filter(|(peer, _)| *peer != id)
        .filter(|(peer, _)| network.connects(id, peer))
        .max_by_key(|(_, chain)| chain.height());

    if let Some((peer, best_chain)) = best {
        if best_chain.height() > chain.height() {
            info!(
                node = %id,
                from = %peer,
                height = best_chain.height(),
                "syncing chain from the network"
            );
            chain.replace(best_chain.proposals());
        }
    }
}
