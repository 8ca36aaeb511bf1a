//! Simulated gossip network with fault-injection hooks.

use ibft::{BoxError, SequenceHandle, Transport};
use ibft_types::{MessageReq, NodeId};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Decides, per message, whether the simulated network delivers it.
///
/// Hooks model adversarial conditions: partitions, targeted drops,
/// whatever a scenario needs. [`connects`](Self::connects) is also
/// consulted by the liveness oracle and the resync path, so a hook that
/// cuts a link hides the peer's chain as well as its messages.
pub trait TransportHook: Send + Sync {
    /// Whether `from` can currently reach `to` at all.
    fn connects(&self, from: &NodeId, to: &NodeId) -> bool;

    /// Whether this particular message is delivered. Defaults to the
    /// connectivity answer.
    fn deliver(&self, from: &NodeId, to: &NodeId, _msg: &MessageReq) -> bool {
        self.connects(from, to)
    }
}

/// Static partitioning: nodes reach each other only inside a shared
/// group. Nodes in no group are isolated.
pub struct PartitionHook {
    groups: Vec<HashSet<NodeId>>,
}

impl PartitionHook {
    pub fn new<I, G>(groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: IntoIterator<Item = NodeId>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(|group| group.into_iter().collect())
                .collect(),
        }
    }
}

impl TransportHook for PartitionHook {
    fn connects(&self, from: &NodeId, to: &NodeId) -> bool {
        self.groups
            .iter()
            .any(|group| group.contains(from) && group.contains(to))
    }
}

/// Drops each message independently with the given probability, using a
/// seeded generator so failures replay.
pub struct RandomDropHook {
    rate: f64,
    rng: Mutex<ChaCha8Rng>,
}

impl RandomDropHook {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rate,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl TransportHook for RandomDropHook {
    fn connects(&self, _from: &NodeId, _to: &NodeId) -> bool {
        true
    }

    fn deliver(&self, _from: &NodeId, _to: &NodeId, _msg: &MessageReq) -> bool {
        self.rng.lock().gen::<f64>() >= self.rate
    }
}

/// In-memory gossip hub connecting every node in the cluster.
///
/// Each running node registers its ingress handle; `broadcast` fans a
/// message out to every other registered node, each delivery on its own
/// task with seeded jitter. The active hook can be swapped at runtime.
pub(crate) struct GossipNetwork {
    handles: RwLock<HashMap<NodeId, SequenceHandle>>,
    hook: RwLock<Option<Arc<dyn TransportHook>>>,
    max_jitter: Duration,
    rng: Mutex<ChaCha8Rng>,
}

impl GossipNetwork {
    pub(crate) fn new(max_jitter: Duration, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            handles: RwLock::new(HashMap::new()),
            hook: RwLock::new(None),
            max_jitter,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        })
    }

    pub(crate) fn register(&self, id: NodeId, handle: SequenceHandle) {
        self.handles.write().insert(id, handle);
    }

    pub(crate) fn deregister(&self, id: &NodeId) {
        self.handles.write().remove(id);
    }

    pub(crate) fn set_hook(&self, hook: Option<Arc<dyn TransportHook>>) {
        *self.hook.write() = hook;
    }

    /// Whether `from` can currently reach `to` under the active hook.
    pub(crate) fn connects(&self, from: &NodeId, to: &NodeId) -> bool {
        self.hook
            .read()
            .as_ref()
            .map_or(true, |hook| hook.connects(from, to))
    }

    fn next_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let micros = self.rng.lock().gen_range(0..=self.max_jitter.as_micros() as u64);
        Duration::from_micros(micros)
    }

    fn broadcast(&self, msg: &MessageReq) {
        let handles: Vec<(NodeId, SequenceHandle)> = self
            .handles
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();
        let hook = self.hook.read().clone();

        for (to, handle) in handles {
            if to == msg.from {
                continue;
            }
            if let Some(hook) = &hook {
                if !hook.deliver(&msg.from, &to, msg) {
                    trace!(from = %msg.from, to = %to, msg = %msg.msg_type, "message dropped by hook");
                    continue;
                }
            }

            let delay = self.next_jitter();
            if delay.is_zero() {
                handle.push_message(msg.clone());
            } else {
                let msg = msg.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    handle.push_message(msg);
                });
            }
        }
    }
}

/// Per-node transport view onto the shared hub.
pub(crate) struct NetTransport {
    network: Arc<GossipNetwork>,
}

impl NetTransport {
    pub(crate) fn new(network: Arc<GossipNetwork>) -> Self {
        Self { network }
    }
}

impl Transport for NetTransport {
    fn gossip(&self, msg: &MessageReq) -> Result<(), BoxError> {
        self.network.broadcast(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> NodeId {
        NodeId::from(name)
    }

    #[test]
    fn partition_hook_separates_groups() {
        let hook = PartitionHook::new([
            vec![id("a"), id("b")],
            vec![id("c")],
        ]);
        assert!(hook.connects(&id("a"), &id("b")));
        assert!(!hook.connects(&id("a"), &id("c")));
        assert!(!hook.connects(&id("c"), &id("b")));
        // a node in no group is unreachable
        assert!(!hook.connects(&id("a"), &id("d")));
    }

    #[test]
    fn random_drop_hook_is_deterministic_per_seed() {
        let a = RandomDropHook::new(0.5, 7);
        let b = RandomDropHook::new(0.5, 7);
        let msg = MessageReq::new(
            ibft_types::MsgType::Prepare,
            id("a"),
            ibft_types::View::new(0, 0),
        );
        for _ in 0..32 {
            assert_eq!(
                a.deliver(&id("a"), &id("b"), &msg),
                b.deliver(&id("a"), &id("b"), &msg)
            );
        }
    }
}
