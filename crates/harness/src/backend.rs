//! In-memory chain backend for harness nodes.

use crate::transport::GossipNetwork;
use ibft::{Backend, BoxError, SignKey};
use ibft_types::{NodeId, Proposal, SealedProposal, ValidatorSet};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sealed-proposal log for one node.
///
/// Heights are contiguous: the proposal sealing sequence `n` sits at
/// index `n`.
#[derive(Default)]
pub struct Chain {
    proposals: RwLock<Vec<SealedProposal>>,
}

impl Chain {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of sealed proposals, which is also the next sequence.
    pub fn height(&self) -> u64 {
        self.proposals.read().len() as u64
    }

    /// The proposal sealing sequence `number`, if sealed.
    pub fn get(&self, number: u64) -> Option<SealedProposal> {
        self.proposals.read().get(number as usize).cloned()
    }

    /// Snapshot of the whole log.
    pub fn proposals(&self) -> Vec<SealedProposal> {
        self.proposals.read().clone()
    }

    /// Proposer of the most recently sealed height.
    pub fn last_proposer(&self) -> Option<NodeId> {
        self.proposals
            .read()
            .last()
            .map(|sealed| sealed.proposer.clone())
    }

    fn append(&self, sealed: SealedProposal) -> Result<(), BoxError> {
        let mut log = self.proposals.write();
        if sealed.number != log.len() as u64 {
            return Err(format!(
                "non-contiguous proposal: got {}, expected {}",
                sealed.number,
                log.len()
            )
            .into());
        }
        log.push(sealed);
        Ok(())
    }

    pub(crate) fn replace(&self, proposals: Vec<SealedProposal>) {
        *self.proposals.write() = proposals;
    }
}

/// One-shot insert fault injection, armed by scenarios that need the
/// backend to reject agreed proposals.
#[derive(Default)]
pub(crate) struct InsertFaults {
    remaining: AtomicUsize,
    rejected: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl InsertFaults {
    pub(crate) fn arm(&self, failures: usize) {
        self.remaining.store(failures, Ordering::SeqCst);
    }

    /// Consume one armed failure, recording what was rejected.
    fn take(&self, number: u64, payload: &[u8]) -> bool {
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            self.rejected.lock().push((number, payload.to_vec()));
        }
        armed
    }

    pub(crate) fn rejected(&self) -> Vec<(u64, Vec<u8>)> {
        self.rejected.lock().clone()
    }
}

/// Record of every payload a node's backend built, for scenarios that
/// need to know which round produced a sealed proposal.
#[derive(Default)]
pub(crate) struct BuildLog {
    built: Mutex<Vec<Vec<u8>>>,
}

impl BuildLog {
    fn record(&self, payload: &[u8]) {
        self.built.lock().push(payload.to_vec());
    }

    pub(crate) fn all(&self) -> Vec<Vec<u8>> {
        self.built.lock().clone()
    }
}

/// Backend of a harness node: proposals are random payloads, the chain
/// is an in-memory log, and the liveness oracle compares the local
/// height against the best height visible across connected peers.
pub(crate) struct ChainBackend {
    node_id: NodeId,
    validators: Vec<NodeId>,
    chain: Arc<Chain>,
    peers: HashMap<NodeId, Arc<Chain>>,
    network: Arc<GossipNetwork>,
    proposal_delay: Duration,
    faults: Arc<InsertFaults>,
    builds: Arc<BuildLog>,
    rng: ChaCha8Rng,
}

impl ChainBackend {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: NodeId,
        validators: Vec<NodeId>,
        chain: Arc<Chain>,
        peers: HashMap<NodeId, Arc<Chain>>,
        network: Arc<GossipNetwork>,
        proposal_delay: Duration,
        faults: Arc<InsertFaults>,
        builds: Arc<BuildLog>,
        rng: ChaCha8Rng,
    ) -> Self {
        Self {
            node_id,
            validators,
            chain,
            peers,
            network,
            proposal_delay,
            faults,
            builds,
            rng,
        }
    }

    /// Best height among peers this node can currently reach.
    fn best_visible_height(&self) -> u64 {
        self.peers
            .iter()
            .filter(|(id, _)| *id != &self.node_id)
            .filter(|(id, _)| self.network.connects(&self.node_id, id))
            .map(|(_, chain)| chain.height())
            .max()
            .unwrap_or(0)
    }
}

impl Backend for ChainBackend {
    fn build_proposal(&mut self) -> Result<Proposal, BoxError> {
        let mut data = vec![0u8; 32];
        self.rng.fill_bytes(&mut data);
        self.builds.record(&data);
        Ok(Proposal::new(data, Instant::now() + self.proposal_delay))
    }

    fn validate(&self, proposal: &[u8]) -> Result<(), BoxError> {
        if proposal.is_empty() {
            return Err("empty proposal".into());
        }
        Ok(())
    }

    fn insert(&mut self, sealed: SealedProposal) -> Result<(), BoxError> {
        if self.faults.take(sealed.number, &sealed.proposal) {
            return Err("injected insert failure".into());
        }
        self.chain.append(sealed)
    }

    fn height(&self) -> u64 {
        self.chain.height()
    }

    fn validator_set(&self) -> ValidatorSet {
        let mut set = ValidatorSet::new(self.validators.clone());
        set.set_last_proposer(self.chain.last_proposer());
        set
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn is_stuck(&self, sequence: u64) -> (u64, bool) {
        let best = self.best_visible_height();
        (best, best > sequence)
    }
}

/// Signing identity of a harness node. Seals are the node id prefixed
/// onto the signed bytes; nothing verifies them, they only have to be
/// distinct per signer.
pub(crate) struct NodeKey {
    id: NodeId,
}

impl NodeKey {
    pub(crate) fn new(id: NodeId) -> Self {
        Self { id }
    }
}

impl SignKey for NodeKey {
    fn node_id(&self) -> NodeId {
        self.id.clone()
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, BoxError> {
        let mut seal = self.id.as_bytes().to_vec();
        seal.push(b':');
        seal.extend_from_slice(data);
        Ok(seal)
    }
}
