//! The per-height consensus state machine.

use crate::backend::{Backend, SignKey, Transport};
use crate::config::Config;
use crate::error::StateError;
use crate::msg_queue::MsgQueue;
use crate::state::{IbftState, RoundState};
use ibft_types::{MessageReq, MsgType, Proposal, SealedProposal, View};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one message wait.
enum Read {
    Msg(MessageReq),
    Timeout,
    Cancelled,
}

/// Cloneable ingress for gossip handlers.
///
/// Pushes inbound messages into the sequence's queue without touching
/// the state machine, so network code never holds a reference to the
/// engine.
#[derive(Clone)]
pub struct SequenceHandle {
    queue: Arc<MsgQueue>,
}

impl SequenceHandle {
    /// Enqueue an inbound gossip message and wake the consensus loop.
    pub fn push_message(&self, msg: MessageReq) {
        self.queue.push(msg);
    }
}

/// IBFT state machine for one validator.
///
/// Owns the round state exclusively; the only surface shared with other
/// tasks is the message queue, reachable through [`SequenceHandle`].
/// [`run`](Self::run) drives a single sequence to [`IbftState::Done`]
/// or [`IbftState::Sync`] and is resumable after cancellation: partial
/// state remains and the next call picks up from the current view.
pub struct Sequence<B, T, K> {
    config: Config,
    backend: B,
    transport: T,
    key: K,
    state: RoundState,
    queue: Arc<MsgQueue>,
    force_timeout: bool,
}

impl<B, T, K> Sequence<B, T, K>
where
    B: Backend,
    T: Transport,
    K: SignKey,
{
    /// Create a state machine positioned at the backend's current
    /// height.
    pub fn new(key: K, backend: B, transport: T, config: Config) -> Self {
        let state = RoundState::new(backend.validator_set(), backend.height());
        debug!(validator = %key.node_id(), sequence = state.view().sequence, "consensus state machine created");
        Self {
            config,
            backend,
            transport,
            key,
            state,
            queue: Arc::new(MsgQueue::new()),
            force_timeout: false,
        }
    }

    /// Ingress handle for the gossip path.
    pub fn handle(&self) -> SequenceHandle {
        SequenceHandle {
            queue: self.queue.clone(),
        }
    }

    /// Push a message into the local queue, equivalent to the handle.
    pub fn push_message(&self, msg: MessageReq) {
        self.queue.push(msg);
    }

    /// Current protocol stage.
    pub fn state(&self) -> IbftState {
        self.state.state()
    }

    /// Current view.
    pub fn view(&self) -> View {
        self.state.view()
    }

    /// Whether the node is currently in the given stage.
    pub fn is_state(&self, state: IbftState) -> bool {
        self.state() == state
    }

    /// Re-snapshot the height and validator set from the backend and
    /// reset all per-sequence state. Call between sequences, not to
    /// resume an interrupted one.
    pub fn begin_sequence(&mut self) {
        self.state = RoundState::new(self.backend.validator_set(), self.backend.height());
    }

    /// Make the next message wait behave as if it timed out. Test hook.
    #[doc(hidden)]
    pub fn force_timeout(&mut self) {
        self.force_timeout = true;
    }

    /// Drive the state machine until the sequence is sealed (`Done`),
    /// abandoned (`Sync`), or `cancel` fires.
    ///
    /// Errors never surface here; they feed the round-change path.
    #[instrument(name = "sequence", skip_all, fields(sequence = self.state.view().sequence))]
    pub async fn run(&mut self, cancel: &CancellationToken) {
        self.set_state(IbftState::Accept);

        while !self.state().is_terminal() {
            if cancel.is_cancelled() {
                return;
            }
            self.run_cycle(cancel).await;
        }
    }

    async fn run_cycle(&mut self, cancel: &CancellationToken) {
        let view = self.view();
        debug!(state = %self.state(), sequence = view.sequence, round = view.round, "cycle");

        match self.state() {
            IbftState::Accept => self.run_accept_state(cancel).await,
            IbftState::Validate => self.run_validate_state(cancel).await,
            IbftState::RoundChange => self.run_round_change_state(cancel).await,
            IbftState::Commit => self.run_commit_state(),
            IbftState::Done | IbftState::Sync => {
                unreachable!("cannot iterate on a terminal state")
            }
        }
    }

    /// Accept state: compute the proposer and either announce a
    /// proposal (proposer) or wait for one (everyone else).
    async fn run_accept_state(&mut self, cancel: &CancellationToken) {
        info!(sequence = self.view().sequence, round = self.view().round, "accept state");

        let me = self.key.node_id();
        if !self.state.validators().includes(&me) {
            info!(validator = %me, "no longer part of the validator set");
            self.set_state(IbftState::Sync);
            return;
        }

        self.state.reset_round_msgs();
        let proposer = self.state.calc_proposer();
        let is_proposer = proposer == me;

        if is_proposer {
            info!(sequence = self.view().sequence, "we are the proposer");

            if !self.state.locked() {
                let proposal = match self.backend.build_proposal() {
                    Ok(proposal) => proposal,
                    Err(err) => {
                        error!(error = %err, "failed to build proposal");
                        self.set_state(IbftState::RoundChange);
                        return;
                    }
                };

                // hold the proposal until its release time
                let delay = proposal.time.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
                self.state.set_proposal(proposal);
            }

            self.send_preprepare();
            self.send_prepare();
            self.set_state(IbftState::Validate);
            return;
        }

        debug!(proposer = %proposer, sequence = self.view().sequence, "proposer calculated");

        // Wait for the preprepare from the proposer. Messages from
        // anyone else are logged and skipped without advancing the
        // round.
        let timeout = self.accept_timeout();
        while self.is_state(IbftState::Accept) {
            let msg = match self.next_message(timeout, cancel).await {
                Read::Cancelled => return,
                Read::Timeout => {
                    self.set_state(IbftState::RoundChange);
                    continue;
                }
                Read::Msg(msg) => msg,
            };

            if msg.from != proposer {
                warn!(expected = %proposer, found = %msg.from, "preprepare from wrong proposer");
                continue;
            }

            let payload = msg.proposal.unwrap_or_default();
            if let Err(err) = self.backend.validate(&payload) {
                error!(error = %err, "failed to validate proposal");
                self.set_state(IbftState::RoundChange);
                return;
            }

            if self.state.locked() {
                let incoming = self.backend.hash(&payload);
                let locked = self.state.proposal().map(|p| self.backend.hash(&p.data));
                if Some(incoming) == locked {
                    // locked on this exact proposal: commit straight
                    // away, the prepare phase is already settled
                    self.send_commit();
                    self.set_state(IbftState::Validate);
                } else {
                    self.handle_state_err(StateError::IncorrectLockedProposal);
                }
            } else {
                self.state.set_proposal(Proposal::immediate(payload));
                self.send_prepare();
                self.set_state(IbftState::Validate);
            }
        }
    }

    /// Validate state: tally prepare and commit votes until a strong
    /// commit quorum forms.
    async fn run_validate_state(&mut self, cancel: &CancellationToken) {
        // the commit broadcast is deduplicated across both quorum
        // triggers
        let mut has_committed = false;

        let timeout = self.round_timeout();
        while self.is_state(IbftState::Validate) {
            let msg = match self.next_message(timeout, cancel).await {
                Read::Cancelled => return,
                Read::Timeout => {
                    self.set_state(IbftState::RoundChange);
                    continue;
                }
                Read::Msg(msg) => msg,
            };

            match msg.msg_type {
                MsgType::Prepare => self.state.add_prepared(msg),
                MsgType::Commit => self.state.add_committed(msg),
                other => unreachable!("{other} message cannot reach the validate state"),
            }

            if self.state.num_prepared() > self.state.num_valid() {
                // strong prepare quorum
                self.lock_and_commit(&mut has_committed);
            }

            if self.state.num_committed() > self.state.num_valid() {
                // strong commit quorum
                self.lock_and_commit(&mut has_committed);
                self.set_state(IbftState::Commit);
            }
        }
    }

    /// Lock the proposal and broadcast our commit exactly once per
    /// validate pass.
    fn lock_and_commit(&mut self, has_committed: &mut bool) {
        self.state.lock();
        if !*has_committed {
            self.send_commit();
            *has_committed = true;
        }
    }

    /// Commit state: hand the sealed proposal to the backend.
    fn run_commit_state(&mut self) {
        let committed_seals = self.state.get_committed_seals();
        let proposal = self
            .state
            .proposal()
            .map(|p| p.data.clone())
            .expect("a proposal is certified before the commit state");
        let proposer = self
            .state
            .proposer()
            .cloned()
            .expect("the proposer is computed on accept");
        let sequence = self.view().sequence;

        // unlock regardless of the outcome so a different proposal can
        // be tried if the insertion fails
        self.state.unlock();

        let sealed = SealedProposal {
            proposal,
            committed_seals,
            proposer,
            number: sequence,
        };
        match self.backend.insert(sealed) {
            Ok(()) => {
                self.state.set_sequence(sequence + 1);
                self.set_state(IbftState::Done);
            }
            Err(err) => {
                error!(error = %err, sequence, "failed to insert proposal");
                self.handle_state_err(StateError::FailedToInsertProposal);
            }
        }
    }

    /// Round-change state: negotiate the next round, or give up and
    /// sync if the network has moved on without us.
    async fn run_round_change_state(&mut self, cancel: &CancellationToken) {
        // Entry: pick the round to ask for. A recorded error means our
        // own state failed, so the next round is the only option;
        // otherwise prefer a round others are already voting for.
        if let Some(err) = self.state.take_err() {
            debug!(error = %err, "round change after state error");
            self.send_next_round_change();
        } else if let Some(max_round) = self.state.max_round() {
            debug!(round = max_round, "round change towards the highest seen round");
            self.send_round_change(max_round);
        } else {
            self.try_advance_or_sync();
        }

        let mut timeout = self.round_timeout();
        while self.is_state(IbftState::RoundChange) {
            let msg = match self.next_message(timeout, cancel).await {
                Read::Cancelled => return,
                Read::Timeout => {
                    debug!("round change timeout");
                    self.try_advance_or_sync();
                    timeout = self.round_timeout();
                    continue;
                }
                Read::Msg(msg) => msg,
            };

            let msg_round = msg.view.round;
            let num = self.state.add_round_message(msg);

            if num == self.state.num_valid() {
                // certificate: enough validators want this round
                self.state.set_round(msg_round);
                self.set_state(IbftState::Accept);
            } else if num == self.state.max_faulty() + 1 && self.view().round < msg_round {
                // weak certificate: catch up to the higher round
                timeout = self.round_timeout();
                self.send_round_change(msg_round);
            }
        }
    }

    /// Consult the liveness oracle; either abandon the sequence or ask
    /// for the next round.
    fn try_advance_or_sync(&mut self) {
        let sequence = self.view().sequence;
        let (best_height, stuck) = self.backend.is_stuck(sequence);
        if stuck {
            info!(local = sequence, remote = best_height, "out of sync with the network");
            self.set_state(IbftState::Sync);
            return;
        }
        self.send_next_round_change();
    }

    fn send_next_round_change(&mut self) {
        self.send_round_change(self.view().round + 1);
    }

    /// Move to `round` and announce it.
    fn send_round_change(&mut self, round: u64) {
        debug!(round, "local round change");
        self.state.set_round(round);
        self.state.clean_round(round);
        self.gossip(MsgType::RoundChange);
    }

    fn handle_state_err(&mut self, err: StateError) {
        self.state.set_err(err);
        self.set_state(IbftState::RoundChange);
    }

    fn send_preprepare(&mut self) {
        self.gossip(MsgType::Preprepare);
    }

    fn send_prepare(&mut self) {
        self.gossip(MsgType::Prepare);
    }

    fn send_commit(&mut self) {
        self.gossip(MsgType::Commit);
    }

    /// Build and broadcast a message of the given kind, self-delivering
    /// a copy of everything except the preprepare (the proposer moves
    /// straight on to its own prepare).
    fn gossip(&mut self, msg_type: MsgType) {
        let mut msg = MessageReq::new(msg_type, self.key.node_id(), self.view());

        if msg_type == MsgType::Preprepare {
            msg.proposal = self.state.proposal().map(|p| p.data.clone());
        }

        if msg_type == MsgType::Commit {
            // seal the proposal hash; a failed signature only mutes
            // this node, the rest of the quorum can still progress
            let data = self
                .state
                .proposal()
                .map(|p| p.data.clone())
                .expect("a commit is only sent for an adopted proposal");
            let hash = self.backend.hash(&data);
            match self.key.sign(&hash) {
                Ok(seal) => msg.seal = Some(seal),
                Err(err) => {
                    error!(error = %err, "failed to sign the committed seal");
                    return;
                }
            }
        }

        if msg_type != MsgType::Preprepare {
            // self-deliver a copy so our own vote is counted
            self.queue.push(msg.clone());
        }

        if let Err(err) = self.transport.gossip(&msg) {
            warn!(error = %err, msg = %msg_type, "failed to gossip");
        }
    }

    /// Wait for the next message deliverable in the current state.
    ///
    /// The wait restarts in full for every call; a wake with nothing
    /// deliverable goes straight back to sleep.
    async fn next_message(&mut self, timeout: Duration, cancel: &CancellationToken) -> Read {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (msg, discarded) = self.queue.read(self.state(), self.view());
            for msg in discarded {
                debug!(
                    msg = %msg.msg_type,
                    from = %msg.from,
                    sequence = msg.view.sequence,
                    round = msg.view.round,
                    "dropping stale message"
                );
            }
            if let Some(msg) = msg {
                debug!(
                    msg = %msg.msg_type,
                    from = %msg.from,
                    sequence = msg.view.sequence,
                    round = msg.view.round,
                    "message"
                );
                return Read::Msg(msg);
            }

            if self.force_timeout {
                self.force_timeout = false;
                return Read::Timeout;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Read::Timeout,
                _ = cancel.cancelled() => return Read::Cancelled,
                _ = self.queue.notified() => {}
            }
        }
    }

    fn round_timeout(&self) -> Duration {
        Config::round_timeout(self.config.timeout, self.view().round)
    }

    fn accept_timeout(&self) -> Duration {
        Config::round_timeout(self.config.proposal_timeout, self.view().round)
    }

    fn set_state(&mut self, state: IbftState) {
        debug!(from = %self.state(), to = %state, "state change");
        self.state.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BoxError;
    use ibft_types::{NodeId, ValidatorSet};
    use parking_lot::Mutex;

    fn node(i: usize) -> NodeId {
        NodeId::from(format!("node_{i}"))
    }

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(node).collect()
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<MessageReq>>>);

    impl Recorder {
        fn sent(&self) -> Vec<MessageReq> {
            self.0.lock().clone()
        }

        fn kinds(&self) -> Vec<MsgType> {
            self.sent().iter().map(|m| m.msg_type).collect()
        }
    }

    impl Transport for Recorder {
        fn gossip(&self, msg: &MessageReq) -> Result<(), BoxError> {
            self.0.lock().push(msg.clone());
            Ok(())
        }
    }

    struct TestKey(NodeId);

    impl SignKey for TestKey {
        fn node_id(&self) -> NodeId {
            self.0.clone()
        }

        fn sign(&self, data: &[u8]) -> Result<Vec<u8>, BoxError> {
            let mut seal = self.0.as_bytes().to_vec();
            seal.extend_from_slice(data);
            Ok(seal)
        }
    }

    struct TestBackend {
        validators: Vec<NodeId>,
        height: u64,
        inserted: Arc<Mutex<Vec<SealedProposal>>>,
        fail_insert: bool,
        fail_build: bool,
        stuck: bool,
    }

    impl TestBackend {
        fn new(n: usize) -> Self {
            Self {
                validators: nodes(n),
                height: 1,
                inserted: Arc::new(Mutex::new(Vec::new())),
                fail_insert: false,
                fail_build: false,
                stuck: false,
            }
        }
    }

    impl Backend for TestBackend {
        fn build_proposal(&mut self) -> Result<Proposal, BoxError> {
            if self.fail_build {
                return Err("no payload available".into());
            }
            Ok(Proposal::immediate(
                format!("block-{}", self.height).into_bytes(),
            ))
        }

        fn validate(&self, _proposal: &[u8]) -> Result<(), BoxError> {
            Ok(())
        }

        fn insert(&mut self, sealed: SealedProposal) -> Result<(), BoxError> {
            if self.fail_insert {
                return Err("injected insert failure".into());
            }
            self.inserted.lock().push(sealed);
            Ok(())
        }

        fn height(&self) -> u64 {
            self.height
        }

        fn validator_set(&self) -> ValidatorSet {
            ValidatorSet::new(self.validators.clone())
        }

        fn hash(&self, data: &[u8]) -> Vec<u8> {
            data.to_vec()
        }

        fn is_stuck(&self, _sequence: u64) -> (u64, bool) {
            (0, self.stuck)
        }
    }

    type TestSequence = Sequence<TestBackend, Recorder, TestKey>;

    fn sequence(me: usize, n: usize) -> (TestSequence, Recorder) {
        sequence_with(me, TestBackend::new(n))
    }

    fn sequence_with(me: usize, backend: TestBackend) -> (TestSequence, Recorder) {
        let transport = Recorder::default();
        let seq = Sequence::new(
            TestKey(node(me)),
            backend,
            transport.clone(),
            Config::default(),
        );
        (seq, transport)
    }

    fn preprepare(from: usize, view: View, payload: &[u8]) -> MessageReq {
        let mut msg = MessageReq::new(MsgType::Preprepare, node(from), view);
        msg.proposal = Some(payload.to_vec());
        msg
    }

    fn commit(from: usize, view: View) -> MessageReq {
        let mut msg = MessageReq::new(MsgType::Commit, node(from), view);
        msg.seal = Some(format!("seal-{from}").into_bytes());
        msg
    }

    #[tokio::test]
    async fn proposer_announces_and_enters_validate() {
        // round 0 with no last proposer elects node_0
        let (mut seq, transport) = sequence(0, 4);
        let cancel = CancellationToken::new();

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::Validate);
        assert_eq!(transport.kinds(), vec![MsgType::Preprepare, MsgType::Prepare]);
        assert_eq!(
            transport.sent()[0].proposal.as_deref(),
            Some(b"block-1".as_ref())
        );

        // the prepare was self-delivered, the preprepare was not
        let (msg, _) = seq.queue.read(IbftState::Validate, seq.view());
        let msg = msg.expect("self-delivered prepare");
        assert_eq!(msg.msg_type, MsgType::Prepare);
        assert_eq!(msg.from, node(0));
        let (none, _) = seq.queue.read(IbftState::Accept, seq.view());
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn build_failure_moves_to_round_change_without_error() {
        let mut backend = TestBackend::new(4);
        backend.fail_build = true;
        let (mut seq, transport) = sequence_with(0, backend);
        let cancel = CancellationToken::new();

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::RoundChange);
        assert!(transport.sent().is_empty());
        assert_eq!(seq.state.take_err(), None);
    }

    #[tokio::test]
    async fn non_proposer_adopts_a_valid_proposal() {
        let (mut seq, transport) = sequence(1, 4);
        let cancel = CancellationToken::new();
        seq.push_message(preprepare(0, View::new(1, 0), b"block"));

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::Validate);
        assert_eq!(transport.kinds(), vec![MsgType::Prepare]);
        assert_eq!(
            seq.state.proposal().map(|p| p.data.clone()),
            Some(b"block".to_vec())
        );
    }

    #[tokio::test]
    async fn preprepare_from_wrong_sender_is_ignored() {
        let (mut seq, transport) = sequence(1, 4);
        let cancel = CancellationToken::new();
        seq.push_message(preprepare(2, View::new(1, 0), b"forged"));
        seq.force_timeout();

        seq.run_cycle(&cancel).await;

        // the forged preprepare was skipped, the timeout moved us on
        assert_eq!(seq.state(), IbftState::RoundChange);
        assert_eq!(seq.view().round, 0);
        assert!(transport.sent().is_empty());
        assert!(seq.state.proposal().is_none());
    }

    #[tokio::test]
    async fn locked_node_commits_the_same_proposal_immediately() {
        let (mut seq, transport) = sequence(1, 4);
        let cancel = CancellationToken::new();
        seq.state.set_proposal(Proposal::immediate(b"block".to_vec()));
        seq.state.lock();
        seq.push_message(preprepare(0, View::new(1, 0), b"block"));

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::Validate);
        assert_eq!(transport.kinds(), vec![MsgType::Commit]);
        assert!(transport.sent()[0].seal.is_some());
        assert!(seq.state.locked());
    }

    #[tokio::test]
    async fn locked_node_rejects_a_different_proposal() {
        let (mut seq, transport) = sequence(1, 4);
        let cancel = CancellationToken::new();
        seq.state.set_proposal(Proposal::immediate(b"block".to_vec()));
        seq.state.lock();
        seq.push_message(preprepare(0, View::new(1, 0), b"other"));

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::RoundChange);
        assert!(transport.sent().is_empty());
        assert_eq!(seq.state.take_err(), Some(StateError::IncorrectLockedProposal));
        // the lock itself is untouched
        assert!(seq.state.locked());
    }

    #[tokio::test]
    async fn prepare_quorum_locks_and_commit_quorum_seals() {
        // N = 4: F = 1, a strong quorum needs more than 2 messages
        let (mut seq, transport) = sequence(3, 4);
        let cancel = CancellationToken::new();
        seq.state.set_state(IbftState::Validate);
        seq.state.set_proposal(Proposal::immediate(b"block".to_vec()));

        let view = View::new(1, 0);
        for i in 0..3 {
            seq.push_message(MessageReq::new(MsgType::Prepare, node(i), view));
        }
        for i in 0..3 {
            seq.push_message(commit(i, view));
        }

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::Commit);
        assert!(seq.state.locked());
        // exactly one commit broadcast despite two quorum triggers
        assert_eq!(transport.kinds(), vec![MsgType::Commit]);
        assert_eq!(seq.state.num_committed(), 3);
    }

    #[tokio::test]
    async fn commit_success_advances_the_sequence() {
        let (mut seq, _transport) = sequence(1, 4);
        let inserted = seq.backend.inserted.clone();
        seq.state.set_state(IbftState::Commit);
        seq.state.set_proposal(Proposal::immediate(b"block".to_vec()));
        seq.state.calc_proposer();
        let view = View::new(1, 0);
        for i in 0..3 {
            seq.state.add_committed(commit(i, view));
        }

        seq.run_commit_state();

        assert_eq!(seq.state(), IbftState::Done);
        assert_eq!(seq.view(), View::new(2, 0));
        assert!(!seq.state.locked());

        let inserted = inserted.lock();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].proposal, b"block".to_vec());
        assert_eq!(inserted[0].number, 1);
        assert_eq!(inserted[0].proposer, node(0));
        assert_eq!(inserted[0].committed_seals.len(), 3);
    }

    #[tokio::test]
    async fn commit_failure_unlocks_and_records_the_error() {
        let mut backend = TestBackend::new(4);
        backend.fail_insert = true;
        let (mut seq, _transport) = sequence_with(1, backend);
        seq.state.set_state(IbftState::Commit);
        seq.state.set_proposal(Proposal::immediate(b"block".to_vec()));
        seq.state.lock();
        seq.state.calc_proposer();

        seq.run_commit_state();

        assert_eq!(seq.state(), IbftState::RoundChange);
        assert!(!seq.state.locked());
        assert!(seq.state.proposal().is_none());
        assert_eq!(seq.state.take_err(), Some(StateError::FailedToInsertProposal));
    }

    #[tokio::test]
    async fn round_change_error_path_asks_for_the_next_round() {
        let mut backend = TestBackend::new(4);
        backend.stuck = true;
        let (mut seq, transport) = sequence_with(1, backend);
        let cancel = CancellationToken::new();
        seq.state.set_state(IbftState::RoundChange);
        seq.state.set_err(StateError::IncorrectLockedProposal);
        seq.force_timeout();

        seq.run_cycle(&cancel).await;

        // entry gossiped a round change for round + 1, then the forced
        // timeout consulted the stuck oracle
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MsgType::RoundChange);
        assert_eq!(sent[0].view.round, 1);
        assert_eq!(seq.state(), IbftState::Sync);
    }

    #[tokio::test]
    async fn round_change_prefers_the_highest_seen_round() {
        // N = 7 keeps the tally below both certificates here
        let mut backend = TestBackend::new(7);
        backend.stuck = true;
        let (mut seq, transport) = sequence_with(1, backend);
        let cancel = CancellationToken::new();
        seq.state.set_state(IbftState::RoundChange);
        seq.state
            .add_round_message(MessageReq::new(MsgType::RoundChange, node(2), View::new(1, 3)));
        seq.force_timeout();

        seq.run_cycle(&cancel).await;

        let sent = transport.sent();
        assert_eq!(sent[0].view.round, 3);
        assert_eq!(seq.state(), IbftState::Sync);
    }

    #[tokio::test]
    async fn stuck_node_abandons_the_sequence() {
        let mut backend = TestBackend::new(4);
        backend.stuck = true;
        let (mut seq, transport) = sequence_with(1, backend);
        let cancel = CancellationToken::new();
        seq.state.set_state(IbftState::RoundChange);

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::Sync);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn weak_certificate_jumps_then_strong_certificate_restarts() {
        // N = 7: F = 2, weak certificate at 3, certificate at 4
        let (mut seq, transport) = sequence(6, 7);
        let cancel = CancellationToken::new();
        seq.state.set_state(IbftState::RoundChange);
        for i in 0..4 {
            seq.push_message(MessageReq::new(
                MsgType::RoundChange,
                node(i),
                View::new(1, 5),
            ));
        }

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::Accept);
        assert_eq!(seq.view().round, 5);

        // entry asked for round 1, the weak certificate jumped to 5
        let rounds: Vec<u64> = transport.sent().iter().map(|m| m.view.round).collect();
        assert_eq!(rounds, vec![1, 5]);
    }

    #[tokio::test]
    async fn weak_certificate_never_jumps_backwards() {
        // N = 7: our own vote plus two peers reach F + 1 for the round
        // we are already in, which must not re-broadcast
        let (mut seq, transport) = sequence(6, 7);
        let cancel = CancellationToken::new();
        seq.state.set_state(IbftState::RoundChange);
        for i in 0..4 {
            seq.push_message(MessageReq::new(
                MsgType::RoundChange,
                node(i),
                View::new(1, 1),
            ));
        }

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::Accept);
        assert_eq!(seq.view().round, 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn non_validator_moves_to_sync() {
        let (mut seq, transport) = sequence(9, 4);
        let cancel = CancellationToken::new();

        seq.run_cycle(&cancel).await;

        assert_eq!(seq.state(), IbftState::Sync);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn single_validator_runs_a_full_sequence() {
        // N = 1 tolerates no faults, so the node's own votes are a
        // quorum and run() completes unaided
        let (mut seq, transport) = sequence(0, 1);
        let inserted = seq.backend.inserted.clone();
        let cancel = CancellationToken::new();

        seq.run(&cancel).await;

        assert_eq!(seq.state(), IbftState::Done);
        assert_eq!(seq.view(), View::new(2, 0));
        assert_eq!(inserted.lock().len(), 1);
        assert_eq!(
            transport.kinds(),
            vec![MsgType::Preprepare, MsgType::Prepare, MsgType::Commit]
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_at_a_suspension_point() {
        let (mut seq, _transport) = sequence(1, 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        seq.run(&cancel).await;

        // nothing happened: the loop observed the cancel before acting
        assert_eq!(seq.state(), IbftState::Accept);
        assert_eq!(seq.view(), View::new(1, 0));
    }
}
