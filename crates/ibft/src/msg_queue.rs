//! View-keyed message buffer feeding the consensus loop.

use crate::state::IbftState;
use ibft_types::{MessageReq, MsgType, View};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Inbound message buffer shared between the gossip ingress and the
/// consensus loop.
///
/// Messages are bucketed by the protocol stage that consumes them and
/// ordered by view (sequence, then round) and kind, so [`read`] always
/// surfaces the earliest message the current state can act on. Pushers
/// raise a coalescing wake signal; many pushes may produce a single
/// wake, so the loop re-checks availability after waking.
///
/// [`read`]: MsgQueue::read
pub(crate) struct MsgQueue {
    queues: Mutex<Queues>,
    notify: Notify,
}

#[derive(Default)]
struct Queues {
    /// Preprepare messages, consumed in the accept state.
    accept: BinaryHeap<Reverse<Task>>,
    /// Prepare and commit messages, consumed in the validate state.
    validate: BinaryHeap<Reverse<Task>>,
    /// Round-change messages, consumed in the round-change state.
    round_change: BinaryHeap<Reverse<Task>>,
}

/// Heap entry ordered by (view, kind); the payload does not participate
/// in the ordering, so entries with equal keys compare equal.
struct Task(MessageReq);

impl Task {
    fn key(&self) -> (View, MsgType) {
        (self.0.view, self.0.msg_type)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl MsgQueue {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
        }
    }

    /// Insert a message and wake the reader.
    pub(crate) fn push(&self, msg: MessageReq) {
        {
            let mut queues = self.queues.lock();
            let heap = match msg.msg_type {
                MsgType::Preprepare => &mut queues.accept,
                MsgType::Prepare | MsgType::Commit => &mut queues.validate,
                MsgType::RoundChange => &mut queues.round_change,
            };
            heap.push(Reverse(Task(msg)));
        }
        self.notify.notify_one();
    }

    /// Atomically pick the highest-priority message compatible with
    /// `(state, view)`.
    ///
    /// Messages that can never be delivered again (an older sequence, or
    /// an older round of the current sequence) are drained and returned
    /// as discards for observability; future-view messages stay queued.
    pub(crate) fn read(
        &self,
        state: IbftState,
        view: View,
    ) -> (Option<MessageReq>, Vec<MessageReq>) {
        let mut queues = self.queues.lock();
        let heap = match state {
            IbftState::Accept => &mut queues.accept,
            IbftState::Validate => &mut queues.validate,
            IbftState::RoundChange => &mut queues.round_change,
            IbftState::Commit | IbftState::Done | IbftState::Sync => return (None, Vec::new()),
        };

        let mut discarded = Vec::new();
        while let Some(Reverse(task)) = heap.peek() {
            let msg_view = task.0.view;

            let stale = msg_view.sequence < view.sequence
                || (msg_view.sequence == view.sequence && msg_view.round < view.round);
            if stale {
                if let Some(Reverse(task)) = heap.pop() {
                    discarded.push(task.0);
                }
                continue;
            }

            // Round-change catch-up: future rounds of the current
            // sequence are deliverable. Everything else must match the
            // view exactly.
            let deliverable = msg_view.sequence == view.sequence
                && match state {
                    IbftState::RoundChange => msg_view.round >= view.round,
                    _ => msg_view.round == view.round,
                };
            if deliverable {
                if let Some(Reverse(task)) = heap.pop() {
                    return (Some(task.0), discarded);
                }
            }

            // The earliest remaining message is for a future view; keep
            // it (and everything behind it) queued.
            break;
        }
        (None, discarded)
    }

    /// A future resolving after the next `push`. A permit stored by an
    /// earlier push resolves it immediately, so a push racing `read` is
    /// never lost.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibft_types::NodeId;
    use std::time::Duration;

    fn msg(msg_type: MsgType, from: &str, sequence: u64, round: u64) -> MessageReq {
        MessageReq::new(msg_type, NodeId::from(from), View::new(sequence, round))
    }

    #[test]
    fn prepare_sorts_before_commit_within_a_view() {
        let queue = MsgQueue::new();
        queue.push(msg(MsgType::Commit, "a", 1, 0));
        queue.push(msg(MsgType::Prepare, "b", 1, 0));

        let (first, _) = queue.read(IbftState::Validate, View::new(1, 0));
        assert_eq!(first.unwrap().msg_type, MsgType::Prepare);
        let (second, _) = queue.read(IbftState::Validate, View::new(1, 0));
        assert_eq!(second.unwrap().msg_type, MsgType::Commit);
    }

    #[test]
    fn stale_messages_are_discarded() {
        let queue = MsgQueue::new();
        queue.push(msg(MsgType::Prepare, "a", 4, 0));
        queue.push(msg(MsgType::Prepare, "b", 5, 1));
        queue.push(msg(MsgType::Prepare, "c", 5, 2));

        let (delivered, discarded) = queue.read(IbftState::Validate, View::new(5, 2));
        assert_eq!(delivered.unwrap().from, NodeId::from("c"));
        assert_eq!(discarded.len(), 2);
    }

    #[test]
    fn future_views_are_deferred_not_dropped() {
        let queue = MsgQueue::new();
        queue.push(msg(MsgType::Prepare, "a", 5, 3));
        queue.push(msg(MsgType::Prepare, "b", 6, 0));

        let (delivered, discarded) = queue.read(IbftState::Validate, View::new(5, 2));
        assert!(delivered.is_none());
        assert!(discarded.is_empty());

        // once the view catches up, the deferred message surfaces
        let (delivered, _) = queue.read(IbftState::Validate, View::new(5, 3));
        assert_eq!(delivered.unwrap().from, NodeId::from("a"));
        let (delivered, _) = queue.read(IbftState::Validate, View::new(6, 0));
        assert_eq!(delivered.unwrap().from, NodeId::from("b"));
    }

    #[test]
    fn round_change_delivers_future_rounds_and_drops_old_ones() {
        let queue = MsgQueue::new();
        queue.push(msg(MsgType::RoundChange, "a", 5, 1));
        queue.push(msg(MsgType::RoundChange, "b", 5, 2));
        queue.push(msg(MsgType::RoundChange, "c", 5, 7));

        let (delivered, discarded) = queue.read(IbftState::RoundChange, View::new(5, 2));
        assert_eq!(delivered.unwrap().from, NodeId::from("b"));
        assert_eq!(discarded.len(), 1);

        let (delivered, _) = queue.read(IbftState::RoundChange, View::new(5, 2));
        assert_eq!(delivered.unwrap().from, NodeId::from("c"));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        let queue = MsgQueue::new();
        queue.push(msg(MsgType::Prepare, "a", 1, 0));
        queue.push(msg(MsgType::RoundChange, "b", 1, 0));

        for state in [IbftState::Commit, IbftState::Done, IbftState::Sync] {
            let (delivered, discarded) = queue.read(state, View::new(1, 0));
            assert!(delivered.is_none());
            assert!(discarded.is_empty());
        }
    }

    #[test]
    fn accept_only_sees_preprepares() {
        let queue = MsgQueue::new();
        queue.push(msg(MsgType::Prepare, "a", 1, 0));
        let (delivered, _) = queue.read(IbftState::Accept, View::new(1, 0));
        assert!(delivered.is_none());

        queue.push(msg(MsgType::Preprepare, "b", 1, 0));
        let (delivered, _) = queue.read(IbftState::Accept, View::new(1, 0));
        assert_eq!(delivered.unwrap().msg_type, MsgType::Preprepare);
    }

    #[tokio::test]
    async fn push_wakes_a_waiting_reader() {
        let queue = MsgQueue::new();
        // the permit stored by the push resolves a later notified()
        queue.push(msg(MsgType::Prepare, "a", 1, 0));
        tokio::time::timeout(Duration::from_millis(100), queue.notified())
            .await
            .expect("wake signal was not raised");
    }
}
