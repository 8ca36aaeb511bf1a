//! Istanbul BFT consensus state machine.
//!
//! This crate implements the core of an IBFT consensus engine: a
//! leader-based state machine that drives a set of validators through
//! rounds until they agree on a single sealed proposal at a given
//! height.
//!
//! # Architecture
//!
//! The engine is a single-task loop with exactly two suspension points:
//! waiting on the message queue (with a round timeout) and the
//! pre-gossip delay of a freshly built proposal. All round state is
//! owned by the loop; the only shared surface is the message queue,
//! which gossip handlers reach through a cloneable [`SequenceHandle`].
//!
//! ```text
//! gossip ingress ──push──► MsgQueue ──read──► Sequence loop ──► Transport / Backend
//! ```
//!
//! # Protocol
//!
//! Each sequence (block height) starts in the accept state at round 0
//! and moves through four stages:
//!
//! - **Accept**: the proposer builds and announces a proposal; everyone
//!   else waits for it, validates it, and votes prepare. A node locked
//!   on a proposal from an earlier round commits immediately when the
//!   same proposal is re-announced.
//! - **Validate**: prepare and commit votes are tallied. A strong
//!   quorum (more than `2F` messages, i.e. `2F + 1`) of prepares locks
//!   the proposal and triggers this node's commit; a strong quorum of
//!   commits seals it.
//! - **Commit**: the sealed proposal is handed to the backend. Success
//!   advances the sequence; failure unlocks and retries in a new round.
//! - **RoundChange**: round-change votes are exchanged until `2F`
//!   validators agree on a round (restart from accept) or the liveness
//!   oracle reports this node has fallen behind (give up and sync).
//!   `F + 1` votes for a higher round are a weak certificate that is
//!   enough to jump to it.
//!
//! All I/O goes through the [`Backend`], [`Transport`], and [`SignKey`]
//! traits; the core owns no persistent state and no sockets.

mod backend;
mod config;
mod error;
mod msg_queue;
mod sequence;
mod state;

pub use backend::{Backend, BoxError, SignKey, Transport};
pub use config::Config;
pub use error::StateError;
pub use sequence::{Sequence, SequenceHandle};
pub use state::IbftState;
