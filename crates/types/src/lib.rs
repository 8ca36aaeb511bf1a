//! Core value types for IBFT consensus.
//!
//! This crate provides the foundational types shared by the consensus
//! engine and its drivers:
//!
//! - **Identifiers**: [`NodeId`]
//! - **Positions**: [`View`] (sequence + round)
//! - **Messages**: [`MsgType`], [`MessageReq`]
//! - **Proposals**: [`Proposal`], [`SealedProposal`]
//! - **Membership**: [`ValidatorSet`] with deterministic proposer rotation
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crate, making it the foundation layer.
//! Everything here is a plain value type; the protocol rules that act on
//! these types live in the `ibft` crate.

mod identifiers;
mod message;
mod validator;
mod view;

pub use identifiers::NodeId;
pub use message::{MessageReq, MsgType, Proposal, SealedProposal};
pub use validator::ValidatorSet;
pub use view::View;
