//! Proof-of-Population consensus over observed announcements.
//!
//! Each notable observation becomes a transaction that its observer
//! puts to a three-way vote among the validator population. Commits
//! require a population-derived quorum of approvals; everything else
//! resolves through timeouts. Committed attack transactions open a
//! second, majority-ruled verdict round.

mod pool;
mod transaction;
mod verdict;
mod vote;

pub use {
  pool::{PoolStats, Proposal, Recall, Resolution, TransactionPool},
  transaction::{Transaction, TxKind, TxStatus},
  verdict::{
    AttackConsensus,
    AttackVerdict,
    VerdictBallot,
    VerdictOutcome,
    VerdictProposal,
    VerdictResolution,
  },
  vote::{VoteChoice, VoteSignature},
};
