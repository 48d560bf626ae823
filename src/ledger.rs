//! BGPCoin ledger.
//!
//! A fixed-supply token pool that pays validators for useful work.
//! Rewards move coins from the treasury into balances, penalties
//! move them back, and spending burns half while recycling the
//! other half. The conservation invariant
//! `treasury + Σ balances + burned = total_supply`
//! holds after every completed operation under the ledger mutex.

use {
  crate::{config::RewardConfig, primitives::Asn},
  indexmap::IndexMap,
  serde::Serialize,
  std::{
    collections::HashSet,
    sync::Mutex,
  },
  thiserror::Error,
  tracing::debug,
};

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
  #[error("{asn} holds {balance:.2}, cannot spend {amount:.2}")]
  InsufficientBalance {
    asn: Asn,
    balance: f64,
    amount: f64,
  },

  #[error("treasury exhausted, cannot pay {amount:.2}")]
  TreasuryExhausted { amount: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOpKind {
  Reward,
  Penalty,
  Spend,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerOp {
  pub kind: LedgerOpKind,
  pub asn: Asn,
  pub amount: f64,
  pub reason: &'static str,
}

/// Performance multipliers maintained out of the hot path. All
/// start at 1.0 and are clamped into their documented bands when
/// the multiplier is computed.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Multiplier {
  pub accuracy: f64,
  pub participation: f64,
  pub quality: f64,
}

impl Default for Multiplier {
  fn default() -> Self {
    Self {
      accuracy: 1.0,
      participation: 1.0,
      quality: 1.0,
    }
  }
}

impl Multiplier {
  pub fn factor(&self) -> f64 {
    self.accuracy.clamp(0.5, 1.5)
      * self.participation.clamp(0.8, 1.2)
      * self.quality.clamp(0.9, 1.3)
  }
}

#[derive(Debug)]
struct LedgerState {
  treasury: f64,
  balances: IndexMap<Asn, f64>,
  burned: f64,
  recycled: f64,
  log: Vec<LedgerOp>,
  multipliers: IndexMap<Asn, Multiplier>,
  sweep_committers: HashSet<Asn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
  pub total_supply: f64,
  pub treasury: f64,
  pub balances: IndexMap<Asn, f64>,
  pub burned: f64,
  pub recycled: f64,
  pub operations: usize,
}

pub struct TokenLedger {
  config: RewardConfig,
  state: Mutex<LedgerState>,
}

impl TokenLedger {
  pub fn new(config: RewardConfig) -> Self {
    let treasury = config.total_supply;
    Self {
      config,
      state: Mutex::new(LedgerState {
        treasury,
        balances: IndexMap::new(),
        burned: 0.0,
        recycled: 0.0,
        log: vec![],
        multipliers: IndexMap::new(),
        sweep_committers: HashSet::new(),
      }),
    }
  }

  /// Pays the committer of a block. Sweep-resolved commits pay the
  /// first-commit bonus to the first distinct committer seen since
  /// `begin_sweep`.
  pub fn reward_commit(
    &self,
    committer: Asn,
    swept: bool,
  ) -> Result<f64, LedgerError> {
    let mut state = self.state.lock().unwrap();
    let mut amount = self.config.block_commit_reward
      * Self::factor_of(&state, committer);
    if swept && state.sweep_committers.insert(committer) {
      amount += self.config.first_commit_bonus;
    }
    Self::pay(&mut state, committer, amount, "block-commit")?;
    Ok(amount)
  }

  /// Pays one approving voter of a committed transaction.
  pub fn reward_vote(&self, voter: Asn) -> Result<f64, LedgerError> {
    let mut state = self.state.lock().unwrap();
    let amount =
      self.config.vote_approve_reward * Self::factor_of(&state, voter);
    Self::pay(&mut state, voter, amount, "approve-vote")?;
    Ok(amount)
  }

  /// Pays the detector of a confirmed attack.
  pub fn reward_detection(&self, detector: Asn) -> Result<f64, LedgerError> {
    let mut state = self.state.lock().unwrap();
    let amount = self.config.attack_detection_reward
      * Self::factor_of(&state, detector);
    Self::pay(&mut state, detector, amount, "attack-detection")?;
    Ok(amount)
  }

  /// Pays a peer whose verdict ballot matched the outcome.
  pub fn reward_verdict_vote(&self, voter: Asn) -> Result<f64, LedgerError> {
    let mut state = self.state.lock().unwrap();
    let amount = self.config.attack_vote_reward;
    Self::pay(&mut state, voter, amount, "verdict-vote")?;
    Ok(amount)
  }

  /// Penalizes the proposer of a rejected verdict. Penalties return
  /// to the treasury without burning and never take a balance below
  /// zero.
  pub fn penalize_false_accusation(&self, proposer: Asn) -> f64 {
    let mut guard = self.state.lock().unwrap();
    let state = &mut *guard;
    let balance = state.balances.entry(proposer).or_insert(0.0);
    let amount = self.config.false_accusation_penalty.min(*balance);
    *balance -= amount;
    state.treasury += amount;
    state.log.push(LedgerOp {
      kind: LedgerOpKind::Penalty,
      asn: proposer,
      amount,
      reason: "false-accusation",
    });
    debug!("{proposer} penalized {amount:.2} for a rejected verdict");
    amount
  }

  /// Spends from a balance: half burns, half returns to treasury.
  pub fn spend(&self, asn: Asn, amount: f64) -> Result<(), LedgerError> {
    let mut guard = self.state.lock().unwrap();
    let state = &mut *guard;
    let balance = state.balances.entry(asn).or_insert(0.0);
    if *balance < amount {
      return Err(LedgerError::InsufficientBalance {
        asn,
        balance: *balance,
        amount,
      });
    }
    *balance -= amount;
    state.burned += amount / 2.0;
    state.recycled += amount / 2.0;
    state.treasury += amount / 2.0;
    state.log.push(LedgerOp {
      kind: LedgerOpKind::Spend,
      asn,
      amount,
      reason: "spend",
    });
    Ok(())
  }

  /// Opens a new sweep window for the first-commit bonus.
  pub fn begin_sweep(&self) {
    self.state.lock().unwrap().sweep_committers.clear();
  }

  pub fn set_multiplier(&self, asn: Asn, multiplier: Multiplier) {
    self.state.lock().unwrap().multipliers.insert(asn, multiplier);
  }

  pub fn balance(&self, asn: Asn) -> f64 {
    self
      .state
      .lock()
      .unwrap()
      .balances
      .get(&asn)
      .copied()
      .unwrap_or(0.0)
  }

  pub fn snapshot(&self) -> LedgerSnapshot {
    let state = self.state.lock().unwrap();
    LedgerSnapshot {
      total_supply: self.config.total_supply,
      treasury: state.treasury,
      balances: state.balances.clone(),
      burned: state.burned,
      recycled: state.recycled,
      operations: state.log.len(),
    }
  }

  /// `treasury + Σ balances + burned`, which must always equal the
  /// total supply.
  pub fn circulating_total(&self) -> f64 {
    let state = self.state.lock().unwrap();
    state.treasury + state.balances.values().sum::<f64>() + state.burned
  }

  fn factor_of(state: &LedgerState, asn: Asn) -> f64 {
    state
      .multipliers
      .get(&asn)
      .copied()
      .unwrap_or_default()
      .factor()
  }

  fn pay(
    state: &mut LedgerState,
    asn: Asn,
    amount: f64,
    reason: &'static str,
  ) -> Result<(), LedgerError> {
    if state.treasury < amount {
      return Err(LedgerError::TreasuryExhausted { amount });
    }
    state.treasury -= amount;
    *state.balances.entry(asn).or_insert(0.0) += amount;
    state.log.push(LedgerOp {
      kind: LedgerOpKind::Reward,
      asn,
      amount,
      reason,
    });
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use {
    super::{Multiplier, TokenLedger},
    crate::{config::RewardConfig, primitives::Asn},
  };

  fn ledger() -> TokenLedger {
    TokenLedger::new(RewardConfig::default())
  }

  fn assert_conserved(ledger: &TokenLedger) {
    let total = ledger.circulating_total();
    assert!(
      (total - RewardConfig::default().total_supply).abs() < 1e-6,
      "conservation violated: {total}"
    );
  }

  #[test]
  fn rewards_move_from_treasury() {
    let ledger = ledger();
    ledger.reward_commit(Asn(1), false).unwrap();
    ledger.reward_vote(Asn(3)).unwrap();
    ledger.reward_vote(Asn(5)).unwrap();

    assert_eq!(ledger.balance(Asn(1)), 10.0);
    assert_eq!(ledger.balance(Asn(3)), 1.0);
    assert_eq!(ledger.balance(Asn(5)), 1.0);
    assert_conserved(&ledger);
  }

  #[test]
  fn first_commit_bonus_applies_once_per_sweep() {
    let ledger = ledger();
    ledger.begin_sweep();
    assert_eq!(ledger.reward_commit(Asn(1), true).unwrap(), 15.0);
    assert_eq!(ledger.reward_commit(Asn(1), true).unwrap(), 10.0);
    assert_eq!(ledger.reward_commit(Asn(3), true).unwrap(), 15.0);

    ledger.begin_sweep();
    assert_eq!(ledger.reward_commit(Asn(1), true).unwrap(), 15.0);
    // predicate-path commits never draw the bonus
    assert_eq!(ledger.reward_commit(Asn(5), false).unwrap(), 10.0);
    assert_conserved(&ledger);
  }

  #[test]
  fn multipliers_scale_and_clamp() {
    let ledger = ledger();
    ledger.set_multiplier(Asn(1), Multiplier {
      accuracy: 2.0, // clamps to 1.5
      participation: 1.0,
      quality: 1.0,
    });
    assert_eq!(ledger.reward_commit(Asn(1), false).unwrap(), 15.0);
    assert_conserved(&ledger);
  }

  #[test]
  fn spend_burns_half_and_recycles_half() {
    let ledger = ledger();
    ledger.reward_detection(Asn(1)).unwrap();
    assert_eq!(ledger.balance(Asn(1)), 100.0);

    ledger.spend(Asn(1), 40.0).unwrap();
    let snapshot = ledger.snapshot();
    assert_eq!(snapshot.balances[&Asn(1)], 60.0);
    assert_eq!(snapshot.burned, 20.0);
    assert_eq!(snapshot.recycled, 20.0);
    assert_conserved(&ledger);

    assert!(ledger.spend(Asn(1), 1000.0).is_err());
  }

  #[test]
  fn penalties_return_to_treasury_without_burning() {
    let ledger = ledger();
    ledger.reward_detection(Asn(1)).unwrap();
    let taken = ledger.penalize_false_accusation(Asn(1));
    assert_eq!(taken, 20.0);
    assert_eq!(ledger.balance(Asn(1)), 80.0);
    assert_eq!(ledger.snapshot().burned, 0.0);
    assert_conserved(&ledger);
  }

  #[test]
  fn penalties_never_take_balances_negative() {
    let ledger = ledger();
    ledger.reward_vote(Asn(1)).unwrap(); // balance 1.0
    let taken = ledger.penalize_false_accusation(Asn(1));
    assert_eq!(taken, 1.0);
    assert_eq!(ledger.balance(Asn(1)), 0.0);
    assert_conserved(&ledger);
  }
}
