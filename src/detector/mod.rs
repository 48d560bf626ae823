//! Announcement classification.
//!
//! A pure decision over (observation, oracle, flap history) into
//! benign or one of the attack classes. Outcomes propagate by value;
//! there is no exceptional control flow anywhere in the pipeline.

mod bogon;
mod flap;

pub use {bogon::is_bogon, flap::FlapTracker};

use {
  crate::{
    config::Config,
    observation::Observation,
    oracle::{RouteValidity, RpkiOracle},
    primitives::Asn,
  },
  serde::{Deserialize, Serialize},
  std::sync::Arc,
};

/// The attack classes the system can adjudicate.
///
/// `RouteLeak` is accounted for by the rating system but no hot-path
/// detector currently classifies it.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
  PrefixHijack,
  SubprefixHijack,
  BogonInjection,
  Flapping,
  RouteLeak,
}

impl AttackKind {
  pub fn label(self) -> &'static str {
    match self {
      AttackKind::PrefixHijack => "prefix-hijack",
      AttackKind::SubprefixHijack => "subprefix-hijack",
      AttackKind::BogonInjection => "bogon-injection",
      AttackKind::Flapping => "flapping",
      AttackKind::RouteLeak => "route-leak",
    }
  }
}

/// Result of classifying one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
  Benign,
  Attack(AttackKind),
}

impl Classification {
  pub fn is_attack(self) -> bool {
    matches!(self, Classification::Attack(_))
  }
}

/// Classifier bound to the shared oracle and the run configuration.
///
/// The flap tracker is owned by the caller (it is per-node mutable
/// state), which keeps the detector itself shareable and stateless.
#[derive(Debug, Clone)]
pub struct Detector {
  oracle: Arc<RpkiOracle>,
  config: Arc<Config>,
}

impl Detector {
  pub fn new(oracle: Arc<RpkiOracle>, config: Arc<Config>) -> Self {
    Self { oracle, config }
  }

  /// Classifies an observation, recording its transition in the
  /// caller's flap history as a side effect.
  ///
  /// Precedence: a Valid oracle answer is always benign, bogons win
  /// over hijacks, and flapping is only reported when no stronger
  /// signal is present.
  pub fn classify(
    &self,
    observation: &Observation,
    flap: &mut FlapTracker,
  ) -> Classification {
    let transitions = flap.record(observation);

    match self.oracle.validate(&observation.prefix, observation.origin) {
      RouteValidity::Valid => Classification::Benign,
      validity => {
        if is_bogon(&observation.prefix) {
          return Classification::Attack(AttackKind::BogonInjection);
        }
        match validity {
          RouteValidity::Invalid => {
            Classification::Attack(AttackKind::PrefixHijack)
          }
          RouteValidity::NotFound => {
            if self
              .oracle
              .covering_conflict(&observation.prefix, observation.origin)
              .is_some()
            {
              Classification::Attack(AttackKind::SubprefixHijack)
            } else if transitions >= self.config.flap_threshold {
              Classification::Attack(AttackKind::Flapping)
            } else {
              Classification::Benign
            }
          }
          RouteValidity::Valid => unreachable!(),
        }
      }
    }
  }

  /// Stateless re-classification a voter runs against a proposer's
  /// claim. Flapping cannot be checked without history, so it never
  /// contradicts here; the verdict round adjudicates it separately
  /// through carried evidence.
  pub fn reclassify(&self, prefix: &ipnet::IpNet, origin: Asn) -> Classification {
    match self.oracle.validate(prefix, origin) {
      RouteValidity::Valid => Classification::Benign,
      RouteValidity::Invalid => {
        if is_bogon(prefix) {
          Classification::Attack(AttackKind::BogonInjection)
        } else {
          Classification::Attack(AttackKind::PrefixHijack)
        }
      }
      RouteValidity::NotFound => {
        if is_bogon(prefix) {
          Classification::Attack(AttackKind::BogonInjection)
        } else if self.oracle.covering_conflict(prefix, origin).is_some() {
          Classification::Attack(AttackKind::SubprefixHijack)
        } else {
          Classification::Benign
        }
      }
    }
  }

  pub fn oracle(&self) -> &RpkiOracle {
    &self.oracle
  }
}
