//! Behavioral trust scores for non-validator ASes.
//!
//! Scores live in [0, 100] and move by signed, bounded deltas in
//! response to confirmed attack verdicts, with slow positive drift
//! applied by periodic maintenance. Classification bands are always
//! derived from the score, never stored.

use {
  crate::{
    config::RatingConfig,
    detector::AttackKind,
    primitives::Asn,
  },
  indexmap::IndexMap,
  serde::Serialize,
  std::sync::Mutex,
  tracing::debug,
};

/// Reporting band derived from a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustBand {
  HighlyTrusted,
  Trusted,
  Neutral,
  Suspicious,
  Malicious,
}

impl TrustBand {
  pub fn of(score: f64) -> Self {
    if score >= 90.0 {
      TrustBand::HighlyTrusted
    } else if score >= 70.0 {
      TrustBand::Trusted
    } else if score >= 50.0 {
      TrustBand::Neutral
    } else if score >= 30.0 {
      TrustBand::Suspicious
    } else {
      TrustBand::Malicious
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct RatingEvent {
  pub timestamp: f64,
  pub delta: f64,
  pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustRating {
  pub score: f64,
  pub confirmed_attacks: u64,
  pub benign_confirmed: u64,
  pub history: Vec<RatingEvent>,
}

impl TrustRating {
  fn new(initial: f64) -> Self {
    Self {
      score: initial,
      confirmed_attacks: 0,
      benign_confirmed: 0,
      history: vec![],
    }
  }

  fn apply(&mut self, delta: f64, reason: String, timestamp: f64) {
    self.score = (self.score + delta).clamp(0.0, 100.0);
    self.history.push(RatingEvent {
      timestamp,
      delta,
      reason,
    });
  }

  pub fn band(&self) -> TrustBand {
    TrustBand::of(self.score)
  }
}

/// The replicated trust store. One mutex, held only across the
/// score-and-history update.
pub struct RatingStore {
  config: RatingConfig,
  ratings: Mutex<IndexMap<Asn, TrustRating>>,
}

impl RatingStore {
  pub fn new(config: RatingConfig) -> Self {
    Self {
      config,
      ratings: Mutex::new(IndexMap::new()),
    }
  }

  /// Applies the penalty for a confirmed attack verdict against the
  /// originating AS. Persistent attackers draw an extra penalty on
  /// every verdict past the threshold.
  pub fn record_attack(&self, origin: Asn, kind: AttackKind, timestamp: f64) {
    let delta = match kind {
      AttackKind::PrefixHijack => self.config.prefix_hijack,
      AttackKind::SubprefixHijack => self.config.subprefix_hijack,
      AttackKind::BogonInjection => self.config.bogon_injection,
      AttackKind::Flapping => self.config.flapping,
      AttackKind::RouteLeak => self.config.route_leak,
    };

    let mut ratings = self.ratings.lock().unwrap();
    let rating = ratings
      .entry(origin)
      .or_insert_with(|| TrustRating::new(self.config.initial_score));

    let persistent =
      rating.confirmed_attacks >= self.config.persistent_threshold;
    rating.apply(delta, kind.label().to_owned(), timestamp);
    if persistent {
      rating.apply(
        self.config.persistent_penalty,
        "persistent-attacker".to_owned(),
        timestamp,
      );
    }
    rating.confirmed_attacks += 1;
    debug!(
      "{origin} rated {:.1} after {} ({:?})",
      rating.score,
      kind.label(),
      rating.band()
    );
  }

  /// Counts a benign confirmed transaction for the origin. The
  /// actual bonus lands during maintenance.
  pub fn record_benign(&self, origin: Asn) {
    let mut ratings = self.ratings.lock().unwrap();
    ratings
      .entry(origin)
      .or_insert_with(|| TrustRating::new(self.config.initial_score))
      .benign_confirmed += 1;
  }

  /// Periodic positive drift, out of the hot path: one bonus point
  /// per full batch of benign confirmed transactions since the last
  /// maintenance pass.
  pub fn apply_benign_bonuses(&self, timestamp: f64) {
    let mut ratings = self.ratings.lock().unwrap();
    for rating in ratings.values_mut() {
      let batches = rating.benign_confirmed / self.config.benign_batch;
      if batches > 0 {
        rating.apply(
          batches as f64 * self.config.benign_bonus,
          "benign-traffic".to_owned(),
          timestamp,
        );
        rating.benign_confirmed %= self.config.benign_batch;
      }
    }
  }

  /// Monthly clean-record bonus for ASes without confirmed attacks.
  pub fn apply_clean_record_bonus(&self, timestamp: f64) {
    let mut ratings = self.ratings.lock().unwrap();
    for rating in ratings.values_mut() {
      if rating.confirmed_attacks == 0 {
        rating.apply(
          self.config.monthly_bonus,
          "clean-record".to_owned(),
          timestamp,
        );
      }
    }
  }

  pub fn score(&self, asn: Asn) -> f64 {
    self
      .ratings
      .lock()
      .unwrap()
      .get(&asn)
      .map(|r| r.score)
      .unwrap_or(self.config.initial_score)
  }

  pub fn snapshot(&self) -> IndexMap<Asn, TrustRating> {
    self.ratings.lock().unwrap().clone()
  }
}

#[cfg(test)]
mod test {
  use {
    super::{RatingStore, TrustBand},
    crate::{config::RatingConfig, detector::AttackKind, primitives::Asn},
  };

  fn store() -> RatingStore {
    RatingStore::new(RatingConfig::default())
  }

  #[test]
  fn attack_deltas_apply_and_log() {
    let store = store();
    store.record_attack(Asn(666), AttackKind::PrefixHijack, 1.0);
    assert_eq!(store.score(Asn(666)), 30.0);

    let snapshot = store.snapshot();
    let rating = &snapshot[&Asn(666)];
    assert_eq!(rating.history.len(), 1);
    assert_eq!(rating.history[0].delta, -20.0);
    assert_eq!(rating.band(), TrustBand::Suspicious);
  }

  #[test]
  fn scores_clamp_at_zero() {
    let store = store();
    for _ in 0..4 {
      store.record_attack(Asn(666), AttackKind::BogonInjection, 0.0);
    }
    assert_eq!(store.score(Asn(666)), 0.0);
    assert_eq!(
      store.snapshot()[&Asn(666)].band(),
      TrustBand::Malicious
    );
  }

  #[test]
  fn persistent_attackers_draw_the_extra_penalty() {
    let config = RatingConfig {
      bogon_injection: -1.0,
      ..RatingConfig::default()
    };
    let store = RatingStore::new(config);
    // three prior confirmed attacks
    for _ in 0..3 {
      store.record_attack(Asn(666), AttackKind::BogonInjection, 0.0);
    }
    assert_eq!(store.score(Asn(666)), 47.0);

    // the fourth verdict crosses the threshold: -1 - 30
    store.record_attack(Asn(666), AttackKind::BogonInjection, 0.0);
    assert_eq!(store.score(Asn(666)), 16.0);
  }

  #[test]
  fn benign_batches_earn_points_in_maintenance() {
    let store = store();
    for _ in 0..250 {
      store.record_benign(Asn(100));
    }
    assert_eq!(store.score(Asn(100)), 50.0); // nothing yet

    store.apply_benign_bonuses(0.0);
    assert_eq!(store.score(Asn(100)), 52.0);

    // remainder carries over
    for _ in 0..50 {
      store.record_benign(Asn(100));
    }
    store.apply_benign_bonuses(1.0);
    assert_eq!(store.score(Asn(100)), 53.0);
  }

  #[test]
  fn clean_record_bonus_skips_attackers() {
    let store = store();
    store.record_benign(Asn(100));
    store.record_attack(Asn(666), AttackKind::Flapping, 0.0);

    store.apply_clean_record_bonus(10.0);
    assert_eq!(store.score(Asn(100)), 55.0);
    assert_eq!(store.score(Asn(666)), 40.0);
  }

  #[test]
  fn scores_clamp_at_one_hundred() {
    let store = store();
    for _ in 0..20 {
      store.record_benign(Asn(100));
      store.apply_clean_record_bonus(0.0);
    }
    assert_eq!(store.score(Asn(100)), 100.0);
    assert_eq!(
      store.snapshot()[&Asn(100)].band(),
      TrustBand::HighlyTrusted
    );
  }
}
