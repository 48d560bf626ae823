use {
  chrono::{DateTime, TimeZone, Utc},
  serde::{Deserialize, Serialize},
  std::{path::Path, time::Duration},
  thiserror::Error,
};

/// Runtime configuration of a run.
///
/// Constructed once at startup (from defaults or a JSON file) and
/// passed immutably to every component. All windows that gate the
/// observation pipeline are expressed in logical dataset seconds;
/// only consensus deadlines are wall-clock durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
  /// Minimum approve votes required for a Proof-of-Population commit.
  pub consensus_min: usize,
  /// Upper cap on the PoP threshold regardless of population size.
  pub consensus_cap: usize,
  /// Minimum approves for an attack verdict to be confirmable.
  pub attack_consensus_min: usize,

  /// Wall-clock deadline for regular transaction voting.
  #[serde(with = "humantime_serde")]
  pub regular_timeout: Duration,
  /// Wall-clock deadline for attack transactions and verdict rounds.
  #[serde(with = "humantime_serde")]
  pub attack_timeout: Duration,
  /// Vote requests and attack proposals go to at most this many peers.
  pub max_broadcast_peers: usize,

  /// Dedup window for validator-role observers, logical seconds.
  pub rpki_dedup_window: f64,
  /// Dedup window for observed-role ASes, logical seconds.
  pub nonrpki_dedup_window: f64,
  /// How far back the knowledge base answers queries, logical seconds.
  pub knowledge_window: f64,
  /// Sampling window used by maintenance statistics, logical seconds.
  pub sampling_window: f64,
  /// Low-frequency knowledge eviction sweep interval.
  #[serde(with = "humantime_serde")]
  pub knowledge_cleanup_interval: Duration,

  pub pending_max: usize,
  pub committed_max: usize,
  pub knowledge_max: usize,
  pub last_seen_max: usize,
  pub inbox_capacity: usize,

  /// Flap detection window, logical seconds.
  pub flap_window: f64,
  /// Distinct transitions within the window that constitute flapping.
  pub flap_threshold: usize,
  /// Transitions closer together than this collapse into one event.
  pub flap_dedup: f64,

  pub rating: RatingConfig,
  pub rewards: RewardConfig,

  /// Ratio of logical dataset time to wall time. 1.0 replays in
  /// real time; 0 disables waiting entirely.
  pub speed_multiplier: f64,
  pub ingestion_buffer_max: usize,

  /// Wall-clock anchor of logical time zero. Timestamps recorded on
  /// transactions and blocks are `genesis_time + logical offset`, so
  /// a replay of the same dataset produces identical chains.
  pub genesis_time: DateTime<Utc>,
  /// Seed for keypair derivation and stable peer-subset selection.
  pub seed: u64,
}

/// Trust score deltas applied per confirmed attack verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RatingConfig {
  pub initial_score: f64,
  pub prefix_hijack: f64,
  pub subprefix_hijack: f64,
  pub bogon_injection: f64,
  pub flapping: f64,
  pub route_leak: f64,
  /// Extra penalty once an AS accumulates `persistent_threshold`
  /// confirmed attacks, applied once per subsequent verdict.
  pub persistent_penalty: f64,
  pub persistent_threshold: u64,
  /// One point of trust per this many benign confirmed transactions.
  pub benign_batch: u64,
  pub benign_bonus: f64,
  pub monthly_bonus: f64,
}

/// BGPCoin reward and penalty table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RewardConfig {
  pub total_supply: f64,
  pub block_commit_reward: f64,
  pub first_commit_bonus: f64,
  pub vote_approve_reward: f64,
  pub attack_detection_reward: f64,
  pub attack_vote_reward: f64,
  pub false_accusation_penalty: f64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      consensus_min: 3,
      consensus_cap: 5,
      attack_consensus_min: 3,
      regular_timeout: Duration::from_secs(3),
      attack_timeout: Duration::from_secs(5),
      max_broadcast_peers: 5,
      rpki_dedup_window: 300.0,
      nonrpki_dedup_window: 120.0,
      knowledge_window: 480.0,
      sampling_window: 300.0,
      knowledge_cleanup_interval: Duration::from_secs(60),
      pending_max: 5_000,
      committed_max: 50_000,
      knowledge_max: 50_000,
      last_seen_max: 100_000,
      inbox_capacity: 1_024,
      flap_window: 60.0,
      flap_threshold: 5,
      flap_dedup: 2.0,
      rating: RatingConfig::default(),
      rewards: RewardConfig::default(),
      speed_multiplier: 1.0,
      ingestion_buffer_max: 1_000,
      genesis_time: Utc.timestamp_opt(0, 0).unwrap(),
      seed: 0,
    }
  }
}

impl Default for RatingConfig {
  fn default() -> Self {
    Self {
      initial_score: 50.0,
      prefix_hijack: -20.0,
      subprefix_hijack: -18.0,
      bogon_injection: -25.0,
      flapping: -10.0,
      route_leak: -15.0,
      persistent_penalty: -30.0,
      persistent_threshold: 3,
      benign_batch: 100,
      benign_bonus: 1.0,
      monthly_bonus: 5.0,
    }
  }
}

impl Default for RewardConfig {
  fn default() -> Self {
    Self {
      total_supply: 10_000_000.0,
      block_commit_reward: 10.0,
      first_commit_bonus: 5.0,
      vote_approve_reward: 1.0,
      attack_detection_reward: 100.0,
      attack_vote_reward: 2.0,
      false_accusation_penalty: 20.0,
    }
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed reading config file: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed parsing config file: {0}")]
  Parse(#[from] serde_json::Error),
}

impl Config {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
  }

  /// Wall-clock timestamp for a logical dataset offset.
  pub fn logical_time(&self, offset: f64) -> DateTime<Utc> {
    self.genesis_time
      + chrono::Duration::milliseconds((offset * 1000.0) as i64)
  }

  /// The timeout sweep must run at least twice per shortest deadline
  /// so deadline precision stays within half a timeout.
  pub fn sweep_interval(&self) -> Duration {
    self.regular_timeout.min(self.attack_timeout) / 2
  }
}

#[cfg(test)]
mod test {
  use super::Config;

  #[test]
  fn defaults_match_documented_values() {
    let config = Config::default();
    assert_eq!(config.consensus_min, 3);
    assert_eq!(config.consensus_cap, 5);
    assert_eq!(config.regular_timeout.as_secs(), 3);
    assert_eq!(config.attack_timeout.as_secs(), 5);
    assert_eq!(config.rpki_dedup_window, 300.0);
    assert_eq!(config.rewards.total_supply, 10_000_000.0);
  }

  #[test]
  fn sweep_interval_is_half_the_shortest_timeout() {
    let config = Config::default();
    assert_eq!(config.sweep_interval().as_millis(), 1500);
  }

  #[test]
  fn roundtrips_through_json() {
    let config = Config::default();
    let json = serde_json::to_string(&config).unwrap();
    let back: Config = serde_json::from_str(&json).unwrap();
    assert_eq!(back.consensus_min, config.consensus_min);
    assert_eq!(back.regular_timeout, config.regular_timeout);
  }
}
