//! Per-observer observation memory.
//!
//! Two bounded stores back the voting and sampling decisions: the
//! knowledge base answers "did I see this route recently" for vote
//! casting, and the last-seen table collapses benign repeats of the
//! same route into a single proposed transaction per window.

use {
  crate::primitives::Asn,
  ipnet::IpNet,
  serde::Serialize,
  std::collections::{HashMap, VecDeque},
};

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeEntry {
  pub prefix: IpNet,
  pub origin: Asn,
  pub observed_at: f64,
}

/// Sliding-window store of everything one node observed.
///
/// Entries expire `window` logical seconds after they were observed
/// and the store never holds more than `max` entries, dropping the
/// oldest first. Lookups match on (prefix, origin) regardless of
/// AS path.
#[derive(Debug)]
pub struct KnowledgeBase {
  window: f64,
  max: usize,
  entries: VecDeque<KnowledgeEntry>,
  latest: HashMap<(IpNet, Asn), f64>,
  evicted: u64,
}

impl KnowledgeBase {
  pub fn new(window: f64, max: usize) -> Self {
    Self {
      window,
      max,
      entries: VecDeque::new(),
      latest: HashMap::new(),
      evicted: 0,
    }
  }

  pub fn insert(&mut self, prefix: IpNet, origin: Asn, observed_at: f64) {
    self.expire(observed_at);
    self.entries.push_back(KnowledgeEntry {
      prefix,
      origin,
      observed_at,
    });
    let latest = self.latest.entry((prefix, origin)).or_insert(observed_at);
    if *latest < observed_at {
      *latest = observed_at;
    }
    while self.entries.len() > self.max {
      self.pop_oldest();
    }
  }

  /// True when some entry for (prefix, origin) lies within the
  /// knowledge window of `at`.
  pub fn knows(&self, prefix: &IpNet, origin: Asn, at: f64) -> bool {
    self
      .latest
      .get(&(*prefix, origin))
      .map(|&seen| (at - seen).abs() <= self.window)
      .unwrap_or(false)
  }

  /// Drops entries older than the window. Runs on every insert and
  /// from the node's low-frequency cleanup sweep.
  pub fn expire(&mut self, now: f64) {
    let horizon = now - self.window;
    while self
      .entries
      .front()
      .map(|e| e.observed_at < horizon)
      .unwrap_or(false)
    {
      self.pop_oldest();
    }
  }

  fn pop_oldest(&mut self) {
    if let Some(entry) = self.entries.pop_front() {
      self.evicted += 1;
      let key = (entry.prefix, entry.origin);
      if self.latest.get(&key) == Some(&entry.observed_at) {
        self.latest.remove(&key);
      }
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn evicted(&self) -> u64 {
    self.evicted
  }
}

/// Whether a processed observation proceeds to a proposal or is
/// collapsed by the sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
  Proceed,
  Skip,
}

/// Counters the dedup statistic outputs are derived from.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DedupStats {
  pub processed: u64,
  pub skipped: u64,
  pub attack_bypasses: u64,
}

/// Last time each (prefix, origin) was processed by this node.
///
/// Benign repeats inside the window are skipped; attack-classified
/// observations always pass through. Every processed observation,
/// skipped or not, refreshes the window.
#[derive(Debug)]
pub struct LastSeenTable {
  window: f64,
  max: usize,
  seen: HashMap<(IpNet, Asn), f64>,
  log: VecDeque<((IpNet, Asn), f64)>,
  stats: DedupStats,
}

impl LastSeenTable {
  pub fn new(window: f64, max: usize) -> Self {
    Self {
      window,
      max,
      seen: HashMap::new(),
      log: VecDeque::new(),
      stats: DedupStats::default(),
    }
  }

  pub fn check(
    &mut self,
    prefix: IpNet,
    origin: Asn,
    at: f64,
    attack: bool,
  ) -> DedupDecision {
    let key = (prefix, origin);
    let recent = self
      .seen
      .get(&key)
      .map(|&seen| at - seen < self.window)
      .unwrap_or(false);

    self.seen.insert(key, at);
    self.log.push_back((key, at));
    self.trim();

    self.stats.processed += 1;
    if attack {
      if recent {
        self.stats.attack_bypasses += 1;
      }
      return DedupDecision::Proceed;
    }
    if recent {
      self.stats.skipped += 1;
      DedupDecision::Skip
    } else {
      DedupDecision::Proceed
    }
  }

  // lazy eviction: drop log entries whose map slot has been
  // refreshed since, then trim the oldest keys over the cap
  fn trim(&mut self) {
    while self.seen.len() > self.max {
      match self.log.pop_front() {
        Some((key, at)) => {
          if self.seen.get(&key) == Some(&at) {
            self.seen.remove(&key);
          }
        }
        None => break,
      }
    }
  }

  pub fn stats(&self) -> DedupStats {
    self.stats
  }

  pub fn len(&self) -> usize {
    self.seen.len()
  }

  pub fn is_empty(&self) -> bool {
    self.seen.is_empty()
  }
}

#[cfg(test)]
mod test {
  use {
    super::{DedupDecision, KnowledgeBase, LastSeenTable},
    crate::primitives::Asn,
    ipnet::IpNet,
  };

  fn prefix(s: &str) -> IpNet {
    s.parse().unwrap()
  }

  #[test]
  fn knowledge_expires_with_the_window() {
    let mut kb = KnowledgeBase::new(480.0, 100);
    kb.insert(prefix("10.0.0.0/24"), Asn(100), 0.0);
    assert!(kb.knows(&prefix("10.0.0.0/24"), Asn(100), 100.0));
    assert!(!kb.knows(&prefix("10.0.0.0/24"), Asn(100), 481.0));

    kb.expire(1000.0);
    assert!(kb.is_empty());
    assert_eq!(kb.evicted(), 1);
  }

  #[test]
  fn knowledge_matches_origin_not_path() {
    let mut kb = KnowledgeBase::new(480.0, 100);
    kb.insert(prefix("10.0.0.0/24"), Asn(100), 0.0);
    assert!(!kb.knows(&prefix("10.0.0.0/24"), Asn(200), 0.0));
    assert!(!kb.knows(&prefix("10.0.1.0/24"), Asn(100), 0.0));
  }

  #[test]
  fn knowledge_capacity_evicts_oldest() {
    let mut kb = KnowledgeBase::new(1e9, 3);
    for i in 0..5 {
      kb.insert(prefix(&format!("10.0.{i}.0/24")), Asn(100), i as f64);
    }
    assert_eq!(kb.len(), 3);
    assert!(!kb.knows(&prefix("10.0.0.0/24"), Asn(100), 4.0));
    assert!(kb.knows(&prefix("10.0.4.0/24"), Asn(100), 4.0));
  }

  #[test]
  fn benign_repeats_skip_inside_the_window() {
    let mut table = LastSeenTable::new(300.0, 100);
    let p = prefix("10.0.0.0/24");
    assert_eq!(table.check(p, Asn(100), 0.0, false), DedupDecision::Proceed);
    assert_eq!(table.check(p, Asn(100), 30.0, false), DedupDecision::Skip);
    assert_eq!(table.check(p, Asn(100), 60.0, false), DedupDecision::Skip);
    assert_eq!(table.stats().skipped, 2);
  }

  #[test]
  fn skips_refresh_the_window() {
    let mut table = LastSeenTable::new(100.0, 100);
    let p = prefix("10.0.0.0/24");
    table.check(p, Asn(100), 0.0, false);
    // each repeat refreshes last-seen, so the route never ages out
    assert_eq!(table.check(p, Asn(100), 90.0, false), DedupDecision::Skip);
    assert_eq!(table.check(p, Asn(100), 180.0, false), DedupDecision::Skip);
    // only a gap longer than the window re-opens proposals
    assert_eq!(
      table.check(p, Asn(100), 300.0, false),
      DedupDecision::Proceed
    );
  }

  #[test]
  fn attacks_always_proceed() {
    let mut table = LastSeenTable::new(300.0, 100);
    let p = prefix("10.0.0.0/24");
    table.check(p, Asn(100), 0.0, false);
    assert_eq!(table.check(p, Asn(100), 1.0, true), DedupDecision::Proceed);
    assert_eq!(table.stats().attack_bypasses, 1);
  }

  #[test]
  fn capacity_evicts_oldest_routes() {
    let mut table = LastSeenTable::new(1e9, 2);
    table.check(prefix("10.0.0.0/24"), Asn(1), 0.0, false);
    table.check(prefix("10.0.1.0/24"), Asn(1), 1.0, false);
    table.check(prefix("10.0.2.0/24"), Asn(1), 2.0, false);
    assert_eq!(table.len(), 2);
    // the evicted route proposes again despite the huge window
    assert_eq!(
      table.check(prefix("10.0.0.0/24"), Asn(1), 3.0, false),
      DedupDecision::Proceed
    );
  }
}
