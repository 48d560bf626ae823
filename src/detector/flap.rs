use {
  crate::{
    observation::{AnnouncementType, Observation},
    primitives::Asn,
  },
  ipnet::IpNet,
  std::collections::{HashMap, VecDeque},
};

// hard cap on remembered transitions per route, well above any
// sane threshold
const RING_MAX: usize = 128;

#[derive(Debug)]
struct FlapState {
  last_type: AnnouncementType,
  last_event: Option<f64>,
  transitions: VecDeque<f64>,
}

/// Per-route announce/withdraw transition history.
///
/// A transition is a flip between announce and withdraw for the same
/// (prefix, origin). Flips closer together than the dedup interval
/// collapse into one event; events older than the window fall off.
#[derive(Debug)]
pub struct FlapTracker {
  window: f64,
  dedup: f64,
  states: HashMap<(IpNet, Asn), FlapState>,
}

impl FlapTracker {
  pub fn new(window: f64, dedup: f64) -> Self {
    Self {
      window,
      dedup,
      states: HashMap::new(),
    }
  }

  /// Records the observation and returns how many distinct
  /// transitions the route has accumulated inside the window.
  pub fn record(&mut self, observation: &Observation) -> usize {
    let key = (observation.prefix, observation.origin);
    let now = observation.timestamp;

    let state = self.states.entry(key).or_insert_with(|| FlapState {
      last_type: observation.announcement,
      last_event: None,
      transitions: VecDeque::new(),
    });

    if state.last_type != observation.announcement {
      state.last_type = observation.announcement;
      let collapsed = state
        .last_event
        .map(|at| now - at < self.dedup)
        .unwrap_or(false);
      if !collapsed {
        state.last_event = Some(now);
        state.transitions.push_back(now);
        if state.transitions.len() > RING_MAX {
          state.transitions.pop_front();
        }
      }
    }

    let horizon = now - self.window;
    while state
      .transitions
      .front()
      .map(|&t| t < horizon)
      .unwrap_or(false)
    {
      state.transitions.pop_front();
    }

    state.transitions.len()
  }

  /// Transition timestamps currently inside the window for a route,
  /// carried as evidence in attack verdict proposals.
  pub fn evidence(&self, prefix: &IpNet, origin: Asn) -> Vec<f64> {
    self
      .states
      .get(&(*prefix, origin))
      .map(|s| s.transitions.iter().copied().collect())
      .unwrap_or_default()
  }

  /// Validates a carried transition list against the flap rule the
  /// way a peer without local history adjudicates a flapping claim.
  pub fn evidence_holds(
    evidence: &[f64],
    window: f64,
    dedup: f64,
    threshold: usize,
  ) -> bool {
    if evidence.is_empty() {
      return false;
    }
    let mut sorted = evidence.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let last = *sorted.last().unwrap();

    let mut count = 0usize;
    let mut previous: Option<f64> = None;
    for &at in sorted.iter().filter(|&&t| last - t <= window) {
      if previous.map(|p| at - p < dedup).unwrap_or(false) {
        continue;
      }
      previous = Some(at);
      count += 1;
    }
    count >= threshold
  }
}

#[cfg(test)]
mod test {
  use {
    super::FlapTracker,
    crate::{
      observation::{AnnouncementType, Observation},
      primitives::Asn,
    },
  };

  fn obs(timestamp: f64, announcement: AnnouncementType) -> Observation {
    Observation {
      timestamp,
      prefix: "11.0.0.0/24".parse().unwrap(),
      origin: Asn(200),
      as_path: vec![Asn(200)],
      source: Asn(1),
      announcement,
      scenario_id: None,
    }
  }

  #[test]
  fn alternating_stream_counts_deduped_transitions() {
    let mut tracker = FlapTracker::new(60.0, 2.0);
    let mut counts = vec![];
    for t in 0..=10 {
      let kind = if t % 2 == 0 {
        AnnouncementType::Announce
      } else {
        AnnouncementType::Withdraw
      };
      counts.push(tracker.record(&obs(t as f64, kind)));
    }
    // transitions at t=1..10, but the 2s dedup keeps only 1,3,5,7,9
    assert_eq!(counts[10], 5);
  }

  #[test]
  fn repeated_announce_is_not_a_transition() {
    let mut tracker = FlapTracker::new(60.0, 2.0);
    for t in 0..10 {
      let count =
        tracker.record(&obs(t as f64, AnnouncementType::Announce));
      assert_eq!(count, 0);
    }
  }

  #[test]
  fn transitions_fall_out_of_the_window() {
    let mut tracker = FlapTracker::new(10.0, 0.0);
    tracker.record(&obs(0.0, AnnouncementType::Announce));
    tracker.record(&obs(1.0, AnnouncementType::Withdraw));
    tracker.record(&obs(2.0, AnnouncementType::Announce));
    let count = tracker.record(&obs(20.0, AnnouncementType::Withdraw));
    assert_eq!(count, 1); // only the t=20 transition survives
  }

  #[test]
  fn evidence_rule_matches_local_counting() {
    let evidence = vec![1.0, 3.0, 5.0, 7.0, 9.0];
    assert!(FlapTracker::evidence_holds(&evidence, 60.0, 2.0, 5));
    assert!(!FlapTracker::evidence_holds(&evidence, 60.0, 2.0, 6));

    // collapsed by dedup: effective events 1,3
    let bursty = vec![1.0, 1.5, 2.0, 2.5, 3.0];
    assert!(!FlapTracker::evidence_holds(&bursty, 60.0, 2.0, 3));
  }
}
