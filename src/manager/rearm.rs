//! Wildcard rearm scheduling and idle-latch detection.
//!
//! Some driver/stick combinations latch onto already-tracked device numbers
//! and stop reporting anyone new on the wildcard. The counter here watches
//! for that signature (the same fully-dedicated set seen over and over) and
//! schedules a rearm, throttled hard enough that a genuinely settled session
//! does not thrash the scanner.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ManagerConfig;

/// Rolling window for the idle-latch rearm rate limit.
const IDLE_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Why a wildcard rearm was requested (for logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RearmReason {
    Promoted,
    IdleLatch,
}

impl fmt::Display for RearmReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RearmReason::Promoted => write!(f, "promoted"),
            RearmReason::IdleLatch => write!(f, "idle-latch"),
        }
    }
}

/// Rearm request state plus the anti-thrashing bookkeeping around it.
pub struct RearmState {
    backoff: Duration,
    ignore_after_rearm: Duration,
    idle_latch_threshold: u32,
    idle_grace: Duration,
    max_idle_per_window: usize,

    pending: Option<RearmReason>,
    last_rearm: Option<Instant>,
    ignore_until: Option<Instant>,

    idle_hits: u32,
    last_idle_set: BTreeSet<u16>,
    last_new_device: Option<Instant>,
    idle_rearm_times: VecDeque<Instant>,
}

impl RearmState {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            backoff: config.rearm_backoff(),
            ignore_after_rearm: config.ignore_after_rearm(),
            idle_latch_threshold: config.idle_latch_threshold,
            idle_grace: config.idle_grace(),
            max_idle_per_window: config.max_idle_rearms_per_minute,
            pending: None,
            last_rearm: None,
            ignore_until: None,
            idle_hits: 0,
            last_idle_set: BTreeSet::new(),
            last_new_device: None,
            idle_rearm_times: VecDeque::new(),
        }
    }

    pub fn pending(&self) -> Option<RearmReason> {
        self.pending
    }

    /// Whether a wildcard sighting of an already-dedicated device should be
    /// discarded because the scanner was rearmed moments ago.
    pub fn in_ignore_window(&self, now: Instant) -> bool {
        self.ignore_until.is_some_and(|until| now < until)
    }

    /// A device without a dedicated channel was heard on the wildcard:
    /// restart the idle-latch hysteresis and the grace period.
    pub fn note_new_device(&mut self, now: Instant) {
        self.last_new_device = Some(now);
        self.reset_idle_latch();
    }

    pub fn reset_idle_latch(&mut self) {
        self.idle_hits = 0;
        self.last_idle_set.clear();
    }

    /// Request a rearm. Returns true if newly scheduled; absorbed when one is
    /// already pending or the backoff has not elapsed.
    pub fn request(&mut self, reason: RearmReason, now: Instant) -> bool {
        if self.pending.is_some() {
            return false;
        }
        if !self.backoff_elapsed(now) {
            return false;
        }
        self.pending = Some(reason);
        true
    }

    /// The wildcard heard an already-dedicated device: update the latch
    /// counter against the current dedicated set and, past the threshold,
    /// try to schedule an idle-latch rearm. Returns true if one was scheduled.
    pub fn observe_dedicated(&mut self, dedicated: &BTreeSet<u16>, now: Instant) -> bool {
        if *dedicated == self.last_idle_set {
            self.idle_hits += 1;
        } else {
            self.idle_hits = 1;
            self.last_idle_set = dedicated.clone();
        }

        if self.idle_hits < self.idle_latch_threshold {
            return false;
        }
        if !self.backoff_elapsed(now) {
            return false;
        }
        if self.within_grace(now) {
            return false;
        }
        if !self.idle_budget_available(now) {
            return false;
        }

        if self.request(RearmReason::IdleLatch, now) {
            self.idle_rearm_times.push_back(now);
            // drop back to 1 rather than 0: bursts should not re-trigger
            // immediately, but the latch suspicion is not fully cleared either
            self.idle_hits = 1;
            true
        } else {
            false
        }
    }

    /// Hand the pending request to the reaper once the backoff allows it.
    pub fn take_due(&mut self, now: Instant) -> Option<RearmReason> {
        if self.backoff_elapsed(now) {
            self.pending.take()
        } else {
            None
        }
    }

    /// Record a completed rearm and arm the post-rearm ignore window.
    pub fn mark_rearmed(&mut self, now: Instant) {
        self.last_rearm = Some(now);
        self.ignore_until = Some(now + self.ignore_after_rearm);
    }

    fn backoff_elapsed(&self, now: Instant) -> bool {
        self.last_rearm
            .map_or(true, |last| now.duration_since(last) >= self.backoff)
    }

    fn within_grace(&self, now: Instant) -> bool {
        self.last_new_device
            .is_some_and(|seen| now.duration_since(seen) < self.idle_grace)
    }

    fn idle_budget_available(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.idle_rearm_times.front() {
            if now.duration_since(front) >= IDLE_RATE_WINDOW {
                self.idle_rearm_times.pop_front();
            } else {
                break;
            }
        }
        self.idle_rearm_times.len() < self.max_idle_per_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;

    fn state() -> RearmState {
        RearmState::new(&ManagerConfig::default())
    }

    fn dedicated(ids: &[u16]) -> BTreeSet<u16> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_second_request_within_backoff_is_absorbed() {
        let mut s = state();
        let now = Instant::now();
        assert!(s.request(RearmReason::Promoted, now));
        // pending flag already set
        assert!(!s.request(RearmReason::Promoted, now));
        assert_eq!(s.pending(), Some(RearmReason::Promoted));
    }

    #[test]
    fn test_backoff_blocks_request_after_rearm() {
        let mut s = state();
        let now = Instant::now();
        s.mark_rearmed(now);
        assert!(!s.request(RearmReason::Promoted, now + Duration::from_millis(500)));
        assert!(s.request(RearmReason::Promoted, now + Duration::from_millis(1300)));
    }

    #[test]
    fn test_take_due_respects_backoff() {
        let mut s = state();
        let now = Instant::now();
        s.mark_rearmed(now);
        // a request made later stays parked until the backoff elapses
        assert!(s.request(RearmReason::Promoted, now + Duration::from_secs(2)));
        s.mark_rearmed(now + Duration::from_secs(2));
        assert_eq!(s.take_due(now + Duration::from_millis(2500)), None);
        assert_eq!(
            s.take_due(now + Duration::from_millis(3300)),
            Some(RearmReason::Promoted)
        );
        assert_eq!(s.pending(), None);
    }

    #[test]
    fn test_idle_latch_threshold_schedules_one_rearm() {
        let mut s = state();
        let set = dedicated(&[100, 200]);
        let t0 = Instant::now() + Duration::from_secs(60); // outside any grace
        assert!(!s.observe_dedicated(&set, t0));
        assert!(!s.observe_dedicated(&set, t0 + Duration::from_millis(100)));
        assert!(s.observe_dedicated(&set, t0 + Duration::from_millis(200)));
        assert_eq!(s.pending(), Some(RearmReason::IdleLatch));
        // counter dropped to 1, so the very next sighting does not re-trigger
        assert!(!s.observe_dedicated(&set, t0 + Duration::from_millis(300)));
    }

    #[test]
    fn test_new_device_resets_idle_latch() {
        let mut s = state();
        let set = dedicated(&[100]);
        let t0 = Instant::now() + Duration::from_secs(60);
        s.observe_dedicated(&set, t0);
        s.observe_dedicated(&set, t0 + Duration::from_millis(100));
        s.note_new_device(t0 + Duration::from_millis(200));
        // counter restarted: two more sightings are not enough
        assert!(!s.observe_dedicated(&set, t0 + Duration::from_secs(10)));
        assert!(!s.observe_dedicated(&set, t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_changed_dedicated_set_restarts_counter() {
        let mut s = state();
        let t0 = Instant::now() + Duration::from_secs(60);
        s.observe_dedicated(&dedicated(&[100]), t0);
        s.observe_dedicated(&dedicated(&[100]), t0 + Duration::from_millis(100));
        // the set changed, so the streak starts over
        assert!(!s.observe_dedicated(&dedicated(&[100, 200]), t0 + Duration::from_millis(200)));
        assert!(!s.observe_dedicated(&dedicated(&[100, 200]), t0 + Duration::from_millis(300)));
        assert!(s.observe_dedicated(&dedicated(&[100, 200]), t0 + Duration::from_millis(400)));
    }

    #[test]
    fn test_grace_period_blocks_idle_rearm() {
        let mut s = state();
        let set = dedicated(&[100]);
        let t0 = Instant::now();
        s.note_new_device(t0);
        assert!(!s.observe_dedicated(&set, t0 + Duration::from_secs(1)));
        assert!(!s.observe_dedicated(&set, t0 + Duration::from_secs(2)));
        // threshold reached but still inside the 5 s grace
        assert!(!s.observe_dedicated(&set, t0 + Duration::from_secs(3)));
        // past the grace the next threshold crossing goes through
        assert!(s.observe_dedicated(&set, t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_idle_rearms_are_rate_limited() {
        let mut s = state();
        let set = dedicated(&[100]);
        let t0 = Instant::now() + Duration::from_secs(120);
        let mut scheduled = 0;

        // keep crossing the threshold every ~2 s; each scheduled rearm is
        // executed right away so pending/backoff never get in the way
        let mut t = t0;
        for _ in 0..10 {
            for _ in 0..3 {
                if s.observe_dedicated(&set, t) {
                    scheduled += 1;
                    s.take_due(t);
                    s.mark_rearmed(t);
                }
                t += Duration::from_millis(600);
            }
        }

        // 18 s of persistent latching: the per-minute budget caps executions
        assert_eq!(scheduled, ManagerConfig::default().max_idle_rearms_per_minute);
    }

    #[test]
    fn test_ignore_window_follows_rearm() {
        let mut s = state();
        let now = Instant::now();
        assert!(!s.in_ignore_window(now));
        s.mark_rearmed(now);
        assert!(s.in_ignore_window(now + Duration::from_millis(500)));
        assert!(!s.in_ignore_window(now + Duration::from_millis(1000)));
    }
}
