//! Debounced owner presence.
//!
//! Absence is accumulated only over intervals covered by observations. A
//! silent period longer than the sensor gap is inconclusive and does not
//! count, so a stalled camera never dims the display on its own.

use crate::types::{FrameObservation, Timestamp};
use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub absence_delay: Duration,
    pub sensor_gap: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            absence_delay: Duration::seconds(10),
            sensor_gap: Duration::milliseconds(2000),
        }
    }
}

/// Read-only snapshot handed to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub present: bool,
    pub last_seen_at: Option<Timestamp>,
    pub last_absent_at: Option<Timestamp>,
}

impl Default for PresenceState {
    fn default() -> Self {
        Self {
            present: true,
            last_seen_at: None,
            last_absent_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    None,
    /// Owner has been unseen for the full absence delay.
    Departed,
    Returned,
}

pub struct PresenceTracker {
    config: PresenceConfig,
    state: PresenceState,
    absent_for: Duration,
    last_observation_at: Option<Timestamp>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            state: PresenceState::default(),
            absent_for: Duration::zero(),
            last_observation_at: None,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn absent_for(&self) -> Duration {
        self.absent_for
    }

    pub fn set_absence_delay(&mut self, delay: Duration) {
        self.config.absence_delay = delay;
    }

    pub fn observe(&mut self, obs: &FrameObservation) -> PresenceChange {
        let now = obs.timestamp;
        let elapsed = self.last_observation_at.map(|prev| now - prev);
        self.last_observation_at = Some(now);

        if obs.owner_matched {
            self.absent_for = Duration::zero();
            self.state.last_seen_at = Some(now);
            if !self.state.present {
                self.state.present = true;
                return PresenceChange::Returned;
            }
            return PresenceChange::None;
        }

        match elapsed {
            Some(dt) if dt > self.config.sensor_gap => {
                tracing::debug!(gap_ms = dt.num_milliseconds(), "sensor gap; interval not counted as absence");
            }
            Some(dt) if dt > Duration::zero() => self.absent_for = self.absent_for + dt,
            _ => {}
        }

        if self.state.present && self.absent_for >= self.config.absence_delay {
            self.state.present = false;
            self.state.last_absent_at = Some(now);
            tracing::debug!(absent_ms = self.absent_for.num_milliseconds(), "owner absent");
            return PresenceChange::Departed;
        }
        PresenceChange::None
    }

    /// Treat the owner as present from `now`; used on manual restore and resume.
    pub fn reset(&mut self, now: Timestamp) {
        self.state.present = true;
        self.state.last_seen_at = Some(now);
        self.absent_for = Duration::zero();
        self.last_observation_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(ms: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn run_empty(p: &mut PresenceTracker, from_ms: i64, to_ms: i64, step: i64) -> Vec<(i64, PresenceChange)> {
        (from_ms..=to_ms)
            .step_by(step as usize)
            .map(|ms| (ms, p.observe(&FrameObservation::empty(at(ms)))))
            .filter(|(_, c)| *c != PresenceChange::None)
            .collect()
    }

    #[test]
    fn test_departs_after_absence_delay() {
        let mut p = PresenceTracker::new(PresenceConfig::default());
        assert_eq!(p.observe(&FrameObservation::owner(at(0))), PresenceChange::None);
        let changes = run_empty(&mut p, 100, 12_000, 100);
        assert_eq!(changes, vec![(10_000, PresenceChange::Departed)]);
        assert!(!p.state().present);
        assert_eq!(p.state().last_absent_at, Some(at(10_000)));
    }

    #[test]
    fn test_owner_returns_immediately() {
        let mut p = PresenceTracker::new(PresenceConfig::default());
        p.observe(&FrameObservation::owner(at(0)));
        run_empty(&mut p, 100, 11_000, 100);
        assert_eq!(p.observe(&FrameObservation::owner(at(11_100))), PresenceChange::Returned);
        assert!(p.state().present);
        assert_eq!(p.absent_for(), Duration::zero());
        assert_eq!(p.state().last_seen_at, Some(at(11_100)));
    }

    #[test]
    fn test_sensor_gap_is_inconclusive() {
        let mut p = PresenceTracker::new(PresenceConfig::default());
        p.observe(&FrameObservation::owner(at(0)));
        p.observe(&FrameObservation::empty(at(1000)));
        // Thirty silent seconds, then one empty frame.
        assert_eq!(p.observe(&FrameObservation::empty(at(31_000))), PresenceChange::None);
        assert!(p.state().present);
        assert_eq!(p.absent_for(), Duration::seconds(1));
    }

    #[test]
    fn test_unknown_face_counts_as_owner_absent() {
        let mut p = PresenceTracker::new(PresenceConfig::default());
        p.observe(&FrameObservation::owner(at(0)));
        let changes: Vec<_> = (1..=100)
            .map(|i| p.observe(&FrameObservation::unknown(at(i * 100))))
            .filter(|c| *c != PresenceChange::None)
            .collect();
        assert_eq!(changes, vec![PresenceChange::Departed]);
    }

    #[test]
    fn test_reset_and_shorter_delay() {
        let mut p = PresenceTracker::new(PresenceConfig::default());
        p.observe(&FrameObservation::owner(at(0)));
        run_empty(&mut p, 100, 5000, 100);
        p.reset(at(5000));
        assert_eq!(p.absent_for(), Duration::zero());

        p.set_absence_delay(Duration::seconds(2));
        let changes = run_empty(&mut p, 5100, 8000, 100);
        // First frame after reset starts the clock; two seconds later it fires.
        assert_eq!(changes, vec![(7100, PresenceChange::Departed)]);
    }
}
