//! Per-cue cooldowns against the scheduler clock.

use std::collections::HashMap;

use crate::catalog::CueId;

#[derive(Debug, Default)]
pub struct CooldownTracker {
    ready_at: HashMap<CueId, f64>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a start at `now`. Negative cooldowns record nothing.
    pub fn start(&mut self, cue: CueId, now: f64, cooldown: f64) {
        if cooldown >= 0.0 {
            self.ready_at.insert(cue, now + cooldown);
        }
    }

    pub fn is_eligible(&self, cue: CueId, now: f64) -> bool {
        self.ready_at.get(&cue).map_or(true, |t| now >= *t)
    }

    pub fn clear(&mut self) {
        self.ready_at.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWL: CueId = CueId::Effect { theme: 'f', index: 0 };
    const WOLF: CueId = CueId::Effect { theme: 'f', index: 1 };

    #[test]
    fn eligible_until_started() {
        let mut tracker = CooldownTracker::new();
        assert!(tracker.is_eligible(OWL, 0.0));

        tracker.start(OWL, 10.0, 5.0);
        assert!(!tracker.is_eligible(OWL, 10.0));
        assert!(!tracker.is_eligible(OWL, 14.99));
        assert!(tracker.is_eligible(OWL, 15.0));
        assert!(tracker.is_eligible(WOLF, 10.0));
    }

    #[test]
    fn negative_cooldown_is_ignored() {
        let mut tracker = CooldownTracker::new();
        tracker.start(OWL, 10.0, -1.0);
        assert!(tracker.is_eligible(OWL, 10.0));
    }

    #[test]
    fn zero_cooldown_allows_next_tick() {
        let mut tracker = CooldownTracker::new();
        tracker.start(OWL, 3.0, 0.0);
        assert!(tracker.is_eligible(OWL, 3.0));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut tracker = CooldownTracker::new();
        tracker.start(OWL, 0.0, 100.0);
        tracker.start(WOLF, 0.0, 100.0);
        tracker.clear();
        assert!(tracker.is_eligible(OWL, 1.0));
        assert!(tracker.is_eligible(WOLF, 1.0));
    }
}
