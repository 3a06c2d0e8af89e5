//! Stochastic firing of effect cues.
//!
//! Each effect is a discretized Poisson process: with `occurrence` expected
//! firings per `basetime` seconds, a tick of `dt` seconds fires with
//! probability `occurrence * dt / basetime`.

use rand::Rng;

use crate::catalog::Theme;

/// Per-tick probabilities above this make the discretization too coarse.
pub const MAX_TICK_PROBABILITY: f64 = 0.1;

pub fn tick_probability(occurrence: f64, basetime: u32, dt: f64) -> f64 {
    if basetime == 0 {
        return 0.0;
    }
    (occurrence * dt / basetime as f64).clamp(0.0, 1.0)
}

/// One uniform draw against `p`.
pub fn should_fire<R: Rng + ?Sized>(rng: &mut R, p: f64) -> bool {
    p > 0.0 && rng.random::<f64>() < p
}

#[derive(Debug, Clone)]
struct EffectSlot {
    probability: f64,
    looped: bool,
    disabled: bool,
}

/// Trigger state for one active theme.
#[derive(Debug)]
pub struct TriggerEngine {
    effects: Vec<EffectSlot>,
}

impl TriggerEngine {
    pub fn new(theme: &Theme, dt: f64) -> Self {
        let effects = theme
            .effects
            .iter()
            .map(|cue| EffectSlot {
                probability: tick_probability(cue.occurrence, theme.basetime, dt),
                looped: cue.looped,
                disabled: false,
            })
            .collect();
        Self { effects }
    }

    /// Indices of the effects that fire this tick. Loop and disabled cues
    /// never draw.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        self.effects
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.looped && !e.disabled)
            .filter(|(_, e)| should_fire(rng, e.probability))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Loop cues that are still enabled.
    pub fn looped(&self) -> Vec<usize> {
        self.effects
            .iter()
            .enumerate()
            .filter(|(_, e)| e.looped && !e.disabled)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn disable(&mut self, index: usize) {
        if let Some(e) = self.effects.get_mut(index) {
            e.disabled = true;
        }
    }

    pub fn is_disabled(&self, index: usize) -> bool {
        self.effects.get(index).map_or(true, |e| e.disabled)
    }

    pub fn probability(&self, index: usize) -> Option<f64> {
        self.effects.get(index).map(|e| e.probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EffectCue;
    use crate::models::MediaFile;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn theme() -> Theme {
        let file = || vec![MediaFile::new("x.wav")];
        Theme::new('f', "Forest")
            .with_basetime(3600)
            .effect(EffectCue::new("owl", file()).with_occurrence(360.0))
            .effect(EffectCue::new("wind", file()).looped())
            .effect(EffectCue::new("never", file()).with_occurrence(0.0))
    }

    #[test]
    fn probability_formula() {
        assert!((tick_probability(120.0, 3600, 1.0) - 1.0 / 30.0).abs() < 1e-12);
        assert!((tick_probability(1.0, 60, 0.25) - 0.25 / 60.0).abs() < 1e-12);
        assert_eq!(tick_probability(0.0, 3600, 1.0), 0.0);
    }

    #[test]
    fn should_fire_edges() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1000 {
            assert!(!should_fire(&mut rng, 0.0));
            assert!(should_fire(&mut rng, 1.0));
        }
    }

    #[test]
    fn sample_skips_loops_and_disabled() {
        let mut engine = TriggerEngine::new(&theme(), 0.5);
        assert_eq!(engine.looped(), vec![1]);
        assert!((engine.probability(0).unwrap() - 0.05).abs() < 1e-12);

        let mut rng = StdRng::seed_from_u64(42);
        let mut fired = 0;
        for _ in 0..2000 {
            let hits = engine.sample(&mut rng);
            assert!(hits.iter().all(|i| *i == 0));
            fired += hits.len();
        }
        assert!(fired > 0);

        engine.disable(0);
        engine.disable(1);
        assert!(engine.is_disabled(0));
        assert!(engine.looped().is_empty());
        for _ in 0..200 {
            assert!(engine.sample(&mut rng).is_empty());
        }
    }

    #[test]
    fn rate_converges() {
        let mut rng = StdRng::seed_from_u64(7);
        let p = tick_probability(360.0, 3600, 0.5);
        let n = 20_000;
        let hits = (0..n).filter(|_| should_fire(&mut rng, p)).count();
        // Expected 1000, sd ~31.
        assert!((900..=1100).contains(&hits), "hits = {hits}");
    }
}
