//! Running intensity statistics over the slices seen so far.

use crate::election::FrequencyTable;

/// Sentinel range, assuming at most 16-bit samples.
const MAX_16: f64 = 65536.0;

/// Snapshot of the derived intensity state, stored on the volume.
#[derive(Clone, Debug)]
pub struct IntensityStats {
    pub min: f64,
    pub max: f64,
    /// Representative (window, level) elected from the per-slice hints.
    pub preset: Option<(f64, f64)>,
    /// True when any slice declared an inverse photometric interpretation
    /// (MONOCHROME1), so low samples render bright.
    pub inverted: bool,
}

impl IntensityStats {
    /// True once at least one slice contributed its extrema.
    pub fn has_range(&self) -> bool {
        self.min <= self.max
    }

    /// Window/level spanning the full observed dynamic range.
    pub fn full_dynamic_preset(&self) -> Option<(f64, f64)> {
        if !self.has_range() {
            return None;
        }
        let width = self.max - self.min;
        Some((width, self.min + width / 2.0))
    }
}

impl Default for IntensityStats {
    fn default() -> Self {
        IntensityStats {
            min: MAX_16,
            max: -MAX_16,
            preset: None,
            inverted: false,
        }
    }
}

/// Tracks global extrema and elects a representative window/level preset
/// from the per-slice hints.
#[derive(Debug, Default)]
pub struct IntensityStatsAccumulator {
    stats: IntensityStats,
    windows: FrequencyTable,
    levels: FrequencyTable,
}

impl IntensityStatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Narrow the running range. Argument order does not matter.
    pub fn observe_extrema(&mut self, slice_min: f64, slice_max: f64) {
        let low = slice_min.min(slice_max);
        let high = slice_min.max(slice_max);
        if low < self.stats.min {
            self.stats.min = low;
        }
        if high > self.stats.max {
            self.stats.max = high;
        }
    }

    /// Latch the inverse-photometric flag; once any slice declares it, the
    /// whole volume renders inverted.
    pub fn observe_photometric(&mut self, inverse: bool) {
        self.stats.inverted |= inverse;
    }

    /// Record window/level hint candidates from one slice.
    pub fn observe_window_level(&mut self, windows: &[f64], levels: &[f64]) {
        for window in windows {
            self.windows.record(*window as i64);
        }
        for level in levels {
            self.levels.record(*level as i64);
        }
    }

    /// Per-axis plurality over all recorded candidates, ties broken by the
    /// rounded mean of the tied values. `None` until any hint was seen.
    pub fn elect(&self) -> Option<(f64, f64)> {
        let window = self.windows.elect()?;
        let level = self.levels.elect()?;
        Some((window as f64, level as f64))
    }

    pub fn snapshot(&self) -> IntensityStats {
        IntensityStats {
            preset: self.elect(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extrema_narrow_monotonically() {
        let mut stats = IntensityStatsAccumulator::new();
        assert!(!stats.snapshot().has_range());

        stats.observe_extrema(-100.0, 300.0);
        stats.observe_extrema(0.0, 200.0);
        stats.observe_extrema(250.0, -120.0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.min, -120.0);
        assert_eq!(snapshot.max, 300.0);
    }

    #[test]
    fn full_dynamic_preset_spans_the_range() {
        let mut stats = IntensityStatsAccumulator::new();
        stats.observe_extrema(-1000.0, 3000.0);
        assert_eq!(stats.snapshot().full_dynamic_preset(), Some((4000.0, 1000.0)));
    }

    #[test]
    fn majority_vote_is_deterministic() {
        let mut stats = IntensityStatsAccumulator::new();
        stats.observe_window_level(&[400.0], &[40.0]);
        stats.observe_window_level(&[400.0], &[40.0]);
        stats.observe_window_level(&[350.0], &[40.0]);
        assert_eq!(stats.elect(), Some((400.0, 40.0)));
    }

    #[test]
    fn vote_ties_break_to_the_mean() {
        let mut stats = IntensityStatsAccumulator::new();
        stats.observe_window_level(&[400.0], &[40.0]);
        stats.observe_window_level(&[350.0], &[40.0]);
        assert_eq!(stats.elect(), Some((375.0, 40.0)));
    }

    #[test]
    fn inverse_photometric_latches() {
        let mut stats = IntensityStatsAccumulator::new();
        assert!(!stats.snapshot().inverted);
        stats.observe_photometric(false);
        stats.observe_photometric(true);
        stats.observe_photometric(false);
        assert!(stats.snapshot().inverted);
    }

    #[test]
    fn no_hints_means_no_preset() {
        let mut stats = IntensityStatsAccumulator::new();
        stats.observe_extrema(0.0, 10.0);
        assert_eq!(stats.elect(), None);
        assert_eq!(stats.snapshot().preset, None);
    }
}
