//! Incremental geometric consistency tracking.
//!
//! Spacing and orientation arrive one slice at a time, possibly out of
//! order, so everything here is a running approximation that converges as
//! more slices are observed. Orientation trust only ever degrades: once two
//! slices disagree, the volume's orientation is unreliable for good.

use tracing::{debug, warn};

use crate::election::FrequencyTable;

/// Maximum per-component deviation for two orientation vectors to count as
/// the same orientation.
const ORIENTATION_TOLERANCE: f64 = 1e-3;

/// Spacing deltas within this distance (mm) of the dominant value still
/// count as regular.
const SPACING_TOLERANCE_MM: f64 = 0.01;

/// Z-spacing frequency keys are mm scaled by this factor.
const Z_SPACING_SCALE: f64 = 1000.0;

/// Pixel-spacing frequency keys are mm scaled by this factor.
const PIXEL_SPACING_SCALE: f64 = 100.0;

/// Orientation-patient vector as trusted by the volume.
///
/// `Untrusted` is permanent within a build; it replaces the reference
/// vector entirely so no stale value can leak out.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum OrientationPatient {
    #[default]
    Unset,
    Trusted([f64; 6]),
    Untrusted,
}

impl OrientationPatient {
    pub fn is_trusted(&self) -> bool {
        matches!(self, OrientationPatient::Trusted(_))
    }
}

/// Snapshot of the derived geometry, stored on the volume.
#[derive(Clone, Debug, Default)]
pub struct GeometryState {
    pub orientation: OrientationPatient,
    /// True iff every observed z-spacing delta agrees within tolerance.
    pub spacing_regular: bool,
    pub has_negative_spacing: bool,
    /// Dominant z-spacing in mm; `None` before the second slice.
    pub most_common_spacing: Option<f64>,
    /// Per-axis scale (dimension multiplier): observed spacing normalized
    /// by the smallest component, for isotropic display of the volume.
    pub scale: Option<[f64; 3]>,
}

/// Accumulates orientation, position and spacing observations.
#[derive(Debug, Default)]
pub struct GeometryAccumulator {
    orientation: OrientationPatient,
    last_position: Option<f64>,
    z_spacing: FrequencyTable,
    negative_spacing_seen: bool,
    row_spacing: FrequencyTable,
    col_spacing: FrequencyTable,
}

fn same_orientation(a: &[f64; 6], b: &[f64; 6]) -> bool {
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| (x - y).abs() <= ORIENTATION_TOLERANCE)
}

impl GeometryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// First call sets the reference orientation; later calls compare
    /// against it. A single disagreement beyond tolerance flips trust off
    /// for the rest of the build; further disagreements are no-ops.
    pub fn observe_orientation(&mut self, orientation: &[f64; 6]) {
        match &self.orientation {
            OrientationPatient::Unset => {
                debug!(?orientation, "first ImageOrientationPatient");
                self.orientation = OrientationPatient::Trusted(*orientation);
            }
            OrientationPatient::Trusted(reference) => {
                if !same_orientation(reference, orientation) {
                    warn!("variable ImageOrientationPatient, orientation no longer trusted");
                    self.orientation = OrientationPatient::Untrusted;
                }
            }
            OrientationPatient::Untrusted => {}
        }
    }

    /// Feed the scalar position of the slice at `rank`. Deltas between
    /// consecutive observations enter the z-spacing table from the second
    /// slice on.
    pub fn observe_position(&mut self, position_sum: f64, rank: usize) {
        if rank > 0 {
            if let Some(last) = self.last_position {
                let delta = position_sum - last;
                if delta < 0.0 {
                    self.negative_spacing_seen = true;
                }
                self.z_spacing
                    .record((delta * Z_SPACING_SCALE).round() as i64);
            }
        }
        self.last_position = Some(position_sum);
    }

    pub fn observe_pixel_spacing(&mut self, rank: usize, spacing: [f64; 2]) {
        debug!(rank, row = spacing[0], col = spacing[1], "pixel spacing");
        self.row_spacing
            .record((spacing[0] * PIXEL_SPACING_SCALE).round() as i64);
        self.col_spacing
            .record((spacing[1] * PIXEL_SPACING_SCALE).round() as i64);
    }

    /// Dominant z-spacing in mm, or `None` before any delta was observed.
    pub fn most_common_spacing(&self) -> Option<f64> {
        self.z_spacing.elect().map(|key| key as f64 / Z_SPACING_SCALE)
    }

    /// All observed deltas agree within tolerance. Vacuously true while
    /// fewer than two deltas exist.
    pub fn is_spacing_regular(&self) -> bool {
        let tolerance = (SPACING_TOLERANCE_MM * Z_SPACING_SCALE).round() as i64;
        let min = self.z_spacing.keys().min();
        let max = self.z_spacing.keys().max();
        match (min, max) {
            (Some(min), Some(max)) => max - min <= tolerance,
            _ => true,
        }
    }

    pub fn has_negative_spacing(&self) -> bool {
        self.negative_spacing_seen
    }

    /// Per-axis dimension multiplier, normalized by the smallest spacing so
    /// the densest axis has scale 1.0. `None` until pixel spacing and at
    /// least one z delta have been seen.
    pub fn scale(&self) -> Option<[f64; 3]> {
        if self.row_spacing.is_empty() || self.col_spacing.is_empty() {
            return None;
        }
        let row = self.row_spacing.elect()? as f64 / PIXEL_SPACING_SCALE;
        let col = self.col_spacing.elect()? as f64 / PIXEL_SPACING_SCALE;
        let z = self.most_common_spacing()?.abs();

        let spacing = [col, row, z];
        let min = spacing.iter().copied().fold(f64::INFINITY, f64::min);
        if min <= 0.0 || !min.is_finite() {
            return None;
        }
        Some([spacing[0] / min, spacing[1] / min, spacing[2] / min])
    }

    pub fn state(&self) -> GeometryState {
        GeometryState {
            orientation: self.orientation.clone(),
            spacing_regular: self.is_spacing_regular(),
            has_negative_spacing: self.has_negative_spacing(),
            most_common_spacing: self.most_common_spacing(),
            scale: self.scale(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AXIAL: [f64; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    #[test]
    fn first_orientation_becomes_the_reference() {
        let mut geometry = GeometryAccumulator::new();
        geometry.observe_orientation(&AXIAL);
        assert_eq!(geometry.state().orientation, OrientationPatient::Trusted(AXIAL));
    }

    #[test]
    fn orientation_distrust_is_permanent() {
        let mut geometry = GeometryAccumulator::new();
        geometry.observe_orientation(&AXIAL);
        geometry.observe_orientation(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(geometry.state().orientation, OrientationPatient::Untrusted);

        // Agreeing slices afterwards must not restore trust.
        geometry.observe_orientation(&AXIAL);
        geometry.observe_orientation(&AXIAL);
        assert_eq!(geometry.state().orientation, OrientationPatient::Untrusted);
    }

    #[test]
    fn tiny_orientation_jitter_is_tolerated() {
        let mut geometry = GeometryAccumulator::new();
        geometry.observe_orientation(&AXIAL);
        geometry.observe_orientation(&[1.0005, 0.0, 0.0, 0.0, 0.9995, 0.0]);
        assert!(geometry.state().orientation.is_trusted());
    }

    #[test]
    fn regular_spacing_is_detected() {
        let mut geometry = GeometryAccumulator::new();
        for rank in 0..5 {
            geometry.observe_position(rank as f64 * 2.5, rank);
        }
        assert!(geometry.is_spacing_regular());
        assert_eq!(geometry.most_common_spacing(), Some(2.5));
        assert!(!geometry.has_negative_spacing());
    }

    #[test]
    fn irregular_spacing_is_detected() {
        let mut geometry = GeometryAccumulator::new();
        geometry.observe_position(0.0, 0);
        geometry.observe_position(2.5, 1);
        geometry.observe_position(5.0, 2);
        geometry.observe_position(9.0, 3);
        assert!(!geometry.is_spacing_regular());
    }

    #[test]
    fn descending_stacks_set_the_negative_flag() {
        let mut geometry = GeometryAccumulator::new();
        geometry.observe_position(10.0, 0);
        geometry.observe_position(7.5, 1);
        assert!(geometry.has_negative_spacing());
        assert_eq!(geometry.most_common_spacing(), Some(-2.5));
    }

    #[test]
    fn spacing_is_unknown_before_the_second_slice() {
        let mut geometry = GeometryAccumulator::new();
        assert_eq!(geometry.most_common_spacing(), None);
        geometry.observe_position(0.0, 0);
        assert_eq!(geometry.most_common_spacing(), None);
    }

    #[test]
    fn scale_normalizes_by_the_smallest_spacing() {
        let mut geometry = GeometryAccumulator::new();
        geometry.observe_position(0.0, 0);
        geometry.observe_position(2.0, 1);
        geometry.observe_pixel_spacing(1, [0.5, 0.5]);
        let scale = geometry.scale().unwrap();
        assert_eq!(scale, [1.0, 1.0, 4.0]);
    }

    #[test]
    fn scale_needs_both_spacing_kinds() {
        let mut geometry = GeometryAccumulator::new();
        geometry.observe_pixel_spacing(0, [0.5, 0.5]);
        assert_eq!(geometry.scale(), None);
    }
}
