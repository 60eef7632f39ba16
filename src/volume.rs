use std::fmt;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::Array2;
use rayon::prelude::*;

use crate::enums::StorageFormat;
use crate::error::AssemblyError;
use crate::geometry::GeometryState;
use crate::intensity::IntensityStats;

/// Immutable shape of a volume, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeShape {
    pub width: u32,
    pub height: u32,
    pub depth: usize,
}

/// The mutable destination of a build: a fixed-shape 3-D byte buffer
/// addressed by slice index, a per-slice completion bitmap, and the derived
/// geometry/intensity state.
///
/// Write access belongs to the single active builder; readers may look at
/// the buffer concurrently but must only interpret slices whose bitmap
/// entry is true. Bitmap entries move false→true exactly once per build,
/// `reset_for_rebuild` being the only way back.
pub struct Volume {
    shape: VolumeShape,
    format: StorageFormat,
    data: Mutex<Vec<u8>>,
    completed: Vec<AtomicBool>,
    complete: AtomicBool,
    geometry: RwLock<GeometryState>,
    intensity: RwLock<IntensityStats>,
}

fn lock_data(data: &Mutex<Vec<u8>>) -> std::sync::MutexGuard<'_, Vec<u8>> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Volume {
    pub fn new(shape: VolumeShape, format: StorageFormat) -> Self {
        let slice_len = shape.width as usize * shape.height as usize * format.bytes_per_pixel();
        Volume {
            shape,
            format,
            data: Mutex::new(vec![0; slice_len * shape.depth]),
            completed: (0..shape.depth).map(|_| AtomicBool::new(false)).collect(),
            complete: AtomicBool::new(false),
            geometry: RwLock::new(GeometryState::default()),
            intensity: RwLock::new(IntensityStats::default()),
        }
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    pub fn depth(&self) -> usize {
        self.shape.depth
    }

    /// Byte length of one slice.
    pub fn slice_len(&self) -> usize {
        self.shape.width as usize * self.shape.height as usize * self.format.bytes_per_pixel()
    }

    /// Write the pixel bytes for one slice and publish its bitmap entry.
    ///
    /// A write to an index that is already complete, or to a volume already
    /// marked complete, is ignored: slices are written exactly once per
    /// build and rebuilds go through a fresh bitmap.
    pub fn write_slice(&self, index: usize, bytes: &[u8]) -> Result<(), AssemblyError> {
        let slice_len = self.slice_len();
        if bytes.len() != slice_len {
            return Err(AssemblyError::SliceSizeMismatch {
                index,
                expected: slice_len,
                actual: bytes.len(),
            });
        }
        if index >= self.shape.depth {
            return Err(AssemblyError::SourceChanged(format!(
                "slice index {index} outside volume depth {}",
                self.shape.depth
            )));
        }
        if self.is_complete() || self.is_slice_complete(index) {
            return Ok(());
        }

        {
            let mut data = lock_data(&self.data);
            data[index * slice_len..(index + 1) * slice_len].copy_from_slice(bytes);
        }
        // Publish after the bytes are in place.
        self.completed[index].store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_slice_complete(&self, index: usize) -> bool {
        self.completed
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn completed_count(&self) -> usize {
        self.completed
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count()
    }

    pub fn all_slices_complete(&self) -> bool {
        self.completed
            .iter()
            .all(|flag| flag.load(Ordering::Acquire))
    }

    /// Whether a build has run to the end on this volume.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    /// Throw away all completion state so a new builder can start over.
    /// Only called once the previous builder is gone.
    pub(crate) fn reset_for_rebuild(&self) {
        self.complete.store(false, Ordering::Release);
        for flag in &self.completed {
            flag.store(false, Ordering::Release);
        }
    }

    pub(crate) fn set_geometry(&self, state: GeometryState) {
        let mut geometry = self
            .geometry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *geometry = state;
    }

    pub fn geometry(&self) -> GeometryState {
        self.geometry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_intensity(&self, stats: IntensityStats) {
        let mut intensity = self
            .intensity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *intensity = stats;
    }

    pub fn intensity(&self) -> IntensityStats {
        self.intensity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Copy of the raw bytes of one completed slice.
    pub fn slice_data(&self, index: usize) -> Option<Vec<u8>> {
        if !self.is_slice_complete(index) {
            return None;
        }
        let slice_len = self.slice_len();
        let data = lock_data(&self.data);
        Some(data[index * slice_len..(index + 1) * slice_len].to_vec())
    }

    /// One completed slice as a 2-D sample array. Only available for the
    /// 16-bit formats; signed samples keep their bit pattern.
    pub fn slice_array_u16(&self, index: usize) -> Option<Array2<u16>> {
        if !matches!(
            self.format,
            StorageFormat::UnsignedShort | StorageFormat::SignedShort
        ) {
            return None;
        }
        let bytes = self.slice_data(index)?;
        let samples: Vec<u16> = bytemuck::pod_collect_to_vec(&bytes);
        Array2::from_shape_vec((self.shape.height as usize, self.shape.width as usize), samples)
            .ok()
    }

    /// Apply a linear window/level to one completed grayscale slice and
    /// normalize it to `u8` for display. Inverse-photometric series
    /// (MONOCHROME1) come out with the ramp flipped.
    pub fn windowed_slice(&self, index: usize, window: f64, level: f64) -> Option<Vec<u8>> {
        if window <= 0.0 {
            return None;
        }
        let bytes = self.slice_data(index)?;
        let floor = level - window / 2.0;
        let inverted = self.intensity().inverted;

        let normalize = move |value: f64| {
            let shade = ((value - floor) / window * 255.0).clamp(0.0, 255.0) as u8;
            if inverted { 255 - shade } else { shade }
        };

        match self.format {
            StorageFormat::UnsignedByte => {
                Some(bytes.par_iter().map(|&v| normalize(v as f64)).collect())
            }
            StorageFormat::UnsignedShort => {
                let samples: Vec<u16> = bytemuck::pod_collect_to_vec(&bytes);
                Some(samples.par_iter().map(|&v| normalize(v as f64)).collect())
            }
            StorageFormat::SignedShort => {
                let samples: Vec<i16> = bytemuck::pod_collect_to_vec(&bytes);
                Some(samples.par_iter().map(|&v| normalize(v as f64)).collect())
            }
            StorageFormat::Rgb8 => None,
        }
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("shape", &self.shape)
            .field("format", &self.format)
            .field("completed", &self.completed_count())
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume() -> Volume {
        Volume::new(
            VolumeShape {
                width: 2,
                height: 2,
                depth: 3,
            },
            StorageFormat::UnsignedShort,
        )
    }

    #[test]
    fn writes_publish_the_bitmap_entry() {
        let volume = volume();
        assert!(!volume.is_slice_complete(1));
        volume.write_slice(1, &[1, 0, 2, 0, 3, 0, 4, 0]).unwrap();
        assert!(volume.is_slice_complete(1));
        assert_eq!(volume.completed_count(), 1);
        assert!(!volume.all_slices_complete());
        assert_eq!(volume.slice_data(1).unwrap(), vec![1, 0, 2, 0, 3, 0, 4, 0]);
        assert_eq!(volume.slice_data(0), None);
    }

    #[test]
    fn wrong_byte_length_is_rejected() {
        let volume = volume();
        let result = volume.write_slice(0, &[1, 2, 3]);
        assert!(matches!(
            result,
            Err(AssemblyError::SliceSizeMismatch {
                index: 0,
                expected: 8,
                actual: 3
            })
        ));
        assert!(!volume.is_slice_complete(0));
    }

    #[test]
    fn out_of_range_index_is_a_source_change() {
        let volume = volume();
        assert!(matches!(
            volume.write_slice(3, &[0; 8]),
            Err(AssemblyError::SourceChanged(_))
        ));
    }

    #[test]
    fn completed_slices_are_not_rewritten() {
        let volume = volume();
        volume.write_slice(0, &[9; 8]).unwrap();
        volume.write_slice(0, &[1; 8]).unwrap();
        assert_eq!(volume.slice_data(0).unwrap(), vec![9; 8]);
    }

    #[test]
    fn reset_clears_completion_state() {
        let volume = volume();
        volume.write_slice(0, &[9; 8]).unwrap();
        volume.mark_complete();
        volume.reset_for_rebuild();
        assert!(!volume.is_complete());
        assert_eq!(volume.completed_count(), 0);
        // And the slice may now be rewritten.
        volume.write_slice(0, &[1; 8]).unwrap();
        assert_eq!(volume.slice_data(0).unwrap(), vec![1; 8]);
    }

    #[test]
    fn slice_array_reflects_sample_values() {
        let volume = volume();
        volume.write_slice(2, &[1, 0, 0, 1, 255, 255, 0, 0]).unwrap();
        let array = volume.slice_array_u16(2).unwrap();
        assert_eq!(array[[0, 0]], 1);
        assert_eq!(array[[0, 1]], 256);
        assert_eq!(array[[1, 0]], 65535);
        assert_eq!(array[[1, 1]], 0);
    }

    #[test]
    fn windowing_normalizes_to_u8() {
        let volume = volume();
        // Samples 0, 100, 200, 400 with window 400 / level 200.
        volume
            .write_slice(0, &[0, 0, 100, 0, 200, 0, 144, 1])
            .unwrap();
        let shaded = volume.windowed_slice(0, 400.0, 200.0).unwrap();
        assert_eq!(shaded[0], 0);
        assert_eq!(shaded[1], 63);
        assert_eq!(shaded[2], 127);
        assert_eq!(shaded[3], 255);
    }

    #[test]
    fn inverse_photometric_flips_the_ramp() {
        let volume = volume();
        volume
            .write_slice(0, &[0, 0, 100, 0, 200, 0, 144, 1])
            .unwrap();
        let mut stats = IntensityStats::default();
        stats.inverted = true;
        volume.set_intensity(stats);
        let shaded = volume.windowed_slice(0, 400.0, 200.0).unwrap();
        assert_eq!(shaded[0], 255);
        assert_eq!(shaded[1], 192);
        assert_eq!(shaded[2], 128);
        assert_eq!(shaded[3], 0);
    }
}
