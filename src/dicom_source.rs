//! `SliceSource` over a set of in-memory DICOM objects.
//!
//! This is the fully materialized case: every object is already local, so
//! the source never streams, is never split, and the cache always picks the
//! sequential strategy for it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::{fs, path::Path};

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom::pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption};
use dicom_dictionary_std::tags;
use ndarray::s;
use thiserror::Error;

use crate::enums::SortBy;
use crate::source::{SeriesIdentity, Slice, SliceDescriptor, SliceSource};

type DicomObject = FileDicomObject<InMemDicomObject>;

#[derive(Debug, Error)]
pub enum DicomSourceError {
    #[error("no valid DICOM images found")]
    NoValidImages,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// A series of DICOM objects presented to the assembler.
pub struct DicomSliceSource {
    objects: Vec<DicomObject>,
    identity: SeriesIdentity,
    order_cache: Mutex<HashMap<SortBy, Vec<usize>>>,
}

impl DicomSliceSource {
    /// Wrap already-loaded DICOM objects. The series identity is taken from
    /// the first object's SeriesInstanceUID.
    pub fn from_objects(objects: Vec<DicomObject>) -> Result<Self, DicomSourceError> {
        let first = objects.first().ok_or(DicomSourceError::NoValidImages)?;
        let uid = first
            .element(tags::SERIES_INSTANCE_UID)
            .ok()
            .and_then(|element| element.to_str().ok().map(|s| s.trim().to_owned()))
            .ok_or(DicomSourceError::NoValidImages)?;
        Ok(DicomSliceSource {
            objects,
            identity: SeriesIdentity(uid),
            order_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Load a series from file paths.
    pub fn from_paths(paths: &[impl AsRef<Path>]) -> Result<Self, DicomSourceError> {
        let objects: Result<Vec<_>, _> = paths.iter().map(|path| open_file(path.as_ref())).collect();
        Self::from_objects(objects?)
    }

    /// Load a series from a directory containing ".dcm" files.
    pub fn from_directory(path: impl AsRef<Path>) -> Result<Self, DicomSourceError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(DicomSourceError::NoValidImages);
        }
        Self::from_paths(&paths)
    }

    fn sorted_indices(&self, sort: SortBy) -> Vec<usize> {
        let mut cache = self
            .order_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache
            .entry(sort)
            .or_insert_with(|| {
                let mut indices: Vec<usize> = (0..self.objects.len()).collect();
                if !matches!(sort, SortBy::None) {
                    indices.sort_by(|a, b| {
                        let ka = sort_key(&self.objects[*a], sort);
                        let kb = sort_key(&self.objects[*b], sort);
                        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
                    });
                }
                if matches!(sort, SortBy::ImagePositionPatient) {
                    indices.reverse();
                }
                indices
            })
            .clone()
    }

    fn slice_for(&self, object: &DicomObject) -> Option<Slice> {
        let mut descriptor = descriptor_for(object);
        let data = decode_pixels(object, &mut descriptor)?;
        Some(Slice { descriptor, data })
    }
}

impl SliceSource for DicomSliceSource {
    fn identity(&self) -> SeriesIdentity {
        self.identity.clone()
    }

    fn declared_dimensions(&self) -> Option<(u32, u32)> {
        None
    }

    fn slice_count(&self) -> usize {
        self.objects.len()
    }

    fn slice_at(&self, position: usize, sort: SortBy) -> Option<Slice> {
        let index = *self.sorted_indices(sort).get(position)?;
        self.slice_for(&self.objects[index])
    }

    fn snapshot(&self) -> Vec<Slice> {
        self.objects
            .iter()
            .filter_map(|object| self.slice_for(object))
            .collect()
    }

    fn is_streaming(&self) -> bool {
        false
    }
}

fn sort_key(object: &DicomObject, sort: SortBy) -> Option<f64> {
    match sort {
        SortBy::ImagePositionPatient => {
            let position = object
                .element(tags::IMAGE_POSITION_PATIENT)
                .ok()?
                .to_multi_float64()
                .ok()?;
            position.get(2).copied()
        }
        SortBy::TablePosition => object
            .element(tags::TABLE_POSITION)
            .ok()?
            .to_float64()
            .ok(),
        SortBy::InstanceNumber => object
            .element(tags::INSTANCE_NUMBER)
            .ok()?
            .to_int::<i32>()
            .ok()
            .map(f64::from),
        SortBy::None => Some(0.0),
    }
}

fn tag_multi_f64<const N: usize>(object: &DicomObject, tag: dicom::core::Tag) -> Option<[f64; N]> {
    let values = object.element(tag).ok()?.to_multi_float64().ok()?;
    <[f64; N]>::try_from(values).ok()
}

fn descriptor_for(object: &DicomObject) -> SliceDescriptor {
    let int_tag = |tag| {
        object
            .element(tag)
            .ok()
            .and_then(|element| element.to_int::<u32>().ok())
    };

    let photometric = object
        .element(tags::PHOTOMETRIC_INTERPRETATION)
        .ok()
        .and_then(|element| element.to_str().ok().map(|s| s.trim().to_owned()));

    SliceDescriptor {
        width: int_tag(tags::COLUMNS).unwrap_or(0),
        height: int_tag(tags::ROWS).unwrap_or(0),
        bits_stored: int_tag(tags::BITS_STORED).unwrap_or(16) as u16,
        signed: int_tag(tags::PIXEL_REPRESENTATION) == Some(1),
        samples_per_pixel: int_tag(tags::SAMPLES_PER_PIXEL).unwrap_or(1) as u16,
        orientation: tag_multi_f64::<6>(object, tags::IMAGE_ORIENTATION_PATIENT),
        position: tag_multi_f64::<3>(object, tags::IMAGE_POSITION_PATIENT),
        instance_number: object
            .element(tags::INSTANCE_NUMBER)
            .ok()
            .and_then(|element| element.to_int::<i32>().ok())
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0),
        pixel_spacing: tag_multi_f64::<2>(object, tags::PIXEL_SPACING),
        window: object
            .element(tags::WINDOW_WIDTH)
            .ok()
            .and_then(|element| element.to_multi_float64().ok())
            .unwrap_or_default(),
        level: object
            .element(tags::WINDOW_CENTER)
            .ok()
            .and_then(|element| element.to_multi_float64().ok())
            .unwrap_or_default(),
        extrema: None,
        inverse_photometric: photometric.as_deref() == Some("MONOCHROME1"),
    }
}

/// Decode the first frame to the volume's native byte layout and fill in
/// the sample extrema. The VOI LUT is deliberately not applied; the volume
/// keeps rescaled samples and windows at display time.
fn decode_pixels(object: &DicomObject, descriptor: &mut SliceDescriptor) -> Option<Vec<u8>> {
    let pixel_data = object.decode_pixel_data().ok()?;
    let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);

    if descriptor.bits_stored <= 8 {
        let array = pixel_data.to_ndarray_with_options::<u8>(&options).ok()?;
        let frame = if descriptor.samples_per_pixel == 3 {
            array.slice_move(s![0, .., .., ..])
        } else {
            array.slice_move(s![0, .., .., ..1])
        };
        let samples: Vec<u8> = frame.iter().copied().collect();
        let min = samples.iter().copied().min().unwrap_or(0);
        let max = samples.iter().copied().max().unwrap_or(0);
        descriptor.extrema = Some((f64::from(min), f64::from(max)));
        Some(samples)
    } else {
        let array = pixel_data.to_ndarray_with_options::<u16>(&options).ok()?;
        let frame = array.slice_move(s![0, .., .., 0]);
        let samples: Vec<u16> = frame.iter().copied().collect();
        let min = samples.iter().copied().min().unwrap_or(0);
        let max = samples.iter().copied().max().unwrap_or(0);
        descriptor.extrema = Some((f64::from(min), f64::from(max)));
        Some(bytemuck::cast_slice(&samples).to_vec())
    }
}
