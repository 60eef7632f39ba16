use crate::enums::SortBy;

/// Opaque key identifying the logical source series. Used as the cache key;
/// requesting the same identity with a different sort order replaces the
/// cached volume rather than creating a second entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SeriesIdentity(pub String);

impl From<&str> for SeriesIdentity {
    fn from(value: &str) -> Self {
        SeriesIdentity(value.to_owned())
    }
}

impl std::fmt::Display for SeriesIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-slice metadata available at (or before) pixel-decode time.
#[derive(Clone, Debug, Default)]
pub struct SliceDescriptor {
    pub width: u32,
    pub height: u32,
    pub bits_stored: u16,
    pub signed: bool,
    pub samples_per_pixel: u16,
    /// ImageOrientationPatient: row + column direction cosines.
    pub orientation: Option<[f64; 6]>,
    /// ImagePositionPatient.
    pub position: Option<[f64; 3]>,
    /// Stable 1-based InstanceNumber, when the source provides one.
    pub instance_number: Option<u32>,
    /// Row and column spacing in mm.
    pub pixel_spacing: Option<[f64; 2]>,
    /// WindowWidth hints, possibly multi-valued.
    pub window: Vec<f64>,
    /// WindowCenter hints, same cardinality as `window`.
    pub level: Vec<f64>,
    /// Smallest and largest sample value of this slice.
    pub extrema: Option<(f64, f64)>,
    pub inverse_photometric: bool,
}

impl SliceDescriptor {
    /// Scalar position used for spacing deltas: the sum of the position
    /// components.
    pub fn position_sum(&self) -> Option<f64> {
        self.position.map(|p| p[0] + p[1] + p[2])
    }
}

/// One decoded cross-sectional image: metadata plus pixels already laid out
/// in the volume's native byte order.
#[derive(Clone, Debug)]
pub struct Slice {
    pub descriptor: SliceDescriptor,
    pub data: Vec<u8>,
}

/// The series abstraction the assembler consumes. Implementations wrap
/// whatever actually holds the images: an in-memory DICOM set, a directory,
/// or a still-downloading remote series.
///
/// `slice_at` may return `None` for a slice the source has not delivered
/// yet; the builders skip it and the resume/stall machinery picks it up
/// later.
pub trait SliceSource: Send + Sync {
    fn identity(&self) -> SeriesIdentity;

    /// Explicit width/height metadata, if the series carries it.
    fn declared_dimensions(&self) -> Option<(u32, u32)>;

    /// Number of slices currently enumerable. May still grow for a
    /// streaming source.
    fn slice_count(&self) -> usize;

    /// Total instance count declared by the source's manifest, if any.
    fn declared_instance_count(&self) -> Option<usize> {
        None
    }

    /// Fetch the slice at `position` under the given sort order.
    fn slice_at(&self, position: usize, sort: SortBy) -> Option<Slice>;

    /// A fixed snapshot of every currently available slice, in no
    /// particular order. Used by the parallel-safe path, which relies on
    /// instance numbers rather than enumeration order.
    fn snapshot(&self) -> Vec<Slice>;

    /// Whether slices are still being discovered/downloaded.
    fn is_streaming(&self) -> bool;

    /// Whether the series has been split into sub-series, which makes
    /// instance numbers unreliable as volume indices.
    fn is_split(&self) -> bool {
        false
    }
}
