use crate::error::AssemblyError;
use crate::source::SliceDescriptor;

/// Sort order applied to a series before it is stacked into a volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

/// Pixel layout of the destination buffer, fixed at volume construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageFormat {
    UnsignedByte,
    Rgb8,
    UnsignedShort,
    SignedShort,
}

impl StorageFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            StorageFormat::UnsignedByte => 1,
            StorageFormat::Rgb8 => 3,
            StorageFormat::UnsignedShort | StorageFormat::SignedShort => 2,
        }
    }

    /// Select the storage format from the first available slice descriptor.
    ///
    /// Bit depth in (8, 16] maps to a short format by pixel representation,
    /// 8 bits and below to a byte format by sample count. Anything else is
    /// not representable.
    pub fn for_descriptor(descriptor: &SliceDescriptor) -> Result<Self, AssemblyError> {
        let bits = descriptor.bits_stored;
        let samples = descriptor.samples_per_pixel;

        if bits > 8 && bits <= 16 {
            return Ok(if descriptor.signed {
                StorageFormat::SignedShort
            } else {
                StorageFormat::UnsignedShort
            });
        }
        if bits <= 8 {
            return match samples {
                1 => Ok(StorageFormat::UnsignedByte),
                3 => Ok(StorageFormat::Rgb8),
                _ => Err(AssemblyError::UnsupportedFormat { bits, samples }),
            };
        }
        Err(AssemblyError::UnsupportedFormat { bits, samples })
    }
}

/// Build strategy chosen once per build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuilderKind {
    /// One slice at a time in comparator order. Safe for any comparator.
    Sequential,
    /// Out-of-order writes keyed by the stable 1-based InstanceNumber.
    ParallelSafe,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(bits: u16, signed: bool, samples: u16) -> SliceDescriptor {
        SliceDescriptor {
            width: 4,
            height: 4,
            bits_stored: bits,
            signed,
            samples_per_pixel: samples,
            ..Default::default()
        }
    }

    #[test]
    fn short_formats_follow_pixel_representation() {
        assert_eq!(
            StorageFormat::for_descriptor(&descriptor(12, true, 1)).unwrap(),
            StorageFormat::SignedShort
        );
        assert_eq!(
            StorageFormat::for_descriptor(&descriptor(16, false, 1)).unwrap(),
            StorageFormat::UnsignedShort
        );
    }

    #[test]
    fn byte_formats_follow_sample_count() {
        assert_eq!(
            StorageFormat::for_descriptor(&descriptor(8, false, 1)).unwrap(),
            StorageFormat::UnsignedByte
        );
        assert_eq!(
            StorageFormat::for_descriptor(&descriptor(8, false, 3)).unwrap(),
            StorageFormat::Rgb8
        );
    }

    #[test]
    fn odd_sample_counts_are_unsupported() {
        assert!(matches!(
            StorageFormat::for_descriptor(&descriptor(8, false, 2)),
            Err(AssemblyError::UnsupportedFormat { bits: 8, samples: 2 })
        ));
        assert!(matches!(
            StorageFormat::for_descriptor(&descriptor(32, false, 1)),
            Err(AssemblyError::UnsupportedFormat { .. })
        ));
    }
}
