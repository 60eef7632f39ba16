use thiserror::Error;

/// Failures of the assembly pipeline.
///
/// Cancellation is deliberately absent: a cancelled build terminates
/// silently and emits no event.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no readable slice found to resolve volume dimensions")]
    UnresolvedDimensions,

    #[error("unsupported storage format: {bits} bits stored, {samples} samples per pixel")]
    UnsupportedFormat { bits: u16, samples: u16 },

    #[error("source changed during build: {0}")]
    SourceChanged(String),

    #[error("slice {index}: wrote {actual} bytes, volume expects {expected}")]
    SliceSizeMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("slice without an InstanceNumber cannot be loaded out of order")]
    MissingInstanceIndex,
}

/// Coarse classification carried on `VolumeEvent::Error` so consumers can
/// decide whether a retry makes sense without parsing the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; retrying without changed input cannot succeed.
    Configuration,
    /// The source mutated underneath the build; retry with `force = true`.
    SourceChanged,
    /// A decoded slice did not match the volume's per-slice size.
    SliceWriteMismatch,
}

impl AssemblyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AssemblyError::UnresolvedDimensions | AssemblyError::UnsupportedFormat { .. } => {
                ErrorKind::Configuration
            }
            AssemblyError::SourceChanged(_) | AssemblyError::MissingInstanceIndex => {
                ErrorKind::SourceChanged
            }
            AssemblyError::SliceSizeMismatch { .. } => ErrorKind::SliceWriteMismatch,
        }
    }
}
