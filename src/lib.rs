//! # Volume-assembler library
//!
//! This crate assembles a consistent 3-D volume out of a stream of 2-D
//! cross-sectional image slices, while the source data may still be
//! downloading, may arrive out of order, and may be re-sorted or
//! invalidated mid-flight.

//!
//! This library is part of the dicom-rs ecosystem and builds on its
//! components for the concrete DICOM source adapter; everything else works
//! against the [`SliceSource`] trait, so a still-downloading remote series
//! and a local directory of files go through the same pipeline.
//! A [`VolumeCache`] keyed by series identity hands out [`Volume`]s,
//! choosing between two build strategies:
//!  - Sequential: one slice at a time in comparator order, safe for any
//!    comparator
//!  - Parallel-safe: out-of-order writes keyed by the stable 1-based
//!    InstanceNumber, for sources that are still streaming
//!
//! While slices arrive, the volume incrementally tracks geometric
//! consistency (spacing regularity, orientation trust, per-axis scale) and
//! global intensity statistics (running min/max, a majority-vote
//! window/level preset). Consumers subscribe to an [`EventBus`] for
//! replace/progress/complete/error notifications, and a per-volume stall
//! monitor suggests a refresh when a build goes quiet without finishing.
//!
//! # Examples
//!
//! ## Building a volume from a directory of DICOM files
//!
//! Read all ".dcm" files from the dicom/ directory, sort them by
//! InstanceNumber, and build the volume.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use volume_assembler::{DicomSliceSource, EventBus, SliceSource, SortBy, VolumeCache};
//! let bus = Arc::new(EventBus::new());
//! let mut events = bus.subscribe();
//! let cache = VolumeCache::new(Arc::clone(&bus));
//!
//! let source: Arc<dyn SliceSource> =
//!     Arc::new(DicomSliceSource::from_directory("dicom").expect("should have loaded directory"));
//! let volume = cache
//!     .get_or_build(&source, SortBy::InstanceNumber, false)
//!     .expect("should have started a build");
//!
//! while let Some(event) = events.blocking_recv() {
//!     if matches!(event, volume_assembler::VolumeEvent::Complete { .. }) {
//!         break;
//!     }
//! }
//! assert!(volume.is_complete());
//! ```

pub mod builder;
pub mod cache;
pub mod dicom_source;
mod election;
pub mod enums;
pub mod error;
pub mod events;
pub mod geometry;
pub mod intensity;
pub mod source;
pub mod stall;
pub mod volume;

pub use builder::{CancelToken, select_builder};
pub use cache::VolumeCache;
pub use dicom_source::{DicomSliceSource, DicomSourceError};
pub use enums::{BuilderKind, SortBy, StorageFormat};
pub use error::{AssemblyError, ErrorKind};
pub use events::{EventBus, VolumeEvent};
pub use geometry::{GeometryAccumulator, GeometryState, OrientationPatient};
pub use intensity::{IntensityStats, IntensityStatsAccumulator};
pub use source::{SeriesIdentity, Slice, SliceDescriptor, SliceSource};
pub use stall::{DEFAULT_STALL_INTERVAL, StallMonitor};
pub use volume::{Volume, VolumeShape};
