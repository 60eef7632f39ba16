//! The two build strategies and their shared plumbing.
//!
//! `Sequential` walks the series in comparator order and is safe for any
//! comparator. `ParallelSafe` writes each slice at its InstanceNumber-derived
//! index, so it tolerates slices arriving in any order while the series is
//! still downloading, but it aborts as soon as one slice has no stable
//! index.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::enums::{BuilderKind, SortBy};
use crate::error::AssemblyError;
use crate::events::{EventBus, VolumeEvent};
use crate::geometry::GeometryAccumulator;
use crate::intensity::IntensityStatsAccumulator;
use crate::source::{SeriesIdentity, Slice, SliceSource};
use crate::volume::Volume;

/// Emit progress and refresh the derived snapshots every this many slices.
const PROGRESS_STRIDE: usize = 10;

/// Cooperative cancellation flag, polled at slice boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Decide the strategy once per build. ParallelSafe requires the stable
/// instance-number order, a source that is still streaming, and a series
/// that has not been split into sub-series.
pub fn select_builder(sort: SortBy, source: &dyn SliceSource) -> BuilderKind {
    if sort == SortBy::InstanceNumber && source.is_streaming() && !source.is_split() {
        BuilderKind::ParallelSafe
    } else {
        BuilderKind::Sequential
    }
}

/// Everything one build worker needs.
pub(crate) struct BuildContext {
    pub identity: SeriesIdentity,
    pub volume: Arc<Volume>,
    pub source: Arc<dyn SliceSource>,
    pub bus: Arc<EventBus>,
    pub cancel: CancelToken,
}

impl BuildContext {
    fn emit_progress(&self) {
        self.bus.emit(VolumeEvent::Progress {
            identity: self.identity.clone(),
            completed: self.volume.completed_count(),
            total: self.volume.depth(),
        });
    }

    fn publish_snapshots(
        &self,
        geometry: &GeometryAccumulator,
        intensity: &IntensityStatsAccumulator,
    ) {
        self.volume.set_geometry(geometry.state());
        self.volume.set_intensity(intensity.snapshot());
    }

    /// Finalize after a build loop ran to its end: publish the derived
    /// state and, iff every slice landed, mark complete and say so once.
    fn finish(&self, geometry: &GeometryAccumulator, intensity: &IntensityStatsAccumulator) {
        self.publish_snapshots(geometry, intensity);
        if self.volume.all_slices_complete() {
            self.volume.mark_complete();
            self.bus.emit(VolumeEvent::Complete {
                identity: self.identity.clone(),
            });
        }
    }
}

/// Feed the order-independent per-slice metadata into the accumulators.
fn ingest_metadata(
    geometry: &mut GeometryAccumulator,
    intensity: &mut IntensityStatsAccumulator,
    slice: &Slice,
    rank: usize,
) {
    let descriptor = &slice.descriptor;
    if let Some(orientation) = &descriptor.orientation {
        geometry.observe_orientation(orientation);
    }
    if let Some(spacing) = descriptor.pixel_spacing {
        geometry.observe_pixel_spacing(rank, spacing);
    }
    intensity.observe_photometric(descriptor.inverse_photometric);
    if !descriptor.window.is_empty() && !descriptor.level.is_empty() {
        intensity.observe_window_level(&descriptor.window, &descriptor.level);
    }
    if let Some((min, max)) = descriptor.extrema {
        intensity.observe_extrema(min, max);
    }
}

/// Single-worker strategy: one slice at a time in comparator order.
pub(crate) fn build_sequential(ctx: &BuildContext, sort: SortBy) -> Result<(), AssemblyError> {
    let mut geometry = GeometryAccumulator::new();
    let mut intensity = IntensityStatsAccumulator::new();

    let count = ctx.source.slice_count();
    for rank in 0..count {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let live_count = ctx.source.slice_count();
        if live_count > ctx.volume.depth() {
            return Err(AssemblyError::SourceChanged(format!(
                "slice count grew to {live_count}, volume holds {}",
                ctx.volume.depth()
            )));
        }

        // A slice the source has not delivered yet is not an error; it is
        // left for a later resume.
        let Some(slice) = ctx.source.slice_at(rank, sort) else {
            debug!(rank, "slice not yet available, skipping");
            continue;
        };

        ingest_metadata(&mut geometry, &mut intensity, &slice, rank);
        if let Some(position) = slice.descriptor.position_sum() {
            geometry.observe_position(position, rank);
        }

        if !ctx.volume.is_slice_complete(rank) {
            ctx.volume.write_slice(rank, &slice.data)?;
        }

        if rank % PROGRESS_STRIDE == 0 {
            ctx.publish_snapshots(&geometry, &intensity);
            ctx.emit_progress();
        }
    }

    ctx.finish(&geometry, &intensity);
    Ok(())
}

/// Multi-capable strategy: iterate a snapshot in whatever order it comes,
/// writing each slice at `instance_number - 1`. Correctness relies only on
/// the stable index, never on iteration order; the z-spacing statistics are
/// rebuilt in instance order at the end, since arrival order would bias
/// them.
pub(crate) fn build_parallel_safe(ctx: &BuildContext) -> Result<(), AssemblyError> {
    let mut geometry = GeometryAccumulator::new();
    let mut intensity = IntensityStatsAccumulator::new();

    let snapshot = ctx.source.snapshot();
    let mut positions = Vec::with_capacity(snapshot.len());
    let mut written = 0usize;

    for slice in &snapshot {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let instance = slice
            .descriptor
            .instance_number
            .ok_or(AssemblyError::MissingInstanceIndex)?;
        if instance == 0 || instance as usize > ctx.volume.depth() {
            return Err(AssemblyError::SourceChanged(format!(
                "InstanceNumber {instance} outside volume of depth {}",
                ctx.volume.depth()
            )));
        }
        let index = (instance - 1) as usize;

        ingest_metadata(&mut geometry, &mut intensity, slice, index);
        if let Some(position) = slice.descriptor.position_sum() {
            positions.push((index, position));
        }

        if !ctx.volume.is_slice_complete(index) {
            ctx.volume.write_slice(index, &slice.data)?;
            written += 1;
            if written % PROGRESS_STRIDE == 0 {
                ctx.publish_snapshots(&geometry, &intensity);
                ctx.emit_progress();
            }
        }
    }

    // Consolidated spacing pass in instance order, the order the sequential
    // strategy would have walked. Position order would erase the stack
    // direction and with it the negative-spacing flag.
    positions.sort_by_key(|(index, _)| *index);
    for (rank, (_, position)) in positions.iter().enumerate() {
        geometry.observe_position(*position, rank);
    }

    ctx.finish(&geometry, &intensity);
    Ok(())
}

/// Worker entry point: run the selected strategy, fall back from a failed
/// parallel-safe build to a fresh sequential one, and report failures on
/// the bus. Cancellation terminates silently.
pub(crate) fn run_build(ctx: BuildContext, kind: BuilderKind, sort: SortBy) {
    let started = Instant::now();
    info!(identity = %ctx.identity, ?kind, ?sort, depth = ctx.volume.depth(), "building volume");

    let result = match kind {
        BuilderKind::Sequential => build_sequential(&ctx, sort),
        BuilderKind::ParallelSafe => match build_parallel_safe(&ctx) {
            Err(AssemblyError::MissingInstanceIndex) => {
                warn!(identity = %ctx.identity, "missing InstanceNumber, falling back to sequential");
                ctx.volume.reset_for_rebuild();
                build_sequential(&ctx, sort)
            }
            other => other,
        },
    };

    match result {
        Ok(()) if ctx.cancel.is_cancelled() => {
            debug!(identity = %ctx.identity, "build cancelled");
        }
        Ok(()) => {
            info!(
                identity = %ctx.identity,
                completed = ctx.volume.completed_count(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "build worker finished"
            );
        }
        Err(error) => {
            tracing::error!(identity = %ctx.identity, %error, "build failed");
            ctx.bus.emit(VolumeEvent::Error {
                identity: ctx.identity.clone(),
                kind: error.kind(),
                message: error.to_string(),
            });
        }
    }
}
