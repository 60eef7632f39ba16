//! Volume construction and caching, keyed by series identity.
//!
//! This is the entry point of the crate: `get_or_build` either hands back a
//! cached volume, resumes an idle build that stopped short, or tears the old
//! entry down and starts a fresh build with the right strategy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::builder::{BuildContext, CancelToken, run_build, select_builder};
use crate::enums::{SortBy, StorageFormat};
use crate::error::AssemblyError;
use crate::events::{EventBus, VolumeEvent};
use crate::source::{SeriesIdentity, SliceSource};
use crate::stall::{DEFAULT_STALL_INTERVAL, StallMonitor};
use crate::volume::{Volume, VolumeShape};

struct BuilderHandle {
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl BuilderHandle {
    fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel-and-wait: after this returns no builder touches the volume.
    fn cancel_and_join(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct CacheEntry {
    sort: SortBy,
    volume: Arc<Volume>,
    handle: BuilderHandle,
    monitor: Option<StallMonitor>,
}

/// Maps a series identity to its (possibly still loading) volume.
///
/// Explicitly constructed and injectable; the event bus is shared with
/// whoever consumes the notifications. The map is the only structure under
/// a lock, so concurrent `get_or_build` calls for the same identity cannot
/// race an insert against a replace.
pub struct VolumeCache {
    bus: Arc<EventBus>,
    stall_interval: Duration,
    entries: Mutex<HashMap<SeriesIdentity, CacheEntry>>,
}

impl VolumeCache {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_stall_interval(bus, DEFAULT_STALL_INTERVAL)
    }

    pub fn with_stall_interval(bus: Arc<EventBus>, stall_interval: Duration) -> Self {
        VolumeCache {
            bus,
            stall_interval,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Return the cached volume for this source, or build one.
    ///
    /// A cached entry is reused only when its sort order matches and no
    /// rebuild is forced. An entry whose builder finished with slices still
    /// missing is resumed in place when the source can still deliver them,
    /// or rebuilt when the source's size has moved past the volume's fixed
    /// depth.
    pub fn get_or_build(
        &self,
        source: &Arc<dyn SliceSource>,
        sort: SortBy,
        force: bool,
    ) -> Result<Arc<Volume>, AssemblyError> {
        let identity = source.identity();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !force {
            if let Some(entry) = entries.get_mut(&identity) {
                if entry.sort == sort {
                    if entry.volume.is_complete() || !entry.handle.is_finished() {
                        debug!(%identity, "returning cached volume");
                        return Ok(Arc::clone(&entry.volume));
                    }
                    // Builder went idle with slices missing.
                    let needs_rebuild = !source.is_streaming()
                        && source.slice_count() != entry.volume.depth();
                    if !needs_rebuild {
                        info!(%identity, "resuming idle build");
                        entry.handle = self.spawn_worker(
                            identity.clone(),
                            Arc::clone(&entry.volume),
                            Arc::clone(source),
                            sort,
                        );
                        if let Some(monitor) = &entry.monitor {
                            monitor.restart();
                        }
                        return Ok(Arc::clone(&entry.volume));
                    }
                }
            }
        }

        // Discard the old entry, if any, before its replacement exists.
        // Dropping it also stops its stall monitor.
        let replaced = match entries.remove(&identity) {
            Some(mut old) => {
                old.handle.cancel_and_join();
                true
            }
            None => false,
        };

        let (shape, format) = resolve_construction(source.as_ref())?;
        info!(
            %identity, ?sort, force,
            width = shape.width, height = shape.height, depth = shape.depth, ?format,
            "building volume"
        );

        let volume = Arc::new(Volume::new(shape, format));
        // Announce the replacement before the new worker can emit anything,
        // so subscribers see Replaced ahead of the first Progress.
        if replaced {
            self.bus.emit(VolumeEvent::Replaced {
                identity: identity.clone(),
                volume: Arc::clone(&volume),
            });
        }
        let handle = self.spawn_worker(
            identity.clone(),
            Arc::clone(&volume),
            Arc::clone(source),
            sort,
        );
        let monitor = source.is_streaming().then(|| {
            StallMonitor::spawn(
                identity.clone(),
                Arc::clone(&volume),
                Arc::clone(&self.bus),
                self.stall_interval,
            )
        });

        entries.insert(
            identity,
            CacheEntry {
                sort,
                volume: Arc::clone(&volume),
                handle,
                monitor,
            },
        );
        Ok(volume)
    }

    fn spawn_worker(
        &self,
        identity: SeriesIdentity,
        volume: Arc<Volume>,
        source: Arc<dyn SliceSource>,
        sort: SortBy,
    ) -> BuilderHandle {
        let kind = select_builder(sort, source.as_ref());
        let cancel = CancelToken::new();
        let ctx = BuildContext {
            identity,
            volume,
            source,
            bus: Arc::clone(&self.bus),
            cancel: cancel.clone(),
        };
        let join = thread::spawn(move || run_build(ctx, kind, sort));
        BuilderHandle {
            cancel,
            join: Some(join),
        }
    }

    /// Drop one entry, cancelling its builder and monitor. Used when the
    /// underlying series closes.
    pub fn evict(&self, identity: &SeriesIdentity) {
        let entry = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.remove(identity)
        };
        if let Some(mut entry) = entry {
            info!(%identity, "evicting volume");
            entry.handle.cancel_and_join();
        }
    }

    /// Soft-retention sweep: drop every entry whose volume nobody outside
    /// the cache holds anymore. A still-loading entry keeps a reference in
    /// its worker, so no in-flight build loses its volume underneath it;
    /// the cancel is a cheap no-op for those already finished.
    pub fn evict_unreferenced(&self) {
        let removed: Vec<CacheEntry> = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let idle: Vec<SeriesIdentity> = entries
                .iter()
                .filter(|(_, entry)| Arc::strong_count(&entry.volume) == 1)
                .map(|(identity, _)| identity.clone())
                .collect();
            idle.into_iter()
                .filter_map(|identity| {
                    debug!(%identity, "dropping unreferenced volume");
                    entries.remove(&identity)
                })
                .collect()
        };
        for mut entry in removed {
            entry.handle.cancel_and_join();
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Work out the destination shape and format before any volume exists.
///
/// Width/height prefer the series' explicit metadata, falling back to the
/// first decodable slice in source order. Depth is the larger of the
/// declared instance count and the currently enumerable count, so sources
/// still discovering slices get a buffer big enough for the rest.
fn resolve_construction(
    source: &dyn SliceSource,
) -> Result<(VolumeShape, StorageFormat), AssemblyError> {
    let mut probe = None;
    for position in 0..source.slice_count() {
        if let Some(slice) = source.slice_at(position, SortBy::None) {
            probe = Some(slice);
            break;
        }
    }
    let probe = probe.ok_or(AssemblyError::UnresolvedDimensions)?;

    let (width, height) = source
        .declared_dimensions()
        .unwrap_or((probe.descriptor.width, probe.descriptor.height));
    let format = StorageFormat::for_descriptor(&probe.descriptor)?;

    let depth = source
        .slice_count()
        .max(source.declared_instance_count().unwrap_or(0));

    Ok((
        VolumeShape {
            width,
            height,
            depth,
        },
        format,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Slice;

    struct EmptySource;

    impl SliceSource for EmptySource {
        fn identity(&self) -> SeriesIdentity {
            SeriesIdentity::from("empty")
        }
        fn declared_dimensions(&self) -> Option<(u32, u32)> {
            None
        }
        fn slice_count(&self) -> usize {
            0
        }
        fn slice_at(&self, _position: usize, _sort: SortBy) -> Option<Slice> {
            None
        }
        fn snapshot(&self) -> Vec<Slice> {
            Vec::new()
        }
        fn is_streaming(&self) -> bool {
            false
        }
    }

    #[test]
    fn unresolvable_dimensions_fail_before_construction() {
        let cache = VolumeCache::new(Arc::new(EventBus::new()));
        let source: Arc<dyn SliceSource> = Arc::new(EmptySource);
        let result = cache.get_or_build(&source, SortBy::default(), false);
        assert!(matches!(result, Err(AssemblyError::UnresolvedDimensions)));
        // No cache entry was created for the failed request.
        assert!(cache.is_empty());
    }
}
