//! Watchdog that notices a build going quiet while the volume is still
//! incomplete and suggests a refresh instead of hanging forever.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::events::{EventBus, VolumeEvent};
use crate::source::SeriesIdentity;
use crate::volume::Volume;

/// Default interval between stall checks.
pub const DEFAULT_STALL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Command {
    Idle,
    Watch,
    Stop,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

struct State {
    command: Command,
    /// Bumped on every `restart()` so a watch in progress re-arms instead
    /// of timing out against a stale baseline.
    epoch: u64,
}

/// Per-volume stall watchdog. One watcher thread; `restart()` re-arms the
/// timer rather than stacking a second one. When the interval elapses with
/// no newly completed slices on an incomplete volume, it emits one
/// `RefreshSuggested` and goes idle until re-armed.
///
/// The monitor never forces a rebuild itself; the signal is advisory.
pub struct StallMonitor {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl StallMonitor {
    pub fn spawn(
        identity: SeriesIdentity,
        volume: Arc<Volume>,
        bus: Arc<EventBus>,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                command: Command::Watch,
                epoch: 0,
            }),
            condvar: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("stall-monitor-{identity}"))
            .spawn(move || run(worker_shared, identity, volume, bus, interval))
            .ok();
        StallMonitor { shared, handle }
    }

    /// Re-arm the timer, e.g. because the source reported a new slice count.
    pub fn restart(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.command != Command::Stop {
            state.command = Command::Watch;
            state.epoch += 1;
            self.shared.condvar.notify_all();
        }
    }

    pub fn stop(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.command = Command::Stop;
        self.shared.condvar.notify_all();
    }
}

impl Drop for StallMonitor {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    shared: Arc<Shared>,
    identity: SeriesIdentity,
    volume: Arc<Volume>,
    bus: Arc<EventBus>,
    interval: Duration,
) {
    let mut state = shared
        .state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    loop {
        match state.command {
            Command::Stop => return,
            Command::Idle => {
                state = shared
                    .condvar
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                continue;
            }
            Command::Watch => {}
        }

        let epoch = state.epoch;
        let baseline = volume.completed_count();
        let deadline = Instant::now() + interval;

        // Wait out one interval, restarting on epoch bumps.
        let timed_out = loop {
            let now = Instant::now();
            if now >= deadline {
                break true;
            }
            let (guard, _) = shared
                .condvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
            match state.command {
                Command::Stop => return,
                Command::Idle => break false,
                Command::Watch => {
                    if state.epoch != epoch {
                        break false;
                    }
                }
            }
        };
        if !timed_out {
            continue;
        }

        if volume.is_complete() {
            state.command = Command::Idle;
        } else if volume.completed_count() != baseline {
            // Slices keep arriving, keep watching against the new count.
        } else {
            debug!(%identity, baseline, "no progress within interval, suggesting refresh");
            bus.emit(VolumeEvent::RefreshSuggested {
                identity: identity.clone(),
            });
            state.command = Command::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::StorageFormat;
    use crate::volume::VolumeShape;

    fn small_volume() -> Arc<Volume> {
        Arc::new(Volume::new(
            VolumeShape {
                width: 1,
                height: 1,
                depth: 4,
            },
            StorageFormat::UnsignedByte,
        ))
    }

    #[test]
    fn stalled_build_fires_exactly_one_refresh() {
        let bus = Arc::new(EventBus::new());
        let mut receiver = bus.subscribe();
        let volume = small_volume();

        let monitor = StallMonitor::spawn(
            SeriesIdentity::from("stalled"),
            Arc::clone(&volume),
            Arc::clone(&bus),
            Duration::from_millis(50),
        );

        thread::sleep(Duration::from_millis(300));
        assert!(matches!(
            receiver.try_recv().unwrap(),
            VolumeEvent::RefreshSuggested { .. }
        ));
        // Went idle after signaling once.
        assert!(receiver.try_recv().is_err());
        drop(monitor);
    }

    #[test]
    fn completion_before_the_interval_stays_silent() {
        let bus = Arc::new(EventBus::new());
        let mut receiver = bus.subscribe();
        let volume = small_volume();

        let monitor = StallMonitor::spawn(
            SeriesIdentity::from("finished"),
            Arc::clone(&volume),
            Arc::clone(&bus),
            Duration::from_millis(150),
        );

        for index in 0..4 {
            volume.write_slice(index, &[0]).unwrap();
        }
        volume.mark_complete();

        thread::sleep(Duration::from_millis(400));
        assert!(receiver.try_recv().is_err());
        drop(monitor);
    }

    #[test]
    fn ongoing_progress_defers_the_signal() {
        let bus = Arc::new(EventBus::new());
        let mut receiver = bus.subscribe();
        let volume = small_volume();

        let monitor = StallMonitor::spawn(
            SeriesIdentity::from("progressing"),
            Arc::clone(&volume),
            Arc::clone(&bus),
            Duration::from_millis(100),
        );

        // One slice lands inside the first interval, so the first timeout
        // re-arms instead of signaling.
        thread::sleep(Duration::from_millis(40));
        volume.write_slice(0, &[0]).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(receiver.try_recv().is_err());

        // Then the build goes quiet for a full interval.
        thread::sleep(Duration::from_millis(250));
        assert!(matches!(
            receiver.try_recv().unwrap(),
            VolumeEvent::RefreshSuggested { .. }
        ));
        drop(monitor);
    }
}
