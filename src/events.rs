//! Asynchronous notification channel decoupling the build pipeline from its
//! consumers.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::ErrorKind;
use crate::source::SeriesIdentity;
use crate::volume::Volume;

/// Notifications emitted by the cache and the builders.
#[derive(Clone, Debug)]
pub enum VolumeEvent {
    /// A previously cached volume for this identity was discarded and is
    /// being rebuilt.
    Replaced {
        identity: SeriesIdentity,
        volume: Arc<Volume>,
    },
    /// Periodic build progress; not necessarily once per slice.
    Progress {
        identity: SeriesIdentity,
        completed: usize,
        total: usize,
    },
    /// Emitted exactly once per successful build.
    Complete { identity: SeriesIdentity },
    /// Unrecoverable build failure; the volume is unusable until a rebuild
    /// succeeds.
    Error {
        identity: SeriesIdentity,
        kind: ErrorKind,
        message: String,
    },
    /// Advisory signal from the stall monitor; the consumer decides whether
    /// to force a rebuild.
    RefreshSuggested { identity: SeriesIdentity },
}

/// Fan-out event channel. Emission is FIFO per bus; each subscriber gets its
/// own unbounded receiver and consumes it in whatever context it likes.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<UnboundedSender<VolumeEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<VolumeEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sender);
        receiver
    }

    /// Deliver to every live subscriber, dropping the ones that went away.
    pub fn emit(&self, event: VolumeEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SeriesIdentity {
        SeriesIdentity::from("1.2.3")
    }

    #[test]
    fn delivery_is_fifo_per_subscriber() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        for completed in 0..3 {
            bus.emit(VolumeEvent::Progress {
                identity: identity(),
                completed,
                total: 3,
            });
        }
        bus.emit(VolumeEvent::Complete {
            identity: identity(),
        });

        for expected in 0..3 {
            match receiver.try_recv().unwrap() {
                VolumeEvent::Progress { completed, .. } => assert_eq!(completed, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(matches!(
            receiver.try_recv().unwrap(),
            VolumeEvent::Complete { .. }
        ));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let receiver = bus.subscribe();
        drop(receiver);

        bus.emit(VolumeEvent::Complete {
            identity: identity(),
        });
        let subscribers = bus.subscribers.lock().unwrap();
        assert!(subscribers.is_empty());
    }
}
