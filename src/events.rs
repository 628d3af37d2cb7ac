//! Push notifications towards the control plane

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use crate::capture::{CameraInfo, Size};
use crate::encode::CodecMode;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum StreamEvent {
    Started {
        address: String,
        camera: CameraInfo,
        size: Size,
        codec: CodecMode,
    },
    Stopped,
    CameraSwitched {
        camera: CameraInfo,
    },
    Reconfigured {
        size: Size,
        fps: u32,
        codec: CodecMode,
    },
    /// The hardware path could not be brought up; software compression took over.
    EncoderFallback {
        reason: String,
    },
    /// The encoder drain loop died while running.
    EncoderFailed {
        reason: String,
    },
    Error {
        message: String,
    },
}

/// Fan-out of [`StreamEvent`]s to any number of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<flume::Sender<StreamEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<StreamEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned.
    pub fn emit(&self, event: StreamEvent) {
        debug!("Event: {:?}", event);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.emit(StreamEvent::Stopped);

        assert_eq!(a.try_recv().unwrap(), StreamEvent::Stopped);
        assert_eq!(b.try_recv().unwrap(), StreamEvent::Stopped);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        let live = bus.subscribe();

        bus.emit(StreamEvent::Stopped);

        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
        assert!(live.try_recv().is_ok());
    }
}
