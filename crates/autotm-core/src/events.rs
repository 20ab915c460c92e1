//! Session events
//!
//! Everything the session reports to the outside world (GUI, scripts, logs)
//! goes through an [`EventBus`]. Events are emitted once a state transition
//! has completed, so observers always see consistent data.

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crate::lut::LookupTable;
use crate::model::{CalibrationKind, RawSample, S11Dataset};

/// Notification raised by an [`AtmSession`](crate::session::AtmSession)
#[derive(Debug, Clone, PartialEq)]
pub enum AtmEvent {
    /// Result of a device scan (port names)
    AvailableDevicesChanged(Vec<String>),
    /// Transport opened or closed
    ConnectionStateChanged {
        /// Whether the link is usable
        is_open: bool,
        /// Endpoint name
        name: String,
    },
    /// A sweep sample arrived
    DataPointAdded(RawSample),
    /// A reflection sweep (measurement or calibration) completed
    SweepFinished {
        /// Samples in arrival order
        dataset: S11Dataset,
        /// Time from start command to terminator
        duration: Duration,
    },
    /// A calibration standard was captured
    CalibrationSlotFinished {
        /// Standard that was measured
        kind: CalibrationKind,
        /// Its raw sweep
        dataset: S11Dataset,
    },
    /// Voltage lookup table generation completed
    LutFinished {
        /// The completed table
        lut: LookupTable,
        /// Time spent on all voltage searches
        duration: Duration,
    },
    /// Informational message (device `i` lines and session notices)
    Info(String),
    /// Error or diagnostic (device `e` lines, malformed lines, aborts)
    Error(String),
}

type Observer = Box<dyn Fn(&AtmEvent) + Send>;

/// Fan-out of events to callbacks and channel subscribers
#[derive(Default)]
pub struct EventBus {
    observers: Vec<Observer>,
    subscribers: Vec<Sender<AtmEvent>>,
}

impl EventBus {
    /// Bus without listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked synchronously for each event
    pub fn observe<F>(&mut self, observer: F)
    where
        F: Fn(&AtmEvent) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Open a channel receiving a copy of every later event
    pub fn subscribe(&mut self) -> Receiver<AtmEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver `event` to every observer and subscriber
    pub fn emit(&mut self, event: AtmEvent) {
        for observer in &self.observers {
            observer(&event);
        }
        // Dropped receivers are pruned
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_observers_and_subscribers_receive_events() {
        let mut bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.observe(move |event| sink.lock().unwrap().push(event.clone()));
        let rx = bus.subscribe();

        bus.emit(AtmEvent::Info("homed".to_string()));

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[AtmEvent::Info("homed".to_string())]
        );
        assert_eq!(rx.try_recv().unwrap(), AtmEvent::Info("homed".to_string()));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit(AtmEvent::Error("gone".to_string()));
        assert_eq!(bus.subscribers.len(), 0);
    }
}
