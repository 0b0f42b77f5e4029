//! Change notifications and the local agent-load probe.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};

use crate::Snapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum ProfilerEvent {
    ModelChanged,
    ConfigChanged,
    SnapshotTaken(Snapshot),
}

/// Fan-out of profiler events to every live subscriber.
#[derive(Debug, Default)]
pub struct EventHub {
    senders: Mutex<Vec<Sender<ProfilerEvent>>>,
}

impl EventHub {
    pub fn subscribe(&self) -> Receiver<ProfilerEvent> {
        let (tx, rx) = channel();
        self.lock().push(tx);
        rx
    }

    /// Subscribers whose receiver was dropped are forgotten.
    pub fn emit(&self, event: ProfilerEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<ProfilerEvent>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reports whether the profiler agent is loaded into a local target.
pub trait AgentLoadDetector: Send + Sync {
    fn is_agent_loaded(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct AgentLoadFlag {
    loaded: AtomicBool,
}

impl AgentLoadFlag {
    pub fn new(loaded: bool) -> Self {
        Self {
            loaded: AtomicBool::new(loaded),
        }
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }
}

impl AgentLoadDetector for AgentLoadFlag {
    fn is_agent_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = EventHub::default();
        let kept = hub.subscribe();
        drop(hub.subscribe());
        hub.emit(ProfilerEvent::ModelChanged);
        assert_eq!(kept.try_recv().expect("event"), ProfilerEvent::ModelChanged);
        assert_eq!(hub.lock().len(), 1);
    }
}
