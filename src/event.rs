//! Engine events and their fan-out.
//!
//! Each engine owns an `EventBus` with an explicit subscriber list; every
//! subscription is addressable through its `SubscriptionId`. A bus can relay
//! into another bus through a shared `ForwardGate`: the relay only passes
//! events while the gate points at the bus's source, so re-pointing all
//! forwarding is a single atomic store.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::app::mode::Mode;
use crate::model::pattern::SearchMatch;
use crate::services::file_watcher::WatchUpdate;
use crate::services::remote::RemotePath;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    WindowLoaded {
        range: Range<usize>,
        lines: Vec<String>,
    },
    LinesAppended {
        first_line: usize,
        count: usize,
    },
    FilterCompleted {
        matched_count: usize,
        total_count: usize,
    },
    FilterCleared,
    FilterError {
        reason: String,
    },
    SearchCompleted {
        results: Vec<SearchMatch>,
    },
    SearchError {
        reason: String,
    },
    WatchUpdate(WatchUpdate),
    /// The watcher gave up on a path after exhausting its retries
    WatchStopped {
        path: RemotePath,
        reason: String,
    },
    ContentLoaded {
        bytes: usize,
    },
    Saved {
        bytes: usize,
    },
    DirtyChanged {
        dirty: bool,
    },
    /// The file changed remotely while edit-mode content had unsaved changes
    ExternalChangeConflict,
    ModeChanged {
        mode: Mode,
    },
    ModeSwitchFailed {
        target: Mode,
        reason: String,
    },
}

/// Which component emitted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventSource {
    Browse = 1,
    Edit = 2,
    Watcher = 3,
    Manager = 4,
}

impl EventSource {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(EventSource::Browse),
            2 => Some(EventSource::Edit),
            3 => Some(EventSource::Watcher),
            4 => Some(EventSource::Manager),
            _ => None,
        }
    }
}

/// Handle identifying one subscription on one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A live subscription: its id plus the receiving end
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Subscription {
    /// Events already queued, without waiting
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Selects which source a set of relays currently passes through
#[derive(Debug)]
pub struct ForwardGate {
    active: AtomicU8,
}

impl ForwardGate {
    pub fn new(active: EventSource) -> Self {
        Self {
            active: AtomicU8::new(active as u8),
        }
    }

    pub fn point_to(&self, source: EventSource) {
        self.active.store(source as u8, Ordering::SeqCst);
    }

    pub fn active(&self) -> Option<EventSource> {
        EventSource::from_u8(self.active.load(Ordering::SeqCst))
    }
}

#[derive(Debug)]
struct Relay {
    gate: Arc<ForwardGate>,
    target: Arc<EventBus>,
}

#[derive(Debug)]
pub struct EventBus {
    source: EventSource,
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<EngineEvent>)>>,
    next_id: AtomicU64,
    relay: Mutex<Option<Relay>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EventBus {
    pub fn new(source: EventSource) -> Self {
        Self {
            source,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            relay: Mutex::new(None),
        }
    }

    pub fn shared(source: EventSource) -> Arc<Self> {
        Arc::new(Self::new(source))
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push((id, tx));
        Subscription { id, events: rx }
    }

    /// Returns false if the id was unknown (already unsubscribed).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Relay events into `target` whenever `gate` points at this bus's source.
    pub fn relay_to(&self, gate: Arc<ForwardGate>, target: Arc<EventBus>) {
        *lock(&self.relay) = Some(Relay { gate, target });
    }

    pub fn emit(&self, event: EngineEvent) {
        {
            let mut subscribers = lock(&self.subscribers);
            // Subscribers whose receiver was dropped are pruned here.
            subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }

        let target = {
            let relay = lock(&self.relay);
            relay
                .as_ref()
                .filter(|r| r.gate.active() == Some(self.source))
                .map(|r| r.target.clone())
        };
        if let Some(target) = target {
            target.emit(event);
        }
    }
}
