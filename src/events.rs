//! Internal event channel between background subsystems and the client, and the public
//! subscriber registry.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::Sender,
        Arc, Mutex,
    },
};

use derive_more::Display;

use crate::{connector::Credential, repository::RepositoryEvent};

/// Everything a background subsystem reports to the client's event loop.
#[derive(Debug, Clone)]
pub(crate) enum SubsystemEvent {
    AuthSuccess(Credential),
    AuthFailure(String),
    PollReady,
    PollError(String),
    StreamReady,
    StreamConnected,
    StreamDisconnected(String),
    StreamFailure { reason: String, unrecoverable: bool },
    MetricsReady,
    /// The remote service rejected the current credential.
    Unauthorized,
    RepositoryChanged(RepositoryEvent),
    Shutdown,
}

/// Cloneable handle used by subsystems to report to the client.
#[derive(Clone)]
pub(crate) struct EventSender(Sender<SubsystemEvent>);

impl EventSender {
    pub fn new(sender: Sender<SubsystemEvent>) -> EventSender {
        EventSender(sender)
    }

    pub fn send(&self, event: SubsystemEvent) {
        // Error means the event loop has exited (client closed). Nothing useful to do.
        let _ = self.0.send(event);
    }
}

/// Events library consumers can subscribe to with [`Client::on`](crate::Client::on).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// The client finished initializing. Payload is empty.
    #[display(fmt = "ready")]
    Ready,
    /// Initialization failed. Payload is the reason.
    #[display(fmt = "failed")]
    Failed,
    /// A flag definition changed. Payload is the flag identifier.
    #[display(fmt = "changed")]
    Changed,
}

/// Identifies a registered callback, for [`Client::off_subscriber`](crate::Client::off_subscriber).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

pub(crate) type Callback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriberId, Event, Callback)>>,
}

impl Subscribers {
    pub fn on(&self, event: Event, callback: Callback) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, event, callback));
        id
    }

    pub fn off(&self) {
        self.lock().clear();
    }

    pub fn off_event(&self, event: Event) {
        self.lock().retain(|(_, e, _)| *e != event);
    }

    pub fn off_subscriber(&self, id: SubscriberId) {
        self.lock().retain(|(i, _, _)| *i != id);
    }

    pub fn has(&self, event: Event) -> bool {
        self.lock().iter().any(|(_, e, _)| *e == event)
    }

    /// Invoke every callback registered for `event`. A panicking callback does not prevent the
    /// others from running.
    pub fn emit(&self, event: Event, payload: &str) {
        let callbacks: Vec<Callback> = self
            .lock()
            .iter()
            .filter(|(_, e, _)| *e == event)
            .map(|(_, _, callback)| callback.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                log::warn!(target: "ff", event = event.to_string().as_str(); "subscriber panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriberId, Event, Callback)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
