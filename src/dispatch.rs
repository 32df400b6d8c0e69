//! Event dispatch: a bounded handoff from the reader task to a dispatcher
//! task that routes each event to a handler by `Event-Name`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{error::EslError, event::EslEvent};

/// Callback invoked for a dispatched event.
///
/// Handlers run on the connection's dispatcher task, never on the reader
/// task. A handler that needs to await should spawn its own task.
pub type EventHandler = Arc<dyn Fn(EslEvent) + Send + Sync>;

pub(crate) type EventItem = Result<EslEvent, EslError>;

/// Handler routing table shared by the client handle and the dispatcher task.
#[derive(Clone, Default)]
pub(crate) struct HandlerTable {
    inner: Arc<RwLock<Handlers>>,
}

#[derive(Default)]
struct Handlers {
    by_name: HashMap<String, EventHandler>,
    fallback: Option<EventHandler>,
}

impl HandlerTable {
    /// Register a handler for an event name (`CHANNEL_ANSWER`) or a custom
    /// subclass (`CUSTOM conference::maintenance`). Replaces any previous one.
    pub(crate) fn register(&self, event_name: &str, handler: EventHandler) {
        let mut handlers = self
            .inner
            .write()
            .unwrap_or_else(|p| p.into_inner());
        handlers
            .by_name
            .insert(normalize_key(event_name), handler);
    }

    pub(crate) fn unregister(&self, event_name: &str) -> bool {
        let mut handlers = self
            .inner
            .write()
            .unwrap_or_else(|p| p.into_inner());
        handlers
            .by_name
            .remove(&normalize_key(event_name))
            .is_some()
    }

    pub(crate) fn set_fallback(&self, handler: Option<EventHandler>) {
        let mut handlers = self
            .inner
            .write()
            .unwrap_or_else(|p| p.into_inner());
        handlers.fallback = handler;
    }

    /// Pick the handler for an event: subclass match, then name, then fallback.
    fn lookup(&self, event: &EslEvent) -> Option<EventHandler> {
        let handlers = self
            .inner
            .read()
            .unwrap_or_else(|p| p.into_inner());
        let name = event.event_name();

        if let (Some(name), Some(subclass)) = (name, event.event_subclass()) {
            let key = normalize_key(&format!("{} {}", name, subclass));
            if let Some(h) = handlers
                .by_name
                .get(&key)
            {
                return Some(h.clone());
            }
        }

        name.and_then(|n| {
            handlers
                .by_name
                .get(&normalize_key(n))
                .cloned()
        })
        .or_else(|| {
            handlers
                .fallback
                .clone()
        })
    }
}

fn normalize_key(name: &str) -> String {
    match name.split_once(' ') {
        Some((event, subclass)) => format!("{} {}", event.to_ascii_uppercase(), subclass.trim()),
        None => name.to_ascii_uppercase(),
    }
}

/// Sending side of the bounded queue between the reader and dispatcher tasks.
///
/// Never blocks: when the queue is full the event is dropped, counted, and a
/// single [`EslError::QueueFull`] notice is delivered once room frees up.
pub(crate) struct EventQueue {
    tx: mpsc::Sender<EventItem>,
    overflow: AtomicBool,
    dropped: Arc<AtomicU64>,
}

impl EventQueue {
    pub(crate) fn new(tx: mpsc::Sender<EventItem>, dropped: Arc<AtomicU64>) -> Self {
        Self {
            tx,
            overflow: AtomicBool::new(false),
            dropped,
        }
    }

    /// Returns `false` once the dispatcher side is gone.
    pub(crate) fn push(&self, item: EventItem) -> bool {
        if self
            .overflow
            .load(Ordering::Relaxed)
        {
            match self
                .tx
                .try_send(Err(EslError::QueueFull))
            {
                Ok(()) => self
                    .overflow
                    .store(false, Ordering::Relaxed),
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        match self
            .tx
            .try_send(item)
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow
                    .store(true, Ordering::Relaxed);
                self.dropped
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Event queue full, dropping event");
                true
            }
        }
    }
}

/// Dispatcher task body. Events with a matching handler go to it; the rest
/// (and queue notices) go to the application's event stream.
pub(crate) async fn run_dispatcher(
    mut rx: mpsc::Receiver<EventItem>,
    handlers: HandlerTable,
    stream_tx: mpsc::Sender<EventItem>,
) {
    let mut stream_open = true;
    while let Some(item) = rx
        .recv()
        .await
    {
        match item {
            Ok(event) => match handlers.lookup(&event) {
                Some(handler) => {
                    trace!("[DISPATCH] {:?} to handler", event.event_name());
                    handler(event);
                }
                None if stream_open => {
                    stream_open = stream_tx
                        .send(Ok(event))
                        .await
                        .is_ok();
                }
                None => debug!("[DISPATCH] no handler and no stream, dropping event"),
            },
            Err(e) if stream_open => {
                stream_open = stream_tx
                    .send(Err(e))
                    .await
                    .is_ok();
            }
            Err(e) => debug!("[DISPATCH] dropping notice: {}", e),
        }
    }
    debug!("[DISPATCH] reader gone, dispatcher exiting");
}
