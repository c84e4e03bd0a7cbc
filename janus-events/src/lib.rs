//! Topic-keyed publish/subscribe router.
//!
//! The router is the serialization point for engine state fan-out: the
//! broker publishes every normalized event under a global topic plus
//! narrower topics scoped by strategy id, symbol, or client order id, and
//! handlers fire synchronously on the publishing thread in registration
//! order. Topics are structured keys (kind + optional qualifier) so a
//! symbol name can never collide with a strategy id.

use janus_core::{Bar, Depth, Funding, Heartbeat, Order, Trade};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Coarse event classification, the first half of a topic key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Order,
    Trade,
    Bar,
    Depth,
    Funding,
    Heartbeat,
}

/// A normalized engine event, as emitted by adapters, the matcher, the
/// scheduler, or the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    Order(Order),
    Trade(Trade),
    Bar(Bar),
    Depth(Depth),
    Funding(Funding),
    Heartbeat(Heartbeat),
}

impl EngineEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Order(_) => EventKind::Order,
            EngineEvent::Trade(_) => EventKind::Trade,
            EngineEvent::Bar(_) => EventKind::Bar,
            EngineEvent::Depth(_) => EventKind::Depth,
            EngineEvent::Funding(_) => EventKind::Funding,
            EngineEvent::Heartbeat(_) => EventKind::Heartbeat,
        }
    }
}

/// Structured routing key: an event kind, optionally narrowed by a
/// qualifier (strategy id, symbol, or client order id depending on kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: EventKind,
    pub qualifier: Option<String>,
}

impl Topic {
    #[must_use]
    pub fn global(kind: EventKind) -> Self {
        Self {
            kind,
            qualifier: None,
        }
    }

    #[must_use]
    pub fn scoped(kind: EventKind, qualifier: impl Into<String>) -> Self {
        Self {
            kind,
            qualifier: Some(qualifier.into()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{:?}/{q}", self.kind),
            None => write!(f, "{:?}/*", self.kind),
        }
    }
}

/// Caller-supplied registration token. Handler identity is defined by the
/// (topic, id) pair since closures carry no usable equality.
pub type HandlerId = String;

pub type Handler = Arc<dyn Fn(&EngineEvent) -> anyhow::Result<()> + Send + Sync>;

/// Synchronous fan-out dispatcher. Registration may happen from any
/// thread; delivery runs on whichever thread calls [`publish`].
///
/// [`publish`]: EventRouter::publish
#[derive(Default)]
pub struct EventRouter {
    handlers: Mutex<HashMap<Topic, Vec<(HandlerId, Handler)>>>,
}

impl EventRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<Topic, Vec<(HandlerId, Handler)>>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` under `topic`. Idempotent: a second registration
    /// with the same (topic, id) pair is a no-op.
    pub fn register<F>(&self, topic: Topic, id: impl Into<HandlerId>, handler: F)
    where
        F: Fn(&EngineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = id.into();
        let mut handlers = self.guard();
        let entries = handlers.entry(topic).or_default();
        if entries.iter().any(|(existing, _)| *existing == id) {
            return;
        }
        entries.push((id, Arc::new(handler)));
    }

    /// Remove the handler registered under (topic, id). Unknown pairs are
    /// silently ignored.
    pub fn unregister(&self, topic: &Topic, id: &str) {
        let mut handlers = self.guard();
        if let Some(entries) = handlers.get_mut(topic) {
            entries.retain(|(existing, _)| existing != id);
            if entries.is_empty() {
                handlers.remove(topic);
            }
        }
    }

    /// Deliver `event` to every handler registered under `topic`, in
    /// registration order, against a snapshot of the current handler list.
    /// A failing handler is logged and skipped; it never prevents delivery
    /// to the handlers after it.
    pub fn publish(&self, topic: &Topic, event: &EngineEvent) {
        let snapshot: Vec<(HandlerId, Handler)> = {
            let handlers = self.guard();
            match handlers.get(topic) {
                Some(entries) => entries.clone(),
                None => return,
            }
        };
        for (id, handler) in snapshot {
            if let Err(error) = handler(event) {
                tracing::error!(topic = %topic, handler = %id, %error, "event handler failed");
            }
        }
    }

    /// Publish `event` under its global topic and then under each scoped
    /// topic in `qualifiers`, in order.
    pub fn fan_out(&self, event: &EngineEvent, qualifiers: &[&str]) {
        let kind = event.kind();
        self.publish(&Topic::global(kind), event);
        for q in qualifiers {
            self.publish(&Topic::scoped(kind, *q), event);
        }
    }

    /// Number of handlers currently registered under `topic`.
    #[must_use]
    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.guard().get(topic).map_or(0, Vec::len)
    }
}
