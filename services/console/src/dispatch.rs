//! Event dispatcher: demultiplexes inbound stream messages to per-topic
//! subscriber callbacks.
//!
//! Handlers run synchronously in subscription order; a panicking handler is
//! isolated so the remaining handlers on the same event still run.  Every
//! subscription has a matching deregistration path — by token or by letting
//! a [`SubscriptionGuard`] fall out of scope.

use mw_protocol::ServerMessage;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Topics and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Weather,
    UserStats,
    TodaysIncidents,
    Traffic,
    CriticalIncidents,
    IncidentLocations,
    NewAlert,
    /// Free-form `new-incident` / `new-traffic` log entries.
    EventLog,
    /// Scalar `amt-*` gauges.
    Counter,
    /// `user-connected` / `user-disconnected` diagnostics.
    Presence,
    /// Connection manager signals, not server frames.
    Lifecycle,
}

/// Connection lifecycle signals, dispatched on [`Topic::Lifecycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    Connected,
    Disconnected,
    Error(String),
}

/// What a handler receives: either a parsed server frame or a lifecycle
/// signal from the connection manager.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Stream(Arc<ServerMessage>),
    Lifecycle(LifecycleSignal),
}

/// The topic a server frame is routed to.
pub fn topic_of(msg: &ServerMessage) -> Topic {
    match msg {
        ServerMessage::WeatherUpdate(_) => Topic::Weather,
        ServerMessage::UserStatsUpdate(_) => Topic::UserStats,
        ServerMessage::TodaysIncidentsUpdate(_) => Topic::TodaysIncidents,
        ServerMessage::TrafficUpdate(_) => Topic::Traffic,
        ServerMessage::CriticalIncidents(_) => Topic::CriticalIncidents,
        ServerMessage::IncidentLocations(_) => Topic::IncidentLocations,
        ServerMessage::NewAlert(_) => Topic::NewAlert,
        ServerMessage::NewIncidentLog(_) | ServerMessage::NewTrafficLog(_) => Topic::EventLog,
        ServerMessage::UsersOnline(_)
        | ServerMessage::ActiveIncidents(_)
        | ServerMessage::CriticalIncidentCount(_) => Topic::Counter,
        ServerMessage::UserConnected(_) | ServerMessage::UserDisconnected(_) => Topic::Presence,
        // Error frames are lifecycle-relevant, not data.
        ServerMessage::Error(_) => Topic::Lifecycle,
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&DispatchEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken {
    topic: Topic,
    id: u64,
}

struct DispatcherInner {
    handlers: HashMap<Topic, Vec<(u64, Handler)>>,
    next_id: u64,
}

#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Mutex<DispatcherInner>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DispatcherInner {
                handlers: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a handler; handlers on the same topic run in subscription
    /// order.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionToken
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .handlers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionToken { topic, id }
    }

    /// Scoped variant: the subscription is released when the guard drops.
    pub fn subscribe_scoped<F>(&self, topic: Topic, handler: F) -> SubscriptionGuard
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        SubscriptionGuard {
            dispatcher: self.clone(),
            token: Some(self.subscribe(topic, handler)),
        }
    }

    /// Unknown tokens are a no-op.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handlers) = inner.handlers.get_mut(&token.topic) {
            handlers.retain(|(id, _)| *id != token.id);
        }
    }

    /// Route a parsed server frame to its topic's subscribers.
    pub fn dispatch_message(&self, msg: ServerMessage) {
        let topic = topic_of(&msg);
        self.dispatch(topic, &DispatchEvent::Stream(Arc::new(msg)));
    }

    /// Fan a lifecycle signal out on [`Topic::Lifecycle`].
    pub fn dispatch_lifecycle(&self, signal: LifecycleSignal) {
        self.dispatch(Topic::Lifecycle, &DispatchEvent::Lifecycle(signal));
    }

    fn dispatch(&self, topic: Topic, event: &DispatchEvent) {
        // Snapshot the handler list so a handler can (un)subscribe without
        // deadlocking, and so a panic cannot poison the registry lock.
        let handlers: Vec<(u64, Handler)> = {
            let inner = self.inner.lock().unwrap();
            match inner.handlers.get(&topic) {
                Some(list) => list.clone(),
                None => {
                    debug!(?topic, "no subscribers");
                    return;
                }
            }
        };
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(?topic, handler = id, "subscriber panicked; continuing");
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its subscription when dropped.
pub struct SubscriptionGuard {
    dispatcher: EventDispatcher,
    token: Option<SubscriptionToken>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.dispatcher.unsubscribe(token);
        }
    }
}
