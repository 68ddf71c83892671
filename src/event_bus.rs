//! Event Bus: pattern-matched pub/sub with handler isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

/// A single published event. `module_name` is `None` for bus-wide events
/// that aren't about a specific module.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub module_name: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, module_name: Option<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            module_name,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Event type constants that are part of the external wire contract —
/// downstream subscribers match on these exact strings.
pub mod event_type {
    pub const LOADED: &str = "module.loaded";
    pub const INSTALLED: &str = "module.installed";
    pub const STARTED: &str = "module.started";
    pub const STOPPED: &str = "module.stopped";
    pub const UNINSTALLED: &str = "module.uninstalled";
    pub const UNLOADED: &str = "module.unloaded";
    pub const STATE_CHANGED: &str = "module.state_changed";
    pub const RELOADED: &str = "module.reloaded";
    pub const ERROR: &str = "module.error";
}

/// A handler invoked for every event that matches its subscription
/// pattern. Async by nature; a synchronous handler is simply one whose
/// body never awaits, the same dispatch story as `ModuleInstance`'s hooks.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(&Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Opaque handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct Subscription {
    pattern: String,
    handler: Arc<dyn EventHandler>,
    /// Monotonic registration order, used to guarantee earlier
    /// subscribers run before later ones for the same event.
    seq: u64,
}

/// Pattern-matched pub/sub bus. The subscription table is guarded by a
/// single read-write lock: `publish` takes only the read side,
/// `subscribe`/`unsubscribe` take the write side.
pub struct EventBus {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_seq: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// `pattern` is `"*"` (match everything), an exact event type, or a
    /// dot-delimited pattern where any segment may be `*` to match exactly
    /// one segment (no multi-segment globbing).
    pub fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().insert(
            id,
            Subscription {
                pattern: pattern.into(),
                handler,
                seq,
            },
        );
        id
    }

    /// Idempotent: unsubscribing an already-removed (or unknown) handle is
    /// a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().remove(&id);
    }

    /// Publishes `event` to every currently-matching subscription, in
    /// registration order, awaiting each handler in turn. A handler that
    /// returns an error does not prevent the rest from running: the bus
    /// catches the failure and publishes a `module.error` event describing
    /// it (without recursing through this same error path).
    pub async fn publish(&self, event: Event) {
        // Snapshot under the read lock so a handler subscribing mid-publish
        // only affects subsequent events, never the one it was registered
        // during.
        let mut matched: Vec<(SubscriptionId, u64, Arc<dyn EventHandler>)> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|(_, s)| Self::matches(&s.pattern, &event.event_type))
                .map(|(id, s)| (*id, s.seq, s.handler.clone()))
                .collect()
        };
        matched.sort_by_key(|(_, seq, _)| *seq);

        tracing::debug!(
            event_type = %event.event_type,
            module = ?event.module_name,
            matched = matched.len(),
            "publishing event"
        );

        for (id, _, handler) in matched {
            if let Err(err) = handler.handle(&event).await {
                tracing::warn!(
                    subscription = ?id,
                    event_type = %event.event_type,
                    error = %err,
                    "event handler failed"
                );
                if event.event_type != event_type::ERROR {
                    let error_event = Event::new(
                        event_type::ERROR,
                        event.module_name.clone(),
                        serde_json::json!({
                            "source_event": event.event_type,
                            "reason": err.to_string(),
                        }),
                    );
                    // Deliver directly (not via recursive `publish`) so a
                    // failing handler on `module.error` itself can't loop.
                    self.deliver_without_failure_events(error_event).await;
                }
            }
        }
    }

    async fn deliver_without_failure_events(&self, event: Event) {
        let mut matched: Vec<(u64, Arc<dyn EventHandler>)> = {
            let subs = self.subscriptions.read();
            subs.values()
                .filter(|s| Self::matches(&s.pattern, &event.event_type))
                .map(|s| (s.seq, s.handler.clone()))
                .collect()
        };
        matched.sort_by_key(|(seq, _)| *seq);
        for (_, handler) in matched {
            if let Err(err) = handler.handle(&event).await {
                tracing::warn!(error = %err, "handler for module.error itself failed; dropping");
            }
        }
    }

    fn matches(pattern: &str, event_type: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if pattern == event_type {
            return true;
        }
        let pattern_segments: Vec<&str> = pattern.split('.').collect();
        let type_segments: Vec<&str> = event_type.split('.').collect();
        if pattern_segments.len() != type_segments.len() {
            return false;
        }
        pattern_segments
            .iter()
            .zip(type_segments.iter())
            .all(|(p, t)| *p == "*" || p == t)
    }
}
