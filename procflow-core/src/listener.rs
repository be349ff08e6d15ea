use crate::execution::ExecutionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Wildcard event name: listeners registered under it fire for every event
/// of their scope, after the exact-match registrations.
pub const ALL_EVENTS: &str = "*";

pub const EVENT_START: &str = "start";
pub const EVENT_END: &str = "end";
pub const EVENT_TAKE: &str = "take";

/// What a lifecycle event was fired on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Process(String),
    Activity(String),
    Transition(String),
}

/// Context handed to an execution listener while it runs.
///
/// `variables` is the execution's own (scope-local) variable map; mutations
/// land back on the execution when the listener returns.
pub struct ListenerContext<'a> {
    pub event_name: &'a str,
    pub event_source: &'a EventSource,
    pub execution_id: ExecutionId,
    pub process_instance_id: Uuid,
    pub actor: Option<&'a str>,
    pub variables: &'a mut HashMap<String, serde_json::Value>,
}

/// A listener capability bound to a (scope, event-name) pair.
///
/// Notification is synchronous with respect to the operation that fires it:
/// an error aborts the whole step and propagates. There is no per-listener
/// isolation at this layer (the event dispatcher does isolate).
#[async_trait]
pub trait ExecutionListener: Send + Sync {
    async fn notify(&self, ctx: &mut ListenerContext<'_>) -> anyhow::Result<()>;
}

/// Declared implementation of a listener, resolved once at graph-build time.
#[derive(Clone)]
pub enum ListenerSpec {
    /// An already-constructed capability.
    NativeType(Arc<dyn ExecutionListener>),
    /// An expression the embedder's factory turns into a capability.
    Expression(String),
    /// A delegate expression resolved against the embedder's registry.
    DelegateExpression(String),
}

/// Resolves declared listener implementations to capabilities.
///
/// Resolution happens exactly once, while the graph is built — never per
/// invocation.
pub trait ListenerFactory: Send + Sync {
    fn resolve(&self, spec: &ListenerSpec) -> anyhow::Result<Arc<dyn ExecutionListener>>;
}

/// Factory for graphs that only use pre-constructed listeners.
pub struct NativeListenerFactory;

impl ListenerFactory for NativeListenerFactory {
    fn resolve(&self, spec: &ListenerSpec) -> anyhow::Result<Arc<dyn ExecutionListener>> {
        match spec {
            ListenerSpec::NativeType(listener) => Ok(listener.clone()),
            ListenerSpec::Expression(expr) => {
                anyhow::bail!("no expression support configured (listener expression `{expr}`)")
            }
            ListenerSpec::DelegateExpression(expr) => anyhow::bail!(
                "no delegate-expression support configured (listener delegate `{expr}`)"
            ),
        }
    }
}

/// Ordered listener registrations for one scope, keyed by event name.
#[derive(Clone, Default)]
pub struct ListenerMap {
    by_event: HashMap<String, Vec<Arc<dyn ExecutionListener>>>,
}

impl ListenerMap {
    pub fn add(&mut self, event: impl Into<String>, listener: Arc<dyn ExecutionListener>) {
        self.by_event.entry(event.into()).or_default().push(listener);
    }

    /// Listeners for an event: exact matches first, then `*` registrations.
    pub fn for_event(&self, event: &str) -> Vec<Arc<dyn ExecutionListener>> {
        let mut out = Vec::new();
        if let Some(exact) = self.by_event.get(event) {
            out.extend(exact.iter().cloned());
        }
        if event != ALL_EVENTS {
            if let Some(wildcard) = self.by_event.get(ALL_EVENTS) {
                out.extend(wildcard.iter().cloned());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every notification it receives, for ordering assertions.
    pub struct RecordingListener {
        pub label: String,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingListener {
        pub fn new(label: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                log,
            })
        }
    }

    #[async_trait]
    impl ExecutionListener for RecordingListener {
        async fn notify(&self, ctx: &mut ListenerContext<'_>) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, ctx.event_name));
            Ok(())
        }
    }

    /// Always fails, for propagation assertions.
    pub struct FailingListener;

    #[async_trait]
    impl ExecutionListener for FailingListener {
        async fn notify(&self, _ctx: &mut ListenerContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingListener;
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn exact_matches_ordered_before_wildcard() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut map = ListenerMap::default();
        map.add(EVENT_START, RecordingListener::new("a", log.clone()));
        map.add(ALL_EVENTS, RecordingListener::new("w", log.clone()));
        map.add(EVENT_START, RecordingListener::new("b", log));

        let listeners = map.for_event(EVENT_START);
        assert_eq!(listeners.len(), 3);
        // Wildcard comes last even though it was registered in the middle.
        let names = map.for_event(EVENT_END);
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn native_factory_rejects_expression_kinds() {
        let factory = NativeListenerFactory;
        assert!(factory
            .resolve(&ListenerSpec::Expression("${foo}".into()))
            .is_err());
        assert!(factory
            .resolve(&ListenerSpec::DelegateExpression("${bean}".into()))
            .is_err());
    }
}
