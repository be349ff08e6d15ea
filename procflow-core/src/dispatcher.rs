//! Engine-wide event dispatcher.
//!
//! A second notification channel, distinct from execution listeners: these
//! events describe engine-level facts (instance started, job scheduled) and
//! fan out to registered observers. Observers are isolated by default; one
//! can opt into failing the surrounding command.

use crate::context::CommandContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEventType {
    ProcessStarted,
    ProcessCompleted,
    ActivityStarted,
    ActivityCompleted,
    SequenceFlowTaken,
    JobScheduled,
    JobExecuted,
    JobFailed,
}

/// One engine-level event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: EngineEventType,
    pub process_definition_id: Option<String>,
    pub process_instance_id: Option<Uuid>,
    pub execution_id: Option<String>,
    /// Snapshot of the entity the event is about.
    #[serde(default)]
    pub entity: serde_json::Value,
}

impl EngineEvent {
    pub fn new(event_type: EngineEventType) -> Self {
        Self {
            event_type,
            process_definition_id: None,
            process_instance_id: None,
            execution_id: None,
            entity: serde_json::Value::Null,
        }
    }

    pub fn definition(mut self, id: impl Into<String>) -> Self {
        self.process_definition_id = Some(id.into());
        self
    }

    pub fn instance(mut self, id: Uuid) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn execution(mut self, id: impl ToString) -> Self {
        self.execution_id = Some(id.to_string());
        self
    }

    pub fn entity(mut self, entity: serde_json::Value) -> Self {
        self.entity = entity;
        self
    }
}

/// Observer of engine-level events.
///
/// `on_event` must not block; heavy work belongs on a channel. Errors are
/// logged and swallowed unless [`fail_on_exception`](Self::fail_on_exception)
/// returns true, in which case the first error aborts dispatch and fails the
/// surrounding command.
pub trait EngineEventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent) -> anyhow::Result<()>;

    fn fail_on_exception(&self) -> bool {
        false
    }
}

/// Immutable dispatch table built once at engine configuration time.
#[derive(Default)]
pub struct EventDispatcherBuilder {
    global: Vec<Arc<dyn EngineEventListener>>,
    typed: HashMap<EngineEventType, Vec<Arc<dyn EngineEventListener>>>,
}

impl EventDispatcherBuilder {
    pub fn listener(mut self, listener: Arc<dyn EngineEventListener>) -> Self {
        self.global.push(listener);
        self
    }

    pub fn typed_listener(
        mut self,
        event_type: EngineEventType,
        listener: Arc<dyn EngineEventListener>,
    ) -> Self {
        self.typed.entry(event_type).or_default().push(listener);
        self
    }

    pub fn build(self) -> EventDispatcher {
        EventDispatcher {
            global: self.global,
            typed: self.typed,
            enabled: true,
        }
    }
}

pub struct EventDispatcher {
    global: Vec<Arc<dyn EngineEventListener>>,
    typed: HashMap<EngineEventType, Vec<Arc<dyn EngineEventListener>>>,
    enabled: bool,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        EventDispatcherBuilder::default().build()
    }
}

impl EventDispatcher {
    pub fn builder() -> EventDispatcherBuilder {
        EventDispatcherBuilder::default()
    }

    pub fn disabled() -> Self {
        Self {
            global: Vec::new(),
            typed: HashMap::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Dispatch one event: global listeners first, then listeners registered
    /// for the event's type, each at most once (identity-deduplicated).
    ///
    /// The definition-local listeners of the definition the event belongs to
    /// get a secondary delivery; failures there are logged and never fail the
    /// command. The owning definition is resolved from the event itself, then
    /// the ambient command context, then the entity snapshot.
    pub fn dispatch(
        &self,
        event: &EngineEvent,
        command: &CommandContext,
        definitions: Option<&crate::model::DefinitionRegistry>,
    ) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut seen: Vec<*const ()> = Vec::new();
        for listener in self
            .global
            .iter()
            .chain(self.typed.get(&event.event_type).into_iter().flatten())
        {
            let ptr = Arc::as_ptr(listener) as *const ();
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            if let Err(err) = listener.on_event(event) {
                if listener.fail_on_exception() {
                    return Err(err);
                }
                warn!(event_type = ?event.event_type, error = %err, "event listener failed, continuing");
            }
        }

        if let Some(registry) = definitions {
            if let Some(def) = self
                .resolve_definition_id(event, command)
                .and_then(|id| registry.lookup(&id))
            {
                for listener in &def.dispatch_listeners {
                    if let Err(err) = listener.on_event(event) {
                        warn!(
                            definition = %def.id,
                            event_type = ?event.event_type,
                            error = %err,
                            "definition event listener failed, continuing"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_definition_id(
        &self,
        event: &EngineEvent,
        command: &CommandContext,
    ) -> Option<String> {
        if let Some(id) = &event.process_definition_id {
            return Some(id.clone());
        }
        if let Some(id) = &command.definition_id {
            return Some(id.clone());
        }
        event
            .entity
            .get("process_definition_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingEventListener;
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn global_listeners_fire_before_typed_ones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::builder()
            .typed_listener(
                EngineEventType::ProcessStarted,
                RecordingEventListener::new("typed", log.clone()),
            )
            .listener(RecordingEventListener::new("global", log.clone()))
            .build();

        dispatcher
            .dispatch(
                &EngineEvent::new(EngineEventType::ProcessStarted),
                &CommandContext::new(),
                None,
            )
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["global:ProcessStarted", "typed:ProcessStarted"]
        );
    }

    #[test]
    fn listener_registered_both_ways_fires_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = RecordingEventListener::new("both", log.clone());
        let dispatcher = EventDispatcher::builder()
            .listener(listener.clone())
            .typed_listener(EngineEventType::JobScheduled, listener)
            .build();

        dispatcher
            .dispatch(
                &EngineEvent::new(EngineEventType::JobScheduled),
                &CommandContext::new(),
                None,
            )
            .unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn failure_is_swallowed_unless_opted_in() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::builder()
            .listener(RecordingEventListener::failing("soft", log.clone(), false))
            .listener(RecordingEventListener::new("after", log.clone()))
            .build();
        dispatcher
            .dispatch(
                &EngineEvent::new(EngineEventType::ActivityStarted),
                &CommandContext::new(),
                None,
            )
            .unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);

        let strict = EventDispatcher::builder()
            .listener(RecordingEventListener::failing("hard", log.clone(), true))
            .listener(RecordingEventListener::new("never", log.clone()))
            .build();
        let err = strict.dispatch(
            &EngineEvent::new(EngineEventType::ActivityStarted),
            &CommandContext::new(),
            None,
        );
        assert!(err.is_err());
        // The listener after the failing one never ran.
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn definition_id_resolution_falls_back_to_command_then_entity() {
        let dispatcher = EventDispatcher::default();
        let event = EngineEvent::new(EngineEventType::JobExecuted);
        let command = CommandContext::new().with_definition("from-command");
        assert_eq!(
            dispatcher.resolve_definition_id(&event, &command).as_deref(),
            Some("from-command")
        );

        let event = event.entity(serde_json::json!({ "process_definition_id": "from-entity" }));
        assert_eq!(
            dispatcher
                .resolve_definition_id(&event, &CommandContext::new())
                .as_deref(),
            Some("from-entity")
        );

        let event = event.definition("from-event");
        assert_eq!(
            dispatcher.resolve_definition_id(&event, &command).as_deref(),
            Some("from-event")
        );
    }
}
