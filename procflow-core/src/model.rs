//! Immutable-after-build process graph definitions.
//!
//! The kernel never parses source markup: an external builder produces these
//! structures (typically through [`ProcessDefinitionBuilder`]) and hands them
//! over fully wired. Listener implementations are resolved exactly once here,
//! at build time, via the [`ListenerFactory`] seam.

use crate::dispatcher::EngineEventListener;
use crate::error::EngineError;
use crate::expression::{Condition, ValueExpression};
use crate::listener::{ExecutionListener, ListenerFactory, ListenerMap, ListenerSpec};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Property marking an activity as a compensation handler.
pub const PROP_FOR_COMPENSATION: &str = "is-for-compensation";
/// Property marking an activity as an asynchronous continuation boundary.
pub const PROP_ASYNC: &str = "async";

/// Built-in behavior tags.
pub const BEHAVIOR_TASK: &str = "task";
pub const BEHAVIOR_RECEIVE: &str = "receive";
pub const BEHAVIOR_EXCLUSIVE_GATEWAY: &str = "exclusive-gateway";
pub const BEHAVIOR_PARALLEL_GATEWAY: &str = "parallel-gateway";
pub const BEHAVIOR_SUBPROCESS: &str = "subprocess";

/// A node in the process graph.
pub struct ActivityDefinition {
    pub id: String,
    /// Enclosing composite activity, `None` for the process root scope.
    pub parent: Option<String>,
    /// Outgoing transition ids, in declared order.
    pub outgoing: Vec<String>,
    /// Incoming transition ids.
    pub incoming: Vec<String>,
    pub default_transition: Option<String>,
    /// True for regions that need explicit create/destroy bookkeeping;
    /// false composites are transparent pass-through regions.
    pub is_scope: bool,
    /// Start activity for composite activities.
    pub initial_activity: Option<String>,
    /// Tag selecting the algorithm that executes this activity.
    pub behavior: String,
    pub properties: HashMap<String, serde_json::Value>,
    pub listeners: ListenerMap,
}

impl ActivityDefinition {
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }
}

/// A directed edge between two activities.
pub struct TransitionDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<Arc<dyn Condition>>,
    pub skip_expression: Option<Arc<dyn ValueExpression>>,
    /// Variable name that enables skip-expression evaluation for this
    /// transition; falls back to `skipExpressionEnabled`.
    pub skip_enabled_flag: Option<String>,
    /// Ordered "take" listeners.
    pub take_listeners: Vec<Arc<dyn ExecutionListener>>,
}

/// A complete, validated, immutable process graph.
pub struct ProcessDefinition {
    pub id: String,
    pub initial_activity: String,
    activities: HashMap<String, ActivityDefinition>,
    transitions: HashMap<String, TransitionDefinition>,
    /// Process-level (root scope) listener registrations.
    pub listeners: ListenerMap,
    /// Definition-local dispatch listeners (the secondary channel of the
    /// engine-wide event dispatcher).
    pub dispatch_listeners: Vec<Arc<dyn EngineEventListener>>,
    pub properties: HashMap<String, serde_json::Value>,
}

impl ProcessDefinition {
    pub fn activity(&self, id: &str) -> Result<&ActivityDefinition, EngineError> {
        self.activities
            .get(id)
            .ok_or_else(|| EngineError::UnknownActivity(id.to_string()))
    }

    pub fn transition(&self, id: &str) -> Result<&TransitionDefinition, EngineError> {
        self.transitions
            .get(id)
            .ok_or_else(|| EngineError::UnknownTransition(id.to_string()))
    }

    pub fn activities(&self) -> impl Iterator<Item = &ActivityDefinition> {
        self.activities.values()
    }

    /// Nearest enclosing scope-flagged activity, skipping transparent
    /// composites. `None` means the process root scope.
    pub fn enclosing_scope(&self, activity_id: &str) -> Option<String> {
        let mut cursor = self.activities.get(activity_id)?.parent.clone();
        while let Some(id) = cursor {
            let act = self.activities.get(&id)?;
            if act.is_scope {
                return Some(id);
            }
            cursor = act.parent.clone();
        }
        None
    }

    /// True if `activity_id` lies (strictly) within the region of `scope_id`.
    pub fn within_scope(&self, activity_id: &str, scope_id: &str) -> bool {
        let mut cursor = self
            .activities
            .get(activity_id)
            .and_then(|a| a.parent.clone());
        while let Some(id) = cursor {
            if id == scope_id {
                return true;
            }
            cursor = self.activities.get(&id).and_then(|a| a.parent.clone());
        }
        false
    }

    /// Ancestor chain of the configured start activity, outermost first and
    /// ending with the start activity itself. Precomputed so process start
    /// enters scoped start activities from the outside in.
    pub fn initial_stack(&self) -> Vec<String> {
        let mut stack = vec![self.initial_activity.clone()];
        let mut cursor = self
            .activities
            .get(&self.initial_activity)
            .and_then(|a| a.parent.clone());
        while let Some(id) = cursor {
            cursor = self.activities.get(&id).and_then(|a| a.parent.clone());
            stack.push(id);
        }
        stack.reverse();
        stack
    }
}

// Listener and expression fields are trait objects; print the graph shape.
impl fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessDefinition")
            .field("id", &self.id)
            .field("initial_activity", &self.initial_activity)
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .field("transitions", &self.transitions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ─── Builder ──────────────────────────────────────────────────

/// Declared activity, before listener resolution and validation.
pub struct ActivitySpec {
    id: String,
    behavior: String,
    parent: Option<String>,
    is_scope: bool,
    initial_activity: Option<String>,
    default_transition: Option<String>,
    properties: HashMap<String, serde_json::Value>,
    listeners: Vec<(String, ListenerSpec)>,
}

impl ActivitySpec {
    pub fn new(id: impl Into<String>, behavior: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            behavior: behavior.into(),
            parent: None,
            is_scope: false,
            initial_activity: None,
            default_transition: None,
            properties: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, BEHAVIOR_TASK)
    }

    pub fn in_scope(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn scope(mut self, initial_activity: impl Into<String>) -> Self {
        self.is_scope = true;
        self.initial_activity = Some(initial_activity.into());
        self
    }

    pub fn default_transition(mut self, transition: impl Into<String>) -> Self {
        self.default_transition = Some(transition.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn listener(mut self, event: impl Into<String>, spec: ListenerSpec) -> Self {
        self.listeners.push((event.into(), spec));
        self
    }
}

/// Declared transition, before wiring.
pub struct TransitionSpec {
    id: String,
    source: String,
    target: String,
    condition: Option<Arc<dyn Condition>>,
    skip_expression: Option<Arc<dyn ValueExpression>>,
    skip_enabled_flag: Option<String>,
    take_listeners: Vec<ListenerSpec>,
}

impl TransitionSpec {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            skip_expression: None,
            skip_enabled_flag: None,
            take_listeners: Vec::new(),
        }
    }

    pub fn condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn skip_expression(mut self, expr: Arc<dyn ValueExpression>) -> Self {
        self.skip_expression = Some(expr);
        self
    }

    pub fn skip_enabled_flag(mut self, flag: impl Into<String>) -> Self {
        self.skip_enabled_flag = Some(flag.into());
        self
    }

    pub fn take_listener(mut self, spec: ListenerSpec) -> Self {
        self.take_listeners.push(spec);
        self
    }
}

pub struct ProcessDefinitionBuilder {
    id: String,
    initial_activity: Option<String>,
    activities: Vec<ActivitySpec>,
    transitions: Vec<TransitionSpec>,
    listeners: Vec<(String, ListenerSpec)>,
    dispatch_listeners: Vec<Arc<dyn EngineEventListener>>,
    properties: HashMap<String, serde_json::Value>,
}

impl ProcessDefinitionBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial_activity: None,
            activities: Vec::new(),
            transitions: Vec::new(),
            listeners: Vec::new(),
            dispatch_listeners: Vec::new(),
            properties: HashMap::new(),
        }
    }

    pub fn initial(mut self, activity: impl Into<String>) -> Self {
        self.initial_activity = Some(activity.into());
        self
    }

    pub fn activity(mut self, spec: ActivitySpec) -> Self {
        self.activities.push(spec);
        self
    }

    pub fn transition(mut self, spec: TransitionSpec) -> Self {
        self.transitions.push(spec);
        self
    }

    pub fn process_listener(mut self, event: impl Into<String>, spec: ListenerSpec) -> Self {
        self.listeners.push((event.into(), spec));
        self
    }

    pub fn dispatch_listener(mut self, listener: Arc<dyn EngineEventListener>) -> Self {
        self.dispatch_listeners.push(listener);
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Validate and wire the graph. Listener specs are resolved here, once.
    pub fn build(self, factory: &dyn ListenerFactory) -> Result<ProcessDefinition, EngineError> {
        let initial = self
            .initial_activity
            .clone()
            .ok_or_else(|| EngineError::UnknownActivity("<no initial activity>".to_string()))?;

        let mut activities: HashMap<String, ActivityDefinition> = HashMap::new();
        for spec in self.activities {
            let mut listeners = ListenerMap::default();
            for (event, l) in &spec.listeners {
                listeners.add(event.clone(), factory.resolve(l)?);
            }
            activities.insert(
                spec.id.clone(),
                ActivityDefinition {
                    id: spec.id,
                    parent: spec.parent,
                    outgoing: Vec::new(),
                    incoming: Vec::new(),
                    default_transition: spec.default_transition,
                    is_scope: spec.is_scope,
                    initial_activity: spec.initial_activity,
                    behavior: spec.behavior,
                    properties: spec.properties,
                    listeners,
                },
            );
        }

        let mut transitions: HashMap<String, TransitionDefinition> = HashMap::new();
        for spec in self.transitions {
            let mut take_listeners = Vec::new();
            for l in &spec.take_listeners {
                take_listeners.push(factory.resolve(l)?);
            }
            match activities.get_mut(&spec.source) {
                Some(source) => source.outgoing.push(spec.id.clone()),
                None => return Err(EngineError::UnknownActivity(spec.source)),
            }
            match activities.get_mut(&spec.target) {
                Some(target) => target.incoming.push(spec.id.clone()),
                None => return Err(EngineError::UnknownActivity(spec.target)),
            }
            transitions.insert(
                spec.id.clone(),
                TransitionDefinition {
                    id: spec.id,
                    source: spec.source,
                    target: spec.target,
                    condition: spec.condition,
                    skip_expression: spec.skip_expression,
                    skip_enabled_flag: spec.skip_enabled_flag,
                    take_listeners,
                },
            );
        }

        // Structural validation: initial activity, parent links, declared
        // default transitions must resolve to real outgoing transitions.
        if !activities.contains_key(&initial) {
            return Err(EngineError::UnknownActivity(initial));
        }
        for act in activities.values() {
            if let Some(parent) = &act.parent {
                if !activities.contains_key(parent) {
                    return Err(EngineError::UnknownActivity(parent.clone()));
                }
            }
            if let Some(inner) = &act.initial_activity {
                if !activities.contains_key(inner) {
                    return Err(EngineError::MissingInitialActivity(act.id.clone()));
                }
            }
            if let Some(default) = &act.default_transition {
                if !act.outgoing.contains(default) {
                    return Err(EngineError::MissingDefaultTransition {
                        activity: act.id.clone(),
                        transition: default.clone(),
                    });
                }
            }
        }

        let mut listeners = ListenerMap::default();
        for (event, l) in &self.listeners {
            listeners.add(event.clone(), factory.resolve(l)?);
        }

        Ok(ProcessDefinition {
            id: self.id,
            initial_activity: initial,
            activities,
            transitions,
            listeners,
            dispatch_listeners: self.dispatch_listeners,
            properties: self.properties,
        })
    }
}

// ─── Registry ─────────────────────────────────────────────────

/// Immutable registry of built process definitions.
///
/// Constructed once at startup and passed by reference into whatever needs
/// it — definitions never register themselves through side effects.
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<ProcessDefinition>>,
}

impl DefinitionRegistry {
    pub fn new(definitions: impl IntoIterator<Item = ProcessDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.id.clone(), Arc::new(d)))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(id.to_string()))
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NativeListenerFactory;

    fn linear() -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new("p")
            .initial("a")
            .activity(ActivitySpec::task("a"))
            .activity(ActivitySpec::task("b"))
            .transition(TransitionSpec::new("t1", "a", "b"))
    }

    #[test]
    fn builds_and_wires_outgoing_order() {
        let def = linear().build(&NativeListenerFactory).unwrap();
        assert_eq!(def.activity("a").unwrap().outgoing, vec!["t1"]);
        assert_eq!(def.activity("b").unwrap().incoming, vec!["t1"]);
        assert_eq!(def.transition("t1").unwrap().target, "b");
    }

    #[test]
    fn rejects_default_transition_not_outgoing() {
        let err = ProcessDefinitionBuilder::new("p")
            .initial("a")
            .activity(ActivitySpec::task("a").default_transition("nope"))
            .activity(ActivitySpec::task("b"))
            .transition(TransitionSpec::new("t1", "a", "b"))
            .activity(ActivitySpec::task("c").default_transition("t1"))
            .build(&NativeListenerFactory)
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingDefaultTransition { .. }));
    }

    #[test]
    fn rejects_dangling_transition_endpoints() {
        let err = ProcessDefinitionBuilder::new("p")
            .initial("a")
            .activity(ActivitySpec::task("a"))
            .transition(TransitionSpec::new("t1", "a", "ghost"))
            .build(&NativeListenerFactory)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownActivity(a) if a == "ghost"));
    }

    #[test]
    fn initial_stack_walks_scopes_outermost_first() {
        let def = ProcessDefinitionBuilder::new("p")
            .initial("inner_start")
            .activity(ActivitySpec::new("outer", BEHAVIOR_SUBPROCESS).scope("inner"))
            .activity(ActivitySpec::new("inner", BEHAVIOR_SUBPROCESS).scope("inner_start").in_scope("outer"))
            .activity(ActivitySpec::task("inner_start").in_scope("inner"))
            .build(&NativeListenerFactory)
            .unwrap();
        assert_eq!(def.initial_stack(), vec!["outer", "inner", "inner_start"]);
        assert_eq!(def.enclosing_scope("inner_start").as_deref(), Some("inner"));
        assert!(def.within_scope("inner_start", "outer"));
        assert!(!def.within_scope("outer", "inner"));
    }
}
