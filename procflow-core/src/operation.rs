//! The atomic-operation engine.
//!
//! Process execution advances as a flat agenda of small, individually
//! completable operations. Each operation does one indivisible piece of work
//! and enqueues what comes next; nothing recurses, so arbitrarily deep
//! process graphs run in constant stack space. Listener notification is
//! replayable: the execution record keeps a cursor of how many listeners of
//! the current protocol already completed, so a failed unit of work resumes
//! at the failing listener instead of re-running the earlier ones.

use crate::context::CommandContext;
use crate::dispatcher::{EngineEvent, EngineEventType, EventDispatcher};
use crate::error::EngineError;
use crate::execution::{ExecutionArena, ExecutionId};
use crate::expression::{is_truthy, EvalContext};
use crate::flows::{select_all, select_default, FlowSelection, StuckPolicy};
use crate::job::{ContinuationRequest, ContinuationScheduler};
use crate::listener::{
    EventSource, ExecutionListener, ListenerContext, EVENT_END, EVENT_START, EVENT_TAKE,
};
use crate::model::{DefinitionRegistry, ProcessDefinition, PROP_ASYNC};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::behavior::BehaviorRegistry;

/// Signal name delivered to the parent when a compensation handler ends.
pub const COMPENSATION_DONE: &str = "compensationDone";

/// One atomic step of process execution.
///
/// Serializable so an interrupted unit of work can record where it stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Operation {
    /// Notify process-level start listeners and stage the entry stack.
    ProcessStart,
    /// Descend one level of the entry stack toward the initial activity.
    ProcessStartInitial,
    /// Run the current activity's behavior (after its start listeners).
    ActivityExecute,
    /// Select outgoing flows for the current activity and leave it.
    ActivityLeave {
        policy: StuckPolicy,
        /// Fan out over every outgoing transition, ignoring conditions.
        #[serde(default)]
        unconditional: bool,
    },
    /// Notify end listeners of the activity being left.
    TransitionNotifyListenerEnd,
    /// Tear down scope state when the transition leaves a scope activity.
    TransitionDestroyScope,
    /// Notify take listeners of the current transition, then move the token.
    TransitionNotifyListenerTake,
}

/// Everything one unit of work needs, threaded explicitly.
///
/// Nothing in here relies on thread affinity; an operation may suspend and
/// the instance resume on a different worker.
pub struct OperationContext<'a> {
    def: &'a ProcessDefinition,
    behaviors: &'a BehaviorRegistry,
    dispatcher: &'a EventDispatcher,
    definitions: Option<&'a DefinitionRegistry>,
    command: &'a CommandContext,
    continuations: Option<&'a dyn ContinuationScheduler>,
    pub arena: &'a mut ExecutionArena,
    /// Execution resumed by a continuation job; its async boundary is
    /// already behind it.
    resumed: Option<ExecutionId>,
    stuck_policy: StuckPolicy,
    max_steps: usize,
    agenda: VecDeque<(ExecutionId, Operation)>,
}

impl<'a> OperationContext<'a> {
    pub fn new(
        def: &'a ProcessDefinition,
        behaviors: &'a BehaviorRegistry,
        dispatcher: &'a EventDispatcher,
        command: &'a CommandContext,
        arena: &'a mut ExecutionArena,
    ) -> Self {
        Self {
            def,
            behaviors,
            dispatcher,
            definitions: None,
            command,
            continuations: None,
            arena,
            resumed: None,
            stuck_policy: StuckPolicy::EndExecution,
            max_steps: 10_000,
            agenda: VecDeque::new(),
        }
    }

    pub fn with_definitions(mut self, definitions: &'a DefinitionRegistry) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn with_continuations(mut self, scheduler: &'a dyn ContinuationScheduler) -> Self {
        self.continuations = Some(scheduler);
        self
    }

    pub fn with_stuck_policy(mut self, policy: StuckPolicy) -> Self {
        self.stuck_policy = policy;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_resumed(mut self, execution: ExecutionId) -> Self {
        self.resumed = Some(execution);
        self
    }

    pub fn definition(&self) -> &'a ProcessDefinition {
        self.def
    }

    pub fn command(&self) -> &CommandContext {
        self.command
    }

    /// Drain the agenda, starting from one seed operation.
    pub async fn run(&mut self, execution: ExecutionId, op: Operation) -> Result<(), EngineError> {
        self.agenda.push_back((execution, op));
        self.drain().await
    }

    /// Drain whatever is already enqueued.
    pub async fn drain(&mut self) -> Result<(), EngineError> {
        let mut steps = 0usize;
        while let Some((exec, op)) = self.agenda.pop_front() {
            steps += 1;
            if steps > self.max_steps {
                return Err(EngineError::StepLimitExceeded(self.max_steps));
            }
            trace!(execution = %exec, ?op, "performing operation");
            self.step(exec, op).await?;
        }
        Ok(())
    }

    async fn step(&mut self, exec: ExecutionId, op: Operation) -> Result<(), EngineError> {
        match op {
            Operation::ProcessStart => self.process_start(exec).await,
            Operation::ProcessStartInitial => self.process_start_initial(exec).await,
            Operation::ActivityExecute => self.activity_execute(exec).await,
            Operation::ActivityLeave {
                policy,
                unconditional,
            } => self.activity_leave(exec, policy, unconditional).await,
            Operation::TransitionNotifyListenerEnd => self.notify_listener_end(exec).await,
            Operation::TransitionDestroyScope => self.destroy_scope(exec).await,
            Operation::TransitionNotifyListenerTake => self.notify_listener_take(exec).await,
        }
    }

    // ── Operations ──

    async fn process_start(&mut self, exec: ExecutionId) -> Result<(), EngineError> {
        let def = self.def;
        self.arena.get_mut(exec)?.start_stack = def.initial_stack();
        self.notify_listeners(
            exec,
            EVENT_START,
            EventSource::Process(def.id.clone()),
            def.listeners.for_event(EVENT_START),
        )
        .await?;
        self.dispatch(self.event(EngineEventType::ProcessStarted).execution(exec))?;
        self.agenda.push_back((exec, Operation::ProcessStartInitial));
        Ok(())
    }

    async fn process_start_initial(&mut self, exec: ExecutionId) -> Result<(), EngineError> {
        let def = self.def;
        let stack = self.arena.get(exec)?.start_stack.clone();
        let Some((next, rest)) = stack.split_first() else {
            return Err(EngineError::MissingInitialActivity(def.id.clone()));
        };
        self.arena.get_mut(exec)?.activity = Some(next.clone());
        if rest.is_empty() {
            // The initial activity itself; its own start protocol runs in
            // the execute operation.
            self.arena.get_mut(exec)?.start_stack.clear();
            self.agenda.push_back((exec, Operation::ActivityExecute));
            return Ok(());
        }

        // Entering an enclosing composite on the way down.
        let activity = def.activity(next)?;
        self.notify_listeners(
            exec,
            EVENT_START,
            EventSource::Activity(next.clone()),
            activity.listeners.for_event(EVENT_START),
        )
        .await?;
        self.dispatch(self.event(EngineEventType::ActivityStarted).execution(exec).entity(
            serde_json::json!({ "activity_id": next }),
        ))?;
        if activity.is_scope {
            let child = self.arena.create_child(exec, false, true)?;
            self.arena.get_mut(child)?.start_stack = rest.to_vec();
            self.arena.get_mut(exec)?.is_active = false;
            self.agenda.push_back((child, Operation::ProcessStartInitial));
        } else {
            self.arena.get_mut(exec)?.start_stack = rest.to_vec();
            self.agenda.push_back((exec, Operation::ProcessStartInitial));
        }
        Ok(())
    }

    async fn activity_execute(&mut self, exec: ExecutionId) -> Result<(), EngineError> {
        let def = self.def;
        let activity_id = self
            .arena
            .get(exec)?
            .activity
            .clone()
            .ok_or(EngineError::NoCurrentActivity(exec))?;
        let activity = def.activity(&activity_id)?;

        // Asynchronous continuation boundary: park here and hand the rest
        // of the work to a job, unless this very execution is the one a job
        // just resumed.
        let wants_async = activity.property(PROP_ASYNC).map(is_truthy).unwrap_or(false);
        if wants_async && self.resumed != Some(exec) {
            match self.continuations {
                Some(scheduler) => {
                    debug!(execution = %exec, activity = %activity_id, "suspending at async boundary");
                    scheduler
                        .schedule(ContinuationRequest {
                            definition_id: def.id.clone(),
                            process_instance_id: self.arena.process_instance_id,
                            execution_id: exec,
                            activity_id: activity_id.clone(),
                        })
                        .await?;
                    return Ok(());
                }
                None => {
                    debug!(activity = %activity_id, "no continuation scheduler, executing inline");
                }
            }
        }

        self.notify_listeners(
            exec,
            EVENT_START,
            EventSource::Activity(activity_id.clone()),
            activity.listeners.for_event(EVENT_START),
        )
        .await?;
        self.dispatch(self.event(EngineEventType::ActivityStarted).execution(exec).entity(
            serde_json::json!({ "activity_id": activity_id }),
        ))?;

        let behavior = self.behaviors.get(&activity.behavior)?;
        behavior.execute(self, exec).await
    }

    async fn activity_leave(
        &mut self,
        exec: ExecutionId,
        policy: StuckPolicy,
        unconditional: bool,
    ) -> Result<(), EngineError> {
        let def = self.def;
        let activity_id = self
            .arena
            .get(exec)?
            .activity
            .clone()
            .ok_or(EngineError::NoCurrentActivity(exec))?;
        let activity = def.activity(&activity_id)?;
        let selection = if unconditional {
            select_all(activity)
        } else {
            let vars = self.arena.collect_variables(exec)?;
            let ectx = EvalContext {
                execution_id: exec,
                process_instance_id: self.arena.process_instance_id,
                variables: &vars,
                actor: self.command.actor.as_deref(),
            };
            select_default(def, activity, &ectx)?
        };

        match selection {
            FlowSelection::Take(t) | FlowSelection::Default(t) => self.take(exec, t),
            FlowSelection::Fork(transitions) => {
                // End listeners fire once, on the forking execution, before
                // the branches exist.
                self.notify_listeners(
                    exec,
                    EVENT_END,
                    EventSource::Activity(activity_id.clone()),
                    activity.listeners.for_event(EVENT_END),
                )
                .await?;
                self.dispatch(
                    self.event(EngineEventType::ActivityCompleted)
                        .execution(exec)
                        .entity(serde_json::json!({ "activity_id": activity_id })),
                )?;
                self.fork(exec, &activity_id, transitions)
            }
            FlowSelection::Compensate => {
                // Compensation handlers hand their token back to the scope
                // that invoked them instead of propagating.
                debug!(execution = %exec, activity = %activity_id, "compensation handler done");
                let (parent, scoped) = {
                    let rec = self.arena.get(exec)?;
                    (rec.parent, rec.is_scope)
                };
                if scoped {
                    self.arena.destroy_scope_in_place(exec)?;
                }
                if let Some(parent) = parent {
                    if let Some(parent_activity) = self.arena.get(parent)?.activity.clone() {
                        let behavior = self
                            .behaviors
                            .get(&def.activity(&parent_activity)?.behavior)?;
                        behavior
                            .signal(self, parent, Some(COMPENSATION_DONE))
                            .await?;
                    }
                }
                self.arena.remove_subtree(exec)?;
                Ok(())
            }
            FlowSelection::End => match policy {
                StuckPolicy::RaiseError => Err(EngineError::StuckExecution {
                    execution: exec,
                    activity: activity_id,
                }),
                StuckPolicy::EndExecution => {
                    self.notify_listeners(
                        exec,
                        EVENT_END,
                        EventSource::Activity(activity_id.clone()),
                        activity.listeners.for_event(EVENT_END),
                    )
                    .await?;
                    self.dispatch(
                        self.event(EngineEventType::ActivityCompleted)
                            .execution(exec)
                            .entity(serde_json::json!({ "activity_id": activity_id })),
                    )?;
                    self.end_execution(exec).await
                }
            },
        }
    }

    async fn notify_listener_end(&mut self, exec: ExecutionId) -> Result<(), EngineError> {
        let def = self.def;
        let activity_id = self
            .arena
            .get(exec)?
            .activity
            .clone()
            .ok_or(EngineError::NoCurrentActivity(exec))?;
        let activity = def.activity(&activity_id)?;
        self.notify_listeners(
            exec,
            EVENT_END,
            EventSource::Activity(activity_id.clone()),
            activity.listeners.for_event(EVENT_END),
        )
        .await?;
        self.dispatch(self.event(EngineEventType::ActivityCompleted).execution(exec).entity(
            serde_json::json!({ "activity_id": activity_id }),
        ))?;
        self.agenda.push_back((exec, Operation::TransitionDestroyScope));
        Ok(())
    }

    /// Scope teardown on the way out of an activity.
    ///
    /// When the activity being left is itself a scope, the shape of the
    /// leaving execution picks the surgery: concurrent non-scope relocates
    /// up (and the abandoned fork is pruned), concurrent scope is destroyed
    /// in place, non-concurrent scope is absorbed by its parent.
    ///
    /// Afterwards, if the transition's target lies outside the enclosing
    /// scope as well, that scope is being left implicitly: its end protocol
    /// runs and the operation re-enters itself one level up, so a token
    /// escaping nested scopes tears each one down in turn.
    async fn destroy_scope(&mut self, exec: ExecutionId) -> Result<(), EngineError> {
        let def = self.def;
        let activity_id = self
            .arena
            .get(exec)?
            .activity
            .clone()
            .ok_or(EngineError::NoCurrentActivity(exec))?;
        let transition_id = self
            .arena
            .get(exec)?
            .transition
            .clone()
            .ok_or(EngineError::NoCurrentTransition(exec))?;
        let target = def.transition(&transition_id)?.target.clone();

        let propagating = if def.activity(&activity_id)?.is_scope {
            let rec = self.arena.get(exec)?;
            let (concurrent, scope, parent) = (rec.is_concurrent, rec.is_scope, rec.parent);
            match (concurrent, scope) {
                (true, false) => {
                    let old_parent = parent.ok_or(EngineError::UnknownExecution(exec))?;
                    self.arena.move_up(exec)?;
                    if let Some(folded) = self.arena.prune_degenerate_fork(old_parent)? {
                        self.remap_agenda(folded, old_parent);
                    }
                    exec
                }
                (true, true) => {
                    self.arena.destroy_scope_in_place(exec)?;
                    exec
                }
                (false, true) => match parent {
                    Some(parent) => {
                        self.arena.absorb_child(parent, exec)?;
                        self.remap_agenda(exec, parent);
                        parent
                    }
                    None => exec,
                },
                (false, false) => exec,
            }
        } else {
            exec
        };

        if let Some(scope) = def.enclosing_scope(&activity_id) {
            if !def.within_scope(&target, &scope) {
                debug!(execution = %propagating, scope = %scope, "transition escapes enclosing scope");
                let scope_activity = def.activity(&scope)?;
                self.notify_listeners(
                    propagating,
                    EVENT_END,
                    EventSource::Activity(scope.clone()),
                    scope_activity.listeners.for_event(EVENT_END),
                )
                .await?;
                self.dispatch(
                    self.event(EngineEventType::ActivityCompleted)
                        .execution(propagating)
                        .entity(serde_json::json!({ "activity_id": scope })),
                )?;
                self.arena.get_mut(propagating)?.activity = Some(scope);
                self.agenda
                    .push_back((propagating, Operation::TransitionDestroyScope));
                return Ok(());
            }
        }
        self.agenda
            .push_back((propagating, Operation::TransitionNotifyListenerTake));
        Ok(())
    }

    async fn notify_listener_take(&mut self, exec: ExecutionId) -> Result<(), EngineError> {
        let def = self.def;
        let transition_id = self
            .arena
            .get(exec)?
            .transition
            .clone()
            .ok_or(EngineError::NoCurrentTransition(exec))?;
        let transition = def.transition(&transition_id)?;
        let target = transition.target.clone();
        self.notify_listeners(
            exec,
            EVENT_TAKE,
            EventSource::Transition(transition_id.clone()),
            transition.take_listeners.clone(),
        )
        .await?;
        self.dispatch(self.event(EngineEventType::SequenceFlowTaken).execution(exec).entity(
            serde_json::json!({
                "transition_id": transition_id,
                "source": transition.source,
                "target": target,
            }),
        ))?;
        let rec = self.arena.get_mut(exec)?;
        rec.transition = None;
        rec.activity = Some(target);
        self.agenda.push_back((exec, Operation::ActivityExecute));
        Ok(())
    }

    // ── Helpers for behaviors ──

    /// Take one transition: stash it on the execution and start the
    /// transition protocol.
    pub fn take(&mut self, exec: ExecutionId, transition: impl Into<String>) -> Result<(), EngineError> {
        self.arena.get_mut(exec)?.transition = Some(transition.into());
        self.agenda
            .push_back((exec, Operation::TransitionNotifyListenerEnd));
        Ok(())
    }

    /// Fork over several transitions: one concurrent child per transition,
    /// reusing inactive concurrent children left over from a join before
    /// creating fresh ones. The forking execution becomes the (inactive)
    /// concurrent root. The source activity's end protocol has already run,
    /// so each branch enters the transition protocol at scope teardown.
    pub fn fork(
        &mut self,
        exec: ExecutionId,
        activity_id: &str,
        transitions: Vec<String>,
    ) -> Result<(), EngineError> {
        let mut reusable: Vec<ExecutionId> = {
            let rec = self.arena.get(exec)?;
            let mut out = Vec::new();
            for child in &rec.children {
                let c = self.arena.get(*child)?;
                if c.is_concurrent && !c.is_active && !c.is_scope {
                    out.push(*child);
                }
            }
            out
        };
        let mut branches = Vec::with_capacity(transitions.len());
        for transition in transitions {
            let child = match reusable.pop() {
                Some(id) => id,
                None => self.arena.create_child(exec, true, false)?,
            };
            let rec = self.arena.get_mut(child)?;
            rec.activity = Some(activity_id.to_string());
            rec.transition = Some(transition);
            rec.is_active = true;
            rec.listener_index = 0;
            branches.push(child);
        }
        // Surplus leftovers from a wider join are gone for good.
        for leftover in reusable {
            self.arena.remove_subtree(leftover)?;
        }
        let rec = self.arena.get_mut(exec)?;
        rec.is_active = false;
        rec.activity = None;
        rec.transition = None;
        for branch in branches {
            self.agenda
                .push_back((branch, Operation::TransitionDestroyScope));
        }
        Ok(())
    }

    /// Leave the current activity through the configured flow selection.
    pub fn enqueue_leave(&mut self, exec: ExecutionId) {
        self.agenda.push_back((
            exec,
            Operation::ActivityLeave {
                policy: self.stuck_policy,
                unconditional: false,
            },
        ));
    }

    /// Leave over every outgoing transition, ignoring conditions.
    pub fn enqueue_leave_all(&mut self, exec: ExecutionId) {
        self.agenda.push_back((
            exec,
            Operation::ActivityLeave {
                policy: self.stuck_policy,
                unconditional: true,
            },
        ));
    }

    /// Queue an operation directly.
    pub fn enqueue(&mut self, exec: ExecutionId, op: Operation) {
        self.agenda.push_back((exec, op));
    }

    /// End one execution and propagate: retire concurrent tokens and prune
    /// their fork, complete enclosing scopes, and finally complete the
    /// process instance when the root runs out of tokens.
    pub async fn end_execution(&mut self, mut exec: ExecutionId) -> Result<(), EngineError> {
        let def = self.def;
        loop {
            let (concurrent, position, parent, is_scope) = {
                let rec = self.arena.get(exec)?;
                (
                    rec.is_concurrent,
                    rec.activity.clone(),
                    rec.parent,
                    rec.is_scope,
                )
            };
            if concurrent {
                let parent = parent.ok_or(EngineError::UnknownExecution(exec))?;
                self.arena.remove_subtree(exec)?;
                if let Some(folded) = self.arena.prune_degenerate_fork(parent)? {
                    self.remap_agenda(folded, parent);
                }
                let prec = self.arena.get(parent)?;
                if prec.children.is_empty() && prec.activity.is_none() {
                    // Last branch gone and nothing folded in: the fork root
                    // itself ends.
                    exec = parent;
                    continue;
                }
                return Ok(());
            }

            if let Some(activity) = &position {
                if let Some(scope_activity) = def.enclosing_scope(activity) {
                    // The enclosing scope region is done; this execution
                    // moves up to the scope activity and leaves it.
                    let prec = self.arena.get_mut(exec)?;
                    prec.activity = Some(scope_activity);
                    prec.is_active = true;
                    self.enqueue_leave(exec);
                    return Ok(());
                }
            }
            match parent {
                None => {
                    self.arena.get_mut(exec)?.is_active = false;
                    self.notify_listeners(
                        exec,
                        EVENT_END,
                        EventSource::Process(def.id.clone()),
                        def.listeners.for_event(EVENT_END),
                    )
                    .await?;
                    self.arena.ended = true;
                    self.dispatch(self.event(EngineEventType::ProcessCompleted))?;
                    return Ok(());
                }
                Some(p) => {
                    if position.is_none() && is_scope {
                        // Spent scope execution: its region belongs to the
                        // activity the parent is parked on.
                        if let Some(scope_activity) = self.arena.get(p)?.activity.clone() {
                            let prec = self.arena.get_mut(exec)?;
                            prec.activity = Some(scope_activity);
                            prec.is_active = true;
                            self.enqueue_leave(exec);
                            return Ok(());
                        }
                    }
                    self.arena.remove_subtree(exec)?;
                    exec = p;
                }
            }
        }
    }

    // ── Listener protocol ──

    /// Ordered notification with a persisted replay cursor: listeners run
    /// one by one, the cursor advancing after each success. A failure leaves
    /// the cursor pointing at the failing listener so a replay of the same
    /// operation skips the ones that already completed.
    pub async fn notify_listeners(
        &mut self,
        exec: ExecutionId,
        event: &str,
        source: EventSource,
        listeners: Vec<Arc<dyn ExecutionListener>>,
    ) -> Result<(), EngineError> {
        if listeners.is_empty() {
            return Ok(());
        }
        let process_instance_id = self.arena.process_instance_id;
        {
            let rec = self.arena.get_mut(exec)?;
            rec.event_name = Some(event.to_string());
            rec.event_source = Some(source.clone());
        }
        loop {
            let index = self.arena.get(exec)?.listener_index;
            let Some(listener) = listeners.get(index) else {
                break;
            };
            let mut variables = std::mem::take(&mut self.arena.get_mut(exec)?.variables);
            let mut lctx = ListenerContext {
                event_name: event,
                event_source: &source,
                execution_id: exec,
                process_instance_id,
                actor: self.command.actor.as_deref(),
                variables: &mut variables,
            };
            let result = listener.notify(&mut lctx).await;
            let rec = self.arena.get_mut(exec)?;
            rec.variables = variables;
            match result {
                Ok(()) => rec.listener_index += 1,
                Err(err) => return Err(EngineError::Listener(err)),
            }
        }
        let rec = self.arena.get_mut(exec)?;
        rec.listener_index = 0;
        rec.event_name = None;
        rec.event_source = None;
        Ok(())
    }

    // ── Plumbing ──

    fn event(&self, event_type: EngineEventType) -> EngineEvent {
        EngineEvent::new(event_type)
            .definition(self.def.id.clone())
            .instance(self.arena.process_instance_id)
    }

    fn dispatch(&self, event: EngineEvent) -> Result<(), EngineError> {
        self.dispatcher
            .dispatch(&event, self.command, self.definitions)?;
        Ok(())
    }

    fn remap_agenda(&mut self, from: ExecutionId, to: ExecutionId) {
        for (id, _) in self.agenda.iter_mut() {
            if *id == from {
                *id = to;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NativeListenerFactory;
    use crate::model::{
        ActivitySpec, ProcessDefinitionBuilder, TransitionSpec, BEHAVIOR_RECEIVE,
        PROP_FOR_COMPENSATION,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[test]
    fn operations_tag_cleanly() {
        let json = serde_json::to_value(Operation::ActivityLeave {
            policy: StuckPolicy::RaiseError,
            unconditional: false,
        })
        .unwrap();
        assert_eq!(json["op"], "activity-leave");
        assert_eq!(json["policy"], "raise-error");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(
            back,
            Operation::ActivityLeave {
                policy: StuckPolicy::RaiseError,
                unconditional: false,
            }
        );
        // Older persisted agendas carry no fan-out flag.
        let old: Operation =
            serde_json::from_value(json!({ "op": "activity-leave", "policy": "end-execution" }))
                .unwrap();
        assert_eq!(
            old,
            Operation::ActivityLeave {
                policy: StuckPolicy::EndExecution,
                unconditional: false,
            }
        );
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Tally {
        label: &'static str,
        log: Log,
    }

    #[async_trait]
    impl ExecutionListener for Tally {
        async fn notify(&self, _ctx: &mut ListenerContext<'_>) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    /// Fails its first invocation, succeeds afterwards.
    struct Flaky {
        label: &'static str,
        log: Log,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl ExecutionListener for Flaky {
        async fn notify(&self, _ctx: &mut ListenerContext<'_>) -> anyhow::Result<()> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                anyhow::bail!("transient failure");
            }
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    #[tokio::test]
    async fn listener_replay_resumes_at_the_saved_cursor() {
        let def = ProcessDefinitionBuilder::new("p")
            .initial("a")
            .activity(ActivitySpec::task("a"))
            .build(&NativeListenerFactory)
            .unwrap();
        let behaviors = BehaviorRegistry::standard();
        let dispatcher = EventDispatcher::default();
        let command = CommandContext::new();
        let mut arena = ExecutionArena::new("p");
        let root = arena.root();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let listeners: Vec<Arc<dyn ExecutionListener>> = vec![
            Arc::new(Tally {
                label: "first",
                log: log.clone(),
            }),
            Arc::new(Flaky {
                label: "second",
                log: log.clone(),
                tripped: AtomicBool::new(false),
            }),
            Arc::new(Tally {
                label: "third",
                log: log.clone(),
            }),
        ];

        let mut ctx = OperationContext::new(&def, &behaviors, &dispatcher, &command, &mut arena);
        let err = ctx
            .notify_listeners(
                root,
                EVENT_END,
                EventSource::Activity("a".into()),
                listeners.clone(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Listener(_)));
        // The cursor points at the failing listener; the first one is done.
        assert_eq!(ctx.arena.get(root).unwrap().listener_index, 1);

        ctx.notify_listeners(
            root,
            EVENT_END,
            EventSource::Activity("a".into()),
            listeners,
        )
        .await
        .unwrap();
        assert_eq!(ctx.arena.get(root).unwrap().listener_index, 0);
        assert!(ctx.arena.get(root).unwrap().event_name.is_none());
        // The replay picked up at the failure, never re-running "first".
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn compensation_handler_signals_parent_and_retires() {
        let def = ProcessDefinitionBuilder::new("comp")
            .initial("gate")
            .activity(ActivitySpec::new("gate", BEHAVIOR_RECEIVE))
            .activity(ActivitySpec::task("done"))
            .activity(ActivitySpec::task("undo").property(PROP_FOR_COMPENSATION, json!(true)))
            .transition(TransitionSpec::new("t1", "gate", "done"))
            .build(&NativeListenerFactory)
            .unwrap();
        let behaviors = BehaviorRegistry::standard();
        let dispatcher = EventDispatcher::default();
        let command = CommandContext::new();
        let mut arena = ExecutionArena::new("comp");
        let root = arena.root();
        arena.get_mut(root).unwrap().activity = Some("gate".into());
        let handler = arena.create_child(root, false, false).unwrap();
        arena.get_mut(handler).unwrap().activity = Some("undo".into());

        {
            let mut ctx =
                OperationContext::new(&def, &behaviors, &dispatcher, &command, &mut arena);
            ctx.run(
                handler,
                Operation::ActivityLeave {
                    policy: StuckPolicy::EndExecution,
                    unconditional: false,
                },
            )
            .await
            .unwrap();
        }

        // The handler is gone and its parent was signalled awake: the
        // receive activity let go and the instance ran out.
        assert!(!arena.contains(handler));
        assert!(arena.ended);
        assert_eq!(arena.get(root).unwrap().activity.as_deref(), Some("done"));
    }
}
