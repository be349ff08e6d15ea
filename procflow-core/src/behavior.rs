//! Pluggable activity behaviors.
//!
//! A behavior is the algorithm an activity runs when the token reaches it.
//! Behaviors never drive execution themselves; they mutate the tree and
//! enqueue follow-up operations through the [`OperationContext`] helpers.

use crate::error::EngineError;
use crate::execution::ExecutionId;
use crate::expression::EvalContext;
use crate::flows::select_exclusive;
use crate::model::{
    BEHAVIOR_EXCLUSIVE_GATEWAY, BEHAVIOR_PARALLEL_GATEWAY, BEHAVIOR_RECEIVE, BEHAVIOR_SUBPROCESS,
    BEHAVIOR_TASK,
};
use crate::operation::{Operation, OperationContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait ActivityBehavior: Send + Sync {
    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        execution: ExecutionId,
    ) -> Result<(), EngineError>;

    /// External wake-up of a waiting execution. The default leaves the
    /// activity through its outgoing flows.
    async fn signal(
        &self,
        ctx: &mut OperationContext<'_>,
        execution: ExecutionId,
        signal: Option<&str>,
    ) -> Result<(), EngineError> {
        let _ = signal;
        ctx.enqueue_leave(execution);
        Ok(())
    }
}

fn current_activity(
    ctx: &OperationContext<'_>,
    execution: ExecutionId,
) -> Result<String, EngineError> {
    ctx.arena
        .get(execution)?
        .activity
        .clone()
        .ok_or(EngineError::NoCurrentActivity(execution))
}

/// Automatic activity: does its (externally attached) work and leaves.
pub struct TaskBehavior;

#[async_trait]
impl ActivityBehavior for TaskBehavior {
    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        execution: ExecutionId,
    ) -> Result<(), EngineError> {
        ctx.enqueue_leave(execution);
        Ok(())
    }
}

/// Wait state: the token parks here until something signals the execution.
pub struct ReceiveBehavior;

#[async_trait]
impl ActivityBehavior for ReceiveBehavior {
    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        execution: ExecutionId,
    ) -> Result<(), EngineError> {
        debug!(execution = %execution, "waiting for external signal");
        let _ = ctx;
        Ok(())
    }
}

/// Exclusive gateway: the first outgoing transition whose condition holds
/// wins, in declared order; the declared default is the fallback.
pub struct ExclusiveGatewayBehavior;

#[async_trait]
impl ActivityBehavior for ExclusiveGatewayBehavior {
    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        execution: ExecutionId,
    ) -> Result<(), EngineError> {
        let def = ctx.definition();
        let activity_id = current_activity(ctx, execution)?;
        let activity = def.activity(&activity_id)?;
        let selected = {
            let vars = ctx.arena.collect_variables(execution)?;
            let actor = ctx.command().actor.clone();
            let ectx = EvalContext {
                execution_id: execution,
                process_instance_id: ctx.arena.process_instance_id,
                variables: &vars,
                actor: actor.as_deref(),
            };
            select_exclusive(def, activity, &ectx)?
        };
        debug!(gateway = %activity_id, transition = %selected, "exclusive gateway selected");
        ctx.take(execution, selected)
    }
}

/// Parallel gateway: fan out over every outgoing transition; join when one
/// token per incoming transition has arrived.
pub struct ParallelGatewayBehavior;

#[async_trait]
impl ActivityBehavior for ParallelGatewayBehavior {
    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        execution: ExecutionId,
    ) -> Result<(), EngineError> {
        let def = ctx.definition();
        let activity_id = current_activity(ctx, execution)?;
        let activity = def.activity(&activity_id)?;

        let (concurrent, parent) = {
            let rec = ctx.arena.get(execution)?;
            (rec.is_concurrent, rec.parent)
        };
        if !concurrent {
            // A lone token: nothing to synchronize with, straight fan-out.
            ctx.enqueue_leave_all(execution);
            return Ok(());
        }
        let parent = parent.ok_or(EngineError::UnknownExecution(execution))?;

        // Arrive: park this token, then count siblings parked at the same
        // gateway.
        ctx.arena.get_mut(execution)?.is_active = false;
        let expected = activity.incoming.len().max(1);
        let siblings = ctx.arena.get(parent)?.children.clone();
        let mut arrived = Vec::new();
        let mut any_active = false;
        for sibling in siblings {
            let rec = ctx.arena.get(sibling)?;
            if !rec.is_active && rec.activity.as_deref() == Some(activity_id.as_str()) {
                arrived.push(sibling);
            } else if rec.is_active {
                any_active = true;
            }
        }

        if arrived.len() < expected {
            if !any_active {
                // No token left that could ever reach the join.
                return Err(EngineError::StuckExecution {
                    execution,
                    activity: activity_id,
                });
            }
            debug!(
                gateway = %activity_id,
                arrived = arrived.len(),
                expected,
                "waiting at parallel join"
            );
            return Ok(());
        }

        debug!(gateway = %activity_id, expected, "parallel join complete");
        for other in arrived.into_iter().filter(|s| *s != execution) {
            ctx.arena.remove_subtree(other)?;
        }
        let continuation = match ctx.arena.prune_degenerate_fork(parent)? {
            // This was the only surviving branch: the fork root takes over.
            Some(_folded) => {
                let rec = ctx.arena.get_mut(parent)?;
                rec.is_active = true;
                rec.activity = Some(activity_id);
                parent
            }
            // Other live branches remain under the same root; this token
            // carries on as a concurrent child.
            None => {
                ctx.arena.get_mut(execution)?.is_active = true;
                execution
            }
        };
        ctx.enqueue_leave_all(continuation);
        Ok(())
    }
}

/// Composite activity with its own scope: enter by creating a child scope
/// execution positioned on the declared initial activity.
pub struct SubprocessBehavior;

#[async_trait]
impl ActivityBehavior for SubprocessBehavior {
    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        execution: ExecutionId,
    ) -> Result<(), EngineError> {
        let def = ctx.definition();
        let activity_id = current_activity(ctx, execution)?;
        let initial = def
            .activity(&activity_id)?
            .initial_activity
            .clone()
            .ok_or_else(|| EngineError::MissingInitialActivity(activity_id.clone()))?;
        let child = ctx.arena.create_child(execution, false, true)?;
        ctx.arena.get_mut(child)?.activity = Some(initial);
        ctx.arena.get_mut(execution)?.is_active = false;
        ctx.enqueue(child, Operation::ActivityExecute);
        Ok(())
    }
}

/// Immutable behavior lookup table, built once at engine configuration.
pub struct BehaviorRegistry {
    behaviors: HashMap<String, Arc<dyn ActivityBehavior>>,
}

impl BehaviorRegistry {
    pub fn empty() -> Self {
        Self {
            behaviors: HashMap::new(),
        }
    }

    /// The built-in set.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(BEHAVIOR_TASK, Arc::new(TaskBehavior));
        registry.register(BEHAVIOR_RECEIVE, Arc::new(ReceiveBehavior));
        registry.register(BEHAVIOR_EXCLUSIVE_GATEWAY, Arc::new(ExclusiveGatewayBehavior));
        registry.register(BEHAVIOR_PARALLEL_GATEWAY, Arc::new(ParallelGatewayBehavior));
        registry.register(BEHAVIOR_SUBPROCESS, Arc::new(SubprocessBehavior));
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, behavior: Arc<dyn ActivityBehavior>) {
        self.behaviors.insert(tag.into(), behavior);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn ActivityBehavior>, EngineError> {
        self.behaviors
            .get(tag)
            .cloned()
            .ok_or_else(|| EngineError::UnknownBehavior(tag.to_string()))
    }
}

impl Default for BehaviorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
