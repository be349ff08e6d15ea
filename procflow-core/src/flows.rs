//! Outgoing-flow selection.
//!
//! Two algorithms share the skip-expression machinery: the default fan-out
//! used by tasks and parallel constructs, and the first-match-wins rule of
//! exclusive gateways.

use crate::error::EngineError;
use crate::expression::{is_truthy, EvalContext};
use crate::model::{ActivityDefinition, ProcessDefinition, TransitionDefinition, PROP_FOR_COMPENSATION};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Variable that enables skip-expression evaluation when a transition does
/// not name its own flag.
pub const SKIP_EXPRESSION_ENABLED: &str = "skipExpressionEnabled";

/// What to do when an activity ends with no way out at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StuckPolicy {
    /// Fail the current unit of work.
    RaiseError,
    /// Quietly end the execution, as if it reached an implicit end.
    EndExecution,
}

/// Outcome of flow selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowSelection {
    /// Take exactly this transition.
    Take(String),
    /// Fork over these transitions, in order.
    Fork(Vec<String>),
    /// Nothing matched; take the declared default.
    Default(String),
    /// No transition and the activity is a compensation handler.
    Compensate,
    /// No way out at all; apply the stuck policy.
    End,
}

fn skip_enabled(transition: &TransitionDefinition, ctx: &EvalContext<'_>) -> bool {
    let flag = transition
        .skip_enabled_flag
        .as_deref()
        .unwrap_or(SKIP_EXPRESSION_ENABLED);
    ctx.variables.get(flag).map(is_truthy).unwrap_or(false)
}

/// Skip-expression verdict for one transition.
///
/// `Some(true)`: the transition is force-taken regardless of its condition.
/// `Some(false)`: the transition is not condition-selectable at all.
/// `None`: skip machinery not in play, fall through to the condition.
fn skip_verdict(
    transition: &TransitionDefinition,
    ctx: &EvalContext<'_>,
) -> Result<Option<bool>, EngineError> {
    let Some(expr) = &transition.skip_expression else {
        return Ok(None);
    };
    if !skip_enabled(transition, ctx) {
        return Ok(None);
    }
    match expr.get_value(ctx)? {
        serde_json::Value::Bool(b) => Ok(Some(b)),
        _ => Err(EngineError::NonBooleanSkipExpression(transition.id.clone())),
    }
}

fn condition_holds(
    transition: &TransitionDefinition,
    ctx: &EvalContext<'_>,
) -> Result<bool, EngineError> {
    match &transition.condition {
        Some(cond) => Ok(cond.evaluate(ctx)?),
        None => Ok(true),
    }
}

/// Is this transition eligible under the default (fan-out) rule? The
/// declared default transition is never a candidate; it only serves as the
/// zero-candidate fallback. A true skip verdict overrides both.
fn eligible(
    transition: &TransitionDefinition,
    default: Option<&str>,
    ctx: &EvalContext<'_>,
) -> Result<bool, EngineError> {
    match skip_verdict(transition, ctx)? {
        Some(verdict) => Ok(verdict),
        None => {
            if Some(transition.id.as_str()) == default {
                return Ok(false);
            }
            condition_holds(transition, ctx)
        }
    }
}

/// Default selection: every eligible outgoing transition is taken, in
/// declared order. Zero candidates fall back to the declared default
/// transition, then to the compensation marker, then to [`FlowSelection::End`].
pub fn select_default(
    def: &ProcessDefinition,
    activity: &ActivityDefinition,
    ctx: &EvalContext<'_>,
) -> Result<FlowSelection, EngineError> {
    let default = activity.default_transition.as_deref();
    let mut selected = Vec::new();
    for tid in &activity.outgoing {
        let transition = def.transition(tid)?;
        if eligible(transition, default, ctx)? {
            selected.push(tid.clone());
        }
    }
    match selected.len() {
        0 => {}
        1 => return Ok(FlowSelection::Take(selected.remove(0))),
        _ => return Ok(FlowSelection::Fork(selected)),
    }
    if let Some(default) = &activity.default_transition {
        debug!(activity = %activity.id, transition = %default, "no eligible transition, taking default");
        return Ok(FlowSelection::Default(default.clone()));
    }
    if activity
        .property(PROP_FOR_COMPENSATION)
        .map(is_truthy)
        .unwrap_or(false)
    {
        return Ok(FlowSelection::Compensate);
    }
    Ok(FlowSelection::End)
}

/// Exclusive selection, strictly first-match-wins in declared order. A true
/// skip verdict selects immediately; otherwise a transition matches when its
/// condition evaluates true, or when it has no condition and is not the
/// declared default. The default itself matches through its own condition,
/// and is otherwise only the no-match fallback. No match and no default is a
/// modeling error.
pub fn select_exclusive(
    def: &ProcessDefinition,
    activity: &ActivityDefinition,
    ctx: &EvalContext<'_>,
) -> Result<String, EngineError> {
    let default = activity.default_transition.as_deref();
    for tid in &activity.outgoing {
        let transition = def.transition(tid)?;
        match skip_verdict(transition, ctx)? {
            Some(true) => return Ok(tid.clone()),
            Some(false) => continue,
            None => {}
        }
        match &transition.condition {
            Some(condition) => {
                if condition.evaluate(ctx)? {
                    return Ok(tid.clone());
                }
            }
            None => {
                if Some(tid.as_str()) != default {
                    return Ok(tid.clone());
                }
            }
        }
    }
    match default {
        Some(d) => {
            debug!(activity = %activity.id, transition = %d, "exclusive gateway falling back to default");
            Ok(d.to_string())
        }
        None => Err(EngineError::NoOutgoingTransition(activity.id.clone())),
    }
}

/// Unconditional selection: every outgoing transition, in declared order.
/// Parallel fan-out uses this; conditions and defaults do not apply.
pub fn select_all(activity: &ActivityDefinition) -> FlowSelection {
    match activity.outgoing.as_slice() {
        [] => FlowSelection::End,
        [only] => FlowSelection::Take(only.clone()),
        many => FlowSelection::Fork(many.to_vec()),
    }
}
