use crate::execution::ExecutionId;
use thiserror::Error;

/// Errors surfaced by the execution kernel.
///
/// Configuration errors (missing default transition, unselectable exclusive
/// gateway, non-boolean skip expression, stuck execution) are fatal and
/// non-retryable: they bubble out of the current unit of work so the
/// enclosing transaction rolls back and the instance stays at its last
/// durable state. Optimistic-lock contention never appears here — it is a
/// distinct type ([`crate::job::OptimisticLockError`]) contained inside the
/// acquisition coordinator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown process definition `{0}`")]
    UnknownDefinition(String),

    #[error("unknown activity `{0}`")]
    UnknownActivity(String),

    #[error("unknown transition `{0}`")]
    UnknownTransition(String),

    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("execution {0} has no current activity")]
    NoCurrentActivity(ExecutionId),

    #[error("execution {0} has no current transition")]
    NoCurrentTransition(ExecutionId),

    #[error(
        "default transition `{transition}` of activity `{activity}` is not one of its outgoing transitions"
    )]
    MissingDefaultTransition { activity: String, transition: String },

    #[error("exclusive gateway `{0}`: no outgoing transition selectable and no usable default")]
    NoOutgoingTransition(String),

    #[error("skip expression on transition `{0}` did not evaluate to a boolean")]
    NonBooleanSkipExpression(String),

    #[error("execution {execution} is stuck at activity `{activity}`: no eligible outgoing transition and no fallback")]
    StuckExecution {
        execution: ExecutionId,
        activity: String,
    },

    #[error("no behavior registered for tag `{0}`")]
    UnknownBehavior(String),

    #[error("no job handler registered for type `{0}`")]
    UnknownJobHandler(String),

    #[error("unknown process instance {0}")]
    UnknownInstance(uuid::Uuid),

    #[error("activity `{0}` is a scope but declares no initial activity")]
    MissingInitialActivity(String),

    #[error("operation step limit of {0} exceeded (cycle in process graph?)")]
    StepLimitExceeded(usize),

    #[error("execution listener failed")]
    Listener(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
