//! procflow-core: a business-process execution kernel
//!
//! Executes process graphs (activities, transitions, scopes) over a tree of
//! runtime tokens. The moving parts:
//! - Immutable graph definitions built through a validating builder
//! - An id-addressed execution arena, serializable at any suspension point
//! - A trampolined atomic-operation engine with replayable listener
//!   notification
//! - Flow selection: default fan-out plus exclusive first-match
//! - An engine-wide event dispatcher with a per-definition secondary channel
//! - Background jobs for async continuations, with an optimistic-lock-aware
//!   acquisition loop and a bounded worker pool
//!
//! The kernel stays policy-free at the edges: expressions, listeners, and
//! storage are traits the embedder implements.

pub mod acquisition;
pub mod behavior;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod execution;
pub mod expression;
pub mod flows;
pub mod job;
pub mod listener;
pub mod model;
pub mod operation;
pub mod store;

pub use behavior::{ActivityBehavior, BehaviorRegistry};
pub use config::EngineConfig;
pub use context::CommandContext;
pub use dispatcher::{EngineEvent, EngineEventListener, EngineEventType, EventDispatcher};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::EngineError;
pub use execution::{ExecutionArena, ExecutionId, ExecutionRecord};
pub use expression::{Condition, EvalContext, ValueExpression};
pub use flows::{FlowSelection, StuckPolicy};
pub use job::{Job, JobHandler, JobStore};
pub use listener::{EventSource, ExecutionListener, ListenerFactory, ListenerSpec};
pub use model::{
    ActivitySpec, DefinitionRegistry, ProcessDefinition, ProcessDefinitionBuilder, TransitionSpec,
};
pub use operation::{Operation, OperationContext};
pub use store::{MemoryJobStore, MemoryProcessStore, ProcessStore};
