//! The assembled process engine.
//!
//! Ties the immutable registries, the event dispatcher, and the stores
//! together behind the three entry points: start an instance, signal a
//! waiting execution, execute a continuation job.

use crate::acquisition::{JobAcquisition, JobAddedNotifier, TokioJobExecutor};
use crate::behavior::BehaviorRegistry;
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::dispatcher::{EngineEvent, EngineEventType, EventDispatcher};
use crate::error::EngineError;
use crate::execution::{ExecutionArena, ExecutionId};
use crate::job::{
    ContinuationRequest, ContinuationScheduler, HandlerRegistry, Job, JobHandler, JobStore,
    CONTINUE_EXECUTION_HANDLER,
};
use crate::model::{DefinitionRegistry, ProcessDefinition};
use crate::operation::{Operation, OperationContext};
use crate::store::{MemoryJobStore, MemoryProcessStore, ProcessStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct ProcessEngine {
    definitions: Arc<DefinitionRegistry>,
    behaviors: BehaviorRegistry,
    dispatcher: EventDispatcher,
    process_store: Arc<dyn ProcessStore>,
    job_store: Arc<dyn JobStore>,
    notifier: Arc<JobAddedNotifier>,
    config: EngineConfig,
}

pub struct ProcessEngineBuilder {
    definitions: DefinitionRegistry,
    behaviors: BehaviorRegistry,
    dispatcher: EventDispatcher,
    process_store: Option<Arc<dyn ProcessStore>>,
    job_store: Option<Arc<dyn JobStore>>,
    config: EngineConfig,
}

impl ProcessEngineBuilder {
    pub fn new(definitions: DefinitionRegistry) -> Self {
        Self {
            definitions,
            behaviors: BehaviorRegistry::standard(),
            dispatcher: EventDispatcher::default(),
            process_store: None,
            job_store: None,
            config: EngineConfig::default(),
        }
    }

    pub fn behaviors(mut self, behaviors: BehaviorRegistry) -> Self {
        self.behaviors = behaviors;
        self
    }

    pub fn dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn process_store(mut self, store: Arc<dyn ProcessStore>) -> Self {
        self.process_store = Some(store);
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ProcessEngine {
        let retry_delay = self.config.retry_delay();
        ProcessEngine {
            definitions: Arc::new(self.definitions),
            behaviors: self.behaviors,
            dispatcher: self.dispatcher,
            process_store: self
                .process_store
                .unwrap_or_else(|| Arc::new(MemoryProcessStore::new())),
            job_store: self
                .job_store
                .unwrap_or_else(|| Arc::new(MemoryJobStore::with_retry_delay(retry_delay))),
            notifier: Arc::new(JobAddedNotifier::new()),
            config: self.config,
        }
    }
}

impl ProcessEngine {
    pub fn builder(definitions: DefinitionRegistry) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(definitions)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn notifier(&self) -> Arc<JobAddedNotifier> {
        self.notifier.clone()
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.job_store.clone()
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    /// Current state of an instance, as last persisted.
    pub async fn instance(&self, id: Uuid) -> Result<Option<ExecutionArena>, EngineError> {
        Ok(self.process_store.load(id).await?)
    }

    /// Start a new instance and run it until every token has either ended
    /// or parked at a wait state or async boundary.
    pub async fn start_process_instance(
        &self,
        definition_id: &str,
        variables: HashMap<String, serde_json::Value>,
        command: &CommandContext,
    ) -> Result<Uuid, EngineError> {
        let def = self.definitions.get(definition_id)?;
        let mut arena = ExecutionArena::new(definition_id);
        let root = arena.root();
        arena.get_mut(root)?.variables = variables;
        let instance = arena.process_instance_id;
        info!(definition = %definition_id, instance = %instance, "starting process instance");

        self.run_ops(def.as_ref(), &mut arena, None, root, Operation::ProcessStart, command)
            .await?;
        self.process_store.save(&arena).await?;
        Ok(instance)
    }

    /// Wake an execution waiting at its current activity.
    pub async fn signal(
        &self,
        process_instance_id: Uuid,
        execution_id: ExecutionId,
        signal: Option<&str>,
        command: &CommandContext,
    ) -> Result<(), EngineError> {
        let mut arena = self
            .process_store
            .load(process_instance_id)
            .await?
            .ok_or(EngineError::UnknownInstance(process_instance_id))?;
        let def = self.definitions.get(&arena.definition_id)?;
        let activity_id = arena
            .get(execution_id)?
            .activity
            .clone()
            .ok_or(EngineError::NoCurrentActivity(execution_id))?;
        let behavior = self.behaviors.get(&def.activity(&activity_id)?.behavior)?;
        debug!(instance = %process_instance_id, execution = %execution_id, activity = %activity_id, "signalling execution");

        {
            let mut ctx = self.context(def.as_ref(), &mut arena, None, command);
            behavior.signal(&mut ctx, execution_id, signal).await?;
            ctx.drain().await?;
        }
        self.process_store.save(&arena).await?;
        Ok(())
    }

    /// Run one continuation job: resume its execution past the async
    /// boundary it parked at.
    pub async fn execute_job(&self, job: &Job, command: &CommandContext) -> Result<(), EngineError> {
        let execution = job.execution_id.ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!("job {} carries no execution", job.id))
        })?;
        let mut arena = self
            .process_store
            .load(job.process_instance_id)
            .await?
            .ok_or(EngineError::UnknownInstance(job.process_instance_id))?;
        let def = self.definitions.get(&arena.definition_id)?;
        debug!(job = %job.id, execution = %execution, "executing continuation job");

        self.run_ops(
            def.as_ref(),
            &mut arena,
            Some(execution),
            execution,
            Operation::ActivityExecute,
            command,
        )
        .await?;
        self.process_store.save(&arena).await?;
        self.dispatcher.dispatch(
            &EngineEvent::new(EngineEventType::JobExecuted)
                .definition(def.id.clone())
                .instance(job.process_instance_id)
                .execution(execution)
                .entity(serde_json::json!({ "job_id": job.id })),
            command,
            Some(&self.definitions),
        )?;
        Ok(())
    }

    /// Acquisition coordinator wired to this engine's stores, with the
    /// continuation handler registered.
    pub fn job_acquisition(self: &Arc<Self>, owner: impl Into<String>) -> JobAcquisition {
        let owner = owner.into();
        let mut handlers = HandlerRegistry::default();
        handlers.register(
            CONTINUE_EXECUTION_HANDLER,
            Arc::new(ContinuationJobHandler::new(self.clone())),
        );
        let executor = Arc::new(TokioJobExecutor::new(
            Arc::new(handlers),
            self.job_store.clone(),
            owner.clone(),
            self.config.worker_slots,
        ));
        JobAcquisition::new(
            self.job_store.clone(),
            executor,
            self.notifier.clone(),
            self.config.clone(),
            owner,
        )
    }

    fn context<'a>(
        &'a self,
        def: &'a ProcessDefinition,
        arena: &'a mut ExecutionArena,
        resumed: Option<ExecutionId>,
        command: &'a CommandContext,
    ) -> OperationContext<'a> {
        let mut ctx = OperationContext::new(def, &self.behaviors, &self.dispatcher, command, arena)
            .with_definitions(&self.definitions)
            .with_continuations(self)
            .with_stuck_policy(self.config.stuck_policy)
            .with_max_steps(self.config.max_steps);
        if let Some(resumed) = resumed {
            ctx = ctx.with_resumed(resumed);
        }
        ctx
    }

    async fn run_ops(
        &self,
        def: &ProcessDefinition,
        arena: &mut ExecutionArena,
        resumed: Option<ExecutionId>,
        execution: ExecutionId,
        op: Operation,
        command: &CommandContext,
    ) -> Result<(), EngineError> {
        let mut ctx = self.context(def, arena, resumed, command);
        ctx.run(execution, op).await
    }
}

#[async_trait]
impl ContinuationScheduler for ProcessEngine {
    async fn schedule(&self, request: ContinuationRequest) -> anyhow::Result<()> {
        let mut job = Job::continuation(&request);
        job.retries = self.config.max_job_retries;
        let event = EngineEvent::new(EngineEventType::JobScheduled)
            .definition(request.definition_id.clone())
            .instance(request.process_instance_id)
            .execution(request.execution_id)
            .entity(serde_json::json!({
                "job_id": job.id,
                "activity_id": request.activity_id,
            }));
        self.job_store.schedule(job).await?;
        self.dispatcher.dispatch(
            &event,
            &CommandContext::new().with_definition(request.definition_id),
            Some(&self.definitions),
        )?;
        self.notifier.job_added();
        Ok(())
    }
}

/// Runs continuation jobs by handing them back to the engine.
pub struct ContinuationJobHandler {
    engine: Arc<ProcessEngine>,
}

impl ContinuationJobHandler {
    pub fn new(engine: Arc<ProcessEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for ContinuationJobHandler {
    async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        self.engine.execute_job(job, &CommandContext::new()).await?;
        Ok(())
    }
}
