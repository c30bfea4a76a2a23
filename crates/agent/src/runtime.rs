//! Service graph assembled from a database pool and configuration.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crewflow_core::config::AppConfig;
use crewflow_core::{IntegrationQueueEngine, QueueEngineConfig};
use crewflow_db::repositories::{
    SqlActionRecordRepository, SqlIntegrationJobRepository, SqlProjectRepository,
    SqlPromptRunRepository, SqlWorkflowPromptRepository,
};
use crewflow_db::DbPool;

use crate::detection::ActionDetectionService;
use crate::executor::ActionExecutor;
use crate::integrations::{
    CommunicationSender, CrmClient, HttpCommunicationSender, HttpCrmClient, HttpKnowledgeBase,
    IntegrationError, KnowledgeBase, UnconfiguredIntegration,
};
use crate::llm::{HttpLlmClient, LlmClient};
use crate::pipeline::ProjectPipeline;
use crate::prompt_runs::{PromptRunService, PromptRunner};
use crate::queue::{CommunicationJobHandler, IntegrationJobQueue, IntegrationWorker, ProjectWriteHandler};
use crate::reminders::{ReminderScheduler, ReminderSweep};
use crate::summary::SummaryService;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("llm client setup failed: {0}")]
    Llm(String),
    #[error("integration client setup failed: {0}")]
    Integration(#[from] IntegrationError),
}

/// External systems the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub sender: Arc<dyn CommunicationSender>,
    pub crm: Arc<dyn CrmClient>,
    pub knowledge_base: Option<Arc<dyn KnowledgeBase>>,
}

impl Collaborators {
    /// HTTP clients for everything configured; unconfigured delivery endpoints
    /// fail permanently and the knowledge base is simply absent.
    pub fn from_config(config: &AppConfig) -> Result<Self, RuntimeError> {
        let llm = HttpLlmClient::from_config(&config.llm)
            .map_err(|error| RuntimeError::Llm(format!("{error:#}")))?;

        let sender: Arc<dyn CommunicationSender> =
            match HttpCommunicationSender::from_config(&config.integrations)? {
                Some(sender) => Arc::new(sender),
                None => Arc::new(UnconfiguredIntegration::new("communication")),
            };
        let crm: Arc<dyn CrmClient> = match HttpCrmClient::from_config(&config.integrations)? {
            Some(crm) => Arc::new(crm),
            None => Arc::new(UnconfiguredIntegration::new("crm")),
        };
        let knowledge_base = HttpKnowledgeBase::from_config(&config.integrations)?
            .map(|kb| Arc::new(kb) as Arc<dyn KnowledgeBase>);

        Ok(Self { llm: Arc::new(llm), sender, crm, knowledge_base })
    }
}

#[derive(Clone)]
pub struct AgentRuntime {
    pipeline: Arc<ProjectPipeline>,
    executor: Arc<ActionExecutor>,
    queue: IntegrationJobQueue,
    worker: Arc<IntegrationWorker>,
    sweep: Arc<ReminderSweep>,
    prompt_runs: PromptRunService,
}

impl AgentRuntime {
    pub fn new(db_pool: DbPool, config: &AppConfig, collaborators: Collaborators) -> Self {
        let projects = Arc::new(SqlProjectRepository::new(db_pool.clone()));
        let actions = Arc::new(SqlActionRecordRepository::new(db_pool.clone()));
        let prompt_runs =
            PromptRunService::new(Arc::new(SqlPromptRunRepository::new(db_pool.clone())));
        let runner = PromptRunner::new(
            Arc::new(SqlWorkflowPromptRepository::new(db_pool.clone())),
            prompt_runs.clone(),
            collaborators.llm.clone(),
        );
        let queue = IntegrationJobQueue::new(
            Arc::new(SqlIntegrationJobRepository::new(db_pool)),
            IntegrationQueueEngine::with_config(QueueEngineConfig {
                claim_timeout_seconds: i64::try_from(config.queue.claim_timeout_secs)
                    .unwrap_or(i64::MAX),
            }),
        );
        let scheduler = ReminderScheduler::new(projects.clone());

        let detection = Arc::new(ActionDetectionService::new(
            runner.clone(),
            actions.clone(),
            scheduler.clone(),
            collaborators.knowledge_base.clone(),
            config.detection.clone(),
        ));
        let executor = Arc::new(ActionExecutor::new(
            actions,
            projects.clone(),
            queue.clone(),
            collaborators.sender.clone(),
        ));

        let mut worker =
            IntegrationWorker::new(queue.clone(), config.queue.worker_id.clone(), config.queue.batch_size);
        worker.register(CommunicationJobHandler::new(collaborators.sender.clone()));
        worker.register(ProjectWriteHandler::new(collaborators.crm.clone()));

        let sweep = Arc::new(ReminderSweep::new(
            scheduler,
            detection.clone(),
            executor.clone(),
            config.reminders.batch_size,
        ));
        let pipeline = Arc::new(ProjectPipeline::new(
            projects.clone(),
            SummaryService::new(runner, projects),
            detection,
            executor.clone(),
        ));

        info!(
            event_name = "system.runtime.assembled",
            correlation_id = "bootstrap",
            llm_provider = collaborators.llm.provider(),
            llm_model = collaborators.llm.model(),
            knowledge_base = collaborators.knowledge_base.is_some(),
            job_handlers = worker.handler_count(),
            "agent runtime assembled"
        );

        Self { pipeline, executor, queue, worker: Arc::new(worker), sweep, prompt_runs }
    }

    pub fn pipeline(&self) -> &ProjectPipeline {
        &self.pipeline
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn queue(&self) -> &IntegrationJobQueue {
        &self.queue
    }

    pub fn worker(&self) -> &IntegrationWorker {
        &self.worker
    }

    pub fn sweep(&self) -> &ReminderSweep {
        &self.sweep
    }

    pub fn prompt_runs(&self) -> &PromptRunService {
        &self.prompt_runs
    }
}
