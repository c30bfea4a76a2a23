//! Reminder Scheduler and the periodic sweep that re-evaluates due projects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crewflow_core::domain::project::{Project, ProjectId};
use crewflow_db::repositories::{ProjectRepository, RepositoryError};

use crate::detection::{ActionDetectionService, DetectionContext, DetectionOutcome};
use crate::executor::{ActionExecutor, ExecutionOutcome};

#[derive(Debug, Error)]
pub enum ReminderError {
    #[error("reminder store failure: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Clone)]
pub struct ReminderScheduler {
    projects: Arc<dyn ProjectRepository>,
}

impl ReminderScheduler {
    pub fn new(projects: Arc<dyn ProjectRepository>) -> Self {
        Self { projects }
    }

    /// Unconditionally overwrites the project's check date; `None` clears it.
    pub async fn set_next_check_date(
        &self,
        project_id: &ProjectId,
        next_check_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), ReminderError> {
        self.projects.set_next_check_date(project_id, next_check_date, now).await?;
        info!(
            event_name = "reminder.scheduled",
            project_id = %project_id,
            next_check_date = ?next_check_date,
            "project check date updated"
        );
        Ok(())
    }

    /// Claims due projects by clearing their check date in one statement, so
    /// overlapping sweeps never evaluate the same project twice.
    pub async fn claim_due_projects(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Project>, ReminderError> {
        Ok(self.projects.claim_due_for_check(now, limit).await?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub evaluated: usize,
    pub actions_created: usize,
    pub actions_executed: usize,
    pub failed: usize,
}

pub struct ReminderSweep {
    scheduler: ReminderScheduler,
    detection: Arc<ActionDetectionService>,
    executor: Arc<ActionExecutor>,
    batch_size: u32,
}

impl ReminderSweep {
    pub fn new(
        scheduler: ReminderScheduler,
        detection: Arc<ActionDetectionService>,
        executor: Arc<ActionExecutor>,
        batch_size: u32,
    ) -> Self {
        Self { scheduler, detection, executor, batch_size }
    }

    /// Re-runs detection for every project whose check date has elapsed. The
    /// claim clears the date, so a failing project is not picked up again on
    /// the next pass; a new reminder decision schedules a fresh one.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, ReminderError> {
        let due = self.scheduler.claim_due_projects(now, self.batch_size).await?;
        let mut report = SweepReport { due: due.len(), ..SweepReport::default() };

        for project in due {
            let correlation_id = format!("reminder-{}", project.id);

            let context = DetectionContext {
                is_reminder_check: true,
                initiated_by: Some("reminder_sweep".to_string()),
                correlation_id: Some(correlation_id.clone()),
            };
            let detection = match self.detection.detect(&project, &context, now).await {
                Ok(detection) => detection,
                Err(detection_error) => {
                    error!(
                        event_name = "reminder.sweep.detection_failed",
                        correlation_id = %correlation_id,
                        project_id = %project.id,
                        error = %detection_error,
                        "reminder re-evaluation failed"
                    );
                    report.failed += 1;
                    continue;
                }
            };
            report.evaluated += 1;

            if let DetectionOutcome::ActionNeeded { record } = &detection.outcome {
                report.actions_created += 1;
                if record.is_executable() {
                    match self.executor.execute_action(&record.id, now).await {
                        Ok(ExecutionOutcome::Executed { .. }) => report.actions_executed += 1,
                        Ok(_) => {}
                        Err(execution_error) => {
                            error!(
                                event_name = "reminder.sweep.execution_failed",
                                correlation_id = %correlation_id,
                                project_id = %project.id,
                                action_record_id = %record.id,
                                error = %execution_error,
                                "auto-approved action could not be executed"
                            );
                            report.failed += 1;
                        }
                    }
                }
            } else if let DetectionOutcome::RequestHumanReview { .. } = &detection.outcome {
                report.actions_created += 1;
            }
        }

        info!(
            event_name = "reminder.sweep.completed",
            due = report.due,
            evaluated = report.evaluated,
            actions_created = report.actions_created,
            actions_executed = report.actions_executed,
            failed = report.failed,
            "reminder sweep finished"
        );
        Ok(report)
    }
}
