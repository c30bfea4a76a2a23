//! Interval loops for the integration worker and the reminder sweep.

use std::time::Duration;

use chrono::Utc;
use crewflow_agent::runtime::AgentRuntime;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info};

pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn spawn(
        runtime: &AgentRuntime,
        worker_interval: Option<Duration>,
        sweep_interval: Option<Duration>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        if let Some(interval) = worker_interval {
            handles.push(tokio::spawn(worker_loop(runtime.clone(), interval, shutdown.subscribe())));
        }
        if let Some(interval) = sweep_interval {
            handles.push(tokio::spawn(sweep_loop(runtime.clone(), interval, shutdown.subscribe())));
        }

        Self { shutdown, handles }
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every loop and waits for the in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(join_error) = handle.await {
                error!(
                    event_name = "system.background.join_failed",
                    correlation_id = "shutdown",
                    error = %join_error,
                    "background task ended abnormally"
                );
            }
        }
    }
}

async fn worker_loop(runtime: AgentRuntime, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        match runtime.worker().run_once(Utc::now()).await {
            Ok(report) if report.claimed > 0 || report.recovered > 0 => info!(
                event_name = "queue.worker.pass",
                correlation_id = "queue-worker",
                recovered = report.recovered,
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                "integration worker pass finished"
            ),
            Ok(_) => {}
            Err(queue_error) => error!(
                event_name = "queue.worker.pass_failed",
                correlation_id = "queue-worker",
                error = %queue_error,
                "integration worker pass failed"
            ),
        }
    }

    info!(event_name = "queue.worker.stopped", correlation_id = "shutdown", "integration worker stopped");
}

async fn sweep_loop(runtime: AgentRuntime, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        match runtime.sweep().run(Utc::now()).await {
            Ok(report) if report.due > 0 => info!(
                event_name = "reminder.sweep.pass",
                correlation_id = "reminder-sweep",
                due = report.due,
                evaluated = report.evaluated,
                actions_created = report.actions_created,
                actions_executed = report.actions_executed,
                failed = report.failed,
                "reminder sweep finished"
            ),
            Ok(_) => {}
            Err(sweep_error) => error!(
                event_name = "reminder.sweep.failed",
                correlation_id = "reminder-sweep",
                error = %sweep_error,
                "reminder sweep failed"
            ),
        }
    }

    info!(event_name = "reminder.sweep.stopped", correlation_id = "shutdown", "reminder sweep stopped");
}
