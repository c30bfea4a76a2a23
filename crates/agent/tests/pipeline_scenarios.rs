use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crewflow_agent::executor::ExecutionOutcome;
use crewflow_agent::integrations::{
    CommunicationResponse, RecordingCommunicationSender, RecordingCrmClient,
};
use crewflow_agent::llm::ScriptedLlmClient;
use crewflow_agent::runtime::{AgentRuntime, Collaborators};
use crewflow_core::config::AppConfig;
use crewflow_core::domain::action::{ActionStatus, ActionType};
use crewflow_core::domain::integration::JobStatus;
use crewflow_core::WebhookEnvelope;
use crewflow_db::{connect_with_settings, migrations, DbPool};

struct Harness {
    pool: DbPool,
    runtime: AgentRuntime,
    llm: Arc<ScriptedLlmClient>,
    sender: Arc<RecordingCommunicationSender>,
}

async fn harness(
    replies: &[&str],
    sender: RecordingCommunicationSender,
    auto_approved: Vec<ActionType>,
) -> Harness {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrate");

    let mut config = AppConfig::default();
    config.detection.auto_approved_action_types = auto_approved;

    let llm = Arc::new(ScriptedLlmClient::replying(replies.iter().copied()));
    let sender = Arc::new(sender);
    let runtime = AgentRuntime::new(
        pool.clone(),
        &config,
        Collaborators {
            llm: llm.clone(),
            sender: sender.clone(),
            crm: Arc::new(RecordingCrmClient::new()),
            knowledge_base: None,
        },
    );

    Harness { pool, runtime, llm, sender }
}

fn envelope(crm_id: &str) -> WebhookEnvelope {
    WebhookEnvelope::parse(
        json!({
            "company_id": "acme",
            "crm_id": crm_id,
            "event_type": "stage.changed",
            "name": "Maple St kitchen",
            "next_step": "Cabinet install",
            "data": {"stage": "Install"}
        })
        .to_string()
        .as_bytes(),
    )
    .expect("valid envelope")
}

fn day(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
}

async fn count(pool: &DbPool, table: &str) -> i64 {
    let (rows,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count rows");
    rows
}

#[tokio::test]
async fn first_webhook_for_unknown_project_with_no_action() {
    let h = harness(
        &["Cabinets arrive next week.", r#"{"decision":"NO_ACTION","reason":"on track"}"#],
        RecordingCommunicationSender::new(),
        Vec::new(),
    )
    .await;

    let report = h
        .runtime
        .pipeline()
        .ingest_webhook(&envelope("X123"), "corr-x123", day("2026-03-02T09:00:00Z"))
        .await
        .expect("ingest");

    assert!(report.created);
    assert_eq!(report.decision, "NO_ACTION");
    assert_eq!(report.action_record_id, None);
    assert_eq!(count(&h.pool, "projects").await, 1);
    assert_eq!(count(&h.pool, "action_records").await, 0);

    let runs = h.runtime.prompt_runs().list_for_project(&report.project_id).await.expect("runs");
    assert_eq!(runs.len(), 2, "one summary run and one detection run");
    let summary_run_id = report.summary_prompt_run_id.expect("summary run tracked");
    let summary_runs: Vec<_> = runs.iter().filter(|run| run.id == summary_run_id).collect();
    assert_eq!(summary_runs.len(), 1);
    assert!(summary_runs[0].prompt_input.contains("Write a concise summary"));

    let again = h
        .runtime
        .pipeline()
        .ingest_webhook(&envelope("X123"), "corr-x123-2", day("2026-03-02T10:00:00Z"))
        .await
        .expect("ai failures degrade instead of failing the webhook");
    assert!(!again.created);
    assert_eq!(again.project_id, report.project_id);
    assert!(!again.summary_updated);
    assert_eq!(again.decision, "NO_ACTION");
    assert_eq!(count(&h.pool, "projects").await, 1);
    assert_eq!(count(&h.pool, "action_records").await, 0);

    h.pool.close().await;
}

#[tokio::test]
async fn reminder_decision_schedules_check_three_days_out() {
    let h = harness(
        &[
            "Waiting on the city permit.",
            r#"{"decision":"SET_FUTURE_REMINDER","days_until_check":3,"check_reason":"permit"}"#,
        ],
        RecordingCommunicationSender::new(),
        Vec::new(),
    )
    .await;
    let now = day("2026-03-02T09:00:00Z");

    let report =
        h.runtime.pipeline().ingest_webhook(&envelope("R-1"), "corr-r1", now).await.expect("ingest");

    assert_eq!(report.decision, "SET_FUTURE_REMINDER");
    assert_eq!(report.next_check_date, Some(now + Duration::days(3)));
    let record_id = report.action_record_id.expect("audit record");
    let record = h.runtime.executor().find(&record_id).await.expect("record");
    assert_eq!(record.status, ActionStatus::Executed);
    assert_eq!(record.action_type(), ActionType::SetFutureReminder);

    let sweep_early = h.runtime.sweep().run(now + Duration::days(2)).await.expect("early sweep");
    assert_eq!(sweep_early.due, 0);
    assert_eq!(h.llm.prompts().len(), 2);

    h.pool.close().await;
}

#[tokio::test]
async fn failed_delivery_is_redelivered_by_the_worker_once() {
    let h = harness(
        &[
            "Cabinets delivered.",
            r#"{"decision":"ACTION_NEEDED","action_type":"message","message_content":"Install starts Monday","recipient":{"name":"Dana","phone":"+15550100"}}"#,
        ],
        RecordingCommunicationSender::scripted([Ok(CommunicationResponse::rejected(
            "carrier unavailable",
        ))]),
        vec![ActionType::Message],
    )
    .await;
    let now = Utc::now();

    let report =
        h.runtime.pipeline().ingest_webhook(&envelope("M-1"), "corr-m1", now).await.expect("ingest");
    let Some(ExecutionOutcome::Failed { retry_job_id: Some(job_id), .. }) = report.execution else {
        panic!("expected a failed delivery with a queued retry, got {:?}", report.execution);
    };
    let record_id = report.action_record_id.expect("record");
    assert_eq!(
        h.runtime.executor().find(&record_id).await.expect("record").status,
        ActionStatus::Failed
    );

    let worker_report = h.runtime.worker().run_once(now).await.expect("worker pass");
    assert_eq!(worker_report.claimed, 1);
    assert_eq!(worker_report.completed, 1);

    let job = h.runtime.queue().find(&job_id).await.expect("find").expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.sender.sent().len(), 2, "one direct attempt and one queued redelivery");

    let again = h.runtime.executor().execute_action(&record_id, now).await.expect("execute");
    assert!(matches!(again, ExecutionOutcome::Skipped { .. }));
    assert_eq!(h.runtime.worker().run_once(now).await.expect("idle pass").claimed, 0);
    assert_eq!(h.sender.sent().len(), 2);

    h.pool.close().await;
}
