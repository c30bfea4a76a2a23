//! Project pipeline services.
//!
//! A CRM change event flows through:
//! 1. **Summary** (`summary`) - refresh the project summary with a tracked prompt run
//! 2. **Detection** (`detection`) - ask the model for one of five decisions and persist it
//! 3. **Execution** (`executor`) - gated delivery of approved actions
//! 4. **Integration queue** (`queue`) - durable retries with capped exponential backoff
//!
//! `reminders` re-enters detection for projects whose check date has elapsed,
//! and `runtime` wires the whole graph from configuration.
//!
//! The model only proposes. Approval state, retry policy, and persistence are
//! decided by the deterministic code in this crate and in `crewflow-core`.

pub mod detection;
pub mod executor;
pub mod integrations;
pub mod llm;
pub mod pipeline;
pub mod prompt_runs;
pub mod queue;
pub mod reminders;
pub mod runtime;
pub mod summary;
