//! Capture-to-upload orchestration.

mod backoff;
mod events;
mod orchestrator;

pub use backoff::RetryPolicy;
pub use events::PipelineEvent;
pub use orchestrator::{log_ledger_summary, Pipeline, PipelineConfig, PipelineDeps};
