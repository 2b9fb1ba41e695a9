mod orchestrator;
mod report;

pub use orchestrator::BatchOrchestrator;
pub use report::{BatchReport, JobStatus, ReportSettings, VideoJobResult};
