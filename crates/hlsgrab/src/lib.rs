pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod hls;
pub mod manifest;

pub use batch::{BatchOrchestrator, BatchReport, JobStatus, VideoJobResult};
pub use client::build_client;
pub use config::{
    BatchConfig, FaultInjection, HeaderDefaults, HttpConfig, IvSource, JobConfig, MergeTool,
    ProxyAuth, ProxyConfig, ProxyType,
};
pub use error::JobError;
pub use headers::HeaderProfile;
pub use hls::{HlsJob, JobOutcome};
pub use manifest::{BatchManifest, ManifestEntry};
