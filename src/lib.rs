pub mod broker;
pub mod capability;
pub mod error;
pub mod job;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod settings;
pub mod store;
pub mod worker;

pub use broker::{Broker, Delivery, MemoryBroker};
pub use job::{AnalysisResult, Job, JobId, JobStatus, StageName, StageResult};
pub use pipeline::{PipelineExecutor, RunOutcome};
pub use registry::CapabilityRegistry;
pub use service::{AnalysisService, JobStats, ResultView};
pub use settings::Settings;
pub use store::{JobStore, MemoryJobStore};
pub use worker::WorkerPool;
