pub mod classification;
pub mod config;
pub mod incident;
pub mod job_queue;
pub mod memory_queue;
pub mod message_event;
pub(crate) mod pg;
pub mod run_tracker;
pub mod service;
pub mod store;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use incident::{IncidentLedger, IncidentOutcome, Severity};
pub use job_queue::{
    ClassifyJob, EnqueueOptions, JobQueue, JobQueueError, JobType, MaterializeJob, PipelineJob,
    PostgresJobQueue,
};
pub use memory_queue::MemoryJobQueue;
pub use message_event::{Direction, EventStatus, EventTransition, MessageEvent};
pub use run_tracker::{PipelineRun, RunState};
pub use store::{MemoryPipelineStore, PipelineStore, PipelineStoreError, PostgresPipelineStore};
pub use supervisor::{Supervisor, SupervisorError, SweepPhase, SweepSummary};
