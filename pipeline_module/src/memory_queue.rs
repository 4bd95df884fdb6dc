use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::job_queue::{
    failure_backoff_secs, EnqueueOptions, EnqueueResult, JobQueue, JobQueueError, JobType,
    PipelineJob, QueuedJob,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryJobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MemoryJob {
    pub id: Uuid,
    pub idempotency_key: String,
    pub job: PipelineJob,
    pub status: MemoryJobStatus,
    pub available_at: DateTime<Utc>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct MemoryQueueState {
    jobs: Vec<MemoryJob>,
    keys: HashSet<String>,
}

/// Process-local queue for the `memory` backend and for tests.
///
/// Leases are not tracked: a claimed job stays `Processing` until it is
/// marked done or failed.
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
    max_attempts: i32,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_max_attempts(5)
    }

    pub fn with_max_attempts(max_attempts: i32) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            max_attempts,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryQueueState>, JobQueueError> {
        self.state
            .lock()
            .map_err(|_| JobQueueError::Unavailable("memory queue lock poisoned".to_string()))
    }

    pub fn jobs(&self) -> Vec<MemoryJob> {
        self.state
            .lock()
            .map(|state| state.jobs.clone())
            .unwrap_or_default()
    }

    pub fn jobs_of_type(&self, job_type: JobType) -> Vec<PipelineJob> {
        self.jobs()
            .into_iter()
            .filter(|entry| entry.job.job_type() == job_type)
            .map(|entry| entry.job)
            .collect()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for MemoryJobQueue {
    fn enqueue(
        &self,
        job: &PipelineJob,
        options: &EnqueueOptions,
    ) -> Result<EnqueueResult, JobQueueError> {
        let mut state = self.lock()?;
        if !state.keys.insert(options.idempotency_key.clone()) {
            return Ok(EnqueueResult { inserted: false });
        }
        let delay = Duration::from_std(options.delay)
            .map_err(|err| JobQueueError::Config(err.to_string()))?;
        state.jobs.push(MemoryJob {
            id: Uuid::new_v4(),
            idempotency_key: options.idempotency_key.clone(),
            job: job.clone(),
            status: MemoryJobStatus::Pending,
            available_at: Utc::now() + delay,
            attempts: 0,
            last_error: None,
        });
        Ok(EnqueueResult { inserted: true })
    }

    fn claim_next(&self, job_type: JobType) -> Result<Option<QueuedJob>, JobQueueError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let max_attempts = self.max_attempts;
        let next = state
            .jobs
            .iter_mut()
            .filter(|entry| {
                entry.job.job_type() == job_type
                    && entry.status == MemoryJobStatus::Pending
                    && entry.available_at <= now
                    && entry.attempts < max_attempts
            })
            .min_by_key(|entry| entry.available_at);
        let Some(entry) = next else {
            return Ok(None);
        };
        entry.status = MemoryJobStatus::Processing;
        entry.attempts += 1;
        Ok(Some(QueuedJob {
            id: entry.id,
            attempts: entry.attempts,
            job: entry.job.clone(),
        }))
    }

    fn mark_done(&self, id: &Uuid) -> Result<(), JobQueueError> {
        let mut state = self.lock()?;
        if let Some(entry) = state.jobs.iter_mut().find(|entry| entry.id == *id) {
            entry.status = MemoryJobStatus::Done;
        }
        Ok(())
    }

    fn mark_failed(&self, id: &Uuid, error: &str) -> Result<(), JobQueueError> {
        let mut state = self.lock()?;
        let max_attempts = self.max_attempts;
        if let Some(entry) = state.jobs.iter_mut().find(|entry| entry.id == *id) {
            entry.last_error = Some(error.to_string());
            if entry.attempts >= max_attempts {
                entry.status = MemoryJobStatus::Failed;
            } else {
                entry.status = MemoryJobStatus::Pending;
                entry.available_at =
                    Utc::now() + Duration::seconds(failure_backoff_secs(entry.attempts));
            }
        }
        Ok(())
    }
}
