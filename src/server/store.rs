use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::model::{
    messages, AgentClientMetadata, ArchiveStatus, JobRequest, JobSpecification, JobStatus,
};

const DEFAULT_MAX_JOBS: usize = 10_000;
const DEFAULT_RETAINED_FINISHED: usize = 10_000;

/// Everything the server knows about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub request: JobRequest,
    /// Agent that reserved the id, when the job came in through an agent.
    pub reserved_by: Option<AgentClientMetadata>,
    pub status: JobStatus,
    pub status_message: String,
    pub claimed: bool,
    pub claimed_by: Option<AgentClientMetadata>,
    pub specification: Option<JobSpecification>,
    pub archive_status: ArchiveStatus,
    /// Submitted through the server API rather than by a standalone agent.
    pub api_job: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn new(
        id: String,
        request: JobRequest,
        reserved_by: Option<AgentClientMetadata>,
        api_job: bool,
    ) -> Self {
        let now = Utc::now();
        let archive_status = if request.agent_config.archiving_disabled {
            ArchiveStatus::Disabled
        } else {
            ArchiveStatus::Pending
        };
        Self {
            id,
            request,
            reserved_by,
            status: JobStatus::Reserved,
            status_message: messages::JOB_RESERVED.to_string(),
            claimed: false,
            claimed_by: None,
            specification: None,
            archive_status,
            api_job,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Persistence contract for jobs.
///
/// Every mutation of a job's status is a single atomic compare-and-set keyed
/// by job id; implementations must never read and then write in two steps.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new request in RESERVED and return its id.
    async fn save_job_request(
        &self,
        request: JobRequest,
        reserved_by: Option<AgentClientMetadata>,
        api_job: bool,
    ) -> Result<String>;

    async fn get_job(&self, job_id: &str) -> Result<JobRecord>;

    async fn get_status(&self, job_id: &str) -> Result<JobStatus>;

    /// Store the specification and move the job to RESOLVED. If one is
    /// already stored it is returned unchanged.
    async fn save_specification(
        &self,
        job_id: &str,
        specification: JobSpecification,
    ) -> Result<JobSpecification>;

    async fn claim_job(&self, job_id: &str, agent: AgentClientMetadata) -> Result<()>;

    /// Move from `current` to `new` if and only if the persisted status is
    /// `current`.
    async fn update_status(
        &self,
        job_id: &str,
        current: JobStatus,
        new: JobStatus,
        message: &str,
    ) -> Result<()>;

    /// Unconditional overwrite.
    async fn set_archive_status(&self, job_id: &str, status: ArchiveStatus) -> Result<()>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Vec<JobRecord>;
}

/// [`JobStore`] over a concurrent map. Each job lives in its own entry so
/// updates to unrelated jobs never contend on one lock.
///
/// `max_jobs` caps unfinished jobs. Finished jobs stay readable until more
/// than `retained_finished` of them exist, then the oldest are dropped.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: DashMap<String, JobRecord>,
    max_jobs: usize,
    active: AtomicUsize,
    retained_finished: usize,
    finished: Mutex<VecDeque<String>>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            max_jobs,
            active: AtomicUsize::new(0),
            retained_finished: DEFAULT_RETAINED_FINISHED,
            finished: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_retained_finished(mut self, retained: usize) -> Self {
        self.retained_finished = retained;
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs that have not reached a final status.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn finished_queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        match self.finished.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Release the job's capacity slot and drop the oldest finished jobs past
    /// the retention limit. Must not be called while holding a map guard.
    fn retire(&self, job_id: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let mut finished = self.finished_queue();
        finished.push_back(job_id.to_string());
        while finished.len() > self.retained_finished {
            let Some(oldest) = finished.pop_front() else {
                break;
            };
            if self.jobs.remove(&oldest).is_some() {
                tracing::debug!(job_id = %oldest, "Dropped finished job past retention");
            }
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save_job_request(
        &self,
        request: JobRequest,
        reserved_by: Option<AgentClientMetadata>,
        api_job: bool,
    ) -> Result<String> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_jobs).then_some(n + 1)
            })
            .map_err(|_| ProtocolError::StoreFull)?;
        let id = request
            .requested_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.jobs.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                Err(ProtocolError::IdAlreadyExists(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(JobRecord::new(id.clone(), request, reserved_by, api_job));
                Ok(id)
            }
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        self.jobs
            .get(job_id)
            .map(|job| job.clone())
            .ok_or_else(|| ProtocolError::JobNotFound(job_id.to_string()))
    }

    async fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        self.jobs
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| ProtocolError::JobNotFound(job_id.to_string()))
    }

    async fn save_specification(
        &self,
        job_id: &str,
        specification: JobSpecification,
    ) -> Result<JobSpecification> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ProtocolError::JobNotFound(job_id.to_string()))?;

        if let Some(existing) = &job.specification {
            tracing::debug!(job_id, "Specification already stored");
            return Ok(existing.clone());
        }
        if !job.status.is_resolvable() {
            return Err(ProtocolError::InvalidStatus {
                job_id: job_id.to_string(),
                status: job.status,
                reason: "only reserved jobs can be resolved".to_string(),
            });
        }

        job.specification = Some(specification.clone());
        job.status = JobStatus::Resolved;
        job.status_message = messages::JOB_RESOLVED.to_string();
        job.updated_at = Utc::now();
        Ok(specification)
    }

    async fn claim_job(&self, job_id: &str, agent: AgentClientMetadata) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ProtocolError::JobNotFound(job_id.to_string()))?;

        if job.claimed {
            return Err(ProtocolError::AlreadyClaimed(job_id.to_string()));
        }
        if !job.status.is_claimable() {
            return Err(ProtocolError::InvalidStatus {
                job_id: job_id.to_string(),
                status: job.status,
                reason: "only resolved jobs can be claimed".to_string(),
            });
        }

        job.claimed = true;
        job.claimed_by = Some(agent);
        job.status = JobStatus::Claimed;
        job.status_message = messages::JOB_CLAIMED.to_string();
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: &str,
        current: JobStatus,
        new: JobStatus,
        message: &str,
    ) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ProtocolError::JobNotFound(job_id.to_string()))?;

        if current == new {
            return Err(ProtocolError::NoOpTransition {
                job_id: job_id.to_string(),
                status: current,
            });
        }
        if job.status != current {
            return Err(ProtocolError::StaleStatus {
                job_id: job_id.to_string(),
                expected: current,
                actual: job.status,
            });
        }
        if current.is_finished() {
            return Err(ProtocolError::InvalidStatus {
                job_id: job_id.to_string(),
                status: current,
                reason: "finished jobs cannot change status".to_string(),
            });
        }

        let now = Utc::now();
        job.status = new;
        job.status_message = message.to_string();
        job.updated_at = now;
        if new == JobStatus::Running {
            job.started_at = Some(now);
        } else if new.is_finished() && job.started_at.is_some() {
            job.finished_at = Some(now);
        }
        drop(job);

        if new.is_finished() {
            self.retire(job_id);
        }
        Ok(())
    }

    async fn set_archive_status(&self, job_id: &str, status: ArchiveStatus) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ProtocolError::JobNotFound(job_id.to_string()))?;
        job.archive_status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list_jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}
