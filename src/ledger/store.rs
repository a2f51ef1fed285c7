use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info};

use crate::job::{ExportJob, ExportTask, JobError, JobStatus};

use super::error::{LedgerError, Result};
use super::partitions::{encode_job_key, encode_status_key, encode_status_prefix};

/// Fields applied alongside a status update.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub error_message: Option<String>,
}

/// Persistent store of job records.
///
/// Every mutator validates the transition through the entity, persists the
/// result, and returns the post-update view so callers never act on a stale
/// snapshot. Counter increments are atomic: two concurrent increments are
/// serialized and each observes the other's effect.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a new job. Fails with [`LedgerError::DuplicateJob`] if the
    /// `job_id` is already known.
    async fn save(&self, job: &ExportJob) -> Result<ExportJob>;

    async fn find_by_id(&self, job_id: &str) -> Result<Option<ExportJob>>;

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<ExportJob>;

    async fn increment_completed_tasks(&self, job_id: &str) -> Result<ExportJob>;

    async fn increment_failed_tasks(
        &self,
        job_id: &str,
        error_message: Option<&str>,
    ) -> Result<ExportJob>;

    /// Record the task split and set the completion denominator in one step.
    async fn record_tasks(&self, job_id: &str, tasks: Vec<ExportTask>) -> Result<ExportJob>;

    async fn find_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<ExportJob>>;

    /// Administrative cleanup only; live flows never delete jobs.
    async fn delete(&self, job_id: &str) -> Result<()>;

    /// Liveness probe of the backing store.
    async fn health_check(&self) -> Result<()>;
}

/// Apply a status move through the entity so repository implementations
/// share one transition table.
pub(crate) fn apply_status(
    job: &ExportJob,
    status: JobStatus,
    patch: &StatusPatch,
) -> std::result::Result<ExportJob, JobError> {
    match status {
        JobStatus::Processing => job.transition_to_processing(),
        JobStatus::Polling => job.transition_to_polling(),
        JobStatus::Downloading => job.transition_to_downloading(),
        JobStatus::Completed => job.transition_to_completed(),
        JobStatus::Failed => {
            let message = patch
                .error_message
                .as_deref()
                .unwrap_or("unspecified failure");
            job.transition_to_failed(message)
        }
        JobStatus::Pending => Err(JobError::InvalidTransition {
            from: job.status,
            to: JobStatus::Pending,
        }),
    }
}

/// Fjall-backed job ledger.
pub struct FjallJobStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    status_index: PartitionHandle,
    // Serializes read-modify-write cycles so counter updates are
    // linearizable. All fjall calls inside the critical section are
    // synchronous; the lock is never held across an await.
    writer: Mutex<()>,
}

impl FjallJobStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening job ledger");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let status_index =
            keyspace.open_partition("status_index", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            jobs,
            status_index,
            writer: Mutex::new(()),
        })
    }

    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    fn load(&self, job_id: &str) -> Result<Option<ExportJob>> {
        match self.jobs.get(encode_job_key(job_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn persist_job(&self, previous_status: Option<JobStatus>, job: &ExportJob) -> Result<()> {
        let value = serde_json::to_vec(job)?;
        self.jobs.insert(encode_job_key(&job.job_id), value)?;

        if previous_status != Some(job.status) {
            if let Some(old) = previous_status {
                self.status_index
                    .remove(encode_status_key(old, &job.job_id))?;
            }
            self.status_index.insert(
                encode_status_key(job.status, &job.job_id),
                job.job_id.as_bytes(),
            )?;
        }
        Ok(())
    }

    fn mutate<F>(&self, job_id: &str, f: F) -> Result<ExportJob>
    where
        F: FnOnce(&ExportJob) -> std::result::Result<ExportJob, JobError>,
    {
        let _guard = self.writer.lock().expect("ledger writer lock poisoned");
        let current = self
            .load(job_id)?
            .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))?;
        let next = f(&current)?;
        self.persist_job(Some(current.status), &next)?;
        debug!(job_id, status = %next.status, "Job updated");
        Ok(next)
    }
}

#[async_trait]
impl JobRepository for FjallJobStore {
    async fn save(&self, job: &ExportJob) -> Result<ExportJob> {
        let _guard = self.writer.lock().expect("ledger writer lock poisoned");
        if self.load(&job.job_id)?.is_some() {
            return Err(LedgerError::DuplicateJob(job.job_id.clone()));
        }
        self.persist_job(None, job)?;
        debug!(job_id = %job.job_id, "Job saved");
        Ok(job.clone())
    }

    async fn find_by_id(&self, job_id: &str) -> Result<Option<ExportJob>> {
        self.load(job_id)
    }

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<ExportJob> {
        self.mutate(job_id, |job| apply_status(job, status, &patch))
    }

    async fn increment_completed_tasks(&self, job_id: &str) -> Result<ExportJob> {
        self.mutate(job_id, |job| job.increment_completed())
    }

    async fn increment_failed_tasks(
        &self,
        job_id: &str,
        error_message: Option<&str>,
    ) -> Result<ExportJob> {
        self.mutate(job_id, |job| job.increment_failed(error_message))
    }

    async fn record_tasks(&self, job_id: &str, tasks: Vec<ExportTask>) -> Result<ExportJob> {
        self.mutate(job_id, |job| job.with_tasks(tasks))
    }

    async fn find_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<ExportJob>> {
        let prefix = encode_status_prefix(status);
        let mut jobs = Vec::new();
        for item in self.status_index.prefix(prefix).take(limit) {
            let (_, value) = item?;
            let job_id = String::from_utf8_lossy(&value).to_string();
            if let Some(job) = self.load(&job_id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        let _guard = self.writer.lock().expect("ledger writer lock poisoned");
        if let Some(job) = self.load(job_id)? {
            self.status_index
                .remove(encode_status_key(job.status, job_id))?;
            self.jobs.remove(encode_job_key(job_id))?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let _ = self.jobs.get(b"job:__health__")?;
        Ok(())
    }
}
