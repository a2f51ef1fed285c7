use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::job::{ExportJob, ExportTask, JobStatus};

use super::error::{LedgerError, Result};
use super::store::{apply_status, JobRepository, StatusPatch};

/// In-memory job ledger for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, ExportJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, job_id: &str, f: F) -> Result<ExportJob>
    where
        F: FnOnce(&ExportJob) -> std::result::Result<ExportJob, crate::job::JobError>,
    {
        let mut jobs = self.jobs.lock().expect("job map lock poisoned");
        let current = jobs
            .get(job_id)
            .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))?;
        let next = f(current)?;
        jobs.insert(job_id.to_string(), next.clone());
        Ok(next)
    }
}

#[async_trait]
impl JobRepository for MemoryJobStore {
    async fn save(&self, job: &ExportJob) -> Result<ExportJob> {
        let mut jobs = self.jobs.lock().expect("job map lock poisoned");
        if jobs.contains_key(&job.job_id) {
            return Err(LedgerError::DuplicateJob(job.job_id.clone()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(job.clone())
    }

    async fn find_by_id(&self, job_id: &str) -> Result<Option<ExportJob>> {
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        Ok(jobs.get(job_id).cloned())
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
        let jobs = self.jobs.lock().expect("job map lock poisoned");
        Ok(jobs
            .values()
            .filter(|job| job.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("job map lock poisoned");
        jobs.remove(job_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;

    fn job(job_id: &str) -> ExportJob {
        ExportJob::create(NewJob {
            job_id: job_id.to_string(),
            export_id: "e".to_string(),
            user_id: "u".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn behaves_like_the_fjall_store() {
        let store = MemoryJobStore::new();
        store.save(&job("j1")).await.unwrap();
        assert!(matches!(
            store.save(&job("j1")).await,
            Err(LedgerError::DuplicateJob(_))
        ));

        let view = store
            .update_status("j1", JobStatus::Processing, StatusPatch::default())
            .await
            .unwrap();
        assert_eq!(view.status, JobStatus::Processing);

        let by_status = store
            .find_by_status(JobStatus::Processing, 10)
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
    }
}
