//! Per-job run exclusion.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{Result, SyncError};

/// Ids of jobs with a run in progress, shared by one orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ActiveJobs {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl ActiveJobs {
    /// Mark `job_id` active, failing with `RunInProgress` if it already is.
    ///
    /// The returned guard releases the id when dropped.
    pub fn acquire(&self, job_id: &str) -> Result<JobGuard> {
        let mut ids = self
            .ids
            .lock()
            .map_err(|_| SyncError::RunInProgress(job_id.to_string()))?;
        if !ids.insert(job_id.to_string()) {
            return Err(SyncError::RunInProgress(job_id.to_string()));
        }
        Ok(JobGuard {
            ids: Arc::clone(&self.ids),
            job_id: job_id.to_string(),
        })
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.ids
            .lock()
            .map(|ids| ids.contains(job_id))
            .unwrap_or(false)
    }
}

/// Releases its job id on drop.
#[derive(Debug)]
pub struct JobGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.job_id);
        }
    }
}
