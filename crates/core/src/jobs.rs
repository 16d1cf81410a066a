//! Durable per-job state shared across the upload → initiate → fetch-result
//! handshake.
//!
//! Each job is one JSON document under `<uploads>/jobs/`, overwritten whole
//! on every transition. The file is the single source of truth; the DashMap
//! in front of it is strictly a read-through cache and is only updated after
//! a durable write succeeds. Requests touching the same job serialize on a
//! per-job guard, so concurrent processing attempts collapse into one
//! effective transition.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

const MAX_JOB_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Uploaded => "uploaded",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub user_filename: String,
    pub original_filename: String,
    pub original_path: PathBuf,
    #[serde(default)]
    pub processed_filename: Option<String>,
    #[serde(default)]
    pub processed_path: Option<PathBuf>,
    pub upload_time: DateTime<Utc>,
    #[serde(default)]
    pub process_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub process_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// File-backed job records with a read-through in-memory cache and per-job
/// transition guards.
pub struct JobStore {
    jobs_dir: PathBuf,
    cache: DashMap<String, Job>,
    transition_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl JobStore {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Result<Self> {
        let jobs_dir = jobs_dir.into();
        fs::create_dir_all(&jobs_dir).with_context(|| {
            format!("failed to create jobs directory: {}", jobs_dir.display())
        })?;

        Ok(Self {
            jobs_dir,
            cache: DashMap::new(),
            transition_locks: DashMap::new(),
        })
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Write a brand-new record. Fails only on storage I/O.
    pub fn create(&self, job: &Job) -> Result<()> {
        self.persist(job)
    }

    /// Full overwrite of an existing record (not a partial patch).
    pub fn save(&self, job: &Job) -> Result<()> {
        self.persist(job)
    }

    /// Cache first; on a miss, read the on-disk record and populate the
    /// cache. Ids that are not UUID-shaped never touch the filesystem.
    pub fn load(&self, job_id: &str) -> Option<Job> {
        if !job_id_is_valid(job_id) {
            return None;
        }

        if let Some(cached) = self.cache.get(job_id) {
            return Some(cached.clone());
        }

        let path = self.job_file(job_id);
        if !path.exists() {
            return None;
        }

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(job_id, error = %err, "Failed to read job record");
                return None;
            }
        };

        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => {
                self.cache.insert(job_id.to_string(), job.clone());
                Some(job)
            }
            Err(err) => {
                warn!(job_id, error = %err, "Skipping corrupted job record");
                None
            }
        }
    }

    /// Acquire this job's transition guard. Every state transition (and the
    /// cleanup sweep) runs under it, so concurrent processing attempts for
    /// one job collapse into a single effective transition.
    pub async fn transition_guard(&self, job_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .transition_locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Delete a job's record, cached entry and image files. Best effort on
    /// the image files; the record deletion is the authoritative step.
    pub fn remove(&self, job: &Job) -> Result<()> {
        if let Some(originals_dir) = job.original_path.parent() {
            if let Err(err) = fs::remove_dir_all(originals_dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %job.job_id, error = %err, "Failed to remove originals directory");
                }
            }
        }

        if let Some(processed_path) = &job.processed_path {
            if let Err(err) = fs::remove_file(processed_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %job.job_id, error = %err, "Failed to remove processed file");
                }
            }
        }

        let record_path = self.job_file(&job.job_id);
        if record_path.exists() {
            fs::remove_file(&record_path).with_context(|| {
                format!("failed to remove job record: {}", record_path.display())
            })?;
        }
        self.cache.remove(&job.job_id);

        Ok(())
    }

    /// Reclaim storage for jobs past the retention period. A job is removed
    /// only under its transition guard (`try_lock`; contended jobs are
    /// skipped this round) and only by its recorded state and timestamps:
    /// terminal jobs aged from their end time, never-initiated `uploaded`
    /// jobs aged from their upload time. `processing` jobs are never swept.
    pub fn sweep_expired(&self, retention: Duration, now: DateTime<Utc>) -> Vec<String> {
        let entries = match fs::read_dir(&self.jobs_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, jobs_dir = %self.jobs_dir.display(), "Failed to read jobs directory for sweep");
                return Vec::new();
            }
        };

        let mut removed = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };

            let lock = self
                .transition_locks
                .entry(job_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };

            // Re-read under the guard; the record may have transitioned
            // since the directory scan.
            let Some(job) = self.load(&job_id) else {
                continue;
            };

            let expired = match job.status {
                JobStatus::Completed | JobStatus::Failed => {
                    let reference = job.process_end_time.unwrap_or(job.upload_time);
                    now - reference > retention
                }
                JobStatus::Uploaded => now - job.upload_time > retention,
                JobStatus::Processing => false,
            };

            if !expired {
                continue;
            }

            match self.remove(&job) {
                Ok(()) => {
                    info!(job_id = %job.job_id, status = job.status.as_str(), "Swept expired job");
                    removed.push(job.job_id.clone());
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "Failed to sweep expired job");
                }
            }
        }

        for job_id in &removed {
            self.transition_locks.remove(job_id);
        }

        removed
    }

    fn job_file(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{job_id}.json"))
    }

    fn persist(&self, job: &Job) -> Result<()> {
        let path = self.job_file(&job.job_id);
        let encoded = serde_json::to_vec_pretty(job)
            .with_context(|| format!("failed to serialize job record {}", job.job_id))?;

        // Write-then-rename so a concurrent reader never observes a torn
        // record.
        let tmp_path = self.jobs_dir.join(format!("{}.json.tmp", job.job_id));
        fs::write(&tmp_path, &encoded)
            .with_context(|| format!("failed to write job record: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to commit job record: {}", path.display()))?;

        self.cache.insert(job.job_id.clone(), job.clone());
        Ok(())
    }
}

fn job_id_is_valid(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= MAX_JOB_ID_LEN
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}
