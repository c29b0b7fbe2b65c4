//! BackgroundScheduler - fire-and-forget job execution
//!
//! `BACKGROUND <query>` submissions get a job id immediately and run on
//! a bounded worker pool. The submitting query's identity is captured at
//! enqueue time and re-entered on the worker, so every log row the job
//! produces still rolls up to the original caller even though it runs on
//! a different thread. Submissions beyond queue capacity block the
//! submitter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::identity::{Identity, IdentityContext};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// A background job's record, queryable by id
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub description: String,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub caller_id: String,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct Job {
    id: String,
    identity: Identity,
    work: BoxFuture<'static, Result<Value, String>>,
}

/// Bounded fire-and-forget scheduler
pub struct BackgroundScheduler {
    jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
    tx: mpsc::Sender<Job>,
}

impl BackgroundScheduler {
    /// Spawn the scheduler with `workers` concurrent jobs and a bounded queue
    pub fn new(workers: usize, queue_capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let jobs: Arc<Mutex<HashMap<String, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let jobs = Arc::clone(&jobs);
            tokio::spawn(async move {
                debug!(worker_id, "BackgroundScheduler: worker started");
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        debug!(worker_id, "BackgroundScheduler: queue closed, worker exiting");
                        break;
                    };
                    Self::run_job(&jobs, job, worker_id).await;
                }
            });
        }

        Arc::new(Self { jobs, tx })
    }

    async fn run_job(jobs: &Arc<Mutex<HashMap<String, JobRecord>>>, job: Job, worker_id: usize) {
        let Job { id, identity, work } = job;
        info!(job_id = %id, worker_id, caller_id = %identity.caller_id, "BackgroundScheduler: job starting");
        set_status(jobs, &id, JobStatus::Running);

        // Workers are reused across jobs; the thread tier is set for the
        // duration of this job and cleared after, while the task tier
        // scopes the actual work.
        IdentityContext::set(identity.clone());
        let result = IdentityContext::scope(identity, work).await;
        IdentityContext::clear();

        let mut jobs = jobs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = jobs.get_mut(&id) {
            record.finished_at = Some(Utc::now());
            match result {
                Ok(value) => {
                    record.status = JobStatus::Completed;
                    record.result = Some(value);
                }
                Err(message) => {
                    warn!(job_id = %id, error = %message, "BackgroundScheduler: job failed");
                    record.status = JobStatus::Failed;
                    record.error = Some(message);
                }
            }
        }
    }

    /// Enqueue work; returns the job id immediately
    ///
    /// The ambient identity at submission time is attached to the job.
    /// Blocks when the queue is at capacity.
    pub async fn submit(
        &self,
        description: impl Into<String>,
        work: BoxFuture<'static, Result<Value, String>>,
    ) -> eyre::Result<String> {
        let id = format!("job-{}", uuid::Uuid::now_v7().simple());
        let identity = IdentityContext::get();

        let record = JobRecord {
            id: id.clone(),
            description: description.into(),
            status: JobStatus::Queued,
            result: None,
            error: None,
            caller_id: identity.caller_id.clone(),
            submitted_at: Utc::now(),
            finished_at: None,
        };
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), record);

        self.tx
            .send(Job {
                id: id.clone(),
                identity,
                work,
            })
            .await
            .map_err(|_| eyre::eyre!("Background scheduler is shut down"))?;

        debug!(job_id = %id, "BackgroundScheduler: job queued");
        Ok(id)
    }

    /// Look up a job's status/result
    pub fn job(&self, id: &str) -> Option<JobRecord> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).get(id).cloned()
    }

    /// All jobs, newest first
    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    /// Wait (bounded) for a job to reach a terminal state - test helper
    pub async fn wait_for(&self, id: &str, timeout: std::time::Duration) -> Option<JobRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.job(id) {
                if matches!(record.status, JobStatus::Completed | JobStatus::Failed) {
                    return Some(record);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return self.job(id);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

fn set_status(jobs: &Arc<Mutex<HashMap<String, JobRecord>>>, id: &str, status: JobStatus) {
    if let Some(record) = jobs.lock().unwrap_or_else(|p| p.into_inner()).get_mut(id) {
        record.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    async fn test_submit_returns_immediately_and_completes() {
        let scheduler = BackgroundScheduler::new(2, 8);
        let id = scheduler
            .submit("quick job", Box::pin(async { Ok(serde_json::json!(42)) }))
            .await
            .unwrap();

        // Submission returned before completion; the record exists now
        assert!(scheduler.job(&id).is_some());

        let record = scheduler.wait_for(&id, std::time::Duration::from_secs(2)).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result, Some(serde_json::json!(42)));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_job_carries_error_digest() {
        let scheduler = BackgroundScheduler::new(1, 4);
        let id = scheduler
            .submit("doomed", Box::pin(async { Err("engine exploded".to_string()) }))
            .await
            .unwrap();

        let record = scheduler.wait_for(&id, std::time::Duration::from_secs(2)).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("engine exploded"));
    }

    #[tokio::test]
    #[serial]
    async fn test_identity_attached_and_visible_on_worker() {
        let scheduler = BackgroundScheduler::new(1, 4);

        let identity = Identity::new("http-abc-1", serde_json::json!({"sql": "BACKGROUND SELECT 1"}));
        let id = IdentityContext::scope(identity, async {
            scheduler
                .submit(
                    "identity probe",
                    Box::pin(async {
                        // The worker thread sees the submitter's identity
                        Ok(serde_json::json!(IdentityContext::get().caller_id))
                    }),
                )
                .await
                .unwrap()
        })
        .await;

        let record = scheduler.wait_for(&id, std::time::Duration::from_secs(2)).await.unwrap();
        assert_eq!(record.caller_id, "http-abc-1");
        assert_eq!(record.result, Some(serde_json::json!("http-abc-1")));
    }

    #[tokio::test]
    async fn test_jobs_listing_newest_first() {
        let scheduler = BackgroundScheduler::new(1, 4);
        let a = scheduler
            .submit("first", Box::pin(async { Ok(serde_json::Value::Null) }))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = scheduler
            .submit("second", Box::pin(async { Ok(serde_json::Value::Null) }))
            .await
            .unwrap();

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, b);
        assert_eq!(jobs[1].id, a);
    }
}
