//! Scan job lifecycle.
//!
//! The job manager owns every scan: it validates and expands the config
//! up front (so bad input fails the submit, not the job), runs the
//! scanner on a background task, tracks progress, and enforces the
//! monotonic status machine `Pending -> Running -> {Completed, Failed,
//! Cancelled}`. Terminal jobs are reaped after a retention window.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::expand::expand_targets;
use crate::scanner::Scanner;
use crate::store::{DiscoveredServer, DiscoveryStore};

/// Default retention for terminal jobs.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Scan job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not yet started.
    Pending,
    /// The scanner is working.
    Running,
    /// Finished normally.
    Completed,
    /// Aborted by an internal failure.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl JobStatus {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Externally visible job state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    /// Job id.
    pub job_id: String,
    /// The config as submitted.
    pub config: ScanConfig,
    /// Current status.
    pub status: JobStatus,
    /// Fraction of targets processed, `0.0..=1.0`.
    pub progress: f64,
    /// When the scanner started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Servers this job found.
    pub results: Vec<DiscoveredServer>,
    /// Per-probe errors the job recorded.
    pub errors: Vec<String>,
}

struct JobRecord {
    snapshot: RwLock<JobSnapshot>,
    cancel: CancellationToken,
}

impl JobRecord {
    /// Transition status, refusing to leave a terminal state.
    fn transition(&self, next: JobStatus) -> bool {
        let mut snapshot = self.snapshot.write();
        if snapshot.status.is_terminal() {
            return false;
        }
        snapshot.status = next;
        match next {
            JobStatus::Running => snapshot.started_at = Some(Utc::now()),
            status if status.is_terminal() => snapshot.finished_at = Some(Utc::now()),
            _ => {}
        }
        true
    }
}

/// Owns scan jobs and the background tasks running them.
pub struct JobManager {
    jobs: DashMap<String, Arc<JobRecord>>,
    scanner: Arc<Scanner>,
    store: Arc<DiscoveryStore>,
    retention: Duration,
    /// Addresses treated as "the gateway itself" for `excludeProxy`.
    local_addresses: Vec<IpAddr>,
    shutdown: CancellationToken,
}

impl JobManager {
    /// Create a manager writing results into `store`.
    pub fn new(
        scanner: Arc<Scanner>,
        store: Arc<DiscoveryStore>,
        local_addresses: Vec<IpAddr>,
    ) -> Self {
        Self {
            jobs: DashMap::new(),
            scanner,
            store,
            retention: DEFAULT_RETENTION,
            local_addresses,
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the terminal-job retention window.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Validate `config`, register a job, and launch it in the background.
    pub fn submit(self: &Arc<Self>, config: ScanConfig) -> DiscoveryResult<JobSnapshot> {
        let timeout = config.probe_timeout()?;
        let concurrency = config.concurrency();
        let exclusions: &[IpAddr] = if config.exclude_proxy {
            &self.local_addresses
        } else {
            &[]
        };
        let targets = expand_targets(&config, exclusions)?;

        let job_id = Uuid::new_v4().to_string();
        let record = Arc::new(JobRecord {
            snapshot: RwLock::new(JobSnapshot {
                job_id: job_id.clone(),
                config,
                status: JobStatus::Pending,
                progress: 0.0,
                started_at: None,
                finished_at: None,
                results: Vec::new(),
                errors: Vec::new(),
            }),
            cancel: self.shutdown.child_token(),
        });
        self.jobs.insert(job_id.clone(), Arc::clone(&record));
        info!(%job_id, targets = targets.len(), "scan job submitted");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_job(&record, targets, timeout, concurrency).await;
        });

        Ok(self
            .get(&job_id)
            .expect("job was just inserted"))
    }

    async fn run_job(
        &self,
        record: &Arc<JobRecord>,
        targets: Vec<std::net::SocketAddr>,
        timeout: Duration,
        concurrency: usize,
    ) {
        if !record.transition(JobStatus::Running) {
            // Cancelled before it ever started.
            return;
        }

        let progress_record = Arc::clone(record);
        let outcome = self
            .scanner
            .run(&targets, timeout, concurrency, &record.cancel, move |p| {
                progress_record.snapshot.write().progress = p;
            })
            .await;

        for server in &outcome.results {
            self.store.upsert(server.clone());
        }

        {
            let mut snapshot = record.snapshot.write();
            snapshot.results = outcome.results;
            snapshot.errors = outcome.errors;
            if !snapshot.status.is_terminal() {
                snapshot.progress = 1.0;
            }
        }
        let finished = if record.cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        record.transition(finished);
        debug!(job_id = %record.snapshot.read().job_id, status = %finished, "scan job finished");
    }

    /// Snapshot one job.
    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.get(job_id).map(|r| r.snapshot.read().clone())
    }

    /// Snapshot every job, newest submissions included.
    pub fn list(&self) -> Vec<JobSnapshot> {
        self.jobs.iter().map(|r| r.snapshot.read().clone()).collect()
    }

    /// Cancel a job. Idempotent for already-cancelled jobs; completed and
    /// failed jobs refuse.
    pub fn cancel(&self, job_id: &str) -> DiscoveryResult<JobSnapshot> {
        let record = self
            .jobs
            .get(job_id)
            .ok_or_else(|| DiscoveryError::UnknownJob {
                id: job_id.to_string(),
            })?;

        let status = record.snapshot.read().status;
        match status {
            JobStatus::Cancelled => {}
            JobStatus::Completed | JobStatus::Failed => {
                return Err(DiscoveryError::JobFinished {
                    id: job_id.to_string(),
                    status: status.to_string(),
                });
            }
            JobStatus::Pending | JobStatus::Running => {
                record.transition(JobStatus::Cancelled);
                record.cancel.cancel();
                info!(%job_id, "scan job cancelled");
            }
        }
        Ok(record.snapshot.read().clone())
    }

    /// Drop terminal jobs older than the retention window.
    pub fn reap(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        self.jobs.retain(|_, record| {
            let snapshot = record.snapshot.read();
            !(snapshot.status.is_terminal()
                && snapshot.finished_at.is_some_and(|at| at < cutoff))
        });
    }

    /// Run [`JobManager::reap`] on an interval until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.reap(),
                    () = manager.shutdown.cancelled() => return,
                }
            }
        })
    }

    /// Cancel every job and stop background work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
