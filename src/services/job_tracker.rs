//! Job tracking for background pipeline runs.
//!
//! Every accepted notice, map acquisition and plan generation runs as a
//! background task identified by a UUID. The tracker stores per-job progress
//! logs (capped), publishes new entries on a broadcast channel for SSE
//! streaming, and trims the oldest finished jobs so the registry stays
//! bounded over a long campaign.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Log lines kept per job; older lines fall off the front.
const MAX_LOG_LINES: usize = 1000;
/// Finished jobs kept for later status queries.
const FINISHED_RETENTION: usize = 256;
/// Broadcast buffer per job; a subscriber lagging past this many entries
/// skips the overwritten ones.
const CHANNEL_CAPACITY: usize = 256;

/// A single log entry with timestamp and message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Job status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Job metadata and logs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub logs: Vec<LogEntry>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Result of the job (e.g. the event key on success).
    pub result: Option<serde_json::Value>,
}

struct JobSlot {
    job: Job,
    /// Live log feed; dropped on the terminal transition so streaming
    /// subscribers see end-of-stream after draining.
    sender: Option<broadcast::Sender<LogEntry>>,
}

struct Registry {
    jobs: HashMap<String, JobSlot>,
    /// Terminal jobs in completion order, oldest first.
    finished: VecDeque<String>,
}

/// Snapshot plus live tail of one job's log, for SSE streaming.
pub struct JobSubscription {
    /// Entries logged before the subscription.
    pub backlog: Vec<LogEntry>,
    /// Receiver for entries logged after; `None` when the job is already
    /// terminal.
    pub live: Option<broadcast::Receiver<LogEntry>>,
}

/// In-memory job tracker.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<RwLock<Registry>>,
}

impl JobTracker {
    /// Create a new job tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry {
                jobs: HashMap::new(),
                finished: VecDeque::new(),
            })),
        }
    }

    /// Register a new job in `Queued` state and return its ID.
    pub fn create_job(&self) -> String {
        let job_id = Uuid::new_v4().to_string();
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let slot = JobSlot {
            job: Job {
                job_id: job_id.clone(),
                status: JobStatus::Queued,
                logs: vec![],
                created_at: chrono::Utc::now(),
                completed_at: None,
                result: None,
            },
            sender: Some(sender),
        };
        self.inner.write().jobs.insert(job_id.clone(), slot);
        job_id
    }

    /// Mark a queued job as running.
    pub fn start_job(&self, job_id: &str) {
        let mut registry = self.inner.write();
        if let Some(slot) = registry.jobs.get_mut(job_id) {
            if slot.job.status == JobStatus::Queued {
                slot.job.status = JobStatus::Running;
            }
        }
    }

    /// Add a log entry to a job and publish it to live subscribers.
    pub fn log(&self, job_id: &str, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: chrono::Utc::now(),
            level,
            message: message.into(),
        };
        let mut registry = self.inner.write();
        if let Some(slot) = registry.jobs.get_mut(job_id) {
            if slot.job.logs.len() >= MAX_LOG_LINES {
                slot.job.logs.remove(0);
            }
            slot.job.logs.push(entry.clone());
            if let Some(sender) = &slot.sender {
                // No receivers is fine; entries stay in the backlog.
                let _ = sender.send(entry);
            }
        }
    }

    /// Mark a job as completed with optional result.
    pub fn complete_job(&self, job_id: &str, result: Option<serde_json::Value>) {
        let mut registry = self.inner.write();
        if let Some(slot) = registry.jobs.get_mut(job_id) {
            slot.job.status = JobStatus::Completed;
            slot.job.completed_at = Some(chrono::Utc::now());
            slot.job.result = result;
            slot.sender = None;
            Self::retire(&mut registry, job_id);
        }
    }

    /// Mark a job as failed.
    pub fn fail_job(&self, job_id: &str, error_message: impl Into<String>) {
        let mut registry = self.inner.write();
        if let Some(slot) = registry.jobs.get_mut(job_id) {
            let entry = LogEntry {
                timestamp: chrono::Utc::now(),
                level: LogLevel::Error,
                message: error_message.into(),
            };
            if slot.job.logs.len() >= MAX_LOG_LINES {
                slot.job.logs.remove(0);
            }
            slot.job.logs.push(entry.clone());
            if let Some(sender) = &slot.sender {
                let _ = sender.send(entry);
            }
            slot.job.status = JobStatus::Failed;
            slot.job.completed_at = Some(chrono::Utc::now());
            slot.sender = None;
            Self::retire(&mut registry, job_id);
        }
    }

    fn retire(registry: &mut Registry, job_id: &str) {
        registry.finished.push_back(job_id.to_string());
        while registry.finished.len() > FINISHED_RETENTION {
            if let Some(oldest) = registry.finished.pop_front() {
                registry.jobs.remove(&oldest);
            }
        }
    }

    /// Get a job by ID.
    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner.read().jobs.get(job_id).map(|slot| slot.job.clone())
    }

    /// Subscribe to a job's log. The backlog and the live receiver are taken
    /// under one lock, so entries are never lost or duplicated between them.
    pub fn subscribe(&self, job_id: &str) -> Option<JobSubscription> {
        let registry = self.inner.read();
        let slot = registry.jobs.get(job_id)?;
        Some(JobSubscription {
            backlog: slot.job.logs.clone(),
            live: slot.sender.as_ref().map(|s| s.subscribe()),
        })
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}
