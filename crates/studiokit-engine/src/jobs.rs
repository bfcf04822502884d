use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

use serde_json::json;
use studiokit_core::{JobEvent, JobKind, JobStatus, Outcome, StudioError};
use studiokit_observability::{metrics, trace};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

struct ActiveJob {
    id: u64,
    kind: JobKind,
    progress: u8,
    cancel: CancellationToken,
    started: Instant,
    // Cancel was requested; the entry stays until the owner settles.
    cancelling: bool,
}

struct Inner {
    data_dir: PathBuf,
    active: Mutex<HashMap<String, ActiveJob>>,
    events: broadcast::Sender<JobEvent>,
    next_id: AtomicU64,
}

/// Registry of in-flight operations, at most one per key.
///
/// A cancelled job keeps its key until the owning operation has unwound, so a new
/// job for the same key cannot start while the old one is still cleaning up.
/// Events are sent while the registry lock is held, so subscribers see them in order
/// and never see progress after a terminal event.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Inner>,
}

/// Handle given to the operation that owns a job.
#[derive(Debug, Clone)]
pub struct JobToken {
    key: String,
    id: u64,
    kind: JobKind,
    cancel: CancellationToken,
}

impl JobToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Live view of job events. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<JobEvent>,
    key: Option<String>,
}

impl Subscription {
    fn wants(&self, ev: &JobEvent) -> bool {
        self.key.as_deref().map_or(true, |k| k == ev.key)
    }

    /// Next matching event, or `None` once the tracker is gone.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if self.wants(&ev) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `next`.
    pub fn try_next(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) if self.wants(&ev) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// Marks the job cancelled if the owning future is dropped before it settles.
struct Settle<'a> {
    tracker: &'a JobTracker,
    token: &'a JobToken,
    armed: bool,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.finish(self.token, JobStatus::Cancelled, None);
        }
    }
}

impl JobTracker {
    pub fn new(data_dir: &Path) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                data_dir: data_dir.to_path_buf(),
                active: Mutex::new(HashMap::new()),
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, ev: JobEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(ev);
    }

    /// Registers a running job. A key that is still active, or still unwinding after a
    /// cancel, is rejected.
    pub fn begin(&self, key: &str, kind: JobKind) -> Result<JobToken, StudioError> {
        let begun = {
            let mut active = self.jobs();
            match active.get(key) {
                Some(existing) => Err(existing.cancelling),
                None => {
                    let token = JobToken {
                        key: key.to_string(),
                        id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                        kind,
                        cancel: CancellationToken::new(),
                    };
                    active.insert(
                        key.to_string(),
                        ActiveJob {
                            id: token.id,
                            kind,
                            progress: 0,
                            cancel: token.cancel.clone(),
                            started: Instant::now(),
                            cancelling: false,
                        },
                    );
                    self.emit(JobEvent {
                        key: key.to_string(),
                        kind,
                        status: JobStatus::Running,
                        progress: 0,
                        error: None,
                    });
                    Ok(token)
                }
            }
        };
        match begun {
            Ok(token) => {
                trace::event(
                    &self.inner.data_dir,
                    Some(key),
                    "Job",
                    "JOB.begin",
                    "ok",
                    Some(json!({ "kind": kind.as_str(), "id": token.id })),
                );
                Ok(token)
            }
            Err(cancelling) => {
                trace::event(
                    &self.inner.data_dir,
                    Some(key),
                    "Job",
                    "JOB.begin",
                    "err",
                    Some(json!({
                        "kind": kind.as_str(),
                        "reason": if cancelling { "cancelling" } else { "duplicate" },
                    })),
                );
                Err(StudioError::DuplicateJob {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Records progress. Returns the new value, or `None` when the update was dropped
    /// (stale token, cancelled or finished job, or no increase).
    pub fn update_progress(&self, token: &JobToken, percent: u8) -> Option<u8> {
        let percent = percent.min(100);
        let mut active = self.jobs();
        let job = active
            .get_mut(&token.key)
            .filter(|j| j.id == token.id && !j.cancelling)?;
        if percent <= job.progress {
            return None;
        }
        job.progress = percent;
        self.emit(JobEvent {
            key: token.key.clone(),
            kind: token.kind,
            status: JobStatus::Running,
            progress: percent,
            error: None,
        });
        Some(percent)
    }

    /// Signals cancellation to the job's owner. The job settles as cancelled once the
    /// owner returns. False when nothing was active or a cancel is already pending.
    pub fn cancel(&self, key: &str) -> bool {
        let signalled = {
            let mut active = self.jobs();
            match active.get_mut(key) {
                Some(job) if !job.cancelling => {
                    job.cancelling = true;
                    job.cancel.cancel();
                    Ok(job.id)
                }
                Some(_) => Err("already_cancelling"),
                None => Err("not_active"),
            }
        };
        match signalled {
            Ok(id) => {
                trace::event(
                    &self.inner.data_dir,
                    Some(key),
                    "Job",
                    "JOB.cancel",
                    "ok",
                    Some(json!({ "id": id })),
                );
                true
            }
            Err(reason) => {
                trace::event(
                    &self.inner.data_dir,
                    Some(key),
                    "Job",
                    "JOB.cancel",
                    "skipped",
                    Some(json!({ "reason": reason })),
                );
                false
            }
        }
    }

    /// Signals every active job and returns how many were newly cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut active = self.jobs();
        let mut n = 0;
        for job in active.values_mut().filter(|j| !j.cancelling) {
            job.cancelling = true;
            job.cancel.cancel();
            n += 1;
        }
        n
    }

    /// Moves the job to its terminal state. A failure after a cancel request is recorded
    /// as cancelled. Returns false if the token no longer owns the key.
    pub fn complete(&self, token: &JobToken, result: Result<(), String>) -> bool {
        match result {
            Ok(()) => self.finish(token, JobStatus::Succeeded, None),
            Err(e) => self.finish(token, JobStatus::Failed, Some(e)),
        }
    }

    fn finish(&self, token: &JobToken, status: JobStatus, error: Option<String>) -> bool {
        let settled = {
            let mut active = self.jobs();
            match active.get(&token.key) {
                Some(j) if j.id == token.id => active.remove(&token.key).map(|job| {
                    let (status, error) = if job.cancelling && status == JobStatus::Failed {
                        (JobStatus::Cancelled, None)
                    } else {
                        (status, error)
                    };
                    self.emit(JobEvent {
                        key: token.key.clone(),
                        kind: job.kind,
                        status,
                        progress: if status == JobStatus::Succeeded {
                            100
                        } else {
                            job.progress
                        },
                        error: error.clone(),
                    });
                    (job, status, error)
                }),
                _ => None,
            }
        };
        let Some((job, status, error)) = settled else {
            return false;
        };
        self.retired(&token.key, &job, status, error);
        true
    }

    // Trace and metrics record for a settled job. Runs outside the registry lock.
    fn retired(&self, key: &str, job: &ActiveJob, status: JobStatus, error: Option<String>) {
        let elapsed_ms = job.started.elapsed().as_millis();
        trace::event(
            &self.inner.data_dir,
            Some(key),
            "Job",
            "JOB.done",
            match status {
                JobStatus::Failed => "err",
                JobStatus::Cancelled => "skipped",
                _ => "ok",
            },
            Some(json!({
                "kind": job.kind.as_str(),
                "status": status.as_str(),
                "elapsed_ms": elapsed_ms as u64,
                "error": error,
            })),
        );
        metrics::job_done_best_effort(
            &self.inner.data_dir,
            key,
            job.kind.as_str(),
            status.as_str(),
            elapsed_ms,
        );
    }

    /// Runs `op` as the job for `key`, settling the job from its result.
    pub async fn run<T, F, Fut>(
        &self,
        key: &str,
        kind: JobKind,
        op: F,
    ) -> Result<Outcome<T>, StudioError>
    where
        F: FnOnce(JobToken) -> Fut,
        Fut: Future<Output = Result<Outcome<T>, StudioError>>,
    {
        let token = self.begin(key, kind)?;
        let mut settle = Settle {
            tracker: self,
            token: &token,
            armed: true,
        };
        let result = op(token.clone()).await;
        settle.armed = false;
        match &result {
            Ok(Outcome::Completed(_)) => {
                self.complete(&token, Ok(()));
            }
            Ok(Outcome::Cancelled) => {
                self.finish(&token, JobStatus::Cancelled, None);
            }
            Err(e) => {
                self.complete(&token, Err(e.to_string()));
            }
        }
        result
    }

    /// True while a job holds the key, including one that is unwinding after a cancel.
    pub fn is_active(&self, key: &str) -> bool {
        self.jobs().contains_key(key)
    }

    /// True once a cancel was requested and the owner has not settled yet.
    pub fn is_cancelling(&self, key: &str) -> bool {
        self.jobs().get(key).is_some_and(|j| j.cancelling)
    }

    pub fn progress(&self, key: &str) -> Option<u8> {
        self.jobs().get(key).map(|j| j.progress)
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Events for `key`, or for every key when `None`.
    pub fn subscribe(&self, key: Option<&str>) -> Subscription {
        Subscription {
            rx: self.inner.events.subscribe(),
            key: key.map(str::to_string),
        }
    }
}
