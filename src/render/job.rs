use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::compose::fingerprint::Fingerprint;
use crate::compose::spec::{Format, Quality, RenderSpec};
use crate::foundation::error::RenderError;
use crate::foundation::ids::JobId;

/// Lifecycle state of a [`RenderJob`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// A renderer invocation is in progress.
    Running,
    /// Artifact available.
    Succeeded,
    /// Renderer failed; see the job's error.
    Failed,
    /// Canceled by a caller or by shutdown.
    Canceled,
}

impl JobStatus {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Canceled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Canceled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        })
    }
}

/// Scheduling class; previews yield to exports in the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// User-requested render.
    Export,
    /// Low-quality latest-wins render.
    Preview,
}

/// Point-in-time view of a job.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RenderJob {
    pub id: JobId,
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub status: JobStatus,
    pub quality: Quality,
    pub format: Format,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RenderError>,
    /// Served from the artifact cache without invoking the renderer.
    #[serde(default)]
    pub cache_hit: bool,
}

impl RenderJob {
    pub(crate) fn new(id: JobId, fingerprint: Fingerprint, kind: JobKind, spec: &RenderSpec) -> Self {
        Self {
            id,
            fingerprint,
            kind,
            status: JobStatus::Queued,
            quality: spec.quality,
            format: spec.format,
            output_path: None,
            duration: None,
            error: None,
            cache_hit: false,
        }
    }
}

/// Shared state of one job: the manager drives it, handles observe it.
pub(crate) struct JobSlot {
    pub(crate) id: JobId,
    pub(crate) fingerprint: Fingerprint,
    pub(crate) spec: RenderSpec,
    pub(crate) cancel: Arc<AtomicBool>,
    state: Mutex<RenderJob>,
    changed: Condvar,
}

impl JobSlot {
    pub(crate) fn new(job: RenderJob, spec: RenderSpec) -> Self {
        Self {
            id: job.id,
            fingerprint: job.fingerprint,
            spec,
            cancel: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(job),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> RenderJob {
        self.lock().clone()
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub(crate) fn kind(&self) -> JobKind {
        self.lock().kind
    }

    /// Turn a live preview into an export once an export caller shares it; returns whether the
    /// kind changed.
    pub(crate) fn promote_to_export(&self) -> bool {
        let mut job = self.lock();
        if job.kind == JobKind::Export || job.status.is_terminal() {
            return false;
        }
        job.kind = JobKind::Export;
        true
    }

    /// Apply `next` if the lifecycle allows it; returns whether the transition happened.
    pub(crate) fn transition(&self, next: JobStatus, update: impl FnOnce(&mut RenderJob)) -> bool {
        let mut job = self.lock();
        if !job.status.can_become(next) {
            tracing::debug!(job = %self.id, from = %job.status, to = %next, "transition refused");
            return false;
        }
        job.status = next;
        update(&mut job);
        drop(job);
        self.changed.notify_all();
        true
    }

    fn wait_terminal(&self, timeout: Option<Duration>) -> RenderJob {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut job = self.lock();
        while !job.status.is_terminal() {
            job = match deadline {
                None => self
                    .changed
                    .wait(job)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.changed
                        .wait_timeout(job, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
        job.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RenderJob> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Subscription to a job; every submitter of the same fingerprint shares one.
#[derive(Clone)]
pub struct JobHandle {
    slot: Arc<JobSlot>,
}

impl JobHandle {
    pub(crate) fn new(slot: Arc<JobSlot>) -> Self {
        Self { slot }
    }

    pub fn id(&self) -> JobId {
        self.slot.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.slot.fingerprint
    }

    /// Current scheduling class; a preview shared by an export caller becomes an export.
    pub fn kind(&self) -> JobKind {
        self.slot.kind()
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        self.slot.status()
    }

    /// Current state of the job.
    pub fn snapshot(&self) -> RenderJob {
        self.slot.snapshot()
    }

    /// Block until the job is terminal.
    pub fn wait(&self) -> RenderJob {
        self.slot.wait_terminal(None)
    }

    /// Block until the job is terminal or `timeout` elapses; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RenderJob> {
        let job = self.slot.wait_terminal(Some(timeout));
        job.status.is_terminal().then_some(job)
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.slot.id)
            .field("fingerprint", &self.slot.fingerprint)
            .field("kind", &self.slot.kind())
            .finish_non_exhaustive()
    }
}
