use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::compose::fingerprint::Fingerprint;
use crate::compose::spec::RenderSpec;
use crate::foundation::error::RenderError;
use crate::foundation::ids::JobId;

/// One renderer invocation.
#[derive(Clone, Copy, Debug)]
pub struct RenderRequest<'a> {
    /// Job being executed.
    pub job: JobId,
    /// Fingerprint of `spec` at its target.
    pub fingerprint: Fingerprint,
    /// Spec with its final quality/format.
    pub spec: &'a RenderSpec,
    /// Empty scratch directory owned by this invocation.
    pub work_dir: &'a Path,
}

/// Media produced by a successful invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderOutput {
    /// Produced file; the manager moves it into the artifact cache.
    pub path: PathBuf,
    /// Media duration in seconds.
    pub duration: f64,
}

/// Cancellation flag and wall-clock deadline for one invocation.
///
/// Renderers must poll [`RenderControl::should_stop`] (or both halves of it) and give up
/// promptly once it returns `true`.
#[derive(Clone, Debug)]
pub struct RenderControl {
    cancel: Arc<AtomicBool>,
    deadline: Instant,
    timeout: Duration,
}

impl RenderControl {
    /// Control whose deadline is `timeout` from now.
    pub fn new(cancel: Arc<AtomicBool>, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// `true` once the job was canceled.
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// `true` once the deadline passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Canceled or expired.
    pub fn should_stop(&self) -> bool {
        self.is_canceled() || self.is_expired()
    }

    /// Absolute deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Error to report when [`RenderControl::should_stop`] fired.
    pub fn stop_error(&self) -> RenderError {
        if self.is_canceled() {
            RenderError::canceled()
        } else {
            RenderError::timeout(format!(
                "renderer exceeded the {:.1}s timeout",
                self.timeout.as_secs_f64()
            ))
        }
    }
}

/// External rendering engine.
///
/// Implementations are called from the manager's worker threads, one invocation per thread.
pub trait Renderer: Send + Sync {
    /// Render `req.spec`, honoring `ctl`.
    fn render(&self, req: &RenderRequest<'_>, ctl: &RenderControl) -> Result<RenderOutput, RenderError>;
}

impl<R: Renderer + ?Sized> Renderer for Arc<R> {
    fn render(&self, req: &RenderRequest<'_>, ctl: &RenderControl) -> Result<RenderOutput, RenderError> {
        (**self).render(req, ctl)
    }
}
