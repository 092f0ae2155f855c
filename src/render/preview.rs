use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::compose::fingerprint::fingerprint;
use crate::compose::spec::{Format, Quality, RenderSpec};
use crate::foundation::error::AnimakeResult;
use crate::foundation::ids::TimelineId;
use crate::render::job::JobHandle;
use crate::render::manager::RenderJobManager;

/// Latest-wins low-quality renders, one outstanding preview per timeline.
pub struct PreviewCoordinator {
    manager: Arc<RenderJobManager>,
    format: Format,
    outstanding: Mutex<HashMap<TimelineId, JobHandle>>,
}

impl PreviewCoordinator {
    pub fn new(manager: Arc<RenderJobManager>, format: Format) -> Self {
        Self {
            manager,
            format,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Render `spec` at [`Quality::Low`], superseding the timeline's previous preview.
    ///
    /// A request identical to the outstanding preview returns that job instead of restarting it.
    pub fn request_preview(&self, timeline: TimelineId, spec: &RenderSpec) -> AnimakeResult<JobHandle> {
        let fp = fingerprint(spec, Quality::Low, self.format);
        let mut outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(prev) = outstanding.get(&timeline)
            && !prev.status().is_terminal()
        {
            if prev.fingerprint() == fp {
                return Ok(prev.clone());
            }
            let shared = outstanding
                .iter()
                .any(|(t, h)| *t != timeline && h.id() == prev.id());
            // deduplication may have attached the preview to an export or another timeline's job
            if !shared {
                tracing::debug!(%timeline, job = %prev.id(), "superseding preview");
                self.manager.cancel_preview(prev.id())?;
            }
        }

        let handle = self
            .manager
            .submit_preview(spec, Quality::Low, self.format)?;
        outstanding.insert(timeline, handle.clone());
        Ok(handle)
    }

    /// The timeline's most recent preview, if any.
    pub fn outstanding(&self, timeline: TimelineId) -> Option<JobHandle> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&timeline)
            .cloned()
    }

    /// Forget a timeline, canceling its outstanding preview.
    pub fn close(&self, timeline: TimelineId) -> AnimakeResult<()> {
        let prev = self
            .outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&timeline);
        if let Some(prev) = prev {
            self.manager.cancel_preview(prev.id())?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/preview.rs"]
mod tests;
