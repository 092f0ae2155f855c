use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::*;
use crate::foundation::error::{RenderError, RenderErrorKind};
use crate::render::job::{JobKind, JobStatus};
use crate::render::manager::RenderJobManagerOpts;
use crate::render::renderer::{RenderControl, RenderOutput, RenderRequest, Renderer};

/// Writes an artifact once `open` is set; gives up when stopped.
#[derive(Default)]
struct Gate {
    open: AtomicBool,
    calls: AtomicUsize,
}

impl Renderer for Gate {
    fn render(&self, req: &RenderRequest<'_>, ctl: &RenderControl) -> Result<RenderOutput, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        while !self.open.load(Ordering::SeqCst) {
            if ctl.should_stop() {
                return Err(ctl.stop_error());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let path = req.work_dir.join("animation.mp4");
        std::fs::write(&path, b"preview")
            .map_err(|e| RenderError::new(RenderErrorKind::Internal, e.to_string()))?;
        Ok(RenderOutput {
            path,
            duration: req.spec.duration,
        })
    }
}

fn setup(dir: &Path) -> (Arc<Gate>, Arc<RenderJobManager>, PreviewCoordinator) {
    let gate = Arc::new(Gate::default());
    let manager = Arc::new(
        RenderJobManager::new(
            gate.clone(),
            RenderJobManagerOpts {
                output_dir: dir.to_path_buf(),
                max_concurrent_renders: 1,
                ..RenderJobManagerOpts::default()
            },
        )
        .unwrap(),
    );
    let previews = PreviewCoordinator::new(Arc::clone(&manager), Format::Mp4);
    (gate, manager, previews)
}

fn spec(n: u32) -> RenderSpec {
    let mut spec = RenderSpec::from_script(format!("class Intro(Scene):\n    pass\n# {n}\n"));
    spec.duration = 2.0;
    spec
}

fn wait_running(h: &JobHandle) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while h.status() != JobStatus::Running {
        assert!(Instant::now() < deadline, "job never started");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn newer_request_supersedes_outstanding_preview() {
    let dir = tempfile::tempdir().unwrap();
    let (gate, _manager, previews) = setup(dir.path());
    let t = TimelineId(1);

    let first = previews.request_preview(t, &spec(1)).unwrap();
    wait_running(&first);
    let second = previews.request_preview(t, &spec(2)).unwrap();

    assert_eq!(first.wait().status, JobStatus::Canceled);
    gate.open.store(true, Ordering::SeqCst);
    let done = second.wait();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.quality, Quality::Low);
    assert_eq!(done.kind, JobKind::Preview);
    assert_eq!(previews.outstanding(t).map(|h| h.id()), Some(second.id()));
}

#[test]
fn identical_request_reuses_outstanding_job() {
    let dir = tempfile::tempdir().unwrap();
    let (gate, _manager, previews) = setup(dir.path());
    let t = TimelineId(1);

    let first = previews.request_preview(t, &spec(3)).unwrap();
    let again = previews.request_preview(t, &spec(3)).unwrap();
    assert_eq!(first.id(), again.id());

    gate.open.store(true, Ordering::SeqCst);
    assert_eq!(again.wait().status, JobStatus::Succeeded);
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn timelines_do_not_cancel_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let (gate, _manager, previews) = setup(dir.path());

    let a = previews.request_preview(TimelineId(1), &spec(4)).unwrap();
    let b = previews.request_preview(TimelineId(2), &spec(5)).unwrap();

    gate.open.store(true, Ordering::SeqCst);
    assert_eq!(a.wait().status, JobStatus::Succeeded);
    assert_eq!(b.wait().status, JobStatus::Succeeded);
}

#[test]
fn preview_sharing_an_export_never_cancels_it() {
    let dir = tempfile::tempdir().unwrap();
    let (gate, manager, previews) = setup(dir.path());
    let t = TimelineId(7);

    let export = manager.submit(&spec(6), Quality::Low, Format::Mp4).unwrap();
    wait_running(&export);
    let attached = previews.request_preview(t, &spec(6)).unwrap();
    assert_eq!(attached.id(), export.id());

    let next = previews.request_preview(t, &spec(7)).unwrap();
    assert_eq!(export.status(), JobStatus::Running);

    gate.open.store(true, Ordering::SeqCst);
    assert_eq!(export.wait().status, JobStatus::Succeeded);
    assert_eq!(next.wait().status, JobStatus::Succeeded);
}

#[test]
fn export_sharing_a_preview_survives_supersession() {
    let dir = tempfile::tempdir().unwrap();
    let (gate, manager, previews) = setup(dir.path());
    let t = TimelineId(9);

    let preview = previews.request_preview(t, &spec(10)).unwrap();
    wait_running(&preview);
    let export = manager.submit(&spec(10), Quality::Low, Format::Mp4).unwrap();
    assert_eq!(export.id(), preview.id());
    assert_eq!(export.kind(), JobKind::Export);

    let next = previews.request_preview(t, &spec(11)).unwrap();
    assert_ne!(next.id(), export.id());
    assert_eq!(export.status(), JobStatus::Running);

    gate.open.store(true, Ordering::SeqCst);
    let done = export.wait();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert!(done.error.is_none());
    assert_eq!(next.wait().status, JobStatus::Succeeded);
}

#[test]
fn close_cancels_outstanding_preview() {
    let dir = tempfile::tempdir().unwrap();
    let (_gate, _manager, previews) = setup(dir.path());
    let t = TimelineId(3);

    let h = previews.request_preview(t, &spec(8)).unwrap();
    previews.close(t).unwrap();
    assert_eq!(h.wait().status, JobStatus::Canceled);
    assert!(previews.outstanding(t).is_none());
}
