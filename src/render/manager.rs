use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context as _;

use crate::cache::artifact::{ArtifactCache, ArtifactCacheOpts, ArtifactEntry};
use crate::compose::fingerprint::Fingerprint;
use crate::compose::spec::{Format, Quality, RenderSpec};
use crate::foundation::error::{AnimakeError, AnimakeResult, RenderError, RenderErrorKind};
use crate::foundation::ids::JobId;
use crate::render::job::{JobHandle, JobKind, JobSlot, JobStatus, RenderJob};
use crate::render::journal::{JobJournal, JournalRecord};
use crate::render::renderer::{RenderControl, RenderOutput, RenderRequest, Renderer};

const JOURNAL_FILE: &str = "jobs.jsonl";
const WORK_DIR: &str = "work";

/// Options for [`RenderJobManager`].
#[derive(Clone, Debug)]
pub struct RenderJobManagerOpts {
    /// Root for cached artifacts, the journal and per-job work directories.
    pub output_dir: PathBuf,
    /// Worker threads; each runs at most one renderer invocation.
    pub max_concurrent_renders: usize,
    /// Hard wall-clock limit per invocation.
    pub render_timeout: Duration,
    pub cache: ArtifactCacheOpts,
    /// Terminal jobs remembered for status queries.
    pub max_job_history: usize,
    /// Record transitions in `<output_dir>/jobs.jsonl` and reconcile them at startup.
    pub journal: bool,
}

impl Default for RenderJobManagerOpts {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("animake-out"),
            max_concurrent_renders: 2,
            render_timeout: Duration::from_secs(300),
            cache: ArtifactCacheOpts::default(),
            max_job_history: 1024,
            journal: true,
        }
    }
}

/// Artifact of a finished blocking render.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RenderOutcome {
    pub output_path: PathBuf,
    pub duration: f64,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<JobId, Arc<JobSlot>>,
    in_flight: HashMap<Fingerprint, JobId>,
    queue: VecDeque<Arc<JobSlot>>, // exports first, then previews newest first
    finished: VecDeque<JobId>,
    next_id: u64,
    shutdown: bool,
}

impl Registry {
    fn alloc_id(&mut self) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        id
    }

    fn enqueue(&mut self, slot: Arc<JobSlot>) {
        // exports are FIFO; a preview goes right behind the last export, ahead of older previews
        let pos = self
            .queue
            .iter()
            .rposition(|s| s.kind() == JobKind::Export)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.queue.insert(pos, slot);
    }

    fn release(&mut self, fp: Fingerprint, id: JobId) {
        if self.in_flight.get(&fp) == Some(&id) {
            self.in_flight.remove(&fp);
        }
    }

    fn retire(&mut self, id: JobId, max_history: usize) {
        self.finished.push_back(id);
        while self.finished.len() > max_history {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }
}

struct Shared {
    opts: RenderJobManagerOpts,
    renderer: Arc<dyn Renderer>,
    registry: Mutex<Registry>,
    work_ready: Condvar,
    cache: Mutex<ArtifactCache>,
    journal: Option<Mutex<JobJournal>>,
}

/// Owner of the job lifecycle, the worker pool and the artifact cache.
///
/// Lock order: registry, then a job slot, then the journal. The cache lock is taken either alone
/// or after the registry, never the other way round.
pub struct RenderJobManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RenderJobManager {
    /// Open the cache and journal under `opts.output_dir` and start the workers.
    pub fn new(renderer: Arc<dyn Renderer>, opts: RenderJobManagerOpts) -> AnimakeResult<Self> {
        std::fs::create_dir_all(&opts.output_dir).with_context(|| {
            format!(
                "failed to create output directory '{}'",
                opts.output_dir.display()
            )
        })?;
        let mut cache = ArtifactCache::open(&opts.output_dir, opts.cache.clone())?;

        let mut registry = Registry {
            next_id: 1,
            ..Registry::default()
        };
        let journal = if opts.journal {
            let (mut journal, replay) = JobJournal::open(opts.output_dir.join(JOURNAL_FILE))?;
            registry.next_id = replay.next_id;
            let mut kept = replay
                .unfinished
                .into_iter()
                .map(|rec| reconcile(&mut registry, &mut cache, rec, opts.max_job_history))
                .collect::<Vec<_>>();
            if let Some(highest) = replay.highest
                && !kept.iter().any(|r| r.job == highest.job)
            {
                kept.push(highest);
            }
            kept.sort_by_key(|r| r.job);
            journal.compact(&kept)?;
            Some(Mutex::new(journal))
        } else {
            None
        };

        let shared = Arc::new(Shared {
            renderer,
            registry: Mutex::new(registry),
            work_ready: Condvar::new(),
            cache: Mutex::new(cache),
            journal,
            opts,
        });

        let mut workers = Vec::new();
        for idx in 0..shared.opts.max_concurrent_renders.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("animake-render-{idx}"))
                .spawn(move || worker_loop(shared))
                .context("failed to spawn render worker")?;
            workers.push(handle);
        }
        tracing::info!(
            workers = workers.len(),
            output_dir = %shared.opts.output_dir.display(),
            "render job manager started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Directory holding cached artifacts.
    pub fn output_dir(&self) -> &Path {
        &self.shared.opts.output_dir
    }

    /// Submit an export of `spec` at `quality`/`format`. Never blocks on rendering.
    pub fn submit(&self, spec: &RenderSpec, quality: Quality, format: Format) -> AnimakeResult<JobHandle> {
        self.submit_kind(spec, quality, format, JobKind::Export)
    }

    pub(crate) fn submit_preview(
        &self,
        spec: &RenderSpec,
        quality: Quality,
        format: Format,
    ) -> AnimakeResult<JobHandle> {
        self.submit_kind(spec, quality, format, JobKind::Preview)
    }

    #[tracing::instrument(skip(self, spec), fields(fingerprint = tracing::field::Empty))]
    fn submit_kind(
        &self,
        spec: &RenderSpec,
        quality: Quality,
        format: Format,
        kind: JobKind,
    ) -> AnimakeResult<JobHandle> {
        if spec.script.trim().is_empty() {
            return Err(AnimakeError::validation("render spec has no script text"));
        }
        let spec = spec.with_target(quality, format);
        let fp = spec.fingerprint();
        tracing::Span::current().record("fingerprint", tracing::field::display(fp));

        let shared = &self.shared;
        let mut reg = shared.lock_registry();
        if reg.shutdown {
            return Err(anyhow::anyhow!("render job manager is shut down").into());
        }

        let cached = shared.lock_cache().get(fp);
        if let Some(entry) = cached {
            let id = reg.alloc_id();
            let mut job = RenderJob::new(id, fp, kind, &spec);
            job.status = JobStatus::Succeeded;
            job.output_path = Some(entry.output_path);
            job.duration = Some(entry.duration);
            job.cache_hit = true;
            let slot = Arc::new(JobSlot::new(job, spec));
            reg.jobs.insert(id, Arc::clone(&slot));
            reg.retire(id, shared.opts.max_job_history);
            shared.record(&slot, JobStatus::Succeeded);
            tracing::info!(job = %id, "artifact cache hit");
            return Ok(JobHandle::new(slot));
        }

        if let Some(slot) = reg
            .in_flight
            .get(&fp)
            .and_then(|id| reg.jobs.get(id))
            .filter(|s| !s.status().is_terminal())
            .cloned()
        {
            // an export caller must not inherit preview priority or preview supersession
            if kind == JobKind::Export && slot.promote_to_export() {
                if let Some(pos) = reg.queue.iter().position(|s| s.id == slot.id) {
                    reg.queue.remove(pos);
                    reg.enqueue(Arc::clone(&slot));
                }
                tracing::debug!(job = %slot.id, "preview promoted to export");
            }
            tracing::debug!(job = %slot.id, "attached to in-flight job");
            return Ok(JobHandle::new(slot));
        }

        let id = reg.alloc_id();
        let slot = Arc::new(JobSlot::new(RenderJob::new(id, fp, kind, &spec), spec));
        reg.jobs.insert(id, Arc::clone(&slot));
        reg.in_flight.insert(fp, id);
        reg.enqueue(Arc::clone(&slot));
        shared.record(&slot, JobStatus::Queued);
        drop(reg);

        shared.work_ready.notify_one();
        tracing::info!(job = %id, ?kind, "render job queued");
        Ok(JobHandle::new(slot))
    }

    /// Submit and wait for the artifact.
    pub fn render_blocking(
        &self,
        spec: &RenderSpec,
        quality: Quality,
        format: Format,
    ) -> AnimakeResult<RenderOutcome> {
        let job = self.submit(spec, quality, format)?.wait();
        match job.status {
            JobStatus::Succeeded => {
                let output_path = job
                    .output_path
                    .ok_or_else(|| anyhow::anyhow!("{} succeeded without an output path", job.id))?;
                Ok(RenderOutcome {
                    output_path,
                    duration: job.duration.unwrap_or(0.0),
                })
            }
            _ => Err(job.error.unwrap_or_else(RenderError::canceled).into()),
        }
    }

    /// Cancel a queued or running job; terminal jobs are returned unchanged.
    pub fn cancel(&self, id: JobId) -> AnimakeResult<RenderJob> {
        self.cancel_if(id, |_| true)
    }

    /// Cancel `id` only while it is still a preview; a job an export caller attached to survives.
    pub(crate) fn cancel_preview(&self, id: JobId) -> AnimakeResult<RenderJob> {
        self.cancel_if(id, |slot| slot.kind() == JobKind::Preview)
    }

    fn cancel_if(&self, id: JobId, allowed: impl FnOnce(&JobSlot) -> bool) -> AnimakeResult<RenderJob> {
        let shared = &self.shared;
        let mut reg = shared.lock_registry();
        let slot = reg
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| AnimakeError::not_found(format!("{id}")))?;
        // checked under the registry lock, which also serializes promotion on attach
        if !allowed(&slot) {
            return Ok(slot.snapshot());
        }

        match slot.status() {
            JobStatus::Queued => reg.queue.retain(|s| s.id != id),
            JobStatus::Running => slot.cancel.store(true, Ordering::Release),
            _ => return Ok(slot.snapshot()),
        }
        if slot.transition(JobStatus::Canceled, |job| {
            job.error = Some(RenderError::canceled());
        }) {
            reg.release(slot.fingerprint, id);
            reg.retire(id, shared.opts.max_job_history);
            shared.record(&slot, JobStatus::Canceled);
            tracing::info!(job = %id, "render job canceled");
        }
        Ok(slot.snapshot())
    }

    /// Current state of a job.
    pub fn job(&self, id: JobId) -> AnimakeResult<RenderJob> {
        self.handle(id).map(|h| h.snapshot())
    }

    /// Subscribe to an existing job.
    pub fn handle(&self, id: JobId) -> AnimakeResult<JobHandle> {
        self.shared
            .lock_registry()
            .jobs
            .get(&id)
            .map(|slot| JobHandle::new(Arc::clone(slot)))
            .ok_or_else(|| AnimakeError::not_found(format!("{id}")))
    }

    /// Every remembered job, by id.
    pub fn jobs(&self) -> Vec<RenderJob> {
        let slots = self
            .shared
            .lock_registry()
            .jobs
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut jobs = slots.iter().map(|s| s.snapshot()).collect::<Vec<_>>();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Live artifact for `fp`, if cached.
    pub fn cached(&self, fp: Fingerprint) -> Option<ArtifactEntry> {
        self.shared.lock_cache().get(fp)
    }

    /// Cancel all outstanding work and join the workers. Idempotent.
    pub fn shutdown(&self) {
        let pending = {
            let mut reg = self.shared.lock_registry();
            if reg.shutdown {
                Vec::new()
            } else {
                reg.shutdown = true;
                reg.queue.clear();
                reg.jobs
                    .values()
                    .filter(|s| !s.status().is_terminal())
                    .cloned()
                    .collect::<Vec<_>>()
            }
        };
        self.shared.work_ready.notify_all();

        for slot in pending {
            slot.cancel.store(true, Ordering::Release);
            if slot.transition(JobStatus::Canceled, |job| {
                job.error = Some(RenderError::canceled());
            }) {
                self.shared.record(&slot, JobStatus::Canceled);
            }
        }

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("render worker panicked");
            }
        }
    }
}

impl Drop for RenderJobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cache(&self) -> MutexGuard<'_, ArtifactCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, slot: &JobSlot, status: JobStatus) {
        let Some(journal) = &self.journal else {
            return;
        };
        let rec = JournalRecord::now(slot.id, slot.fingerprint, slot.kind(), status);
        let mut journal = journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = journal.append(&rec) {
            tracing::warn!(job = %slot.id, error = %e, "failed to journal job transition");
        }
    }

    fn next_job(&self) -> Option<Arc<JobSlot>> {
        let mut reg = self.lock_registry();
        loop {
            if reg.shutdown {
                return None;
            }
            if let Some(slot) = reg.queue.pop_front() {
                if slot.transition(JobStatus::Running, |_| {}) {
                    self.record(&slot, JobStatus::Running);
                    return Some(slot);
                }
                continue;
            }
            reg = self
                .work_ready
                .wait(reg)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    #[tracing::instrument(skip_all, fields(job = %slot.id, fingerprint = %slot.fingerprint))]
    fn run(&self, slot: &Arc<JobSlot>) {
        let work_dir = self
            .opts
            .output_dir
            .join(WORK_DIR)
            .join(slot.id.to_string());
        let control = RenderControl::new(Arc::clone(&slot.cancel), self.opts.render_timeout);
        let req = RenderRequest {
            job: slot.id,
            fingerprint: slot.fingerprint,
            spec: &slot.spec,
            work_dir: &work_dir,
        };

        let started = Instant::now();
        let result = match std::fs::create_dir_all(&work_dir) {
            Ok(()) => std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.renderer.render(&req, &control)
            }))
            .unwrap_or_else(|_| {
                Err(RenderError::new(
                    RenderErrorKind::Internal,
                    "renderer panicked",
                ))
            }),
            Err(e) => Err(RenderError::new(
                RenderErrorKind::Internal,
                format!("failed to create work directory '{}': {e}", work_dir.display()),
            )),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let keep_work_dir = match result {
            Ok(output) => self.succeed(slot, output, elapsed_ms),
            Err(err) => self.fail(slot, err, elapsed_ms),
        };
        if !keep_work_dir {
            let _ = std::fs::remove_dir_all(&work_dir);
        }

        let mut reg = self.lock_registry();
        reg.release(slot.fingerprint, slot.id);
        if slot.status().is_terminal() && !reg.finished.contains(&slot.id) {
            reg.retire(slot.id, self.opts.max_job_history);
        }
    }

    /// Returns whether the work directory still holds the artifact.
    fn succeed(&self, slot: &JobSlot, output: RenderOutput, elapsed_ms: u64) -> bool {
        if slot.cancel.load(Ordering::Acquire) {
            tracing::debug!("discarding output of canceled job");
            return false;
        }

        let target = self
            .lock_cache()
            .artifact_path(slot.fingerprint, slot.spec.format.extension());
        let (output_path, moved) = match move_file(&output.path, &target) {
            Ok(()) => (target, true),
            Err(e) => {
                tracing::warn!(
                    from = %output.path.display(),
                    error = %e,
                    "failed to move artifact into the cache, serving it from the work directory"
                );
                (output.path, false)
            }
        };

        if moved {
            let bytes = std::fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
            let entry = ArtifactEntry {
                output_path: output_path.clone(),
                duration: output.duration,
                created_at: SystemTime::now(),
                bytes,
            };
            if let Err(e) = self.lock_cache().put(slot.fingerprint, entry) {
                tracing::warn!(error = %e, "failed to record artifact in cache");
            }
        }

        if slot.transition(JobStatus::Succeeded, |job| {
            job.output_path = Some(output_path);
            job.duration = Some(output.duration);
        }) {
            self.record(slot, JobStatus::Succeeded);
            tracing::info!(duration = output.duration, elapsed_ms, "render succeeded");
        }
        !moved
    }

    /// Returns whether the work directory is kept for inspection.
    fn fail(&self, slot: &JobSlot, err: RenderError, elapsed_ms: u64) -> bool {
        if err.kind == RenderErrorKind::Canceled || slot.cancel.load(Ordering::Acquire) {
            tracing::debug!(elapsed_ms, "renderer stopped after cancellation");
            return false;
        }
        tracing::warn!(
            kind = %err.kind,
            exit_code = ?err.exit_code,
            elapsed_ms,
            error = %err.message,
            "render failed"
        );
        if slot.transition(JobStatus::Failed, |job| job.error = Some(err)) {
            self.record(slot, JobStatus::Failed);
        }
        true
    }
}

fn worker_loop(shared: Arc<Shared>) {
    while let Some(slot) = shared.next_job() {
        shared.run(&slot);
    }
    tracing::debug!("render worker exiting");
}

/// Settle a job the previous process left unfinished; returns its final journal record.
fn reconcile(
    reg: &mut Registry,
    cache: &mut ArtifactCache,
    rec: JournalRecord,
    max_history: usize,
) -> JournalRecord {
    let entry = cache.get(rec.fingerprint);
    let status = if entry.is_some() {
        tracing::info!(job = %rec.job, fingerprint = %rec.fingerprint, "interrupted job recovered from cache");
        JobStatus::Succeeded
    } else {
        tracing::warn!(job = %rec.job, fingerprint = %rec.fingerprint, last = %rec.status, "job interrupted by restart");
        JobStatus::Failed
    };

    // Specs are not journaled; the placeholder only keeps the job queryable by id.
    let spec = RenderSpec::from_script("");
    let mut job = RenderJob::new(rec.job, rec.fingerprint, rec.kind, &spec);
    job.status = status;
    match entry {
        Some(entry) => {
            job.output_path = Some(entry.output_path);
            job.duration = Some(entry.duration);
            job.cache_hit = true;
        }
        None => {
            job.error = Some(RenderError::new(
                RenderErrorKind::Interrupted,
                "job was in flight when the previous process stopped",
            ));
        }
    }
    reg.jobs.insert(rec.job, Arc::new(JobSlot::new(job, spec)));
    reg.retire(rec.job, max_history);
    JournalRecord::now(rec.job, rec.fingerprint, rec.kind, status)
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

#[cfg(test)]
#[path = "../../tests/unit/render/manager.rs"]
mod tests;
