use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;

use crate::compose::spec::RenderSpec;
use crate::foundation::error::{RenderError, RenderErrorKind};
use crate::render::renderer::{RenderControl, RenderOutput, RenderRequest, Renderer};

const SCRIPT_FILE: &str = "scene.py";
const TIMELINE_FILE: &str = "timeline.json";
// How long to wait for the output pipes to close after the process exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Command line and output conventions of the external renderer.
///
/// The defaults drive the Manim CLI: `manim -qm -o animation --format mp4 scene.py Scene`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProcessRendererOpts {
    /// Executable, resolved through `PATH`.
    pub program: String,
    /// Argument template. Placeholders: `{quality_flag}`, `{quality}`, `{format}`, `{script}`,
    /// `{scene}`, `{timeline}`, `{work_dir}`, `{output_name}`.
    pub args: Vec<String>,
    /// File stem the renderer is told to produce.
    pub output_name: String,
    /// Ask `ffprobe` for the duration when no sidecar is written.
    pub ffprobe: bool,
    /// Exit polling interval.
    pub poll_interval_ms: u64,
    /// Bytes of stderr kept for error reports.
    pub stderr_tail_bytes: usize,
}

impl Default for ProcessRendererOpts {
    fn default() -> Self {
        Self {
            program: "manim".to_string(),
            args: [
                "{quality_flag}",
                "-o",
                "{output_name}",
                "--format",
                "{format}",
                "{script}",
                "{scene}",
            ]
            .map(String::from)
            .to_vec(),
            output_name: "animation".to_string(),
            ffprobe: true,
            poll_interval_ms: 50,
            stderr_tail_bytes: 4096,
        }
    }
}

/// [`Renderer`] that supervises one child process per invocation.
#[derive(Clone, Debug, Default)]
pub struct ProcessRenderer {
    opts: ProcessRendererOpts,
}

impl ProcessRenderer {
    pub fn new(opts: ProcessRendererOpts) -> Self {
        Self { opts }
    }

    pub fn opts(&self) -> &ProcessRendererOpts {
        &self.opts
    }

    fn expand_args(&self, req: &RenderRequest<'_>, scene: &str) -> Vec<String> {
        let script = req.work_dir.join(SCRIPT_FILE);
        let timeline = req.work_dir.join(TIMELINE_FILE);
        let vars: [(&str, String); 8] = [
            ("{quality_flag}", req.spec.quality.manim_flag().to_string()),
            ("{quality}", req.spec.quality.to_string()),
            ("{format}", req.spec.format.to_string()),
            ("{script}", script.display().to_string()),
            ("{scene}", scene.to_string()),
            ("{timeline}", timeline.display().to_string()),
            ("{work_dir}", req.work_dir.display().to_string()),
            ("{output_name}", self.opts.output_name.clone()),
        ];
        self.opts
            .args
            .iter()
            .map(|arg| {
                vars.iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect()
    }

    fn prepare(&self, req: &RenderRequest<'_>) -> Result<(), RenderError> {
        let internal = |what: &str, e: std::io::Error| {
            RenderError::new(RenderErrorKind::Internal, format!("failed to write {what}: {e}"))
        };
        std::fs::create_dir_all(req.work_dir).map_err(|e| internal("work directory", e))?;
        std::fs::write(req.work_dir.join(SCRIPT_FILE), &req.spec.script)
            .map_err(|e| internal(SCRIPT_FILE, e))?;
        let timeline = req
            .spec
            .to_canonical_json()
            .map_err(|e| RenderError::new(RenderErrorKind::Internal, e.to_string()))?;
        std::fs::write(req.work_dir.join(TIMELINE_FILE), timeline)
            .map_err(|e| internal(TIMELINE_FILE, e))
    }

    fn duration_of(&self, output: &Path, work_dir: &Path, spec: &RenderSpec) -> Result<f64, RenderError> {
        let sidecars = [
            output.with_extension("json"),
            work_dir.join(format!("{}.json", self.opts.output_name)),
        ];
        if let Some(sidecar) = sidecars.iter().find(|p| p.is_file()) {
            return read_sidecar(sidecar);
        }
        if self.opts.ffprobe {
            match probe_duration(output) {
                Ok(d) => return Ok(d),
                Err(e) => tracing::debug!(path = %output.display(), error = %e, "ffprobe duration unavailable"),
            }
        }
        Ok(spec.duration)
    }
}

impl Renderer for ProcessRenderer {
    #[tracing::instrument(skip_all, fields(job = %req.job, fingerprint = %req.fingerprint))]
    fn render(&self, req: &RenderRequest<'_>, ctl: &RenderControl) -> Result<RenderOutput, RenderError> {
        if ctl.should_stop() {
            return Err(ctl.stop_error());
        }
        let scene = scene_class(&req.spec.script)?;
        self.prepare(req)?;

        let args = self.expand_args(req, &scene);
        tracing::debug!(program = %self.opts.program, ?args, "spawning renderer");

        let mut child = Command::new(&self.opts.program)
            .args(&args)
            .current_dir(req.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RenderError::new(
                    RenderErrorKind::Spawn,
                    format!(
                        "failed to spawn '{}' (is it installed and on PATH?): {e}",
                        self.opts.program
                    ),
                )
            })?;

        let cap = self.opts.stderr_tail_bytes.max(1);
        let stdout = Drain::start(child.stdout.take(), cap);
        let stderr = Drain::start(child.stderr.take(), cap);

        let poll = Duration::from_millis(self.opts.poll_interval_ms.max(1));
        let status = match supervise(&mut child, ctl, poll) {
            Ok(status) => status,
            Err(err) => {
                // a killed process may leave grandchildren holding the pipes; do not wait on them
                return Err(err.with_stderr(tail_text(&stderr.snapshot(), cap)));
            }
        };
        let stderr = tail_text(&stderr.finish(DRAIN_GRACE), cap);
        drop(stdout.finish(DRAIN_GRACE));

        if !status.success() {
            let mut err = RenderError::new(
                RenderErrorKind::NonZeroExit,
                format!("{} exited with {status}", self.opts.program),
            )
            .with_stderr(stderr);
            err.exit_code = status.code();
            err.signal = exit_signal(&status);
            return Err(err);
        }

        let ext = req.spec.format.extension();
        let path = find_output(req.work_dir, &self.opts.output_name, ext)?.ok_or_else(|| {
            RenderError::malformed(format!(
                "renderer exited successfully but produced no {}*.{ext}",
                self.opts.output_name
            ))
            .with_stderr(stderr.clone())
        })?;
        let duration = self.duration_of(&path, req.work_dir, req.spec)?;

        tracing::debug!(path = %path.display(), duration, "renderer finished");
        Ok(RenderOutput { path, duration })
    }
}

/// Name of the first scene class defined in `script`.
pub fn scene_class(script: &str) -> Result<String, RenderError> {
    let re = Regex::new(r"(?m)^\s*class\s+(\w+)\s*\(\s*(?:\w+\.)*\w*Scene\s*\)\s*:")
        .map_err(|e| RenderError::new(RenderErrorKind::Internal, format!("regex error: {e}")))?;
    re.captures(script)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            RenderError::new(
                RenderErrorKind::InvalidScript,
                "script does not define a Scene subclass",
            )
        })
}

fn supervise(child: &mut Child, ctl: &RenderControl, poll: Duration) -> Result<ExitStatus, RenderError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                kill(child);
                return Err(RenderError::new(
                    RenderErrorKind::Internal,
                    format!("failed to poll renderer process: {e}"),
                ));
            }
        }
        if ctl.should_stop() {
            kill(child);
            let err = ctl.stop_error();
            tracing::info!(kind = %err.kind, "renderer process killed");
            return Err(err);
        }
        std::thread::sleep(poll);
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::warn!(error = %e, "failed to kill renderer process");
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt as _;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn find_output(work_dir: &Path, stem: &str, ext: &str) -> Result<Option<PathBuf>, RenderError> {
    let base = work_dir.to_str().ok_or_else(|| {
        RenderError::malformed(format!("work directory '{}' is not utf-8", work_dir.display()))
    })?;
    let pattern = format!(
        "{}/**/{}*.{}",
        glob::Pattern::escape(base),
        glob::Pattern::escape(stem),
        ext
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| RenderError::new(RenderErrorKind::Internal, format!("bad output pattern: {e}")))?;
    let mut found = paths
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect::<Vec<_>>();
    found.sort();
    Ok(found.into_iter().next())
}

fn read_sidecar(path: &Path) -> Result<f64, RenderError> {
    #[derive(serde::Deserialize)]
    struct Sidecar {
        duration: f64,
    }

    let bytes = std::fs::read(path).map_err(|e| {
        RenderError::malformed(format!("failed to read '{}': {e}", path.display()))
    })?;
    let sidecar: Sidecar = serde_json::from_slice(&bytes).map_err(|e| {
        RenderError::malformed(format!("invalid duration sidecar '{}': {e}", path.display()))
    })?;
    if !sidecar.duration.is_finite() || sidecar.duration < 0.0 {
        return Err(RenderError::malformed(format!(
            "sidecar '{}' reports invalid duration {}",
            path.display(),
            sidecar.duration
        )));
    }
    Ok(sidecar.duration)
}

fn probe_duration(path: &Path) -> anyhow::Result<f64> {
    #[derive(serde::Deserialize)]
    struct ProbeFormat {
        duration: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ProbeOut {
        format: Option<ProbeFormat>,
    }

    let out = Command::new("ffprobe")
        .args(["-v", "error", "-print_format", "json", "-show_format"])
        .arg(path)
        .stdin(Stdio::null())
        .output()?;
    if !out.status.success() {
        anyhow::bail!(
            "ffprobe failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    let parsed: ProbeOut = serde_json::from_slice(&out.stdout)?;
    parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| anyhow::anyhow!("ffprobe reported no duration"))
}

/// Background reader that keeps the tail of a child's output pipe.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl Drain {
    fn start<R: Read + Send + 'static>(reader: Option<R>, cap: usize) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        if let Some(mut reader) = reader {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut b = buf.lock().unwrap_or_else(|p| p.into_inner());
                            b.extend_from_slice(&chunk[..n]);
                            if b.len() > cap * 2 {
                                let cut = b.len() - cap;
                                b.drain(..cut);
                            }
                        }
                    }
                }
                let _ = tx.send(());
            });
        }
        Self { buf, done }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn finish(self, grace: Duration) -> Vec<u8> {
        let _ = self.done.recv_timeout(grace);
        self.snapshot()
    }
}

fn tail_text(bytes: &[u8], cap: usize) -> String {
    let start = bytes.len().saturating_sub(cap);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(test)]
#[path = "../../tests/unit/render/process.rs"]
mod tests;
