use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::*;
use crate::compose::spec::{Format, Quality};
use crate::foundation::ids::JobId;

const SCENE: &str = "from manim import *\n\nclass Intro(Scene):\n    def construct(self):\n        pass\n";

fn sh(script: &str) -> ProcessRenderer {
    ProcessRenderer::new(ProcessRendererOpts {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), "{scene}".to_string()],
        ffprobe: false,
        poll_interval_ms: 10,
        ..ProcessRendererOpts::default()
    })
}

fn spec() -> RenderSpec {
    let mut spec = RenderSpec::from_script(SCENE);
    spec.duration = 5.0;
    spec.with_target(Quality::Low, Format::Mp4)
}

fn run_with(
    renderer: &ProcessRenderer,
    spec: &RenderSpec,
    work_dir: &Path,
    cancel: Arc<AtomicBool>,
    timeout: Duration,
) -> Result<RenderOutput, RenderError> {
    let ctl = RenderControl::new(cancel, timeout);
    let req = RenderRequest {
        job: JobId(1),
        fingerprint: spec.fingerprint(),
        spec,
        work_dir,
    };
    renderer.render(&req, &ctl)
}

fn run(renderer: &ProcessRenderer, work_dir: &Path) -> Result<RenderOutput, RenderError> {
    run_with(
        renderer,
        &spec(),
        work_dir,
        Arc::new(AtomicBool::new(false)),
        Duration::from_secs(30),
    )
}

#[test]
fn scene_class_finds_first_scene_subclass() {
    assert_eq!(scene_class(SCENE).unwrap(), "Intro");
    assert_eq!(
        scene_class("class Helper:\n    pass\nclass Orbit(ThreeDScene):\n    pass\n").unwrap(),
        "Orbit"
    );
    let err = scene_class("print('hello')").unwrap_err();
    assert_eq!(err.kind, RenderErrorKind::InvalidScript);
}

#[test]
fn default_args_follow_manim_cli() {
    let renderer = ProcessRenderer::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = RenderSpec::from_script(SCENE).with_target(Quality::High, Format::Gif);
    let req = RenderRequest {
        job: JobId(3),
        fingerprint: spec.fingerprint(),
        spec: &spec,
        work_dir: dir.path(),
    };

    let args = renderer.expand_args(&req, "Intro");
    let script = dir.path().join("scene.py").display().to_string();
    assert_eq!(
        args,
        vec!["-qh", "-o", "animation", "--format", "gif", script.as_str(), "Intro"]
    );
}

#[cfg(unix)]
#[test]
fn success_reads_sidecar_duration() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = sh(r#"test "$0" = Intro || exit 9
test -f scene.py && test -f timeline.json || exit 8
mkdir -p media/videos/480p15
printf data > media/videos/480p15/animation.mp4
echo '{"duration": 2.5}' > media/videos/480p15/animation.json"#);

    let out = run(&renderer, dir.path()).unwrap();
    assert!(out.path.ends_with("media/videos/480p15/animation.mp4"));
    assert_eq!(out.duration, 2.5);
}

#[cfg(unix)]
#[test]
fn missing_sidecar_falls_back_to_spec_duration() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(&sh("printf data > animation.mp4"), dir.path()).unwrap();
    assert_eq!(out.duration, 5.0);
}

#[cfg(unix)]
#[test]
fn nonzero_exit_captures_code_and_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let err = run(&sh("echo 'NameError: Circle' >&2; exit 3"), dir.path()).unwrap_err();
    assert_eq!(err.kind, RenderErrorKind::NonZeroExit);
    assert_eq!(err.exit_code, Some(3));
    assert_eq!(err.signal, None);
    assert!(err.stderr.contains("NameError: Circle"));
}

#[cfg(unix)]
#[test]
fn clean_exit_without_output_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let err = run(&sh("exit 0"), dir.path()).unwrap_err();
    assert_eq!(err.kind, RenderErrorKind::MalformedOutput);
}

#[cfg(unix)]
#[test]
fn unparsable_sidecar_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let err = run(
        &sh("printf data > animation.mp4; echo 'nope' > animation.json"),
        dir.path(),
    )
    .unwrap_err();
    assert_eq!(err.kind, RenderErrorKind::MalformedOutput);
}

#[cfg(unix)]
#[test]
fn timeout_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let started = Instant::now();
    let err = run_with(
        &sh("exec sleep 30"),
        &spec(),
        dir.path(),
        Arc::new(AtomicBool::new(false)),
        Duration::from_millis(300),
    )
    .unwrap_err();

    assert_eq!(err.kind, RenderErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(unix)]
#[test]
fn cancel_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let canceler = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        flag.store(true, Ordering::Release);
    });

    let started = Instant::now();
    let err = run_with(
        &sh("exec sleep 30"),
        &spec(),
        dir.path(),
        cancel,
        Duration::from_secs(60),
    )
    .unwrap_err();
    canceler.join().unwrap();

    assert_eq!(err.kind, RenderErrorKind::Canceled);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn missing_program_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = ProcessRenderer::new(ProcessRendererOpts {
        program: "/nonexistent/animake-renderer".to_string(),
        ..ProcessRendererOpts::default()
    });
    let err = run(&renderer, dir.path()).unwrap_err();
    assert_eq!(err.kind, RenderErrorKind::Spawn);
}

#[test]
fn script_without_scene_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let spec = RenderSpec::from_script("print('no scene here')");
    let err = run_with(
        &sh("touch spawned"),
        &spec,
        dir.path(),
        Arc::new(AtomicBool::new(false)),
        Duration::from_secs(5),
    )
    .unwrap_err();

    assert_eq!(err.kind, RenderErrorKind::InvalidScript);
    assert!(!dir.path().join("spawned").exists());
}
