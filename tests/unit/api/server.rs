use std::io::Read as _;
use std::path::Path;
use std::time::Duration;

use super::*;
use crate::foundation::error::{RenderError, RenderErrorKind};
use crate::render::manager::RenderJobManagerOpts;
use crate::render::renderer::{RenderControl, RenderOutput, RenderRequest, Renderer};
use crate::script::generate::GeneratedScript;
use crate::script::store::ScriptStoreOpts;

/// `block` scripts wait for cancellation, `fail` scripts exit non-zero, others succeed.
struct Scripted;

impl Renderer for Scripted {
    fn render(&self, req: &RenderRequest<'_>, ctl: &RenderControl) -> Result<RenderOutput, RenderError> {
        if req.spec.script.contains("block") {
            while !ctl.should_stop() {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err(ctl.stop_error());
        }
        if req.spec.script.contains("fail") {
            return Err(RenderError::new(RenderErrorKind::NonZeroExit, "manim exited with 1"));
        }
        let path = req.work_dir.join("animation.mp4");
        std::fs::write(&path, b"video")
            .map_err(|e| RenderError::new(RenderErrorKind::Internal, e.to_string()))?;
        Ok(RenderOutput {
            path,
            duration: 3.0,
        })
    }
}

struct Echo;

impl ScriptGenerator for Echo {
    fn generate(
        &self,
        prompt: &str,
        _prior: Option<&str>,
        api_key: Option<&str>,
    ) -> AnimakeResult<GeneratedScript> {
        Ok(GeneratedScript {
            code: format!("from manim import *\n# {prompt} key={}", api_key.unwrap_or("env")),
            metadata: vec![serde_json::json!({"id": "title"})],
        })
    }

    /// Accepts everything except the literal key `bad`.
    fn validate_key(&self, api_key: Option<&str>) -> AnimakeResult<()> {
        match api_key {
            Some("bad") => Err(AnimakeError::unauthorized("invalid api key")),
            _ => Ok(()),
        }
    }

    fn revise(&self, code: &str, properties: &serde_json::Value, _: &[String]) -> AnimakeResult<String> {
        Ok(format!("{code}\n# {properties}"))
    }
}

fn state(dir: &Path, generator: Option<Arc<dyn ScriptGenerator>>) -> ApiState {
    let manager = RenderJobManager::new(
        Arc::new(Scripted),
        RenderJobManagerOpts {
            output_dir: dir.to_path_buf(),
            ..RenderJobManagerOpts::default()
        },
    )
    .unwrap();
    ApiState {
        manager: Arc::new(manager),
        scripts: Arc::new(ScriptStore::new("session", ScriptStoreOpts::default())),
        generator,
    }
}

fn get(state: &ApiState, url: &str) -> Response {
    handle_request(state, &Request::fake_http("GET", url, vec![], vec![]))
}

fn post(state: &ApiState, url: &str, body: serde_json::Value) -> Response {
    let request = Request::fake_http(
        "POST",
        url,
        vec![("Content-Type".to_string(), "application/json".to_string())],
        body.to_string().into_bytes(),
    );
    handle_request(state, &request)
}

fn body(response: Response) -> serde_json::Value {
    let (mut reader, _) = response.data.into_reader_and_size();
    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn has_cors(response: &Response) -> bool {
    response
        .headers
        .iter()
        .any(|(k, v)| k == "Access-Control-Allow-Origin" && v == "*")
}

#[test]
fn health_reports_ok_with_cors() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), None);
    let resp = get(&state, "/api/health");
    assert_eq!(resp.status_code, 200);
    assert!(has_cors(&resp));
    assert_eq!(body(resp)["status"], "ok");
}

#[test]
fn generate_animation_returns_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), None);
    let resp = post(
        &state,
        "/api/generate-animation",
        serde_json::json!({"code": "class A(Scene): pass", "quality": "low"}),
    );
    assert_eq!(resp.status_code, 200);
    let json = body(resp);
    assert_eq!(json["duration"], 3.0);
    assert!(json["output_path"].as_str().unwrap().ends_with(".mp4"));
}

#[test]
fn bad_body_and_render_failure_map_to_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), None);

    let resp = post(
        &state,
        "/api/generate-animation",
        serde_json::json!({"code": "x", "quality": "ultra"}),
    );
    assert_eq!(resp.status_code, 400);
    assert_eq!(body(resp)["kind"], "validation");

    let resp = post(
        &state,
        "/api/generate-animation",
        serde_json::json!({"code": "fail please"}),
    );
    assert_eq!(resp.status_code, 500);
    assert!(has_cors(&resp));
    assert_eq!(body(resp)["kind"], "render");
}

#[test]
fn jobs_can_be_submitted_polled_and_canceled() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), None);

    let resp = post(&state, "/api/jobs", serde_json::json!({"code": "block forever"}));
    assert_eq!(resp.status_code, 202);
    let id = body(resp)["id"].as_u64().unwrap();

    let resp = get(&state, &format!("/api/jobs/{id}"));
    assert_eq!(resp.status_code, 200);
    assert_eq!(body(resp)["kind"], "export");

    let resp = post(&state, &format!("/api/jobs/job-{id}/cancel"), serde_json::json!({}));
    assert_eq!(resp.status_code, 200);
    assert_eq!(body(resp)["status"], "canceled");
}

#[test]
fn unknown_routes_and_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), None);
    assert_eq!(get(&state, "/api/jobs/999").status_code, 404);
    assert_eq!(get(&state, "/api/jobs/abc").status_code, 400);
    assert_eq!(get(&state, "/api/nope").status_code, 404);

    let preflight = handle_request(&state, &Request::fake_http("OPTIONS", "/api/jobs", vec![], vec![]));
    assert_eq!(preflight.status_code, 204);
    assert!(has_cors(&preflight));
}

#[test]
fn code_endpoints_need_a_generator() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), None);
    let resp = post(&state, "/api/generate-code", serde_json::json!({"prompt": "a circle"}));
    assert_eq!(resp.status_code, 502);
    assert_eq!(body(resp)["kind"], "generation");
}

#[test]
fn generated_and_updated_code_is_versioned() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), Some(Arc::new(Echo)));

    let resp = post(&state, "/api/generate-code", serde_json::json!({"prompt": "a circle"}));
    assert_eq!(resp.status_code, 200);
    let json = body(resp);
    assert_eq!(json["version"], 1);
    assert_eq!(json["metadata"][0]["id"], "title");
    let code = json["code"].as_str().unwrap().to_string();

    let resp = post(
        &state,
        "/api/update-code",
        serde_json::json!({"code": code, "properties": {"color": "RED"}}),
    );
    assert_eq!(resp.status_code, 200);
    let json = body(resp);
    assert_eq!(json["version"], 2);
    assert!(json["code"].as_str().unwrap().contains("RED"));
    assert_eq!(state.scripts.latest_version(), 2);
}

#[test]
fn validate_key_reports_valid_or_unauthorized() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), Some(Arc::new(Echo)));

    let resp = post(&state, "/api/validate-key", serde_json::json!({"api_key": "sk-good"}));
    assert_eq!(resp.status_code, 200);
    assert_eq!(body(resp)["status"], "valid");

    let resp = post(&state, "/api/validate-key", serde_json::json!({}));
    assert_eq!(resp.status_code, 200);

    let resp = post(&state, "/api/validate-key", serde_json::json!({"api_key": "bad"}));
    assert_eq!(resp.status_code, 401);
    assert!(has_cors(&resp));
    assert_eq!(body(resp)["kind"], "unauthorized");
}

#[test]
fn generate_code_passes_request_key_to_generator() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), Some(Arc::new(Echo)));

    let resp = post(
        &state,
        "/api/generate-code",
        serde_json::json!({"prompt": "a circle", "api_key": "sk-user"}),
    );
    assert_eq!(resp.status_code, 200);
    assert!(body(resp)["code"].as_str().unwrap().ends_with("a circle key=sk-user"));

    let resp = post(&state, "/api/generate-code", serde_json::json!({"prompt": "a square"}));
    assert!(body(resp)["code"].as_str().unwrap().ends_with("a square key=env"));
}
