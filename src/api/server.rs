use std::sync::Arc;

use rouille::{Request, Response};

use crate::compose::spec::{Format, Quality, RenderSpec};
use crate::foundation::error::{AnimakeError, AnimakeResult};
use crate::foundation::ids::JobId;
use crate::render::manager::RenderJobManager;
use crate::script::generate::{ScriptGenerator, generate_into};
use crate::script::store::ScriptStore;

/// Everything request handlers need.
pub struct ApiState {
    pub manager: Arc<RenderJobManager>,
    /// Session script; generated and revised code is committed here.
    pub scripts: Arc<ScriptStore>,
    /// `None` disables `generate-code` and `update-code`.
    pub generator: Option<Arc<dyn ScriptGenerator>>,
}

#[derive(Debug, serde::Deserialize)]
struct RenderBody {
    code: String,
    #[serde(default)]
    quality: Quality,
    #[serde(default)]
    format: Format,
}

#[derive(Debug, serde::Deserialize)]
struct GenerateCodeBody {
    prompt: String,
    /// Overrides the configured key for this request.
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ValidateKeyBody {
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct UpdateCodeBody {
    code: String,
    #[serde(default)]
    properties: serde_json::Value,
    #[serde(default)]
    history: Vec<String>,
}

#[derive(serde::Serialize)]
struct GenerateCodeResponse {
    code: String,
    metadata: Vec<serde_json::Value>,
    version: u64,
}

#[derive(serde::Serialize)]
struct UpdateCodeResponse {
    code: String,
    version: u64,
}

#[derive(serde::Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(serde::Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

/// HTTP front end over a [`RenderJobManager`] and a [`ScriptGenerator`].
pub struct ApiServer {
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(state: ApiState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Serve on `bind` until the process exits.
    pub fn serve(self, bind: &str) -> anyhow::Result<()> {
        let state = self.state;
        let server = rouille::Server::new(bind, move |request| handle_request(&state, request))
            .map_err(|e| anyhow::anyhow!("failed to bind http server on {bind}: {e}"))?;
        tracing::info!(addr = %server.server_addr(), "api server listening");
        server.run();
        Ok(())
    }
}

/// Route one request. Every response carries CORS headers.
pub fn handle_request(state: &ApiState, request: &Request) -> Response {
    if request.method() == "OPTIONS" {
        return cors(Response::empty_204())
            .with_additional_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .with_additional_header("Access-Control-Allow-Headers", "Content-Type");
    }

    let url = request.url();
    let result = if let Some(rest) = url.strip_prefix("/api/jobs/") {
        match (request.method(), rest.strip_suffix("/cancel")) {
            ("POST", Some(id)) => parse_job_id(id).and_then(|id| json(&state.manager.cancel(id)?)),
            ("GET", None) => parse_job_id(rest).and_then(|id| json(&state.manager.job(id)?)),
            _ => Err(AnimakeError::not_found(format!("{} {url}", request.method()))),
        }
    } else {
        rouille::router!(request,
            (GET) ["/api/health"] => {
                json(&HealthResponse {
                    status: "ok",
                    version: env!("CARGO_PKG_VERSION"),
                })
            },
            (POST) ["/api/generate-animation"] => { generate_animation(state, request) },
            (POST) ["/api/validate-key"] => { validate_key(state, request) },
            (POST) ["/api/generate-code"] => { generate_code(state, request) },
            (POST) ["/api/update-code"] => { update_code(state, request) },
            (POST) ["/api/jobs"] => { submit_job(state, request) },
            (GET) ["/api/jobs"] => { json(&state.manager.jobs()) },
            _ => { Err(AnimakeError::not_found(format!("{} {url}", request.method()))) }
        )
    };

    let response = result.unwrap_or_else(|e| error_response(&e));
    tracing::debug!(method = %request.method(), url = %url, status = response.status_code, "request handled");
    cors(response)
}

fn generate_animation(state: &ApiState, request: &Request) -> AnimakeResult<Response> {
    let body: RenderBody = json_body(request)?;
    let outcome = state
        .manager
        .render_blocking(&RenderSpec::from_script(body.code), body.quality, body.format)?;
    json(&outcome)
}

fn submit_job(state: &ApiState, request: &Request) -> AnimakeResult<Response> {
    let body: RenderBody = json_body(request)?;
    let handle = state
        .manager
        .submit(&RenderSpec::from_script(body.code), body.quality, body.format)?;
    Ok(Response::json(&handle.snapshot()).with_status_code(202))
}

fn generate_code(state: &ApiState, request: &Request) -> AnimakeResult<Response> {
    let body: GenerateCodeBody = json_body(request)?;
    let generator = generator(state)?;
    let (script, metadata) = generate_into(
        generator,
        &state.scripts,
        &body.prompt,
        body.api_key.as_deref(),
    )?;
    json(&GenerateCodeResponse {
        code: script.content.clone(),
        metadata,
        version: script.version,
    })
}

fn validate_key(state: &ApiState, request: &Request) -> AnimakeResult<Response> {
    let body: ValidateKeyBody = json_body(request)?;
    generator(state)?.validate_key(body.api_key.as_deref())?;
    json(&StatusResponse { status: "valid" })
}

fn update_code(state: &ApiState, request: &Request) -> AnimakeResult<Response> {
    let body: UpdateCodeBody = json_body(request)?;
    if body.code.trim().is_empty() {
        return Err(AnimakeError::validation("code must not be empty"));
    }
    let code = generator(state)?.revise(&body.code, &body.properties, &body.history)?;
    let script = state.scripts.set(code);
    json(&UpdateCodeResponse {
        code: script.content.clone(),
        version: script.version,
    })
}

fn generator(state: &ApiState) -> AnimakeResult<&dyn ScriptGenerator> {
    state
        .generator
        .as_deref()
        .ok_or_else(|| AnimakeError::generation("no script generator is configured"))
}

fn json_body<T: serde::de::DeserializeOwned>(request: &Request) -> AnimakeResult<T> {
    rouille::input::json_input(request)
        .map_err(|e| AnimakeError::validation(format!("invalid request body: {e}")))
}

fn json<T: serde::Serialize>(value: &T) -> AnimakeResult<Response> {
    Ok(Response::json(value))
}

fn parse_job_id(raw: &str) -> AnimakeResult<JobId> {
    let digits = raw.strip_prefix("job-").unwrap_or(raw);
    digits
        .parse::<u64>()
        .map(JobId)
        .map_err(|_| AnimakeError::validation(format!("invalid job id '{raw}'")))
}

fn status_code(err: &AnimakeError) -> u16 {
    match err {
        AnimakeError::Validation(_)
        | AnimakeError::Overlap(_)
        | AnimakeError::DanglingReference { .. }
        | AnimakeError::Serde(_) => 400,
        AnimakeError::Unauthorized(_) => 401,
        AnimakeError::NotFound(_) => 404,
        AnimakeError::Conflict { .. } => 409,
        AnimakeError::Generation(_) => 502,
        AnimakeError::Render(_) | AnimakeError::CacheIo(_) | AnimakeError::Other(_) => 500,
    }
}

fn error_response(err: &AnimakeError) -> Response {
    let status = status_code(err);
    if status >= 500 {
        tracing::warn!(kind = err.kind(), error = %err, "request failed");
    }
    Response::json(&ErrorBody {
        error: err.to_string(),
        kind: err.kind(),
    })
    .with_status_code(status)
}

fn cors(response: Response) -> Response {
    response.with_additional_header("Access-Control-Allow-Origin", "*")
}

#[cfg(test)]
#[path = "../../tests/unit/api/server.rs"]
mod tests;
