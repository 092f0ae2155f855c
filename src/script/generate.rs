use std::sync::Arc;
use std::time::Duration;

use crate::foundation::error::{AnimakeError, AnimakeResult};
use crate::script::store::{Script, ScriptStore};

const MANIM_IMPORT: &str = "from manim import";

const GENERATE_SYSTEM_PROMPT: &str = "\
You are a Manim code generator. Generate Manim code based on the user's description.

Always answer with two fenced blocks:
1. A ```python block with the Manim code. Start with `from manim import *`. Define every editable
   property (font size, color, position, scaling, rotation, opacity) as a variable at the top of
   the file and use it in the scene. Import every constant, class and animation you use.
2. A ```json block with a list of component metadata objects of the form
   {\"id\", \"type\": \"text|shape|transform\", \"start\", \"duration\", \"properties\": {name:
   {\"type\": \"number|string|color|boolean|position\", \"value\", \"min\", \"max\", \"step\",
   \"options\", \"multiline\", \"label\"}}}.";

/// Output of a generation request.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeneratedScript {
    /// Scene script, starting at the manim import.
    pub code: String,
    /// Editable-property metadata; empty when the service returned none or garbage.
    pub metadata: Vec<serde_json::Value>,
}

/// Natural-language to script service.
pub trait ScriptGenerator: Send + Sync {
    /// Produce a script for `prompt`, optionally refining `prior`. `api_key` overrides the
    /// configured credential for this call only.
    fn generate(
        &self,
        prompt: &str,
        prior: Option<&str>,
        api_key: Option<&str>,
    ) -> AnimakeResult<GeneratedScript>;

    /// Check that the service accepts `api_key` (or the configured key when `None`).
    /// A rejected or missing key is [`AnimakeError::Unauthorized`].
    fn validate_key(&self, api_key: Option<&str>) -> AnimakeResult<()>;

    /// Rewrite `code` so its property values match `properties`. `history` holds earlier
    /// revisions, oldest first, for context.
    fn revise(
        &self,
        code: &str,
        properties: &serde_json::Value,
        history: &[String],
    ) -> AnimakeResult<String>;
}

/// Generate from `prompt` (with the latest script as context) and commit the result.
///
/// The commit is conditional on the version the request started from, so a concurrent edit
/// surfaces as [`AnimakeError::Conflict`] instead of being overwritten.
#[tracing::instrument(skip(generator, store, prompt, api_key), fields(script = store.id()))]
pub fn generate_into(
    generator: &dyn ScriptGenerator,
    store: &ScriptStore,
    prompt: &str,
    api_key: Option<&str>,
) -> AnimakeResult<(Arc<Script>, Vec<serde_json::Value>)> {
    if prompt.trim().is_empty() {
        return Err(AnimakeError::validation("prompt must not be empty"));
    }
    let base = store.latest();
    let base_version = base.as_ref().map(|s| s.version).unwrap_or(0);
    let generated = generator.generate(prompt, base.as_ref().map(|s| s.content.as_str()), api_key)?;
    let script = store.set_if(base_version, generated.code)?;
    tracing::info!(version = script.version, "generated script committed");
    Ok((script, generated.metadata))
}

/// Parse a generation response: a required ```python block and an optional ```json block.
pub fn extract_generated(response: &str) -> AnimakeResult<GeneratedScript> {
    let code = fenced_block(response, "python")
        .ok_or_else(|| AnimakeError::generation("response contained no python code block"))?;
    let code = match code.find(MANIM_IMPORT) {
        Some(idx) => &code[idx..],
        None => code,
    };
    if code.trim().is_empty() {
        return Err(AnimakeError::generation("response contained an empty code block"));
    }

    let metadata = match fenced_block(response, "json").map(serde_json::from_str::<serde_json::Value>) {
        Some(Ok(serde_json::Value::Array(items))) => items,
        Some(Ok(_)) | Some(Err(_)) => {
            tracing::debug!("ignoring malformed metadata block");
            Vec::new()
        }
        None => Vec::new(),
    };

    Ok(GeneratedScript {
        code: code.trim().to_string(),
        metadata,
    })
}

/// Parse a revision response: the ```python block if present, otherwise the whole text.
pub fn extract_revised(response: &str) -> AnimakeResult<String> {
    let code = match fenced_block(response, "python") {
        Some(block) => {
            let lines = block.lines().collect::<Vec<_>>();
            match lines
                .iter()
                .position(|l| l.trim_start().starts_with(MANIM_IMPORT))
            {
                Some(i) => lines[i..].join("\n"),
                None => block.to_string(),
            }
        }
        None => response.to_string(),
    };
    let code = code.trim();
    if code.is_empty() {
        return Err(AnimakeError::generation("revision response was empty"));
    }
    Ok(code.to_string())
}

/// Body of the first ```<lang> fence, without the fence lines.
fn fenced_block<'a>(text: &'a str, lang: &str) -> Option<&'a str> {
    let open = format!("```{lang}");
    let start = text.find(&open)? + open.len();
    let rest = &text[start..];
    let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
    let body = &rest[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn revise_prompt(code: &str, properties: &serde_json::Value, history: &[String]) -> String {
    let mut prompt = String::from(
        "You are a Manim code editor. Given the following Manim code and a JSON object of updated \
         property values, update the code so that the property values match the JSON. Only change \
         the values, do not change the structure or add new properties.\n\n",
    );
    if !history.is_empty() {
        prompt.push_str("Here is the previous code history for context:\n");
        for (idx, prev) in history.iter().enumerate() {
            prompt.push_str(&format!("Previous code version {}:\n{prev}\n\n", idx + 1));
        }
    }
    let properties = serde_json::to_string_pretty(properties).unwrap_or_else(|_| properties.to_string());
    prompt.push_str(&format!("Manim code:\n{code}\n\n"));
    prompt.push_str(&format!("Updated properties:\n{properties}\n\n"));
    prompt.push_str("Return only the updated Manim code.");
    prompt
}

/// Settings for [`OpenAiGenerator`]; the `[generator]` table of the engine config.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OpenAiGeneratorOpts {
    /// Chat-completions endpoint.
    pub endpoint: String,
    /// Model listing endpoint, used to check a key without spending tokens.
    pub models_endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub generate_temperature: f32,
    pub revise_temperature: f32,
}

impl Default for OpenAiGeneratorOpts {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            models_endpoint: "https://api.openai.com/v1/models".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
            generate_temperature: 0.7,
            revise_temperature: 0.2,
        }
    }
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage<'a>],
    temperature: f32,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(serde::Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// [`ScriptGenerator`] backed by an OpenAI-compatible chat-completions API.
pub struct OpenAiGenerator {
    opts: OpenAiGeneratorOpts,
    client: reqwest::blocking::Client,
}

impl OpenAiGenerator {
    pub fn new(opts: OpenAiGeneratorOpts) -> AnimakeResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(opts.timeout_secs.max(1)))
            .build()
            .map_err(|e| AnimakeError::generation(format!("failed to build http client: {e}")))?;
        Ok(Self { opts, client })
    }

    /// The per-call override, else the key from the configured environment variable.
    fn api_key(&self, api_key: Option<&str>) -> Option<String> {
        match api_key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => Some(key.to_string()),
            None => std::env::var(&self.opts.api_key_env).ok(),
        }
    }

    fn complete(
        &self,
        messages: &[ChatMessage<'_>],
        temperature: f32,
        api_key: Option<&str>,
    ) -> AnimakeResult<String> {
        let api_key = self.api_key(api_key).ok_or_else(|| {
            AnimakeError::unauthorized(format!("no api key given and {} is not set", self.opts.api_key_env))
        })?;

        let resp = self
            .client
            .post(&self.opts.endpoint)
            .bearer_auth(api_key)
            .json(&ChatRequest {
                model: &self.opts.model,
                messages,
                temperature,
            })
            .send()
            .map_err(|e| AnimakeError::generation(format!("request failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AnimakeError::unauthorized("service rejected the api key"));
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(AnimakeError::generation(format!(
                "service returned {status}: {}",
                body.trim()
            )));
        }

        let parsed: ChatResponse = resp
            .json()
            .map_err(|e| AnimakeError::generation(format!("invalid response body: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AnimakeError::generation("response had no message content"))
    }
}

impl ScriptGenerator for OpenAiGenerator {
    #[tracing::instrument(skip_all, fields(model = %self.opts.model))]
    fn generate(
        &self,
        prompt: &str,
        prior: Option<&str>,
        api_key: Option<&str>,
    ) -> AnimakeResult<GeneratedScript> {
        let user = match prior {
            Some(prior) => format!("Current script:\n```python\n{prior}\n```\n\n{prompt}"),
            None => prompt.to_string(),
        };
        let messages = [
            ChatMessage {
                role: "system",
                content: GENERATE_SYSTEM_PROMPT,
            },
            ChatMessage {
                role: "user",
                content: &user,
            },
        ];
        let content = self.complete(&messages, self.opts.generate_temperature, api_key)?;
        extract_generated(&content)
    }

    #[tracing::instrument(skip_all)]
    fn validate_key(&self, api_key: Option<&str>) -> AnimakeResult<()> {
        let api_key = self
            .api_key(api_key)
            .ok_or_else(|| AnimakeError::unauthorized("no api key given"))?;
        let resp = self
            .client
            .get(&self.opts.models_endpoint)
            .bearer_auth(api_key)
            .send()
            .map_err(|e| AnimakeError::generation(format!("request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            tracing::debug!(%status, "api key rejected");
            return Err(AnimakeError::unauthorized("invalid api key"));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(model = %self.opts.model))]
    fn revise(
        &self,
        code: &str,
        properties: &serde_json::Value,
        history: &[String],
    ) -> AnimakeResult<String> {
        let prompt = revise_prompt(code, properties, history);
        let messages = [ChatMessage {
            role: "system",
            content: &prompt,
        }];
        let content = self.complete(&messages, self.opts.revise_temperature, None)?;
        extract_revised(&content)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/script/generate.rs"]
mod tests;
