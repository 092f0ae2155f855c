use super::*;
use crate::script::store::ScriptStoreOpts;

const RESPONSE: &str = "Here is your animation:\n\n```python\n# scene\nfrom manim import *\n\nfont_size = 48\n\nclass Hello(Scene):\n    def construct(self):\n        self.play(Write(Text(\"Hi\", font_size=font_size)))\n```\n\n```json\n[{\"id\": \"title\", \"type\": \"text\", \"start\": 0, \"duration\": 2, \"properties\": {\"font_size\": {\"type\": \"number\", \"value\": 48}}}]\n```\n";

#[test]
fn generated_code_starts_at_manim_import() {
    let out = extract_generated(RESPONSE).unwrap();
    assert!(out.code.starts_with("from manim import *"));
    assert!(out.code.ends_with("font_size=font_size)))"));
    assert_eq!(out.metadata.len(), 1);
    assert_eq!(out.metadata[0]["id"], "title");
}

#[test]
fn malformed_metadata_is_dropped() {
    let response = "```python\nfrom manim import *\n```\n```json\n{ oops\n```";
    let out = extract_generated(response).unwrap();
    assert_eq!(out.code, "from manim import *");
    assert!(out.metadata.is_empty());
}

#[test]
fn missing_code_block_is_a_generation_error() {
    let err = extract_generated("I cannot help with that.").unwrap_err();
    assert!(matches!(err, AnimakeError::Generation(_)));
}

#[test]
fn revised_code_uses_fence_or_whole_text() {
    let fenced = "Sure!\n```python\nimport numpy\nfrom manim import *\nx = 2\n```";
    assert_eq!(extract_revised(fenced).unwrap(), "from manim import *\nx = 2");
    assert_eq!(
        extract_revised("  from manim import *\nx = 3\n").unwrap(),
        "from manim import *\nx = 3"
    );
    assert!(extract_revised("   ").is_err());
}

#[test]
fn revise_prompt_numbers_history() {
    let props = serde_json::json!({"font_size": 24});
    let prompt = revise_prompt("code v3", &props, &["code v1".to_string(), "code v2".to_string()]);
    assert!(prompt.contains("Previous code version 1:\ncode v1"));
    assert!(prompt.contains("Previous code version 2:\ncode v2"));
    assert!(prompt.contains("\"font_size\": 24"));
    assert!(prompt.ends_with("Return only the updated Manim code."));
}

/// Returns a fixed script, optionally committing a competing edit mid-request.
struct Canned<'a> {
    interfere: Option<&'a ScriptStore>,
    fail: bool,
}

impl ScriptGenerator for Canned<'_> {
    fn generate(
        &self,
        prompt: &str,
        prior: Option<&str>,
        api_key: Option<&str>,
    ) -> AnimakeResult<GeneratedScript> {
        if self.fail {
            return Err(AnimakeError::generation("service unavailable"));
        }
        if let Some(store) = self.interfere {
            store.set("edited by hand");
        }
        let prompt = match api_key {
            Some(key) => format!("{prompt} [{key}]"),
            None => prompt.to_string(),
        };
        Ok(GeneratedScript {
            code: format!("# {prompt} (prior: {})", prior.unwrap_or("none")),
            metadata: Vec::new(),
        })
    }

    fn validate_key(&self, _: Option<&str>) -> AnimakeResult<()> {
        Ok(())
    }

    fn revise(&self, code: &str, _: &serde_json::Value, _: &[String]) -> AnimakeResult<String> {
        Ok(code.to_string())
    }
}

#[test]
fn generate_into_commits_with_prior_context() {
    let store = ScriptStore::new("main", ScriptStoreOpts::default());
    let generator = Canned { interfere: None, fail: false };

    let (first, _) = generate_into(&generator, &store, "a circle", None).unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(first.content, "# a circle (prior: none)");

    let (second, _) = generate_into(&generator, &store, "make it red", Some("sk-user")).unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(second.content, "# make it red [sk-user] (prior: # a circle (prior: none))");
}

#[test]
fn concurrent_edit_during_generation_conflicts() {
    let store = ScriptStore::new("main", ScriptStoreOpts::default());
    store.set("v1");
    let generator = Canned {
        interfere: Some(&store),
        fail: false,
    };

    let err = generate_into(&generator, &store, "spin", None).unwrap_err();
    assert!(matches!(err, AnimakeError::Conflict { base: 1, latest: 2 }));
    assert_eq!(store.latest().unwrap().content, "edited by hand");
}

#[test]
fn generation_failure_leaves_store_untouched() {
    let store = ScriptStore::new("main", ScriptStoreOpts::default());
    store.set("v1");
    let generator = Canned { interfere: None, fail: true };

    assert!(matches!(
        generate_into(&generator, &store, "spin", None),
        Err(AnimakeError::Generation(_))
    ));
    assert_eq!(store.latest_version(), 1);
}

fn offline_generator() -> OpenAiGenerator {
    OpenAiGenerator::new(OpenAiGeneratorOpts {
        api_key_env: "ANIMAKE_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
        endpoint: "http://127.0.0.1:9/v1/chat/completions".to_string(),
        models_endpoint: "http://127.0.0.1:9/v1/models".to_string(),
        ..OpenAiGeneratorOpts::default()
    })
    .unwrap()
}

#[test]
fn request_key_overrides_environment() {
    let generator = offline_generator();
    assert_eq!(generator.api_key(Some("  sk-abc ")).as_deref(), Some("sk-abc"));
    assert_eq!(generator.api_key(Some("")), None);
    assert_eq!(generator.api_key(None), None);
}

#[test]
fn missing_key_is_unauthorized_without_a_request() {
    let generator = offline_generator();
    assert!(matches!(
        generator.validate_key(None),
        Err(AnimakeError::Unauthorized(_))
    ));
    assert!(matches!(
        generator.generate("a square", None, Some(" ")),
        Err(AnimakeError::Unauthorized(_))
    ));
}
