use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;

use crate::cache::artifact::ArtifactCacheOpts;
use crate::compose::spec::Format;
use crate::foundation::error::{AnimakeError, AnimakeResult};
use crate::render::manager::RenderJobManagerOpts;
use crate::render::process::ProcessRendererOpts;
use crate::script::generate::OpenAiGeneratorOpts;
use crate::script::store::ScriptStoreOpts;

/// `[server]` table.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the HTTP API listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

/// Engine configuration, usually read from `animake.toml`. Every key is optional.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output_dir: PathBuf,
    pub max_concurrent_renders: usize,
    pub render_timeout_secs: u64,
    pub cache_max_entries: Option<usize>,
    pub cache_max_bytes: Option<u64>,
    pub max_job_history: usize,
    pub journal: bool,
    pub preview_format: Format,
    pub script_max_versions: Option<usize>,
    pub renderer: ProcessRendererOpts,
    pub generator: OpenAiGeneratorOpts,
    pub server: ServerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let manager = RenderJobManagerOpts::default();
        Self {
            output_dir: manager.output_dir,
            max_concurrent_renders: manager.max_concurrent_renders,
            render_timeout_secs: manager.render_timeout.as_secs(),
            cache_max_entries: manager.cache.max_entries,
            cache_max_bytes: manager.cache.max_bytes,
            max_job_history: manager.max_job_history,
            journal: manager.journal,
            preview_format: Format::Mp4,
            script_max_versions: None,
            renderer: ProcessRendererOpts::default(),
            generator: OpenAiGeneratorOpts::default(),
            server: ServerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> AnimakeResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> AnimakeResult<Self> {
        let cfg: Self = toml::from_str(content).map_err(|e| AnimakeError::serde(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> AnimakeResult<()> {
        if self.max_concurrent_renders == 0 {
            return Err(AnimakeError::validation(
                "max_concurrent_renders must be at least 1",
            ));
        }
        if self.render_timeout_secs == 0 {
            return Err(AnimakeError::validation("render_timeout_secs must be non-zero"));
        }
        if self.renderer.program.trim().is_empty() {
            return Err(AnimakeError::validation("renderer.program must be set"));
        }
        if self.script_max_versions == Some(0) {
            return Err(AnimakeError::validation(
                "script_max_versions must be at least 1 when set",
            ));
        }
        Ok(())
    }

    pub fn manager_opts(&self) -> RenderJobManagerOpts {
        RenderJobManagerOpts {
            output_dir: self.output_dir.clone(),
            max_concurrent_renders: self.max_concurrent_renders,
            render_timeout: Duration::from_secs(self.render_timeout_secs),
            cache: ArtifactCacheOpts {
                max_entries: self.cache_max_entries,
                max_bytes: self.cache_max_bytes,
            },
            max_job_history: self.max_job_history,
            journal: self.journal,
        }
    }

    pub fn script_opts(&self) -> ScriptStoreOpts {
        ScriptStoreOpts {
            max_versions: self.script_max_versions,
        }
    }
}
