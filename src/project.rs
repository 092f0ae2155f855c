use std::path::Path;

use anyhow::Context as _;

use crate::compose::resolver::resolve;
use crate::compose::spec::RenderSpec;
use crate::foundation::error::{AnimakeError, AnimakeResult};
use crate::foundation::ids::TimelineId;
use crate::script::store::{Script, ScriptStore, ScriptStoreOpts};
use crate::timeline::model::Timeline;

const PROJECT_VERSION: u32 = 1;

#[derive(serde::Serialize, serde::Deserialize)]
struct ProjectFile {
    version: u32,
    script_id: String,
    scripts: Vec<Script>,
    timeline: Timeline,
}

/// One script history plus the timeline arranged on top of it, stored as a JSON document.
#[derive(Debug)]
pub struct Project {
    pub scripts: ScriptStore,
    pub timeline: Timeline,
}

impl Project {
    pub fn new(script_id: impl Into<String>, timeline: TimelineId, opts: ScriptStoreOpts) -> Self {
        Self {
            scripts: ScriptStore::new(script_id, opts),
            timeline: Timeline::new(timeline),
        }
    }

    /// Read a project file, validating the timeline and the script history.
    pub fn load(path: &Path, opts: ScriptStoreOpts) -> AnimakeResult<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read project '{}'", path.display()))?;
        let file: ProjectFile = serde_json::from_slice(&bytes)
            .map_err(|e| AnimakeError::serde(format!("{}: {e}", path.display())))?;
        if file.version != PROJECT_VERSION {
            return Err(AnimakeError::validation(format!(
                "unsupported project version {} (expected {PROJECT_VERSION})",
                file.version
            )));
        }
        file.timeline.validate()?;
        let scripts = ScriptStore::from_history(file.script_id, file.scripts, opts)?;
        Ok(Self {
            scripts,
            timeline: file.timeline,
        })
    }

    /// Write the project atomically.
    pub fn save(&self, path: &Path) -> AnimakeResult<()> {
        let file = ProjectFile {
            version: PROJECT_VERSION,
            script_id: self.scripts.id().to_string(),
            scripts: self
                .scripts
                .history()
                .iter()
                .map(|s| Script::clone(s))
                .collect(),
            timeline: self.timeline.clone(),
        };
        let json =
            serde_json::to_vec_pretty(&file).map_err(|e| AnimakeError::serde(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, path))
            .with_context(|| format!("failed to write project '{}'", path.display()))?;
        Ok(())
    }

    /// Resolve the timeline against the script history.
    pub fn resolve(&self) -> AnimakeResult<RenderSpec> {
        resolve(&self.timeline, &self.scripts)
    }
}
