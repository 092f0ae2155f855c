//! Animake turns animation scripts into rendered video.
//!
//! Scripts are versioned in a [`ScriptStore`], arranged on a layered [`Timeline`], resolved into a
//! deterministic [`RenderSpec`] and rendered through a [`RenderJobManager`]:
//!
//! - identical work (same [`Fingerprint`]) renders once and is served from the [`ArtifactCache`]
//! - renders run on a bounded worker pool with cancellation and a wall-clock timeout
//! - previews for an edited timeline supersede each other via [`PreviewCoordinator`]
#![forbid(unsafe_code)]

mod foundation;

pub(crate) mod api;
pub(crate) mod cache;
pub(crate) mod compose;
pub(crate) mod render;
pub(crate) mod script;
pub(crate) mod timeline;

/// `animake.toml` loading.
pub mod config;
/// Script history and timeline persisted together.
pub mod project;

pub use crate::foundation::error::{AnimakeError, AnimakeResult, RenderError, RenderErrorKind};
pub use crate::foundation::ids::{ItemId, JobId, LayerId, TimelineId};

pub use crate::api::server::{ApiServer, ApiState, handle_request};
pub use crate::cache::artifact::{ArtifactCache, ArtifactCacheOpts, ArtifactEntry};
pub use crate::compose::fingerprint::{Fingerprint, fingerprint};
pub use crate::compose::resolver::resolve;
pub use crate::compose::spec::{Format, Quality, RenderSpec, ResolvedItem, ResolvedSource};
pub use crate::config::{EngineConfig, ServerConfig};
pub use crate::project::Project;
pub use crate::render::job::{JobHandle, JobKind, JobStatus, RenderJob};
pub use crate::render::journal::{JobJournal, JournalRecord, Replay};
pub use crate::render::manager::{RenderJobManager, RenderJobManagerOpts, RenderOutcome};
pub use crate::render::preview::PreviewCoordinator;
pub use crate::render::process::{ProcessRenderer, ProcessRendererOpts, scene_class};
pub use crate::render::renderer::{RenderControl, RenderOutput, RenderRequest, Renderer};
pub use crate::script::generate::{
    GeneratedScript, OpenAiGenerator, OpenAiGeneratorOpts, ScriptGenerator, extract_generated,
    extract_revised, generate_into,
};
pub use crate::script::store::{Script, ScriptStore, ScriptStoreOpts};
pub use crate::timeline::model::{
    AssetRef, ItemSource, Layer, NewItem, ScriptRef, Timeline, TimelineItem,
};
