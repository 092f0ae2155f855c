use std::fmt;
use std::str::FromStr;

use crate::foundation::error::{AnimakeError, AnimakeResult};
use crate::foundation::ids::{ItemId, LayerId};

/// Render quality preset understood by the renderer.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Fast, low resolution; used for previews.
    Low,
    /// Default export quality.
    #[default]
    Medium,
    /// Full quality export.
    High,
}

impl Quality {
    /// Manim command-line flag for this preset.
    pub fn manim_flag(self) -> &'static str {
        match self {
            Self::Low => "-ql",
            Self::Medium => "-qm",
            Self::High => "-qh",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

impl FromStr for Quality {
    type Err = AnimakeError;

    fn from_str(s: &str) -> AnimakeResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(AnimakeError::validation(format!(
                "unknown quality '{other}' (expected low, medium or high)"
            ))),
        }
    }
}

/// Container format of the produced artifact.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// H.264 video.
    #[default]
    Mp4,
    /// Animated gif.
    Gif,
}

impl Format {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Gif => "gif",
        }
    }

    /// MIME type used when serving the artifact.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::Gif => "image/gif",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Mp4 => 0,
            Self::Gif => 1,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Format {
    type Err = AnimakeError;

    fn from_str(s: &str) -> AnimakeResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "gif" => Ok(Self::Gif),
            other => Err(AnimakeError::validation(format!(
                "unknown format '{other}' (expected mp4 or gif)"
            ))),
        }
    }
}

/// Content bound to a resolved item.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedSource {
    /// Exact script revision.
    Script {
        /// Script lineage id.
        script_id: String,
        /// Pinned revision.
        version: u64,
    },
    /// Static asset, project-relative.
    Asset {
        /// Normalized relative path.
        path: String,
    },
}

/// A timeline item with absolute timing and its position in the composite order.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResolvedItem {
    /// Layer the item came from.
    pub layer: LayerId,
    /// Rank of the layer in bottom-to-top composite order (0 is the bottom layer).
    pub composite_rank: u32,
    /// Source item id.
    pub item: ItemId,
    /// Absolute start in seconds.
    pub start: f64,
    /// Absolute exclusive end in seconds.
    pub end: f64,
    /// Bound content.
    pub source: ResolvedSource,
}

/// Immutable, fully resolved description of what to render.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RenderSpec {
    /// Script text handed to the renderer.
    pub script: String,
    /// Items in composite order (ascending layer rank, then start).
    pub items: Vec<ResolvedItem>,
    /// Max item end, in seconds. Zero for a bare script.
    pub duration: f64,
    /// Target quality.
    pub quality: Quality,
    /// Target container format.
    pub format: Format,
}

impl RenderSpec {
    /// Spec for a bare script with no timeline (the `generate-animation` path).
    ///
    /// The media duration is whatever the renderer reports.
    pub fn from_script(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            items: Vec::new(),
            duration: 0.0,
            quality: Quality::default(),
            format: Format::default(),
        }
    }

    /// Copy of this spec retargeted to `quality`/`format`.
    pub fn with_target(&self, quality: Quality, format: Format) -> Self {
        Self {
            quality,
            format,
            ..self.clone()
        }
    }

    /// Canonical JSON encoding; equal specs produce identical bytes.
    pub fn to_canonical_json(&self) -> AnimakeResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AnimakeError::serde(e.to_string()))
    }
}
