use std::fmt;

/// Crate-wide result alias.
pub type AnimakeResult<T> = Result<T, AnimakeError>;

/// Every failure the pipeline can surface to a caller.
#[derive(thiserror::Error, Debug)]
pub enum AnimakeError {
    /// Malformed input (bad timings, empty specs, unknown enum strings).
    #[error("validation error: {0}")]
    Validation(String),

    /// A script edit raced against a newer committed version.
    #[error("conflict: edit based on version {base} but latest is {latest}")]
    Conflict {
        /// Version the writer believed was current.
        base: u64,
        /// Version actually at the head of the history.
        latest: u64,
    },

    /// A timeline placement would overlap another item in the same layer.
    #[error("overlap error: {0}")]
    Overlap(String),

    /// A resolved item points at a script version the store no longer holds.
    #[error("dangling reference: script '{script_id}' version {version} is not retained")]
    DanglingReference {
        /// Script id recorded on the item.
        script_id: String,
        /// Version recorded on the item.
        version: u64,
    },

    /// The external script generation service failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// The generation service rejected (or was never given) an API key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The external renderer failed, timed out, or was canceled.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Unknown id or version.
    #[error("not found: {0}")]
    NotFound(String),

    /// Artifact cache storage could not be read or written.
    #[error("cache io error: {0}")]
    CacheIo(String),

    /// JSON/TOML encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Plumbing failures (filesystem, threads) with context attached.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AnimakeError {
    /// Build a [`AnimakeError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`AnimakeError::Overlap`].
    pub fn overlap(msg: impl Into<String>) -> Self {
        Self::Overlap(msg.into())
    }

    /// Build a [`AnimakeError::Generation`].
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Build a [`AnimakeError::Unauthorized`].
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Build a [`AnimakeError::NotFound`].
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Build a [`AnimakeError::CacheIo`].
    pub fn cache_io(msg: impl Into<String>) -> Self {
        Self::CacheIo(msg.into())
    }

    /// Build a [`AnimakeError::Serde`].
    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    /// Short machine-readable tag used in API error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict { .. } => "conflict",
            Self::Overlap(_) => "overlap",
            Self::DanglingReference { .. } => "dangling_reference",
            Self::Generation(_) => "generation",
            Self::Unauthorized(_) => "unauthorized",
            Self::Render(_) => "render",
            Self::NotFound(_) => "not_found",
            Self::CacheIo(_) => "cache_io",
            Self::Serde(_) => "serialization",
            Self::Other(_) => "internal",
        }
    }
}

/// Failure category for a renderer invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderErrorKind {
    /// The renderer process exited unsuccessfully.
    NonZeroExit,
    /// The invocation exceeded the configured wall-clock timeout and was killed.
    Timeout,
    /// The renderer exited cleanly but its output could not be located or parsed.
    MalformedOutput,
    /// The renderer process could not be started.
    Spawn,
    /// The script cannot be handed to the renderer (for example no scene class).
    InvalidScript,
    /// The job was canceled and the process terminated.
    Canceled,
    /// The job was in flight when a previous process instance stopped.
    Interrupted,
    /// The renderer panicked or the work directory could not be prepared.
    Internal,
}

impl fmt::Display for RenderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NonZeroExit => "non-zero exit",
            Self::Timeout => "timeout",
            Self::MalformedOutput => "malformed output",
            Self::Spawn => "spawn failure",
            Self::InvalidScript => "invalid script",
            Self::Canceled => "canceled",
            Self::Interrupted => "interrupted",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured renderer failure recorded on a job.
#[derive(thiserror::Error, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("render error ({kind}): {message}")]
pub struct RenderError {
    /// Failure category.
    pub kind: RenderErrorKind,
    /// Human-readable summary.
    pub message: String,
    /// Process exit code, when the process exited on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Terminating signal on unix, when the process was signaled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Tail of the captured stderr.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl RenderError {
    /// Build an error of `kind` with no process diagnostics attached.
    pub fn new(kind: RenderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            signal: None,
            stderr: String::new(),
        }
    }

    /// Shorthand for a [`RenderErrorKind::Timeout`] error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RenderErrorKind::Timeout, message)
    }

    /// Shorthand for a [`RenderErrorKind::Canceled`] error.
    pub fn canceled() -> Self {
        Self::new(RenderErrorKind::Canceled, "render canceled")
    }

    /// Shorthand for a [`RenderErrorKind::MalformedOutput`] error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(RenderErrorKind::MalformedOutput, message)
    }

    /// Attach a stderr excerpt.
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
