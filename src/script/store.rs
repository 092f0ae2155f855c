use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::foundation::error::{AnimakeError, AnimakeResult};

/// One immutable, versioned revision of a scene script.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Script {
    /// Id of the store (and therefore the script lineage) this revision belongs to.
    pub id: String,
    /// Full script source.
    pub content: String,
    /// Monotonic revision number, starting at 1.
    pub version: u64,
    /// Wall-clock time of the commit.
    pub created_at: SystemTime,
}

/// Retention options for [`ScriptStore`].
#[derive(Clone, Debug, Default)]
pub struct ScriptStoreOpts {
    /// Keep at most this many versions; `None` keeps the full history.
    ///
    /// Timeline items pinned to a dropped version fail to resolve, so this should only be set
    /// together with a policy that re-pins items.
    pub max_versions: Option<usize>,
}

#[derive(Debug, Default)]
struct History {
    versions: VecDeque<Arc<Script>>,
    latest: u64,
}

/// Owner of a script and its edit history.
///
/// All writes go through one lock, which gives commits a total order. [`ScriptStore::set_if`]
/// adds optimistic concurrency on top: a writer that edited a stale base is rejected instead of
/// silently replacing the newer text.
#[derive(Debug)]
pub struct ScriptStore {
    id: String,
    opts: ScriptStoreOpts,
    history: Mutex<History>,
}

impl ScriptStore {
    /// Create an empty store for the script lineage `id`.
    pub fn new(id: impl Into<String>, opts: ScriptStoreOpts) -> Self {
        Self {
            id: id.into(),
            opts,
            history: Mutex::new(History::default()),
        }
    }

    /// Rebuild a store from a persisted history (oldest first).
    pub fn from_history(
        id: impl Into<String>,
        versions: Vec<Script>,
        opts: ScriptStoreOpts,
    ) -> AnimakeResult<Self> {
        let id = id.into();
        let mut history = History::default();
        for script in versions {
            if script.id != id {
                return Err(AnimakeError::validation(format!(
                    "script version {} belongs to '{}', expected '{}'",
                    script.version, script.id, id
                )));
            }
            if script.version <= history.latest {
                return Err(AnimakeError::validation(format!(
                    "script versions must be strictly increasing (got {} after {})",
                    script.version, history.latest
                )));
            }
            history.latest = script.version;
            history.versions.push_back(Arc::new(script));
        }
        let store = Self {
            id,
            opts,
            history: Mutex::new(history),
        };
        store.with_history(|h| store.apply_retention(h));
        Ok(store)
    }

    /// Id of the script lineage this store owns.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Commit `content` as a new version unconditionally.
    pub fn set(&self, content: impl Into<String>) -> Arc<Script> {
        let content = content.into();
        self.with_history(|h| self.commit(h, content))
    }

    /// Commit `content` only if `base_version` is still the latest version.
    ///
    /// `base_version == 0` means the writer started from an empty store.
    pub fn set_if(&self, base_version: u64, content: impl Into<String>) -> AnimakeResult<Arc<Script>> {
        let content = content.into();
        self.with_history(|h| {
            if h.latest != base_version {
                return Err(AnimakeError::Conflict {
                    base: base_version,
                    latest: h.latest,
                });
            }
            Ok(self.commit(h, content))
        })
    }

    /// Return the latest version (`None`) or a specific one.
    pub fn get(&self, version: Option<u64>) -> AnimakeResult<Arc<Script>> {
        self.with_history(|h| match version {
            None => h.versions.back().cloned().ok_or_else(|| {
                AnimakeError::not_found(format!("script '{}' has no versions", self.id))
            }),
            Some(v) => {
                if v == 0 || v > h.latest {
                    return Err(AnimakeError::not_found(format!(
                        "script '{}' version {v} does not exist",
                        self.id
                    )));
                }
                // versions are sorted ascending
                h.versions
                    .binary_search_by_key(&v, |s| s.version)
                    .map(|idx| Arc::clone(&h.versions[idx]))
                    .map_err(|_| {
                        AnimakeError::not_found(format!(
                            "script '{}' version {v} is no longer retained",
                            self.id
                        ))
                    })
            }
        })
    }

    /// Latest version, if any.
    pub fn latest(&self) -> Option<Arc<Script>> {
        self.with_history(|h| h.versions.back().cloned())
    }

    /// Latest committed version number (0 for an empty store).
    pub fn latest_version(&self) -> u64 {
        self.with_history(|h| h.latest)
    }

    /// Every retained version, oldest first.
    pub fn history(&self) -> Vec<Arc<Script>> {
        self.with_history(|h| h.versions.iter().cloned().collect())
    }

    fn commit(&self, h: &mut History, content: String) -> Arc<Script> {
        h.latest += 1;
        let script = Arc::new(Script {
            id: self.id.clone(),
            content,
            version: h.latest,
            created_at: SystemTime::now(),
        });
        h.versions.push_back(Arc::clone(&script));
        self.apply_retention(h);
        tracing::debug!(script = %self.id, version = script.version, "script committed");
        script
    }

    fn apply_retention(&self, h: &mut History) {
        if let Some(max) = self.opts.max_versions {
            let max = max.max(1);
            while h.versions.len() > max {
                if let Some(dropped) = h.versions.pop_front() {
                    tracing::debug!(script = %self.id, version = dropped.version, "script version dropped by retention");
                }
            }
        }
    }

    fn with_history<R>(&self, f: impl FnOnce(&mut History) -> R) -> R {
        // commit only ever pushes fully built versions, so a poisoned history is consistent.
        let mut guard = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/script/store.rs"]
mod tests;
