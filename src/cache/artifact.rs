use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context as _;
use lru::LruCache;

use crate::compose::fingerprint::Fingerprint;
use crate::foundation::error::{AnimakeError, AnimakeResult};

const MANIFEST_FILE: &str = "artifacts.json";
const MANIFEST_VERSION: u32 = 1;

/// Eviction bounds for [`ArtifactCache`].
#[derive(Clone, Debug)]
pub struct ArtifactCacheOpts {
    /// Maximum number of entries; `None` for unbounded.
    pub max_entries: Option<usize>,
    /// Maximum total size of backing files in bytes; `None` for unbounded.
    pub max_bytes: Option<u64>,
}

impl Default for ArtifactCacheOpts {
    fn default() -> Self {
        Self {
            max_entries: Some(256),
            max_bytes: Some(2 * 1024 * 1024 * 1024),
        }
    }
}

/// A previously produced artifact.
#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactEntry {
    /// Absolute location of the backing file.
    pub output_path: PathBuf,
    /// Media duration in seconds.
    pub duration: f64,
    /// When the artifact was stored.
    pub created_at: SystemTime,
    /// Size of the backing file.
    pub bytes: u64,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Manifest {
    version: u32,
    entries: Vec<ManifestEntry>, // least recently used first
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ManifestEntry {
    fingerprint: Fingerprint,
    file: String,
    duration: f64,
    created_at: SystemTime,
    bytes: u64,
}

/// Fingerprint-addressed store of rendered artifacts under one directory.
///
/// Recency is tracked by an unbounded [`LruCache`]; the count/byte bounds are enforced on every
/// [`put`](ArtifactCache::put). Entries survive restarts through `artifacts.json`.
pub struct ArtifactCache {
    dir: PathBuf,
    opts: ArtifactCacheOpts,
    entries: LruCache<Fingerprint, ArtifactEntry>,
    total_bytes: u64,
}

impl ArtifactCache {
    /// Open (or create) the cache rooted at `dir`.
    ///
    /// A missing or unreadable manifest yields an empty cache; entries whose backing files are
    /// gone are dropped.
    pub fn open(dir: impl Into<PathBuf>, opts: ArtifactCacheOpts) -> AnimakeResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache directory '{}'", dir.display()))?;

        let mut cache = Self {
            dir,
            opts,
            entries: LruCache::unbounded(),
            total_bytes: 0,
        };

        let mut dropped = false;
        for e in cache.load_manifest() {
            let output_path = cache.dir.join(&e.file);
            if !output_path.is_file() {
                tracing::warn!(fingerprint = %e.fingerprint, "cached artifact missing on disk, dropping entry");
                dropped = true;
                continue;
            }
            cache.total_bytes += e.bytes;
            cache.entries.put(
                e.fingerprint,
                ArtifactEntry {
                    output_path,
                    duration: e.duration,
                    created_at: e.created_at,
                    bytes: e.bytes,
                },
            );
        }

        let evicted = cache.evict_over_bounds(None);
        if dropped || !evicted.is_empty() {
            cache.save_manifest()?;
        }
        tracing::info!(
            dir = %cache.dir.display(),
            entries = cache.entries.len(),
            bytes = cache.total_bytes,
            "artifact cache opened"
        );
        Ok(cache)
    }

    /// Cache directory; artifacts are stored directly inside it.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical location for the artifact of `fp` with extension `ext`.
    pub fn artifact_path(&self, fp: Fingerprint, ext: &str) -> PathBuf {
        self.dir.join(format!("{fp}.{ext}"))
    }

    /// Look up `fp`, marking it most recently used.
    ///
    /// An entry whose backing file was deleted externally is dropped and reported as a miss.
    pub fn get(&mut self, fp: Fingerprint) -> Option<ArtifactEntry> {
        let entry = self.entries.get(&fp)?.clone();
        if entry.output_path.is_file() {
            return Some(entry);
        }

        tracing::warn!(
            fingerprint = %fp,
            path = %entry.output_path.display(),
            "cached artifact disappeared, treating as miss"
        );
        self.remove_entry(fp);
        if let Err(e) = self.save_manifest() {
            tracing::warn!(error = %e, "failed to persist artifact manifest");
        }
        None
    }

    /// `true` when `fp` has an entry, without touching recency or the filesystem.
    pub fn contains(&self, fp: Fingerprint) -> bool {
        self.entries.contains(&fp)
    }

    /// Insert `entry` and evict least recently used entries until within bounds.
    ///
    /// Entries are never rewritten: re-inserting a live fingerprint only refreshes its recency.
    /// Returns the fingerprints that were evicted (their files are deleted).
    pub fn put(&mut self, fp: Fingerprint, entry: ArtifactEntry) -> AnimakeResult<Vec<Fingerprint>> {
        if self.get(fp).is_some() {
            return Ok(Vec::new());
        }

        self.total_bytes += entry.bytes;
        self.entries.put(fp, entry);
        let evicted = self.evict_over_bounds(Some(fp));
        self.save_manifest()?;
        Ok(evicted)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of all backing files.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn over_bounds(&self) -> bool {
        self.opts
            .max_entries
            .is_some_and(|max| self.entries.len() > max)
            || self.opts.max_bytes.is_some_and(|max| self.total_bytes > max)
    }

    fn evict_over_bounds(&mut self, keep: Option<Fingerprint>) -> Vec<Fingerprint> {
        let mut evicted = Vec::new();
        while self.over_bounds() {
            let Some((&fp, _)) = self.entries.peek_lru() else {
                break;
            };
            // The entry being inserted is kept even if it alone exceeds the byte bound.
            if Some(fp) == keep {
                break;
            }
            if let Some(entry) = self.remove_entry(fp) {
                match std::fs::remove_file(&entry.output_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(
                        path = %entry.output_path.display(),
                        error = %e,
                        "failed to delete evicted artifact"
                    ),
                }
                tracing::debug!(fingerprint = %fp, bytes = entry.bytes, "artifact evicted");
            }
            evicted.push(fp);
        }
        evicted
    }

    fn remove_entry(&mut self, fp: Fingerprint) -> Option<ArtifactEntry> {
        let entry = self.entries.pop(&fp)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.bytes);
        Some(entry)
    }

    fn load_manifest(&self) -> Vec<ManifestEntry> {
        let path = self.dir.join(MANIFEST_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "artifact manifest unreadable, starting empty");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Manifest>(&content) {
            Ok(m) if m.version == MANIFEST_VERSION => m.entries,
            Ok(m) => {
                tracing::warn!(version = m.version, "artifact manifest version mismatch, starting empty");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "artifact manifest corrupt, starting empty");
                Vec::new()
            }
        }
    }

    fn save_manifest(&self) -> AnimakeResult<()> {
        // LruCache iterates most recent first; the manifest stores oldest first so that a
        // replay of `put` in file order restores the same recency.
        let mut entries = self
            .entries
            .iter()
            .map(|(fp, e)| ManifestEntry {
                fingerprint: *fp,
                file: e
                    .output_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                duration: e.duration,
                created_at: e.created_at,
                bytes: e.bytes,
            })
            .collect::<Vec<_>>();
        entries.reverse();

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            entries,
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| AnimakeError::serde(e.to_string()))?;

        let path = self.dir.join(MANIFEST_FILE);
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, &path))
            .map_err(|e| {
                AnimakeError::cache_io(format!(
                    "failed to write manifest '{}': {e}",
                    path.display()
                ))
            })
    }
}

#[cfg(test)]
#[path = "../../tests/unit/cache/artifact.rs"]
mod tests;
