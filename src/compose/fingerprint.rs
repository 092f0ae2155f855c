use std::fmt;
use std::str::FromStr;

use xxhash_rust::xxh3::Xxh3;

use crate::compose::spec::{Format, Quality, RenderSpec, ResolvedSource};
use crate::foundation::error::{AnimakeError, AnimakeResult};

const XXH3_SEED: u64 = 0x6a1d_3c5e_9b27_f04d;
// Bump when the encoding below changes so stale cache entries stop matching.
const ENCODING_VERSION: u8 = 1;

/// 128-bit content hash of a render request; cache and deduplication key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint {
    /// High 64 bits.
    pub hi: u64,
    /// Low 64 bits.
    pub lo: u64,
}

impl Fingerprint {
    /// 32 lowercase hex characters.
    pub fn to_hex(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

impl FromStr for Fingerprint {
    type Err = AnimakeError;

    fn from_str(s: &str) -> AnimakeResult<Self> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(AnimakeError::validation(format!(
                "fingerprint must be 32 hex characters, got '{s}'"
            )));
        }
        let parse = |part: &str| {
            u64::from_str_radix(part, 16)
                .map_err(|e| AnimakeError::validation(format!("bad fingerprint '{s}': {e}")))
        };
        Ok(Self {
            hi: parse(&s[..16])?,
            lo: parse(&s[16..])?,
        })
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Fingerprint `spec` rendered at `quality`/`format`.
///
/// Covers the script text, every item's composite rank, timing and bound source, plus the
/// target. Layer and item ids and raw z-index values are not hashed: renumbering layers without
/// changing their order keeps the fingerprint, while any change to timing, pinned versions or
/// composite order produces a new one.
pub fn fingerprint(spec: &RenderSpec, quality: Quality, format: Format) -> Fingerprint {
    let mut h = StableHasher::new();
    h.write_u8(ENCODING_VERSION);
    h.write_str(&spec.script);
    h.write_u64(spec.items.len() as u64);
    for item in &spec.items {
        h.write_u32(item.composite_rank);
        h.write_f64(item.start);
        h.write_f64(item.end);
        match &item.source {
            ResolvedSource::Script { script_id, version } => {
                h.write_u8(0);
                h.write_str(script_id);
                h.write_u64(*version);
            }
            ResolvedSource::Asset { path } => {
                h.write_u8(1);
                h.write_str(path);
            }
        }
    }
    h.write_u8(quality.tag());
    h.write_u8(format.tag());
    h.finish()
}

impl RenderSpec {
    /// Fingerprint of this spec at its own quality/format target.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(self, self.quality, self.format)
    }
}

struct StableHasher {
    inner: Xxh3,
}

impl StableHasher {
    fn new() -> Self {
        Self {
            inner: Xxh3::with_seed(XXH3_SEED),
        }
    }

    fn write_bytes(&mut self, b: &[u8]) {
        self.inner.update(b);
    }

    fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_f64(&mut self, v: f64) {
        // -0.0 and 0.0 place an item at the same time
        let v = if v == 0.0 { 0.0 } else { v };
        self.write_u64(v.to_bits());
    }

    fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write_bytes(s.as_bytes());
    }

    fn finish(self) -> Fingerprint {
        let v = self.inner.digest128();
        Fingerprint {
            hi: (v >> 64) as u64,
            lo: v as u64,
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/compose/fingerprint.rs"]
mod tests;
