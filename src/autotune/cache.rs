//! Persistent autotune cache (`spec.md` §4.6, §6.2).
//!
//! Grounded on `vk_autotune.cpp`'s `Cache` (hand-rolled JSON reader/writer
//! there; here a real `serde_json` document, since reaching for `serde` is
//! the ambient idiom this port follows throughout).

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub device_key: String,
    pub bucket: String,
    pub winner: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: Vec<CacheEntry>,
}

/// `$XDG_CACHE_HOME/gretacore/vk_autotune.json`, falling back to
/// `$HOME/.cache/...`, then the current directory.
pub fn resolve_cache_path() -> PathBuf {
    let base = if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".cache")
    } else {
        return PathBuf::from("vk_autotune_cache.json");
    };
    let dir = base.join("gretacore");
    let _ = fs::create_dir_all(&dir);
    dir.join("vk_autotune.json")
}

pub struct AutotuneCache {
    path: PathBuf,
    entries: Vec<CacheEntry>,
}

impl AutotuneCache {
    pub fn new() -> Self {
        Self {
            path: resolve_cache_path(),
            entries: Vec::new(),
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load from disk; missing or malformed files are treated as empty
    /// (tolerates additional fields per `spec.md` §4.6, "Loading tolerates
    /// additional fields").
    pub fn load(&mut self) {
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return;
        };
        match serde_json::from_str::<CacheDocument>(&contents) {
            Ok(doc) => self.entries = doc.entries,
            Err(e) => debug!(error = %e, path = %self.path.display(), "ignoring malformed autotune cache"),
        }
    }

    /// Best-effort save; write failures are silently ignored.
    pub fn save(&self) {
        let doc = CacheDocument {
            version: 1,
            entries: self.entries.clone(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&doc) {
            let _ = fs::write(&self.path, json);
        }
    }

    pub fn find_winner(&self, device_key: &str, bucket: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.device_key == device_key && e.bucket == bucket)
            .map(|e| e.winner.as_str())
    }

    pub fn upsert(&mut self, device_key: &str, bucket: &str, winner: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.device_key == device_key && e.bucket == bucket)
        {
            entry.winner = winner.to_string();
            return;
        }
        self.entries.push(CacheEntry {
            device_key: device_key.to_string(),
            bucket: bucket.to_string(),
            winner: winner.to_string(),
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for AutotuneCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `M{M}_N{N}_K{K}`.
pub fn make_bucket(m: u32, n: u32, k: u32) -> String {
    format!("M{m}_N{n}_K{k}")
}
