//! FP16 health-check blacklist persistence (`spec.md` §4.6.1).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// `$XDG_CACHE_HOME/gretacore/vk_fp16_blacklist.txt`, falling back to
/// `$HOME/.cache/...`, then the current directory.
pub fn resolve_blacklist_path() -> PathBuf {
    let base = if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".cache")
    } else {
        return PathBuf::from("vk_fp16_blacklist.txt");
    };
    let dir = base.join("gretacore");
    let _ = fs::create_dir_all(&dir);
    dir.join("vk_fp16_blacklist.txt")
}

pub struct Fp16Blacklist {
    path: PathBuf,
}

impl Fp16Blacklist {
    pub fn new() -> Self {
        Self {
            path: resolve_blacklist_path(),
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// A newline-separated set of device keys; blank lines ignored.
    pub fn contains(&self, device_key: &str) -> bool {
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return false;
        };
        contents
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && line == device_key)
    }

    /// Append `device_key`, unless it's already present. Returns `Ok(())` on
    /// a best-effort basis; callers should treat failure to write as
    /// non-fatal (`spec.md` §4.6.1, "unless a no-write override is set").
    pub fn append(&self, device_key: &str) -> std::io::Result<()> {
        if self.contains(device_key) {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{device_key}")
    }

    pub fn reason(&self, device_key: &str) -> String {
        format!(
            "fp16_blacklisted device_key={device_key} blacklist_path={} (set VK_FP16_ALLOW_UNSAFE=1 to override)",
            self.path.display()
        )
    }
}

impl Default for Fp16Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_contains_roundtrips() {
        let path = std::env::temp_dir().join(format!("exsa_core_fp16_bl_{}.txt", std::process::id()));
        let _ = fs::remove_file(&path);
        let blacklist = Fp16Blacklist::with_path(path.clone());
        assert!(!blacklist.contains("vid=0x1002;did=0x1234;name=x;driver=radv;sg=(32,32,64)"));
        blacklist
            .append("vid=0x1002;did=0x1234;name=x;driver=radv;sg=(32,32,64)")
            .unwrap();
        assert!(blacklist.contains("vid=0x1002;did=0x1234;name=x;driver=radv;sg=(32,32,64)"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_is_idempotent() {
        let path = std::env::temp_dir().join(format!("exsa_core_fp16_bl_idem_{}.txt", std::process::id()));
        let _ = fs::remove_file(&path);
        let blacklist = Fp16Blacklist::with_path(path.clone());
        blacklist.append("dev-a").unwrap();
        blacklist.append("dev-a").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().filter(|l| *l == "dev-a").count(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_not_contained() {
        let blacklist = Fp16Blacklist::with_path(PathBuf::from("/nonexistent/path/to/blacklist.txt"));
        assert!(!blacklist.contains("anything"));
    }
}
