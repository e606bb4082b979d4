//! Point-in-time capture of configuration files with integrity hashes.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::audit::AuditLogger;
use crate::integrity::file_sha256;
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::state::now_ts;

const CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "toml"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFileEntry {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    /// Hex digest, or an `ERROR: ...` marker if the file was unreadable.
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub snapshot_id: String,
    pub timestamp: u64,
    pub reason: String,
    pub files: Vec<ConfigFileEntry>,
    pub diffs: BTreeMap<String, String>,
    pub summary: SnapshotSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub total_files: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Capability producing a source-control diff for a file. Absence of the
/// tool, of a repository, or of changes are all the same `None` outcome.
pub trait DiffSource {
    fn diff(&self, path: &Path) -> Option<String>;
}

/// Best-effort git diff with a hard timeout per invocation.
pub struct GitDiff {
    pub timeout: Duration,
}

impl GitDiff {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Option<String> {
        let mut child = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;
        // Drain stdout off-thread; output past the pipe buffer would
        // otherwise block the child until the timeout kills it.
        let mut stdout = child.stdout.take()?;
        let reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf).ok()
        });
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    let out = reader.join().ok().flatten()?;
                    return String::from_utf8(out).ok();
                }
                Ok(Some(_)) => return None,
                Ok(None) => {
                    if started.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(_) => return None,
            }
        }
    }
}

impl DiffSource for GitDiff {
    fn diff(&self, path: &Path) -> Option<String> {
        let dir = path.parent()?;
        let name = path.file_name()?.to_str()?;
        let status = self.run(dir, &["status", "--porcelain", "--", name])?;
        if status.trim().is_empty() {
            return None;
        }
        let diff = self.run(dir, &["diff", "--", name])?;
        if diff.trim().is_empty() {
            None
        } else {
            Some(diff)
        }
    }
}

pub struct ConfigSnapshotter {
    config_dirs: Vec<PathBuf>,
    snapshot_dir: PathBuf,
    diff_source: Option<Box<dyn DiffSource>>,
}

impl ConfigSnapshotter {
    pub fn new(
        config_dirs: Vec<PathBuf>,
        snapshot_dir: impl Into<PathBuf>,
        diff_source: Option<Box<dyn DiffSource>>,
    ) -> Result<Self> {
        let snapshot_dir = snapshot_dir.into();
        std::fs::create_dir_all(&snapshot_dir)
            .with_context(|| format!("create snapshot dir: {}", snapshot_dir.display()))?;
        Ok(Self {
            config_dirs,
            snapshot_dir,
            diff_source,
        })
    }

    fn tracked_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for dir in &self.config_dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(dir)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if CONFIG_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                    files.push(path.to_path_buf());
                }
            }
        }
        files.sort();
        files.dedup();
        files
    }

    /// Capture every tracked config file, persist the snapshot, and emit a
    /// config-change audit event when a logger is supplied.
    pub fn create_snapshot(
        &self,
        reason: &str,
        audit: Option<&AuditLogger>,
    ) -> Result<ConfigSnapshot> {
        let now = Utc::now();
        let snapshot_id = now.format("%Y%m%d_%H%M%S").to_string();

        let mut files = Vec::new();
        let mut diffs = BTreeMap::new();
        let mut total_bytes = 0u64;

        for path in self.tracked_files() {
            let meta = std::fs::metadata(&path).ok();
            let size = meta.as_ref().map(|m| m.len()).unwrap_or(0);
            let mtime = meta
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let sha256 = match file_sha256(&path) {
                Ok(digest) => digest,
                Err(err) => format!("ERROR: {}", err),
            };
            total_bytes += size;
            let path_str = path.to_string_lossy().into_owned();

            if let Some(source) = &self.diff_source {
                if let Some(diff) = source.diff(&path) {
                    diffs.insert(path_str.clone(), diff);
                }
            }
            files.push(ConfigFileEntry {
                path: path_str,
                size,
                mtime,
                sha256,
            });
        }

        let snapshot = ConfigSnapshot {
            snapshot_id: snapshot_id.clone(),
            timestamp: now_ts(),
            reason: reason.to_string(),
            summary: SnapshotSummary {
                total_files: files.len(),
                total_bytes,
            },
            files,
            diffs,
        };

        let path = self.snapshot_path(&snapshot_id);
        std::fs::write(&path, serde_json::to_string_pretty(&snapshot)?)
            .with_context(|| format!("write snapshot: {}", path.display()))?;

        logging::info(
            Domain::Config,
            "snapshot_created",
            obj(&[
                ("snapshot_id", v_str(&snapshot_id)),
                ("files", v_num(snapshot.summary.total_files as f64)),
                ("bytes", v_num(total_bytes as f64)),
            ]),
        );
        if let Some(logger) = audit {
            logger.write_config_event(obj(&[
                ("snapshot_id", v_str(&snapshot_id)),
                ("reason", v_str(reason)),
                ("files", v_num(snapshot.summary.total_files as f64)),
                ("bytes", v_num(total_bytes as f64)),
            ]))?;
        }

        Ok(snapshot)
    }

    pub fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.snapshot_dir
            .join(format!("config_snapshot_{}.json", snapshot_id))
    }

    pub fn load_snapshot(&self, snapshot_id: &str) -> Result<ConfigSnapshot> {
        let path = self.snapshot_path(snapshot_id);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("read snapshot: {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Latest snapshot id. Ids are timestamp-prefixed, so lexicographic
    /// order is chronological order.
    pub fn get_latest_snapshot(&self) -> Option<String> {
        let mut ids: Vec<String> = std::fs::read_dir(&self.snapshot_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| {
                name.strip_prefix("config_snapshot_")?
                    .strip_suffix(".json")
                    .map(|id| id.to_string())
            })
            .collect();
        ids.sort();
        ids.pop()
    }

    /// Partition the union of tracked paths by hash equality.
    pub fn compare_snapshots(&self, id_a: &str, id_b: &str) -> Result<SnapshotDiff> {
        let a = self.load_snapshot(id_a)?;
        let b = self.load_snapshot(id_b)?;
        let map_a: BTreeMap<&str, &str> = a
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.sha256.as_str()))
            .collect();
        let map_b: BTreeMap<&str, &str> = b
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.sha256.as_str()))
            .collect();

        let mut diff = SnapshotDiff::default();
        for (path, hash_b) in &map_b {
            match map_a.get(path) {
                None => diff.added.push(path.to_string()),
                Some(hash_a) if hash_a == hash_b => diff.unchanged.push(path.to_string()),
                Some(_) => diff.modified.push(path.to_string()),
            }
        }
        for path in map_a.keys() {
            if !map_b.contains_key(path) {
                diff.removed.push(path.to_string());
            }
        }
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshotter(root: &Path) -> ConfigSnapshotter {
        let configs = root.join("configs");
        std::fs::create_dir_all(&configs).unwrap();
        ConfigSnapshotter::new(vec![configs], root.join("snapshots"), None).unwrap()
    }

    #[test]
    fn test_snapshot_captures_config_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshotter(dir.path());
        let configs = dir.path().join("configs");
        std::fs::write(configs.join("broker.toml"), "key = 1\n").unwrap();
        std::fs::write(configs.join("risk.yaml"), "limit: 2\n").unwrap();
        std::fs::write(configs.join("notes.txt"), "ignored\n").unwrap();

        let snapshot = snap.create_snapshot("test", None).unwrap();
        assert_eq!(snapshot.summary.total_files, 2);
        assert!(snapshot.files.iter().all(|f| f.sha256.len() == 64));
        assert_eq!(
            snapshot.summary.total_bytes,
            snapshot.files.iter().map(|f| f.size).sum::<u64>()
        );
        assert!(snap.snapshot_path(&snapshot.snapshot_id).exists());
    }

    #[test]
    fn test_latest_snapshot_is_lexicographic_max() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshotter(dir.path());
        for id in ["20250101_000000", "20260101_000000", "20251231_235959"] {
            std::fs::write(snap.snapshot_path(id), "{}").unwrap();
        }
        assert_eq!(snap.get_latest_snapshot().unwrap(), "20260101_000000");
    }

    #[test]
    fn test_compare_partitions_union_of_paths() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshotter(dir.path());
        let configs = dir.path().join("configs");

        std::fs::write(configs.join("a.json"), "{\"v\":1}").unwrap();
        std::fs::write(configs.join("b.json"), "{\"v\":2}").unwrap();
        let first = snap.create_snapshot("first", None).unwrap();

        std::fs::write(configs.join("b.json"), "{\"v\":3}").unwrap();
        std::fs::write(configs.join("c.json"), "{\"v\":4}").unwrap();
        std::fs::remove_file(configs.join("a.json")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let second = snap.create_snapshot("second", None).unwrap();

        let diff = snap
            .compare_snapshots(&first.snapshot_id, &second.snapshot_id)
            .unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.modified.len(), 1);
        assert!(diff.added[0].ends_with("c.json"));
        assert!(diff.removed[0].ends_with("a.json"));
        assert!(diff.modified[0].ends_with("b.json"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_gets_error_marker_not_abort() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let snap = snapshotter(dir.path());
        let configs = dir.path().join("configs");
        std::fs::write(configs.join("ok.json"), "{\"v\":1}").unwrap();
        let locked = configs.join("locked.json");
        std::fs::write(&locked, "{\"v\":2}").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::File::open(&locked).is_ok() {
            // Permission bits are not enforced for this user (root).
            return;
        }

        let snapshot = snap.create_snapshot("test", None).unwrap();
        assert_eq!(snapshot.summary.total_files, 2);
        let entry = |name: &str| {
            snapshot
                .files
                .iter()
                .find(|f| f.path.ends_with(name))
                .unwrap()
        };
        assert!(entry("locked.json").sha256.starts_with("ERROR:"));
        assert_eq!(entry("ok.json").sha256.len(), 64);
    }

    #[test]
    fn test_git_diff_handles_output_larger_than_pipe_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            Command::new("git")
                .arg("-C")
                .arg(dir.path())
                .args(args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        };
        if !git(&["init"]) {
            return;
        }
        git(&["config", "user.email", "ops@localhost"]);
        git(&["config", "user.name", "ops"]);

        let path = dir.path().join("big.yaml");
        std::fs::write(&path, "seed: 0\n").unwrap();
        if !git(&["add", "."]) || !git(&["commit", "-m", "seed"]) {
            return;
        }
        let mut body = String::new();
        for i in 0..20_000 {
            body.push_str(&format!("key_{}: {}\n", i, i));
        }
        std::fs::write(&path, body).unwrap();

        let source = GitDiff::new(5);
        let started = Instant::now();
        let diff = source.diff(&path).unwrap();
        assert!(diff.len() > 64 * 1024);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_config_dir_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snap = ConfigSnapshotter::new(
            vec![dir.path().join("does-not-exist")],
            dir.path().join("snapshots"),
            None,
        )
        .unwrap();
        let snapshot = snap.create_snapshot("test", None).unwrap();
        assert_eq!(snapshot.summary.total_files, 0);
        assert_eq!(snapshot.summary.total_bytes, 0);
    }
}
