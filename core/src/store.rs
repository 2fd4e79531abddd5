use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::cfg::DEFAULT_PORT;
use crate::task::{Method, TaskSpec};

/// Format version written into every snapshot.
pub const SNAPSHOT_VERSION: i64 = 1;

/// On-disk representation of the whole registry (`config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version, currently always 1.
    #[serde(default = "default_version")]
    pub version: i64,
    /// Port the control plane listens on. Values outside 1..=65535 mean "default".
    #[serde(default)]
    pub port: i64,
    /// Task records, sorted by id when written by [`Snapshot::from_tasks`].
    #[serde(default)]
    pub tasks: Vec<PersistedTask>,
}

/// One task as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTask {
    /// Task id.
    #[serde(default)]
    pub id: String,
    /// Seconds between runs; validated on restore, not on parse.
    #[serde(default)]
    pub interval_seconds: i64,
    /// Target URL.
    #[serde(default)]
    pub url: String,
    /// Method as written; normalized on restore.
    #[serde(default)]
    pub method: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// `false` for paused tasks.
    #[serde(default)]
    pub enabled: bool,
    /// RFC 3339 creation time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    /// RFC 3339 time of the write that produced this record.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
}

/// A persisted record that passed restore validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredTask {
    /// Task id from the file.
    pub id: String,
    /// Normalized definition.
    pub spec: TaskSpec,
    /// Whether a loop should be started.
    pub enabled: bool,
    /// Original creation time, if the file had a parseable one.
    pub created_at: Option<DateTime<Utc>>,
}

fn default_version() -> i64 { SNAPSHOT_VERSION }

impl Default for Snapshot {
    fn default() -> Self {
        Self { version: SNAPSHOT_VERSION, port: i64::from(DEFAULT_PORT), tasks: Vec::new() }
    }
}

impl Snapshot {
    /// Build a snapshot from an unordered set of records, sorting them by id.
    pub fn from_tasks(port: u16, mut tasks: Vec<PersistedTask>) -> Self {
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Self { version: SNAPSHOT_VERSION, port: i64::from(port), tasks }
    }

    /// The configured port, or [`DEFAULT_PORT`] when missing or out of range.
    pub fn effective_port(&self) -> u16 {
        match u16::try_from(self.port) {
            Ok(p) if p > 0 => p,
            _ => DEFAULT_PORT,
        }
    }
}

/// Format a timestamp the way snapshots store them (UTC, nanoseconds).
pub fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a snapshot timestamp; `None` when empty or malformed.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim()).ok().map(|t| t.with_timezone(&Utc))
}

/// Reads and atomically rewrites the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Store backed by the file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// Target file path.
    pub fn path(&self) -> &Path { &self.path }

    /// Scratch file the next write goes through (`<path>.tmp`).
    pub fn tmp_path(&self) -> PathBuf {
        let mut s = OsString::from(self.path.as_os_str());
        s.push(".tmp");
        PathBuf::from(s)
    }

    /// Replace the file with `snap`.
    ///
    /// Writes the temp file, fsyncs it, then renames it over the target, so
    /// readers only ever see the previous or the new complete snapshot.
    pub fn write(&self, snap: &Snapshot) -> Result<()> {
        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = parent {
            fs::create_dir_all(dir)
                .with_context(|| format!("create config dir {}", dir.display()))?;
        }

        let tmp = self.tmp_path();
        let f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        let mut w = BufWriter::new(f);
        serde_json::to_writer_pretty(&mut w, snap).context("serialize snapshot")?;
        w.write_all(b"\n").with_context(|| format!("write {}", tmp.display()))?;
        let f = w
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("flush {}", tmp.display()))?;
        f.sync_all().with_context(|| format!("sync {}", tmp.display()))?;
        drop(f);

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        if let Some(dir) = parent {
            sync_dir(dir);
        }
        Ok(())
    }

    /// Load the snapshot, creating a default file when none exists yet.
    ///
    /// Malformed JSON fails the whole read; per-entry checks happen later in
    /// [`restore_tasks`].
    pub fn read(&self) -> Result<Snapshot> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("config not found, creating {}", self.path.display());
                let snap = Snapshot::default();
                self.write(&snap)?;
                return Ok(snap);
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        serde_json::from_slice(&bytes).with_context(|| format!("invalid {}", self.path.display()))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Persist the rename itself; failure only weakens durability, not atomicity.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Keep every record that can be scheduled again; skip the rest one by one.
pub fn restore_tasks(snap: &Snapshot) -> Vec<RestoredTask> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(snap.tasks.len());
    for pt in &snap.tasks {
        let method: Method = match pt.method.parse() {
            Ok(m) => m,
            Err(_) => {
                warn!("[restore] skip {}: invalid method={:?}", pt.id, pt.method);
                continue;
            }
        };
        if pt.interval_seconds < 1 || pt.url.trim().is_empty() {
            warn!("[restore] skip {}: invalid interval/url", pt.id);
            continue;
        }
        if pt.id.trim().is_empty() {
            warn!("[restore] skip entry for {}: missing id", pt.url);
            continue;
        }
        if !seen.insert(pt.id.as_str()) {
            warn!("[restore] skip {}: duplicate id", pt.id);
            continue;
        }
        out.push(RestoredTask {
            id: pt.id.clone(),
            spec: TaskSpec {
                interval_seconds: pt.interval_seconds as u64,
                url: pt.url.clone(),
                method,
                description: pt.description.clone(),
            },
            enabled: pt.enabled,
            created_at: parse_ts(&pt.created_at),
        });
    }
    out
}
