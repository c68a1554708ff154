//! Recording triple per session: raw output log, script(1)-style timing
//! sidecar, and a metadata JSON rewritten atomically (tmp + rename).
//! Recording is best-effort: I/O failures are logged by callers and never
//! affect the live session.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One viewer join, persisted for the playback page.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Visitor {
    pub joined_at: String,
    pub ip: String,
}

/// Metadata JSON for one recording. Timestamps are RFC3339 strings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecordingMeta {
    pub uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub agent: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    /// Set when a user pins the recording; never cleared, exempts it from
    /// reaping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kept_at: Option<String>,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visitors: Vec<Visitor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

impl RecordingMeta {
    pub fn new(uuid: Uuid, agent: &str, command: Vec<String>, work_dir: &Path) -> Self {
        Self {
            uuid,
            name: None,
            agent: agent.to_string(),
            started_at: Utc::now().to_rfc3339(),
            ended_at: None,
            kept_at: None,
            command,
            visitors: Vec::new(),
            max_cols: None,
            max_rows: None,
            work_dir: Some(work_dir.to_string_lossy().into_owned()),
        }
    }

    /// Raise the observed size peaks; they never decrease. Returns true when
    /// either peak changed (caller persists).
    pub fn note_size(&mut self, rows: u16, cols: u16) -> bool {
        let mut changed = false;
        if self.max_rows.map_or(true, |r| rows > r) {
            self.max_rows = Some(rows);
            changed = true;
        }
        if self.max_cols.map_or(true, |c| cols > c) {
            self.max_cols = Some(cols);
            changed = true;
        }
        changed
    }

    pub fn note_visitor(&mut self, ip: &str) {
        self.visitors.push(Visitor {
            joined_at: Utc::now().to_rfc3339(),
            ip: ip.to_string(),
        });
    }

    /// End time for retention decisions: ended-at when set, else started-at.
    pub fn effective_end(&self) -> Option<DateTime<Utc>> {
        let raw = self.ended_at.as_deref().unwrap_or(&self.started_at);
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub fn log_path(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("session-{}.log", id))
}

pub fn timing_path(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("session-{}.timing", id))
}

pub fn metadata_path(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("session-{}.metadata.json", id))
}

/// Incremental writer for one recording triple. Log and timing files are
/// append-only; metadata goes through [`RecordingWriter::write_meta`].
pub struct RecordingWriter {
    dir: PathBuf,
    id: Uuid,
    log: File,
    timing: File,
}

impl RecordingWriter {
    pub fn create(dir: &Path, id: Uuid) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(dir, id))?;
        let timing = OpenOptions::new()
            .create(true)
            .append(true)
            .open(timing_path(dir, id))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            id,
            log,
            timing,
        })
    }

    /// Append one PTY read: raw bytes to the log, `delay byte-count` to the
    /// timing sidecar (script(1) format, replayable with scriptreplay).
    pub fn append(&mut self, delay: Duration, bytes: &[u8]) -> std::io::Result<()> {
        self.timing
            .write_all(format!("{:.6} {}\n", delay.as_secs_f64(), bytes.len()).as_bytes())?;
        self.log.write_all(bytes)
    }

    /// Rewrite the metadata JSON atomically: write a tmp file, then rename.
    pub fn write_meta(&self, meta: &RecordingMeta) -> std::io::Result<()> {
        let path = metadata_path(&self.dir, self.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(meta).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(tmp, path)
    }
}

/// Load one recording's metadata. Returns None if missing or unparseable.
pub fn load_meta(path: &Path) -> Option<RecordingMeta> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// All recording metadata found in `dir`, for listing and reaping.
pub fn list_metas(dir: &Path) -> Vec<RecordingMeta> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(".metadata.json"))
        })
        .filter_map(|e| load_meta(&e.path()))
        .collect()
}

/// Remove the whole triple. Missing files are fine (idempotent).
pub fn delete_triple(dir: &Path, id: Uuid) {
    for path in [log_path(dir, id), timing_path(dir, id), metadata_path(dir, id)] {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_roundtrip_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let writer = RecordingWriter::create(tmp.path(), id).unwrap();

        let mut meta = RecordingMeta::new(
            id,
            "claude",
            vec!["claude".into()],
            Path::new("/work/project"),
        );
        meta.note_visitor("10.0.0.7");
        meta.note_size(24, 80);
        writer.write_meta(&meta).unwrap();

        let loaded = load_meta(&metadata_path(tmp.path(), id)).unwrap();
        assert_eq!(loaded.uuid, id);
        assert_eq!(loaded.agent, "claude");
        assert_eq!(loaded.visitors.len(), 1);
        assert_eq!(loaded.visitors[0].ip, "10.0.0.7");
        assert_eq!(loaded.max_cols, Some(80));
        assert_eq!(loaded.work_dir.as_deref(), Some("/work/project"));
        assert!(loaded.ended_at.is_none());
        // no stale tmp file after the rename
        assert!(!metadata_path(tmp.path(), id).with_extension("json.tmp").exists());
    }

    #[test]
    fn size_peaks_never_decrease() {
        let id = Uuid::new_v4();
        let mut meta = RecordingMeta::new(id, "shell", vec!["bash".into()], Path::new("/w"));
        assert!(meta.note_size(24, 80));
        assert!(meta.note_size(30, 80));
        assert_eq!(meta.max_rows, Some(30));
        assert!(!meta.note_size(10, 40));
        assert_eq!(meta.max_rows, Some(30));
        assert_eq!(meta.max_cols, Some(80));
    }

    #[test]
    fn timing_sidecar_records_delay_and_count() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let mut writer = RecordingWriter::create(tmp.path(), id).unwrap();
        writer
            .append(Duration::from_millis(250), b"hello")
            .unwrap();
        writer.append(Duration::from_micros(1500), b"!!").unwrap();

        let timing = std::fs::read_to_string(timing_path(tmp.path(), id)).unwrap();
        assert_eq!(timing, "0.250000 5\n0.001500 2\n");
        let log = std::fs::read(log_path(tmp.path(), id)).unwrap();
        assert_eq!(log, b"hello!!");
    }

    #[test]
    fn list_and_delete_triple() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let writer = RecordingWriter::create(tmp.path(), id).unwrap();
        let meta = RecordingMeta::new(id, "codex", vec!["codex".into()], Path::new("/w"));
        writer.write_meta(&meta).unwrap();

        assert_eq!(list_metas(tmp.path()).len(), 1);
        delete_triple(tmp.path(), id);
        assert_eq!(list_metas(tmp.path()).len(), 0);
        assert!(!log_path(tmp.path(), id).exists());
        // deleting again is harmless
        delete_triple(tmp.path(), id);
    }

    #[test]
    fn effective_end_prefers_ended_at() {
        let id = Uuid::new_v4();
        let mut meta = RecordingMeta::new(id, "shell", vec![], Path::new("/w"));
        let started = meta.effective_end().unwrap();
        meta.ended_at = Some((started + chrono::Duration::seconds(90)).to_rfc3339());
        let ended = meta.effective_end().unwrap();
        assert!(ended > started);
    }
}
