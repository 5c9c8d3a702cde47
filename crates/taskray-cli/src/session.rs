//! Session management for simulation runs.
//!
//! Each `simulate` run gets a unique session ID and directory holding its
//! segments and a metadata file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Segment file name inside a session directory.
pub const SEGMENTS_FILE: &str = "segments.jsonl";

/// Unique identifier for a simulation session.
///
/// Format: `YYYY-MM-DDTHH-MM-SS_XXXX` where XXXX is a short UUID suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session ID with current timestamp and random suffix.
    pub fn generate() -> Self {
        let now = Utc::now();
        let short_uuid = &uuid::Uuid::new_v4().simple().to_string()[..4];
        Self(format!("{}_{}", now.format("%Y-%m-%dT%H-%M-%S"), short_uuid))
    }

    #[cfg(test)]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Get the session directory path for a given session ID.
pub fn session_dir(taskray_dir: &Path, session_id: &SessionId) -> PathBuf {
    taskray_dir.join("sessions").join(&session_id.0)
}

/// What a simulation run was asked to do and what it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub tasks: usize,

    pub workers: usize,

    /// Segments written to the session's segment file.
    #[serde(default)]
    pub segments_emitted: usize,
}

impl SessionMetadata {
    pub fn new(session_id: &SessionId, tasks: usize, workers: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            tasks,
            workers,
            segments_emitted: 0,
        }
    }

    /// Mark the run finished with `segments_emitted` segments written.
    pub fn finish(mut self, segments_emitted: usize) -> Self {
        self.finished_at = Some(Utc::now());
        self.segments_emitted = segments_emitted;
        self
    }
}

/// Write session metadata to the session directory.
pub fn write_metadata(session_dir: &Path, metadata: &SessionMetadata) -> anyhow::Result<()> {
    let path = session_dir.join("session.json");
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(&path, json)?;
    Ok(())
}

/// Read session metadata from a session directory.
pub fn read_metadata(session_dir: &Path) -> anyhow::Result<SessionMetadata> {
    let path = session_dir.join("session.json");
    let json = fs::read_to_string(&path)?;
    let metadata: SessionMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate();
        let s = id.to_string();

        // Format: YYYY-MM-DDTHH-MM-SS_XXXX
        assert_eq!(s.len(), 24, "Unexpected session ID: {}", s);
        assert!(s.contains('T'), "Missing T separator: {}", s);
        assert!(s.contains('_'), "Missing UUID separator: {}", s);
    }

    #[test]
    fn test_session_dir_path() {
        let taskray_dir = Path::new("/tmp/.taskray");
        let session_id = SessionId::from_string("2026-01-11T17-34-52_a3f2");

        let dir = session_dir(taskray_dir, &session_id);
        assert_eq!(
            dir,
            PathBuf::from("/tmp/.taskray/sessions/2026-01-11T17-34-52_a3f2")
        );
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let session_id = SessionId::generate();
        let metadata = SessionMetadata::new(&session_id, 20, 3).finish(17);

        write_metadata(dir.path(), &metadata).unwrap();
        let loaded = read_metadata(dir.path()).unwrap();

        assert_eq!(loaded.session_id, metadata.session_id);
        assert_eq!(loaded.tasks, 20);
        assert_eq!(loaded.workers, 3);
        assert_eq!(loaded.segments_emitted, 17);
        assert!(loaded.finished_at.is_some());
    }
}
