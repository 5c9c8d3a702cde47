//! JSONL persistence for closed segments.
//!
//! Where a segment lands is decided by [`WriterConfig::file_at`]:
//! - [`Rotation::Session`]: `trace_path` is the file itself (e.g. `run_dir/segments.jsonl`)
//! - [`Rotation::Daily`]: `trace_path` is a directory of dated files (e.g. `traces/2026-01-11.jsonl`)
//!
//! The writer keeps one file open and reopens whenever the target path for
//! the current time differs from it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::emitter::Emitter;
use crate::error::EmitError;
use crate::types::Segment;

/// Extension of segment files.
pub const TRACE_FILE_EXTENSION: &str = "jsonl";

/// How segment files are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// One file per UTC day inside `trace_path`.
    #[default]
    Daily,
    /// Everything appended to `trace_path`.
    Session,
}

/// Configuration for the segment writer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Output file (session) or directory (daily).
    pub trace_path: PathBuf,

    pub enabled: bool,

    pub rotation: Rotation,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::daily_rotation(".taskray/traces")
    }
}

impl WriterConfig {
    /// Append every segment to one file.
    pub fn session(trace_file: impl Into<PathBuf>) -> Self {
        Self {
            trace_path: trace_file.into(),
            enabled: true,
            rotation: Rotation::Session,
        }
    }

    /// Write one file per day into a directory.
    pub fn daily_rotation(trace_dir: impl Into<PathBuf>) -> Self {
        Self {
            trace_path: trace_dir.into(),
            enabled: true,
            rotation: Rotation::Daily,
        }
    }

    pub fn disabled() -> Self {
        Self {
            trace_path: PathBuf::new(),
            enabled: false,
            rotation: Rotation::Daily,
        }
    }

    /// File a segment closed at `at` belongs in.
    pub fn file_at(&self, at: DateTime<Utc>) -> PathBuf {
        match self.rotation {
            Rotation::Session => self.trace_path.clone(),
            Rotation::Daily => self.trace_path.join(format!(
                "{}.{TRACE_FILE_EXTENSION}",
                at.format("%Y-%m-%d")
            )),
        }
    }

    /// Directory that must exist before the first write.
    fn output_dir(&self) -> Option<&Path> {
        match self.rotation {
            Rotation::Session => self.trace_path.parent(),
            Rotation::Daily => Some(&self.trace_path),
        }
    }
}

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Appends closed segments to JSONL files, one document per line.
pub struct TraceWriter {
    config: WriterConfig,
    open: Mutex<Option<OpenFile>>,
}

impl TraceWriter {
    pub fn new(config: WriterConfig) -> Result<Self, EmitError> {
        if config.enabled {
            if let Some(dir) = config.output_dir().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(Self {
            config,
            open: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Append `segment` to the file for the current time.
    pub fn write(&self, segment: &Segment) -> Result<(), EmitError> {
        if !self.config.enabled {
            return Ok(());
        }
        let line = serde_json::to_string(segment)?;
        let target = self.config.file_at(Utc::now());

        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match &mut *open {
            Some(file) if file.path == target => file,
            slot => {
                let handle = OpenOptions::new().create(true).append(true).open(&target)?;
                slot.insert(OpenFile {
                    path: target,
                    writer: BufWriter::new(handle),
                })
            }
        };
        writeln!(file.writer, "{line}")?;
        file.writer.flush()?;
        Ok(())
    }

    /// File the next write goes to.
    pub fn current_file_path(&self) -> PathBuf {
        self.config.file_at(Utc::now())
    }

    /// Existing segment files for this configuration, oldest first.
    pub fn list_trace_files(&self) -> Result<Vec<PathBuf>, EmitError> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        match self.config.rotation {
            Rotation::Session => Ok(Some(self.config.trace_path.clone())
                .filter(|path| path.exists())
                .into_iter()
                .collect()),
            Rotation::Daily => {
                let mut files: Vec<PathBuf> = fs::read_dir(&self.config.trace_path)?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.extension().is_some_and(|ext| ext == TRACE_FILE_EXTENSION))
                    .collect();
                files.sort();
                Ok(files)
            }
        }
    }

    /// Parse every segment in a JSONL file, skipping blank lines.
    pub fn read_segments(path: &Path) -> Result<Vec<Segment>, EmitError> {
        let content = fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(EmitError::from))
            .collect()
    }
}

impl Emitter for TraceWriter {
    fn send(&self, segment: &Segment) -> Result<(), EmitError> {
        self.write(segment)
    }
}
