//! Trace entity types.
//!
//! Segments and subsegments serialize to the X-Ray segment document shape:
//! ids and times at the top level, annotations and metadata alongside, and
//! closed subsegments nested under their parent.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, Result};
use crate::header::TraceContext;

/// Version prefix of every trace id.
const TRACE_ID_VERSION: &str = "1";

/// Reserved metadata namespace prefix.
const RESERVED_NAMESPACE_PREFIX: &str = "AWS.";

/// Trace identifier: `1-<8 hex epoch seconds>-<24 hex random>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Generate a new trace id stamped with the current time.
    pub fn generate() -> Self {
        let random: [u8; 12] = rand::random();
        Self(format!(
            "{}-{:08x}-{}",
            TRACE_ID_VERSION,
            Utc::now().timestamp(),
            hex::encode(random)
        ))
    }

    /// Parse a trace id, returning `None` if it is not well formed.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('-');
        let version = parts.next()?;
        let epoch = parts.next()?;
        let unique = parts.next()?;
        if parts.next().is_some() || version != TRACE_ID_VERSION {
            return None;
        }
        if !is_hex(epoch, 8) || !is_hex(unique, 24) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    /// Get the trace id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a 16 hex digit segment/subsegment id.
pub fn generate_entity_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Check that `s` is an entity id (16 hex digits).
pub fn is_entity_id(s: &str) -> bool {
    is_hex(s, 16)
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Current wall-clock time in float epoch seconds.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn sampled_default() -> bool {
    true
}

/// Indexed annotation value. The backend only indexes scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<bool> for AnnotationValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AnnotationValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AnnotationValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AnnotationValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// One frame of a recorded stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Source file path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Line number within `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,

    /// Function or symbol name.
    pub label: String,
}

impl StackFrame {
    /// Create a frame with only a label.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            path: None,
            line: None,
            label: label.into(),
        }
    }

    /// Attach a source location.
    pub fn with_location(mut self, path: impl Into<String>, line: u32) -> Self {
        self.path = Some(path.into());
        self.line = Some(line);
        self
    }
}

/// An exception recorded on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: String,

    /// Exception type name (e.g. `ValueError`).
    #[serde(rename = "type")]
    pub kind: String,

    pub message: String,

    /// Set when the exception originated in a downstream service.
    #[serde(default, skip_serializing_if = "is_false")]
    pub remote: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<StackFrame>,

    /// Number of frames dropped to stay within the stack depth limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<usize>,
}

impl ExceptionRecord {
    /// Build a record, keeping at most `limit` frames of `stack`.
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        mut stack: Vec<StackFrame>,
        limit: usize,
    ) -> Self {
        let truncated = stack.len().saturating_sub(limit);
        stack.truncate(limit);
        Self {
            id: generate_entity_id(),
            kind: kind.into(),
            message: message.into(),
            remote: false,
            stack,
            truncated: (truncated > 0).then_some(truncated),
        }
    }
}

/// Exceptions attached to a faulted entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cause {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_directory: String,

    pub exceptions: Vec<ExceptionRecord>,
}

/// Annotations, metadata and failure state shared by segments and subsegments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityAttributes {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, AnnotationValue>,

    /// Namespace -> key -> value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, BTreeMap<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub fault: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Cause>,
}

impl EntityAttributes {
    /// Set an indexed annotation.
    pub fn put_annotation(&mut self, key: &str, value: AnnotationValue) -> Result<()> {
        let valid = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(RecorderError::InvalidAnnotationKey(key.to_string()));
        }
        self.annotations.insert(key.to_string(), value);
        Ok(())
    }

    /// Set a metadata value under `namespace`.
    pub fn put_metadata(
        &mut self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        if namespace.starts_with(RESERVED_NAMESPACE_PREFIX) {
            return Err(RecorderError::ReservedNamespace(namespace.to_string()));
        }
        self.metadata
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Look up a metadata value.
    pub fn metadata_value(&self, namespace: &str, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(namespace).and_then(|ns| ns.get(key))
    }

    /// Record an exception and flag the entity as faulted.
    pub fn add_exception(&mut self, exception: ExceptionRecord) {
        self.fault = true;
        let cause = self.cause.get_or_insert_with(|| Cause {
            working_directory: std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
            exceptions: Vec::new(),
        });
        cause.exceptions.push(exception);
    }
}

/// Lightweight handle to an open entity, enough to propagate its context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub id: String,
    pub name: String,
    pub trace_id: TraceId,
    pub sampled: bool,
}

/// Behaviour shared by segments and subsegments.
///
/// Mutations on an unsampled entity are accepted and discarded, so callers
/// never need to branch on the sampling decision.
pub trait TraceEntity {
    fn attributes(&self) -> &EntityAttributes;

    fn attributes_mut(&mut self) -> &mut EntityAttributes;

    fn entity_ref(&self) -> EntityRef;

    fn is_sampled(&self) -> bool;

    /// Set an indexed annotation.
    fn put_annotation(&mut self, key: &str, value: AnnotationValue) -> Result<()> {
        if !self.is_sampled() {
            return Ok(());
        }
        self.attributes_mut().put_annotation(key, value)
    }

    /// Set a namespaced metadata value.
    fn put_metadata(&mut self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()> {
        if !self.is_sampled() {
            return Ok(());
        }
        self.attributes_mut().put_metadata(namespace, key, value)
    }

    /// Record an exception.
    fn add_exception(&mut self, exception: ExceptionRecord) {
        if self.is_sampled() {
            self.attributes_mut().add_exception(exception);
        }
    }
}

/// A traced unit of work, typically one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,

    pub name: String,

    pub trace_id: TraceId,

    /// Id of the upstream entity this segment continues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    pub start_time: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub in_progress: bool,

    /// Trace context the segment was started from.
    #[serde(skip)]
    pub origin: Option<TraceContext>,

    #[serde(skip, default = "sampled_default")]
    pub sampled: bool,

    #[serde(flatten)]
    pub attributes: EntityAttributes,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsegments: Vec<Subsegment>,
}

impl Segment {
    /// Open a new segment.
    pub fn new(name: impl Into<String>, trace_id: TraceId, parent_id: Option<String>) -> Self {
        Self {
            id: generate_entity_id(),
            name: name.into(),
            trace_id,
            parent_id,
            start_time: epoch_seconds(),
            end_time: None,
            in_progress: true,
            origin: None,
            sampled: true,
            attributes: EntityAttributes::default(),
            subsegments: Vec::new(),
        }
    }

    /// Set the sampling decision.
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    /// Remember the trace context this segment continues.
    pub fn save_origin(&mut self, origin: TraceContext) {
        self.origin = Some(origin);
    }

    /// Mark the segment closed.
    pub fn close(&mut self) {
        self.end_time = Some(epoch_seconds());
        self.in_progress = false;
    }

    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Duration in milliseconds, if closed.
    pub fn duration_ms(&self) -> Option<f64> {
        self.end_time.map(|end| ((end - self.start_time) * 1000.0).max(0.0))
    }

    /// Attach a closed child subsegment.
    pub fn add_subsegment(&mut self, subsegment: Subsegment) {
        self.subsegments.push(subsegment);
    }

    /// Count of nested subsegments at every depth.
    pub fn subsegment_count(&self) -> usize {
        self.subsegments.iter().map(Subsegment::count).sum()
    }
}

impl TraceEntity for Segment {
    fn attributes(&self) -> &EntityAttributes {
        &self.attributes
    }

    fn attributes_mut(&mut self) -> &mut EntityAttributes {
        &mut self.attributes
    }

    fn entity_ref(&self) -> EntityRef {
        EntityRef {
            id: self.id.clone(),
            name: self.name.clone(),
            trace_id: self.trace_id.clone(),
            sampled: self.sampled,
        }
    }

    fn is_sampled(&self) -> bool {
        self.sampled
    }
}

/// A nested unit of work inside a segment, such as a task publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subsegment {
    pub id: String,

    pub name: String,

    pub trace_id: TraceId,

    /// Id of the enclosing segment or subsegment.
    pub parent_id: String,

    /// `remote` for calls into other services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub start_time: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub in_progress: bool,

    #[serde(skip, default = "sampled_default")]
    pub sampled: bool,

    #[serde(flatten)]
    pub attributes: EntityAttributes,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsegments: Vec<Subsegment>,
}

impl Subsegment {
    /// Open a subsegment under `parent`.
    pub fn new(name: impl Into<String>, namespace: Option<&str>, parent: &EntityRef) -> Self {
        Self {
            id: generate_entity_id(),
            name: name.into(),
            trace_id: parent.trace_id.clone(),
            parent_id: parent.id.clone(),
            namespace: namespace.map(str::to_string),
            start_time: epoch_seconds(),
            end_time: None,
            in_progress: true,
            sampled: parent.sampled,
            attributes: EntityAttributes::default(),
            subsegments: Vec::new(),
        }
    }

    /// Mark the subsegment closed.
    pub fn close(&mut self) {
        self.end_time = Some(epoch_seconds());
        self.in_progress = false;
    }

    pub fn add_subsegment(&mut self, subsegment: Subsegment) {
        self.subsegments.push(subsegment);
    }

    fn count(&self) -> usize {
        1 + self.subsegments.iter().map(Subsegment::count).sum::<usize>()
    }
}

impl TraceEntity for Subsegment {
    fn attributes(&self) -> &EntityAttributes {
        &self.attributes
    }

    fn attributes_mut(&mut self) -> &mut EntityAttributes {
        &mut self.attributes
    }

    fn entity_ref(&self) -> EntityRef {
        EntityRef {
            id: self.id.clone(),
            name: self.name.clone(),
            trace_id: self.trace_id.clone(),
            sampled: self.sampled,
        }
    }

    fn is_sampled(&self) -> bool {
        self.sampled
    }
}
