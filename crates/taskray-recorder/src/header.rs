//! Trace context header format.
//!
//! The context travels as a single header value:
//!
//! ```text
//! X-Amzn-Trace-Id: Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=1
//! ```
//!
//! Parsing never fails outright. Unknown keys are preserved, malformed
//! `Parent` and `Sampled` values are dropped, and a missing or malformed
//! `Root` yields `None` so the caller can start a fresh trace.

use std::fmt;

use crate::types::{EntityRef, TraceId, is_entity_id};

/// Primary header name.
pub const TRACE_HEADER: &str = "X-Amzn-Trace-Id";

/// Header name as it appears after WSGI-style environ mangling.
pub const ALT_TRACE_HEADER: &str = "HTTP_X_AMZN_TRACE_ID";

const ROOT: &str = "Root";
const PARENT: &str = "Parent";
const SAMPLED: &str = "Sampled";

/// Upstream sampling decision carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingDecision {
    /// `Sampled=1`
    Sampled,
    /// `Sampled=0`
    NotSampled,
    /// `Sampled=?`: upstream asks the receiver to decide and report back.
    Requested,
    /// No decision was propagated.
    #[default]
    Unknown,
}

impl SamplingDecision {
    fn parse(s: &str) -> Self {
        match s {
            "1" => Self::Sampled,
            "0" => Self::NotSampled,
            "?" => Self::Requested,
            _ => Self::Unknown,
        }
    }

    fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Self::Sampled => Some("1"),
            Self::NotSampled => Some("0"),
            Self::Requested => Some("?"),
            Self::Unknown => None,
        }
    }

    /// The decision an entity with the given sampled flag propagates.
    pub fn from_sampled(sampled: bool) -> Self {
        if sampled {
            Self::Sampled
        } else {
            Self::NotSampled
        }
    }
}

/// Propagated identifiers linking entities across process boundaries.
///
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    root: TraceId,
    parent: Option<String>,
    sampled: SamplingDecision,
    extra: Vec<(String, String)>,
}

impl TraceContext {
    /// Start a brand new trace with no parent and no sampling decision.
    pub fn new_root() -> Self {
        Self {
            root: TraceId::generate(),
            parent: None,
            sampled: SamplingDecision::Unknown,
            extra: Vec::new(),
        }
    }

    /// Build a context from explicit parts.
    pub fn new(root: TraceId, parent: Option<String>, sampled: SamplingDecision) -> Self {
        Self {
            root,
            parent,
            sampled,
            extra: Vec::new(),
        }
    }

    /// The context a child of `entity` should continue from.
    pub fn from_entity(entity: &EntityRef) -> Self {
        Self::new(
            entity.trace_id.clone(),
            Some(entity.id.clone()),
            SamplingDecision::from_sampled(entity.sampled),
        )
    }

    /// Parse a header value. Returns `None` without a valid `Root`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut root = None;
        let mut parent = None;
        let mut sampled = SamplingDecision::Unknown;
        let mut extra = Vec::new();

        for pair in value.split(';') {
            let Some((key, val)) = pair.split_once('=') else {
                continue;
            };
            let (key, val) = (key.trim(), val.trim());
            match key {
                ROOT => root = TraceId::parse(val),
                PARENT if is_entity_id(val) => parent = Some(val.to_string()),
                PARENT => {}
                SAMPLED => sampled = SamplingDecision::parse(val),
                _ if !key.is_empty() => extra.push((key.to_string(), val.to_string())),
                _ => {}
            }
        }

        Some(Self {
            root: root?,
            parent,
            sampled,
            extra,
        })
    }

    pub fn root(&self) -> &TraceId {
        &self.root
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn sampled(&self) -> SamplingDecision {
        self.sampled
    }

    /// Extra key/value pairs carried through unchanged.
    pub fn extra(&self) -> &[(String, String)] {
        &self.extra
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", ROOT, self.root)?;
        if let Some(parent) = &self.parent {
            write!(f, ";{}={}", PARENT, parent)?;
        }
        if let Some(sampled) = self.sampled.as_header_value() {
            write!(f, ";{}={}", SAMPLED, sampled)?;
        }
        for (key, val) in &self.extra {
            write!(f, ";{}={}", key, val)?;
        }
        Ok(())
    }
}
