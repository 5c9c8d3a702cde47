//! Human-readable views of recorded segments and trace headers.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use taskray_recorder::{EntityAttributes, SamplingDecision, Segment, Subsegment, TraceContext};

use crate::session::{self, SEGMENTS_FILE};

/// Where `show` reads segments from: a JSONL file, or a session directory.
pub fn segments_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(SEGMENTS_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Render every segment in `path`, preceded by the session summary when
/// `path` is a session directory.
pub fn render_path(path: &Path) -> Result<String> {
    let mut out = String::new();
    if path.is_dir() {
        let metadata = session::read_metadata(path)
            .with_context(|| format!("Not a session directory: {}", path.display()))?;
        let _ = writeln!(
            out,
            "session {} ({} tasks, {} workers, {} segments)",
            metadata.session_id, metadata.tasks, metadata.workers, metadata.segments_emitted
        );
    }

    let file = segments_file(path);
    let segments = taskray_recorder::TraceWriter::read_segments(&file)
        .with_context(|| format!("Failed to read segments from {}", file.display()))?;
    for segment in &segments {
        out.push_str(&render_segment(segment));
    }
    Ok(out)
}

/// Render one segment and its subsegments as an indented tree.
pub fn render_segment(segment: &Segment) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "{} trace={} id={}",
        segment.name, segment.trace_id, segment.id
    );
    if let Some(parent) = &segment.parent_id {
        let _ = write!(out, " parent={parent}");
    }
    push_duration(&mut out, segment.duration_ms());
    push_attributes(&mut out, &segment.attributes, 1);
    for child in &segment.subsegments {
        push_subsegment(&mut out, child, 1);
    }
    out
}

fn push_subsegment(out: &mut String, subsegment: &Subsegment, depth: usize) {
    let indent = "  ".repeat(depth);
    let _ = write!(out, "{indent}└─ ");
    if let Some(namespace) = &subsegment.namespace {
        let _ = write!(out, "{namespace}:");
    }
    let _ = write!(out, "{} id={}", subsegment.name, subsegment.id);
    let duration = subsegment
        .end_time
        .map(|end| ((end - subsegment.start_time) * 1000.0).max(0.0));
    push_duration(out, duration);
    push_attributes(out, &subsegment.attributes, depth + 1);
    for child in &subsegment.subsegments {
        push_subsegment(out, child, depth + 1);
    }
}

fn push_duration(out: &mut String, duration_ms: Option<f64>) {
    match duration_ms {
        Some(ms) => {
            let _ = writeln!(out, " {ms:.2}ms");
        }
        None => out.push_str(" (in progress)\n"),
    }
}

fn push_attributes(out: &mut String, attributes: &EntityAttributes, depth: usize) {
    let indent = "  ".repeat(depth);
    if attributes.fault {
        let _ = writeln!(out, "{indent}fault");
    }
    for (key, value) in &attributes.annotations {
        let value = serde_json::to_string(value).unwrap_or_default();
        let _ = writeln!(out, "{indent}@{key} = {value}");
    }
    for (namespace, entries) in &attributes.metadata {
        for (key, value) in entries {
            let _ = writeln!(out, "{indent}{namespace}.{key} = {value}");
        }
    }
    if let Some(cause) = &attributes.cause {
        for exception in &cause.exceptions {
            let _ = writeln!(out, "{indent}! {}: {}", exception.kind, exception.message);
            for frame in &exception.stack {
                let location = match (&frame.path, frame.line) {
                    (Some(path), Some(line)) => format!(" ({path}:{line})"),
                    (Some(path), None) => format!(" ({path})"),
                    _ => String::new(),
                };
                let _ = writeln!(out, "{indent}    at {}{location}", frame.label);
            }
            if let Some(truncated) = exception.truncated {
                let _ = writeln!(out, "{indent}    ... {truncated} more frames");
            }
        }
    }
}

/// Describe a trace header value field by field.
pub fn describe_header(value: &str) -> Result<String> {
    let context = TraceContext::parse(value)
        .with_context(|| format!("No valid Root in trace header: {value}"))?;

    let sampled = match context.sampled() {
        SamplingDecision::Sampled => "sampled",
        SamplingDecision::NotSampled => "not sampled",
        SamplingDecision::Requested => "requested",
        SamplingDecision::Unknown => "undecided",
    };

    let mut out = String::new();
    let _ = writeln!(out, "root:    {}", context.root());
    let _ = writeln!(out, "parent:  {}", context.parent().unwrap_or("-"));
    let _ = writeln!(out, "sampled: {sampled}");
    for (key, value) in context.extra() {
        let _ = writeln!(out, "{key}: {value}");
    }
    let _ = writeln!(out, "header:  {context}");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskray_recorder::{
        AnnotationValue, ExceptionRecord, StackFrame, TraceEntity, TraceId, TraceWriter,
        WriterConfig,
    };
    use tempfile::tempdir;

    fn sample_segment() -> Segment {
        let trace_id = TraceId::parse("1-5759e988-bd862e3fe1be46a994272793").unwrap();
        let mut segment = Segment::new("tasks.add", trace_id, Some("53995c3f42cd8ad8".into()));
        segment
            .put_annotation("celery_retry_reason", AnnotationValue::from("timeout"))
            .unwrap();
        segment.add_exception(ExceptionRecord::new(
            "ValueError",
            "bad input",
            vec![StackFrame::new("add").with_location("tasks.py", 3)],
            10,
        ));
        let mut child = Subsegment::new("tasks.mul", Some("remote"), &segment.entity_ref());
        child.close();
        segment.add_subsegment(child);
        segment.close();
        segment
    }

    #[test]
    fn test_render_segment_tree() {
        let rendered = render_segment(&sample_segment());
        assert!(rendered.starts_with("tasks.add trace=1-5759e988-bd862e3fe1be46a994272793"));
        assert!(rendered.contains("parent=53995c3f42cd8ad8"));
        assert!(rendered.contains("  fault\n"));
        assert!(rendered.contains("@celery_retry_reason = \"timeout\""));
        assert!(rendered.contains("! ValueError: bad input"));
        assert!(rendered.contains("at add (tasks.py:3)"));
        assert!(rendered.contains("└─ remote:tasks.mul"));
    }

    #[test]
    fn test_render_path_reads_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segments.jsonl");
        let writer = TraceWriter::new(WriterConfig::session(&path)).unwrap();
        writer.write(&sample_segment()).unwrap();
        writer.write(&sample_segment()).unwrap();
        drop(writer);

        let rendered = render_path(&path).unwrap();
        assert_eq!(rendered.matches("tasks.add trace=").count(), 2);
    }

    #[test]
    fn test_render_path_rejects_plain_directory() {
        let dir = tempdir().unwrap();
        assert!(render_path(dir.path()).is_err());
    }

    #[test]
    fn test_describe_header() {
        let described = describe_header(
            "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=0",
        )
        .unwrap();
        assert!(described.contains("root:    1-5759e988-bd862e3fe1be46a994272793"));
        assert!(described.contains("parent:  53995c3f42cd8ad8"));
        assert!(described.contains("sampled: not sampled"));
    }

    #[test]
    fn test_describe_header_without_root() {
        assert!(describe_header("Parent=53995c3f42cd8ad8").is_err());
    }
}
