//! Trace context propagation through task message headers.

use serde_json::Value;
use taskray_recorder::{ALT_TRACE_HEADER, EntityRef, TRACE_HEADER, TraceContext};

use crate::signals::{Headers, TaskRequest};

/// Read the propagated trace context of an inbound task.
///
/// Falls back to a fresh root context when the header is absent or its root
/// is not a valid trace id.
pub fn extract_context(request: &TaskRequest) -> TraceContext {
    header_value(&request.headers)
        .and_then(TraceContext::parse)
        .unwrap_or_else(TraceContext::new_root)
}

/// Write `entity`'s trace id, id and sampling decision into `headers`.
///
/// Any existing trace header is replaced.
pub fn inject_context(headers: &mut Headers, entity: &EntityRef) {
    let context = TraceContext::from_entity(entity);
    headers.remove(ALT_TRACE_HEADER);
    headers.insert(TRACE_HEADER.to_string(), Value::String(context.to_string()));
}

fn header_value(headers: &Headers) -> Option<&str> {
    [TRACE_HEADER, ALT_TRACE_HEADER]
        .into_iter()
        .find_map(|name| headers.get(name).and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskray_recorder::{SamplingDecision, TraceId};

    fn entity(sampled: bool) -> EntityRef {
        EntityRef {
            id: "53995c3f42cd8ad8".to_string(),
            name: "add".to_string(),
            trace_id: TraceId::parse("1-5759e988-bd862e3fe1be46a994272793").unwrap(),
            sampled,
        }
    }

    #[test]
    fn test_inject_then_extract_round_trips() {
        let mut headers = Headers::new();
        headers.insert("id".to_string(), "abc".into());
        inject_context(&mut headers, &entity(true));

        let request = TaskRequest {
            id: Some("abc".to_string()),
            headers,
        };
        let context = extract_context(&request);
        assert_eq!(context.root().as_str(), "1-5759e988-bd862e3fe1be46a994272793");
        assert_eq!(context.parent(), Some("53995c3f42cd8ad8"));
        assert_eq!(context.sampled(), SamplingDecision::Sampled);
    }

    #[test]
    fn test_inject_propagates_not_sampled() {
        let mut headers = Headers::new();
        inject_context(&mut headers, &entity(false));
        assert_eq!(
            headers[TRACE_HEADER],
            "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=0"
        );
    }

    #[test]
    fn test_inject_replaces_existing_headers() {
        let mut headers = Headers::new();
        headers.insert(ALT_TRACE_HEADER.to_string(), "Root=stale".into());
        headers.insert(TRACE_HEADER.to_string(), "Root=stale".into());
        inject_context(&mut headers, &entity(true));
        assert!(!headers.contains_key(ALT_TRACE_HEADER));
        assert!(headers[TRACE_HEADER].as_str().unwrap().contains("Parent=53995c3f42cd8ad8"));
    }

    #[test]
    fn test_extract_reads_alternate_header() {
        let mut headers = Headers::new();
        headers.insert(
            ALT_TRACE_HEADER.to_string(),
            "Root=1-5759e988-bd862e3fe1be46a994272793;Sampled=0".into(),
        );
        let context = extract_context(&TaskRequest { id: None, headers });
        assert_eq!(context.sampled(), SamplingDecision::NotSampled);
        assert_eq!(context.parent(), None);
    }

    #[test]
    fn test_extract_without_header_starts_new_trace() {
        let first = extract_context(&TaskRequest::default());
        let second = extract_context(&TaskRequest::default());
        assert_eq!(first.parent(), None);
        assert_eq!(first.sampled(), SamplingDecision::Unknown);
        assert_ne!(first.root(), second.root());
    }

    #[test]
    fn test_extract_ignores_non_string_header() {
        let mut headers = Headers::new();
        headers.insert(TRACE_HEADER.to_string(), 42.into());
        let context = extract_context(&TaskRequest { id: None, headers });
        assert_eq!(context.parent(), None);
    }

    #[test]
    fn test_extract_falls_back_past_non_string_header() {
        let mut headers = Headers::new();
        headers.insert(TRACE_HEADER.to_string(), Value::Null);
        headers.insert(
            ALT_TRACE_HEADER.to_string(),
            "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8".into(),
        );
        let context = extract_context(&TaskRequest { id: None, headers });
        assert_eq!(context.root().to_string(), "1-5759e988-bd862e3fe1be46a994272793");
        assert_eq!(context.parent(), Some("53995c3f42cd8ad8"));
    }
}
