//! Segment lifecycle driven by task signals.
//!
//! [`TaskTracer`] turns task lifecycle events into recorder calls:
//!
//! ```text
//! before_task_publish  -> begin_subsegment(task, "remote"), inject context
//! after_task_publish   -> end_subsegment, if before_task_publish opened it
//! task_prerun          -> extract context, begin_segment(task)
//! task_failure         -> add_exception            (see annotate.rs)
//! task_retry           -> put_annotation           (see annotate.rs)
//! task_postrun         -> end_segment
//! ```
//!
//! Every handler is infallible from the caller's point of view: malformed
//! payloads are skipped and recorder errors are reported through the
//! configured [`ContextMissing`] policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde_json::Value;
use taskray_recorder::{ContextId, ContextMissing, Recorder, RecorderError, TraceEntity};
use tracing::{debug, warn};

use crate::context::{extract_context, inject_context};
use crate::signals::{Headers, Receiver, TaskEvent, TaskInfo};

/// Metadata namespace for task fields.
pub const METADATA_NAMESPACE: &str = "celery";

/// Namespace of publish subsegments.
pub const PUBLISH_NAMESPACE: &str = "remote";

/// Metadata key holding the task id.
pub const TASK_ID_KEY: &str = "task_id";

/// Bridges task lifecycle events to a [`Recorder`].
pub struct TaskTracer {
    recorder: Arc<Recorder>,
    /// Ids of publish subsegments opened per thread, innermost last.
    publishes: Mutex<HashMap<ContextId, Vec<String>>>,
}

impl TaskTracer {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            publishes: Mutex::new(HashMap::new()),
        }
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Open a segment for a task about to run.
    ///
    /// No-op when either the task or its id is missing.
    pub fn on_task_prerun(&self, task: Option<&TaskInfo>, task_id: Option<&str>) {
        let (Some(task), Some(task_id)) = (task, task_id) else {
            debug!("task_prerun without sender or task_id, skipping");
            return;
        };

        let context = extract_context(&task.request);
        self.recorder.begin_segment(
            &task.name,
            Some(context.root().clone()),
            context.parent().map(str::to_string),
            context.sampled(),
        );

        let recorded = self.recorder.with_current_segment(|segment| {
            segment.save_origin(context);
            segment.put_metadata(METADATA_NAMESPACE, TASK_ID_KEY, Value::from(task_id))
        });
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => self.report("task_prerun", &e),
        }
    }

    /// Close the segment of the task that just ran.
    pub fn on_task_postrun(&self) {
        if let Err(e) = self.recorder.end_segment() {
            self.report("task_postrun", &e);
        }
    }

    /// Open a publish subsegment and propagate its context into `headers`.
    ///
    /// The task id comes from `headers["id"]`, falling back to `body["id"]`.
    pub fn on_before_publish(&self, task_name: Option<&str>, headers: &mut Headers, body: &Headers) {
        let Some(task_name) = task_name else {
            debug!("before_task_publish without sender, skipping");
            return;
        };
        let task_id = resolve_task_id(headers, body);

        let subsegment = match self
            .recorder
            .begin_subsegment(task_name, Some(PUBLISH_NAMESPACE))
        {
            Ok(subsegment) => subsegment,
            Err(RecorderError::Disabled) => return,
            Err(e) => {
                self.report("before_task_publish", &e);
                return;
            }
        };
        self.lock_publishes()
            .entry(thread::current().id())
            .or_default()
            .push(subsegment.id.clone());

        let recorded = self.recorder.with_current_entity(|entity| {
            entity.put_metadata(METADATA_NAMESPACE, TASK_ID_KEY, task_id)
        });
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => self.report("before_task_publish", &e),
        }

        if !headers.is_empty() {
            inject_context(headers, &subsegment);
        }
    }

    /// Close the subsegment opened by the matching `on_before_publish`.
    ///
    /// Does nothing when that call opened none, so a publish that was
    /// skipped never closes an unrelated subsegment.
    pub fn on_after_publish(&self) {
        let Some(expected) = self.pop_publish() else {
            debug!("after_task_publish without a recorded publish, skipping");
            return;
        };

        let current = self.recorder.current_entity();
        if current.is_none_or(|entity| entity.id != expected) {
            self.report("after_task_publish", &RecorderError::NoOpenSubsegment);
            return;
        }
        if let Err(e) = self.recorder.end_subsegment() {
            self.report("after_task_publish", &e);
        }
    }

    fn pop_publish(&self) -> Option<String> {
        let mut publishes = self.lock_publishes();
        let context = thread::current().id();
        let stack = publishes.get_mut(&context)?;
        let id = stack.pop();
        if stack.is_empty() {
            publishes.remove(&context);
        }
        id
    }

    fn lock_publishes(&self) -> MutexGuard<'_, HashMap<ContextId, Vec<String>>> {
        self.publishes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report a recorder error per the context-missing policy.
    pub(crate) fn report(&self, signal: &'static str, error: &RecorderError) {
        let missing = matches!(
            error,
            RecorderError::ContextMissing(_) | RecorderError::NoOpenSubsegment
        );
        if missing && self.recorder.config().context_missing == ContextMissing::Ignore {
            debug!(signal, error = %error, "tracing context missing");
        } else {
            warn!(signal, error = %error, "tracing handler could not record");
        }
    }
}

/// Task id of an outgoing message: `headers["id"]`, else `body["id"]`.
fn resolve_task_id(headers: &Headers, body: &Headers) -> Value {
    let non_empty = |map: &Headers| {
        map.get("id")
            .filter(|v| !v.is_null() && v.as_str() != Some(""))
            .cloned()
    };
    non_empty(headers)
        .or_else(|| non_empty(body))
        .unwrap_or(Value::Null)
}

impl Receiver for TaskTracer {
    fn receive(&self, event: &mut TaskEvent) {
        match event {
            TaskEvent::TaskPrerun { sender, task_id } => {
                self.on_task_prerun(sender.as_ref(), task_id.as_deref())
            }
            TaskEvent::TaskPostrun { .. } => self.on_task_postrun(),
            TaskEvent::BeforeTaskPublish {
                sender,
                headers,
                body,
            } => self.on_before_publish(sender.as_deref(), headers, body),
            TaskEvent::AfterTaskPublish { .. } => self.on_after_publish(),
            TaskEvent::TaskFailure { einfo, .. } => self.on_task_failure(einfo.as_ref()),
            TaskEvent::TaskRetry { reason } => self.on_task_retry(reason.as_deref()),
            TaskEvent::WorkerProcessInit | TaskEvent::WorkerProcessShutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::TaskRequest;
    use taskray_recorder::{
        MemoryEmitter, RecorderConfig, SamplingDecision, TRACE_HEADER, TraceContext,
    };

    fn tracer() -> (TaskTracer, Arc<MemoryEmitter>) {
        let emitter = Arc::new(MemoryEmitter::new());
        let recorder = Recorder::new(RecorderConfig::sample_all(), emitter.clone());
        (TaskTracer::new(Arc::new(recorder)), emitter)
    }

    fn task(name: &str) -> TaskInfo {
        TaskInfo::new(name, TaskRequest::default())
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_prerun_postrun_emits_one_segment() {
        let (tracer, emitter) = tracer();
        tracer.on_task_prerun(Some(&task("add")), Some("t1"));
        assert!(tracer.recorder().has_open_segment());
        tracer.on_task_postrun();

        assert!(!tracer.recorder().has_open_segment());
        let segments = emitter.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].name, "add");
        assert_eq!(
            segments[0].attributes.metadata_value("celery", "task_id"),
            Some(&Value::from("t1"))
        );
    }

    #[test]
    fn test_prerun_with_missing_fields_is_noop() {
        let (tracer, emitter) = tracer();
        tracer.on_task_prerun(None, Some("t1"));
        tracer.on_task_prerun(Some(&task("add")), None);
        assert!(!tracer.recorder().has_open_segment());
        assert_eq!(tracer.recorder().stats().segments_begun, 0);
        assert!(emitter.is_empty());
    }

    #[test]
    fn test_prerun_continues_propagated_trace() {
        let (tracer, emitter) = tracer();
        let upstream = "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=1";
        let request = TaskRequest {
            id: Some("t1".to_string()),
            headers: headers(&[(TRACE_HEADER, upstream)]),
        };
        tracer.on_task_prerun(Some(&TaskInfo::new("add", request)), Some("t1"));

        let origin = tracer
            .recorder()
            .with_current_segment(|s| s.origin.clone())
            .unwrap();
        assert_eq!(origin, TraceContext::parse(upstream));
        tracer.on_task_postrun();

        let segments = emitter.segments();
        let segment = &segments[0];
        assert_eq!(segment.trace_id.as_str(), "1-5759e988-bd862e3fe1be46a994272793");
        assert_eq!(segment.parent_id.as_deref(), Some("53995c3f42cd8ad8"));
    }

    #[test]
    fn test_prerun_honors_not_sampled() {
        let (tracer, emitter) = tracer();
        let request = TaskRequest {
            id: None,
            headers: headers(&[(
                TRACE_HEADER,
                "Root=1-5759e988-bd862e3fe1be46a994272793;Sampled=0",
            )]),
        };
        tracer.on_task_prerun(Some(&TaskInfo::new("add", request)), Some("t1"));
        tracer.on_task_postrun();
        assert!(emitter.is_empty());
        assert_eq!(tracer.recorder().stats().open_segments(), 0);
    }

    #[test]
    fn test_postrun_without_segment_does_not_panic() {
        let (tracer, emitter) = tracer();
        tracer.on_task_postrun();
        assert!(emitter.is_empty());
    }

    #[test]
    fn test_before_publish_records_task_id_from_headers() {
        let (tracer, emitter) = tracer();
        tracer
            .recorder()
            .begin_segment("web", None, None, SamplingDecision::Sampled);

        let mut outgoing = headers(&[("id", "abc")]);
        tracer.on_before_publish(Some("add"), &mut outgoing, &Headers::new());

        let task_id = tracer
            .recorder()
            .with_current_entity(|e| {
                e.attributes()
                    .metadata_value(METADATA_NAMESPACE, TASK_ID_KEY)
                    .cloned()
            })
            .unwrap();
        assert_eq!(task_id, Some(Value::from("abc")));

        let subsegment = tracer.recorder().current_entity().unwrap();
        let injected = TraceContext::parse(outgoing[TRACE_HEADER].as_str().unwrap()).unwrap();
        assert_eq!(injected.parent(), Some(subsegment.id.as_str()));
        assert_eq!(injected.root(), &subsegment.trace_id);

        tracer.on_after_publish();
        tracer.recorder().end_segment().unwrap();

        let segments = emitter.segments();
        let publish = &segments[0].subsegments[0];
        assert_eq!(publish.name, "add");
        assert_eq!(publish.namespace.as_deref(), Some(PUBLISH_NAMESPACE));
        assert!(publish.end_time.is_some());
    }

    #[test]
    fn test_before_publish_falls_back_to_body_id() {
        let (tracer, emitter) = tracer();
        tracer
            .recorder()
            .begin_segment("web", None, None, SamplingDecision::Sampled);

        let mut outgoing = headers(&[("task", "add")]);
        let body = headers(&[("id", "from-body")]);
        tracer.on_before_publish(Some("add"), &mut outgoing, &body);
        tracer.on_after_publish();
        tracer.recorder().end_segment().unwrap();

        let segments = emitter.segments();
        let publish = &segments[0].subsegments[0];
        assert_eq!(
            publish.attributes.metadata_value("celery", "task_id"),
            Some(&Value::from("from-body"))
        );
    }

    #[test]
    fn test_before_publish_leaves_empty_headers_alone() {
        let (tracer, _) = tracer();
        tracer
            .recorder()
            .begin_segment("web", None, None, SamplingDecision::Sampled);
        let mut outgoing = Headers::new();
        tracer.on_before_publish(Some("add"), &mut outgoing, &Headers::new());
        assert!(outgoing.is_empty());
        tracer.on_after_publish();
        tracer.recorder().end_segment().unwrap();
    }

    #[test]
    fn test_before_publish_without_segment_is_noop() {
        let (tracer, _) = tracer();
        let mut outgoing = headers(&[("id", "abc")]);
        tracer.on_before_publish(Some("add"), &mut outgoing, &Headers::new());
        assert!(!outgoing.contains_key(TRACE_HEADER));
        assert_eq!(tracer.recorder().stats().subsegments_begun, 0);

        tracer.on_after_publish();
        assert_eq!(tracer.recorder().stats().subsegments_ended, 0);
    }

    #[test]
    fn test_after_publish_closes_only_its_own_subsegment() {
        let (tracer, emitter) = tracer();
        tracer
            .recorder()
            .begin_segment("task", None, None, SamplingDecision::Sampled);

        let mut outer = headers(&[("id", "outer")]);
        tracer.on_before_publish(Some("outer"), &mut outer, &Headers::new());
        let mut skipped = headers(&[("id", "skipped")]);
        tracer.on_before_publish(None, &mut skipped, &Headers::new());
        tracer.on_after_publish();

        assert_eq!(tracer.recorder().current_entity().unwrap().name, "outer");
        tracer.on_after_publish();
        assert_eq!(tracer.recorder().current_entity().unwrap().name, "task");

        tracer.recorder().end_segment().unwrap();
        let segments = emitter.segments();
        assert!(segments[0].subsegments[0].end_time.is_some());
    }

    #[test]
    fn test_unpaired_after_publish_leaves_open_subsegment() {
        let (tracer, _) = tracer();
        tracer
            .recorder()
            .begin_segment("task", None, None, SamplingDecision::Sampled);
        tracer.recorder().begin_subsegment("query", None).unwrap();

        tracer.on_after_publish();

        assert_eq!(tracer.recorder().current_entity().unwrap().name, "query");
        assert_eq!(tracer.recorder().stats().open_subsegments(), 1);
    }

    #[test]
    fn test_before_publish_disabled_recorder() {
        let recorder = Recorder::new(RecorderConfig::disabled(), Arc::new(MemoryEmitter::new()));
        let tracer = TaskTracer::new(Arc::new(recorder));
        tracer.on_task_prerun(Some(&task("add")), Some("t1"));

        let mut outgoing = headers(&[("id", "abc")]);
        tracer.on_before_publish(Some("add"), &mut outgoing, &Headers::new());
        assert!(!outgoing.contains_key(TRACE_HEADER));
        tracer.on_after_publish();
        tracer.on_task_postrun();
        assert_eq!(tracer.recorder().stats().open_segments(), 0);
    }

    #[test]
    fn test_receive_dispatches_by_variant() {
        let (tracer, emitter) = tracer();
        tracer.receive(&mut TaskEvent::prerun(task("add"), "t1"));
        tracer.receive(&mut TaskEvent::TaskRetry {
            reason: Some("broker down".to_string()),
        });
        tracer.receive(&mut TaskEvent::TaskPostrun { task_id: None });

        let segments = emitter.segments();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].attributes.annotations.contains_key("celery_retry_reason"));
    }
}
