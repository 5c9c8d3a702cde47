//! Cross-crate integration and E2E tests
//!
//! These tests wire the instrumentation to real recorders and JSONL writers
//! and follow a trace from a producer process to its workers.

use std::sync::Arc;
use std::sync::mpsc;

use serde_json::Value;
use taskray::{
    ExceptionInfo, Headers, Instrumentor, Receiver, Signal, SignalBus, TaskEvent, TaskInfo,
    TaskRequest, TaskTracer,
};
use taskray_recorder::{
    Emitter, Recorder, RecorderConfig, SamplingDecision, Segment, TRACE_HEADER, TraceWriter,
    WriterConfig,
};
use tempfile::TempDir;

/// A worker process: own recorder and bus, shared emitter.
fn boot_process(emitter: Arc<dyn Emitter>) -> (Arc<SignalBus>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::new(RecorderConfig::sample_all(), emitter));
    let instrumentor = Arc::new(Instrumentor::new(Arc::new(TaskTracer::new(Arc::clone(
        &recorder,
    )))));
    let bus = Arc::new(SignalBus::new());
    instrumentor.install(&bus);
    bus.send(&mut TaskEvent::WorkerProcessInit);
    (bus, recorder)
}

fn publish(bus: &SignalBus, task_name: &str, task_id: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert("id".to_string(), Value::from(task_id));
    let mut event = TaskEvent::before_publish(task_name, headers, Headers::new());
    bus.send(&mut event);
    bus.send(&mut TaskEvent::AfterTaskPublish {
        sender: Some(task_name.to_string()),
    });
    match event {
        TaskEvent::BeforeTaskPublish { headers, .. } => headers,
        _ => unreachable!(),
    }
}

fn prerun(bus: &SignalBus, task_name: &str, task_id: &str, headers: Headers) {
    let request = TaskRequest {
        id: Some(task_id.to_string()),
        headers,
    };
    bus.send(&mut TaskEvent::prerun(TaskInfo::new(task_name, request), task_id));
}

fn postrun(bus: &SignalBus, task_id: &str) {
    bus.send(&mut TaskEvent::TaskPostrun {
        task_id: Some(task_id.to_string()),
    });
}

fn persisted(dir: &TempDir) -> Vec<Segment> {
    TraceWriter::read_segments(&dir.path().join("segments.jsonl")).expect("Should read segments")
}

fn writer(dir: &TempDir) -> Arc<dyn Emitter> {
    let config = WriterConfig::session(dir.path().join("segments.jsonl"));
    Arc::new(TraceWriter::new(config).expect("Should create writer"))
}

/// E2E Test: a chain of tasks across three worker processes
///
/// web request -> tasks.fetch (worker A) -> tasks.parse (worker B)
/// Every hop must land in the same trace, parented by the publishing subsegment.
#[tokio::test]
async fn test_e2e_task_chain_shares_one_trace() {
    let dir = TempDir::new().unwrap();
    let emitter = writer(&dir);

    let (to_a, inbox_a) = mpsc::channel::<Headers>();
    let (to_b, inbox_b) = mpsc::channel::<Headers>();

    let worker_b = {
        let emitter = Arc::clone(&emitter);
        tokio::task::spawn_blocking(move || {
            let (bus, _) = boot_process(emitter);
            for headers in inbox_b {
                prerun(&bus, "tasks.parse", "parse-1", headers);
                postrun(&bus, "parse-1");
            }
            bus.send(&mut TaskEvent::WorkerProcessShutdown);
        })
    };

    let worker_a = {
        let emitter = Arc::clone(&emitter);
        tokio::task::spawn_blocking(move || {
            let (bus, _) = boot_process(emitter);
            for headers in inbox_a {
                prerun(&bus, "tasks.fetch", "fetch-1", headers);
                let next = publish(&bus, "tasks.parse", "parse-1");
                to_b.send(next).unwrap();
                postrun(&bus, "fetch-1");
            }
            bus.send(&mut TaskEvent::WorkerProcessShutdown);
        })
    };

    let web = {
        let emitter = Arc::clone(&emitter);
        tokio::task::spawn_blocking(move || {
            let (bus, recorder) = boot_process(emitter);
            recorder.begin_segment("web.request", None, None, SamplingDecision::Unknown);
            to_a.send(publish(&bus, "tasks.fetch", "fetch-1")).unwrap();
            recorder.end_segment().unwrap();
        })
    };

    web.await.unwrap();
    worker_a.await.unwrap();
    worker_b.await.unwrap();

    let segments = persisted(&dir);
    assert_eq!(segments.len(), 3);
    let by_name = |name: &str| segments.iter().find(|s| s.name == name).unwrap();
    let web = by_name("web.request");
    let fetch = by_name("tasks.fetch");
    let parse = by_name("tasks.parse");

    assert_eq!(fetch.trace_id, web.trace_id);
    assert_eq!(parse.trace_id, web.trace_id);
    assert_eq!(fetch.parent_id.as_deref(), Some(web.subsegments[0].id.as_str()));
    assert_eq!(parse.parent_id.as_deref(), Some(fetch.subsegments[0].id.as_str()));
    assert_eq!(
        parse.attributes.metadata_value("celery", "task_id"),
        Some(&Value::from("parse-1"))
    );
    assert_eq!(
        fetch.subsegments[0].attributes.metadata_value("celery", "task_id"),
        Some(&Value::from("parse-1"))
    );
}

/// A broken third-party receiver on the same signal must not stop tracing.
#[test]
fn test_panicking_neighbor_receiver_does_not_break_tracing() {
    let dir = TempDir::new().unwrap();
    let (bus, recorder) = boot_process(writer(&dir));

    fn broken(_: &mut TaskEvent) {
        panic!("third-party handler failed");
    }
    let broken: Arc<dyn Receiver> = Arc::new(broken);
    bus.connect(Signal::TaskPrerun, "thirdparty.prerun", broken);

    prerun(&bus, "tasks.add", "t-1", Headers::new());
    postrun(&bus, "t-1");

    assert_eq!(recorder.stats().open_segments(), 0);
    assert_eq!(persisted(&dir).len(), 1);
}

/// A worker that never saw postrun for a task still reports it, once.
#[test]
fn test_missing_postrun_is_recovered_by_next_task() {
    let dir = TempDir::new().unwrap();
    let (bus, recorder) = boot_process(writer(&dir));

    prerun(&bus, "tasks.lost", "lost", Headers::new());
    prerun(&bus, "tasks.add", "t-2", Headers::new());
    postrun(&bus, "t-2");

    let names: Vec<_> = persisted(&dir).into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["tasks.lost", "tasks.add"]);
    assert_eq!(recorder.stats().open_segments(), 0);
}

/// Failure details survive persistence.
#[test]
fn test_failure_is_persisted_with_cause() {
    let dir = TempDir::new().unwrap();
    let (bus, _) = boot_process(writer(&dir));

    prerun(&bus, "tasks.div", "t-3", Headers::new());
    bus.send(&mut TaskEvent::TaskFailure {
        task_id: Some("t-3".to_string()),
        einfo: Some(ExceptionInfo::new("ZeroDivisionError", "division by zero")),
    });
    postrun(&bus, "t-3");

    let segments = persisted(&dir);
    let cause = segments[0].attributes.cause.as_ref().unwrap();
    assert!(segments[0].attributes.fault);
    assert_eq!(cause.exceptions[0].kind, "ZeroDivisionError");
    assert!(!cause.working_directory.is_empty());
}

/// Headers written by one process parse as an inbound context in another.
#[test]
fn test_outbound_header_format() {
    let dir = TempDir::new().unwrap();
    let (bus, recorder) = boot_process(writer(&dir));
    recorder.begin_segment("web.request", None, None, SamplingDecision::Sampled);
    let headers = publish(&bus, "tasks.add", "t-4");
    recorder.end_segment().unwrap();

    let value = headers[TRACE_HEADER].as_str().unwrap();
    let parts: Vec<_> = value.split(';').collect();
    assert!(parts[0].starts_with("Root=1-"));
    assert!(parts[1].starts_with("Parent="));
    assert_eq!(parts[2], "Sampled=1");
}
