//! Distributed tracing for task queue workers.
//!
//! Hooks a worker's task lifecycle signals so every task execution becomes a
//! trace segment and every task publish becomes a subsegment whose context
//! travels to the consumer in the message headers.
//!
//! - **Signals**: the events a worker host emits and the bus that dispatches them
//! - **Context**: extracting and injecting the trace header on task messages
//! - **Tracer**: segment lifecycle per task plus failure/retry annotations
//! - **Registrar**: idempotent (un)subscription and worker process hooks
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskray::{Instrumentor, SignalBus, TaskTracer, TaskEvent};
//! use taskray_recorder::{Recorder, RecorderConfig, TraceWriter, WriterConfig};
//!
//! let writer = TraceWriter::new(WriterConfig::default()).unwrap();
//! let recorder = Arc::new(Recorder::new(RecorderConfig::default(), Arc::new(writer)));
//! let instrumentor = Arc::new(Instrumentor::new(Arc::new(TaskTracer::new(recorder))));
//!
//! let bus = Arc::new(SignalBus::new());
//! instrumentor.install(&bus);
//! bus.send(&mut TaskEvent::WorkerProcessInit);
//! ```

pub mod annotate;
pub mod context;
pub mod registrar;
pub mod signals;
pub mod tracer;

pub use annotate::RETRY_REASON_KEY;
pub use context::{extract_context, inject_context};
pub use registrar::{Instrumentor, TASK_HANDLERS};
pub use signals::{
    DispatchUid, ExceptionInfo, Headers, Receiver, Signal, SignalBus, TaskEvent, TaskInfo,
    TaskRequest,
};
pub use tracer::{METADATA_NAMESPACE, PUBLISH_NAMESPACE, TASK_ID_KEY, TaskTracer};
