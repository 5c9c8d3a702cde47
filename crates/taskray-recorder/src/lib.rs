//! X-Ray style segment recorder.
//!
//! This crate records traced units of work for the task instrumentation:
//!
//! - **Types**: `Segment`, `Subsegment`, annotations, metadata and exceptions
//! - **Header**: the `Root=..;Parent=..;Sampled=..` trace context format
//! - **Recorder**: per-thread segment state with begin/end pairing
//! - **Sampler**: reservoir plus fixed-rate sampling decisions
//! - **Emitters**: sinks for closed segments, including JSONL persistence
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskray_recorder::{Recorder, RecorderConfig, SamplingDecision, TraceWriter, WriterConfig};
//!
//! let writer = TraceWriter::new(WriterConfig::default()).unwrap();
//! let recorder = Recorder::new(RecorderConfig::default(), Arc::new(writer));
//!
//! recorder.begin_segment("add", None, None, SamplingDecision::Unknown);
//! recorder
//!     .with_current_segment(|segment| {
//!         segment.attributes.put_metadata("celery", "task_id", "t1".into())
//!     })
//!     .ok();
//! recorder.end_segment().ok();
//! ```

pub mod config;
pub mod emitter;
pub mod error;
pub mod header;
pub mod recorder;
pub mod sampler;
pub mod stack;
pub mod types;
pub mod writer;

pub use config::{ContextMissing, RecorderConfig, SamplingConfig};
pub use emitter::{Emitter, FanoutEmitter, MemoryEmitter};
pub use error::{EmitError, RecorderError, Result};
pub use header::{ALT_TRACE_HEADER, SamplingDecision, TRACE_HEADER, TraceContext};
pub use recorder::{ContextId, Recorder, RecorderStats};
pub use sampler::Sampler;
pub use types::{
    AnnotationValue, Cause, EntityAttributes, EntityRef, ExceptionRecord, Segment, StackFrame,
    Subsegment, TraceEntity, TraceId,
};
pub use writer::{Rotation, TraceWriter, WriterConfig};
