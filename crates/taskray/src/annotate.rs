//! Failure and retry annotations on the running task's segment.
//!
//! Neither handler closes the segment; `task_postrun` still fires after a
//! failure or retry and closes it.

use taskray_recorder::{AnnotationValue, ExceptionRecord, TraceEntity, stack};
use tracing::debug;

use crate::signals::ExceptionInfo;
use crate::tracer::TaskTracer;

/// Annotation key for retry reasons.
pub const RETRY_REASON_KEY: &str = "celery_retry_reason";

impl TaskTracer {
    /// Record the task's exception on its segment.
    ///
    /// Uses the traceback carried by `einfo` when there is one, otherwise the
    /// current call stack, keeping at most `max_trace_back` frames.
    pub fn on_task_failure(&self, einfo: Option<&ExceptionInfo>) {
        let Some(einfo) = einfo else {
            debug!("task_failure without einfo, skipping");
            return;
        };

        let frames = if einfo.traceback.is_empty() {
            stack::capture()
        } else {
            einfo.traceback.clone()
        };
        let limit = self.recorder().config().max_trace_back;
        let record = ExceptionRecord::new(&einfo.kind, &einfo.message, frames, limit);

        if let Err(e) = self
            .recorder()
            .with_current_segment(|segment| segment.add_exception(record))
        {
            self.report("task_failure", &e);
        }
    }

    /// Annotate the task's segment with why it is being retried.
    pub fn on_task_retry(&self, reason: Option<&str>) {
        let Some(reason) = reason.filter(|r| !r.is_empty()) else {
            debug!("task_retry without reason, skipping");
            return;
        };

        let recorded = self.recorder().with_current_segment(|segment| {
            segment.put_annotation(RETRY_REASON_KEY, AnnotationValue::from(reason))
        });
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => self.report("task_retry", &e),
        }
    }
}
