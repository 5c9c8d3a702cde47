//! Per-context segment recorder.
//!
//! Each execution context (OS thread) owns at most one open segment and a
//! stack of open subsegments beneath it. State lives in a map keyed by
//! thread id inside the recorder, so worker threads sharing one recorder
//! never see each other's segments.
//!
//! Ordering is the caller's responsibility: `begin_segment` before
//! `end_segment`, `begin_subsegment` before `end_subsegment`. Violations are
//! reported as errors or repaired with a warning, never a panic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use crate::config::RecorderConfig;
use crate::emitter::Emitter;
use crate::error::{RecorderError, Result};
use crate::header::SamplingDecision;
use crate::sampler::Sampler;
use crate::types::{EntityRef, Segment, Subsegment, TraceEntity, TraceId};

/// Identifies an execution context.
pub type ContextId = ThreadId;

fn current_context() -> ContextId {
    thread::current().id()
}

/// Open entities of one execution context.
#[derive(Debug)]
struct ContextState {
    segment: Segment,
    open: Vec<Subsegment>,
}

impl ContextState {
    fn new(segment: Segment) -> Self {
        Self {
            segment,
            open: Vec::new(),
        }
    }

    fn current_ref(&self) -> EntityRef {
        match self.open.last() {
            Some(subsegment) => subsegment.entity_ref(),
            None => self.segment.entity_ref(),
        }
    }

    fn attach(&mut self, subsegment: Subsegment) {
        // Innermost open subsegment is the parent; otherwise the segment
        if let Some(parent) = self.open.last_mut() {
            parent.add_subsegment(subsegment);
        } else {
            self.segment.add_subsegment(subsegment);
        }
    }

    /// Close everything, returning the segment and how many subsegments
    /// were still open.
    fn finish(mut self) -> (Segment, u64) {
        let mut dangling = 0;
        while let Some(mut subsegment) = self.open.pop() {
            subsegment.close();
            self.attach(subsegment);
            dangling += 1;
        }
        self.segment.close();
        (self.segment, dangling)
    }
}

#[derive(Debug, Default)]
struct Counters {
    segments_begun: AtomicU64,
    segments_ended: AtomicU64,
    subsegments_begun: AtomicU64,
    subsegments_ended: AtomicU64,
}

/// Snapshot of begin/end counts over the recorder's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub segments_begun: u64,
    pub segments_ended: u64,
    pub subsegments_begun: u64,
    pub subsegments_ended: u64,
}

impl RecorderStats {
    /// Segments begun but not yet ended.
    pub fn open_segments(&self) -> u64 {
        self.segments_begun.saturating_sub(self.segments_ended)
    }

    /// Subsegments begun but not yet ended.
    pub fn open_subsegments(&self) -> u64 {
        self.subsegments_begun.saturating_sub(self.subsegments_ended)
    }
}

/// Records segments and subsegments and hands closed segments to an emitter.
pub struct Recorder {
    config: RecorderConfig,
    sampler: Sampler,
    emitter: Arc<dyn Emitter>,
    contexts: Mutex<HashMap<ContextId, ContextState>>,
    counters: Counters,
}

impl Recorder {
    /// Create a recorder that sends closed segments to `emitter`.
    pub fn new(config: RecorderConfig, emitter: Arc<dyn Emitter>) -> Self {
        Self {
            sampler: Sampler::new(config.sampling.clone()),
            config,
            emitter,
            contexts: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Open a segment in the current context.
    ///
    /// An upstream `Sampled`/`NotSampled` decision is honored; otherwise the
    /// local sampler decides. A segment still open in this context is closed
    /// and emitted first so it cannot leak into the next unit of work.
    pub fn begin_segment(
        &self,
        name: &str,
        trace_id: Option<TraceId>,
        parent_id: Option<String>,
        sampling: SamplingDecision,
    ) -> EntityRef {
        let name = if name.is_empty() {
            self.config.service_name.as_str()
        } else {
            name
        };
        let sampled = self.config.enabled
            && match sampling {
                SamplingDecision::Sampled => true,
                SamplingDecision::NotSampled => false,
                SamplingDecision::Requested | SamplingDecision::Unknown => {
                    self.sampler.should_trace()
                }
            };

        let trace_id = trace_id.unwrap_or_else(TraceId::generate);
        let segment = Segment::new(name, trace_id, parent_id).with_sampled(sampled);
        let entity = segment.entity_ref();

        let stale = self
            .lock()
            .insert(current_context(), ContextState::new(segment));
        self.counters.segments_begun.fetch_add(1, Ordering::Relaxed);

        if let Some(stale) = stale {
            warn!(
                stale = %stale.segment.name,
                segment = %entity.name,
                "segment still open when a new one began, closing it"
            );
            self.finish(stale);
        }

        debug!(segment = %entity.name, trace_id = %entity.trace_id, sampled, "segment begun");
        entity
    }

    /// Close the current context's segment and emit it if sampled.
    ///
    /// Subsegments left open are closed and attached first.
    pub fn end_segment(&self) -> Result<EntityRef> {
        let state = self
            .lock()
            .remove(&current_context())
            .ok_or(RecorderError::ContextMissing("end segment"))?;
        let entity = state.segment.entity_ref();
        self.finish(state);
        debug!(segment = %entity.name, "segment ended");
        Ok(entity)
    }

    /// Open a subsegment under the innermost open entity.
    ///
    /// Fails with [`RecorderError::Disabled`] when recording is off and
    /// [`RecorderError::ContextMissing`] when no segment is open.
    pub fn begin_subsegment(&self, name: &str, namespace: Option<&str>) -> Result<EntityRef> {
        if !self.config.enabled {
            return Err(RecorderError::Disabled);
        }

        let mut contexts = self.lock();
        let state = contexts
            .get_mut(&current_context())
            .ok_or(RecorderError::ContextMissing("begin subsegment"))?;
        let subsegment = Subsegment::new(name, namespace, &state.current_ref());
        let entity = subsegment.entity_ref();
        state.open.push(subsegment);
        drop(contexts);

        self.counters
            .subsegments_begun
            .fetch_add(1, Ordering::Relaxed);
        Ok(entity)
    }

    /// Close the innermost open subsegment and attach it to its parent.
    pub fn end_subsegment(&self) -> Result<EntityRef> {
        let mut contexts = self.lock();
        let state = contexts
            .get_mut(&current_context())
            .ok_or(RecorderError::ContextMissing("end subsegment"))?;
        let mut subsegment = state.open.pop().ok_or(RecorderError::NoOpenSubsegment)?;
        subsegment.close();
        let entity = subsegment.entity_ref();
        state.attach(subsegment);
        drop(contexts);

        self.counters
            .subsegments_ended
            .fetch_add(1, Ordering::Relaxed);
        Ok(entity)
    }

    /// Run `f` against the current context's segment.
    ///
    /// `f` runs under the recorder lock and must not call back into the recorder.
    pub fn with_current_segment<R>(&self, f: impl FnOnce(&mut Segment) -> R) -> Result<R> {
        let mut contexts = self.lock();
        let state = contexts
            .get_mut(&current_context())
            .ok_or(RecorderError::ContextMissing("access current segment"))?;
        Ok(f(&mut state.segment))
    }

    /// Run `f` against the innermost open entity (subsegment or segment).
    ///
    /// `f` runs under the recorder lock and must not call back into the recorder.
    pub fn with_current_entity<R>(&self, f: impl FnOnce(&mut dyn TraceEntity) -> R) -> Result<R> {
        let mut contexts = self.lock();
        let state = contexts
            .get_mut(&current_context())
            .ok_or(RecorderError::ContextMissing("access current entity"))?;
        match state.open.last_mut() {
            Some(subsegment) => Ok(f(subsegment)),
            None => Ok(f(&mut state.segment)),
        }
    }

    /// Handle to the innermost open entity, if any.
    pub fn current_entity(&self) -> Option<EntityRef> {
        self.lock()
            .get(&current_context())
            .map(ContextState::current_ref)
    }

    /// Whether the current context has an open segment.
    pub fn has_open_segment(&self) -> bool {
        self.lock().contains_key(&current_context())
    }

    /// Discard every context's state without emitting it.
    ///
    /// Called when a worker process starts so state inherited from a parent
    /// process is not reported twice. Returns the number of discarded segments.
    pub fn reset(&self) -> usize {
        let discarded: Vec<ContextState> = self.lock().drain().map(|(_, state)| state).collect();
        for state in &discarded {
            warn!(segment = %state.segment.name, "discarding inherited open segment");
            self.counters.segments_ended.fetch_add(1, Ordering::Relaxed);
            self.counters
                .subsegments_ended
                .fetch_add(state.open.len() as u64, Ordering::Relaxed);
        }
        discarded.len()
    }

    /// Close and emit every context's open segment.
    ///
    /// Called on worker process shutdown. Returns the number of segments closed.
    pub fn shutdown(&self) -> usize {
        let open: Vec<ContextState> = self.lock().drain().map(|(_, state)| state).collect();
        let count = open.len();
        for state in open {
            warn!(segment = %state.segment.name, "closing segment still open at shutdown");
            self.finish(state);
        }
        count
    }

    /// Begin/end counters.
    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            segments_begun: self.counters.segments_begun.load(Ordering::Relaxed),
            segments_ended: self.counters.segments_ended.load(Ordering::Relaxed),
            subsegments_begun: self.counters.subsegments_begun.load(Ordering::Relaxed),
            subsegments_ended: self.counters.subsegments_ended.load(Ordering::Relaxed),
        }
    }

    fn finish(&self, state: ContextState) {
        let (segment, dangling) = state.finish();
        if dangling > 0 {
            warn!(segment = %segment.name, dangling, "closed subsegments left open");
            self.counters
                .subsegments_ended
                .fetch_add(dangling, Ordering::Relaxed);
        }
        self.counters.segments_ended.fetch_add(1, Ordering::Relaxed);

        if segment.sampled {
            if let Err(e) = self.emitter.send(&segment) {
                warn!(segment = %segment.name, error = %e, "failed to emit segment");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextId, ContextState>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
