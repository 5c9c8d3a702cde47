//! Sinks for closed segments.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::EmitError;
use crate::types::Segment;

/// Receives every closed, sampled segment.
///
/// Implementations must be cheap to call from a task thread; the recorder
/// logs and discards errors.
pub trait Emitter: Send + Sync {
    fn send(&self, segment: &Segment) -> Result<(), EmitError>;
}

/// Keeps emitted segments in memory.
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    segments: Mutex<Vec<Segment>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn segments(&self) -> Vec<Segment> {
        self.lock().clone()
    }

    /// Drain everything emitted so far.
    pub fn take(&self) -> Vec<Segment> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Segment>> {
        self.segments.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Emitter for MemoryEmitter {
    fn send(&self, segment: &Segment) -> Result<(), EmitError> {
        self.lock().push(segment.clone());
        Ok(())
    }
}

/// Forwards each segment to several emitters.
///
/// Every emitter is tried; the first error is returned.
#[derive(Default)]
pub struct FanoutEmitter {
    emitters: Vec<Arc<dyn Emitter>>,
}

impl FanoutEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitters.push(emitter);
        self
    }
}

impl Emitter for FanoutEmitter {
    fn send(&self, segment: &Segment) -> Result<(), EmitError> {
        let mut first_err = None;
        for emitter in &self.emitters {
            if let Err(e) = emitter.send(segment) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
