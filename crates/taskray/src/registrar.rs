//! Subscribes the tracing handlers to a worker's signal bus.
//!
//! [`Instrumentor::install`] hooks worker process start/stop:
//!
//! ```text
//! worker_process_init      -> recorder.reset(), instrument()
//! worker_process_shutdown  -> uninstrument(), recorder.shutdown()
//! ```
//!
//! `instrument`/`uninstrument` may also be called directly. Both are
//! idempotent: handlers are keyed by dispatch uid on the bus.

use std::sync::{Arc, Weak};

use tracing::{debug, info};

use crate::signals::{DispatchUid, Receiver, Signal, SignalBus, TaskEvent};
use crate::tracer::TaskTracer;

/// Task-event handlers and the uids they are registered under.
pub const TASK_HANDLERS: [(Signal, DispatchUid); 6] = [
    (Signal::TaskPrerun, "taskray.trace_prerun"),
    (Signal::TaskPostrun, "taskray.trace_postrun"),
    (Signal::BeforeTaskPublish, "taskray.trace_before_publish"),
    (Signal::AfterTaskPublish, "taskray.trace_after_publish"),
    (Signal::TaskFailure, "taskray.trace_failure"),
    (Signal::TaskRetry, "taskray.trace_retry"),
];

const WORKER_INIT_UID: DispatchUid = "taskray.worker_process_init";
const WORKER_SHUTDOWN_UID: DispatchUid = "taskray.worker_process_shutdown";

/// Connects a [`TaskTracer`] to signal buses.
pub struct Instrumentor {
    tracer: Arc<TaskTracer>,
}

impl Instrumentor {
    pub fn new(tracer: Arc<TaskTracer>) -> Self {
        Self { tracer }
    }

    pub fn tracer(&self) -> &Arc<TaskTracer> {
        &self.tracer
    }

    /// Subscribe every task-event handler. Returns how many were newly connected.
    pub fn instrument(&self, bus: &SignalBus) -> usize {
        let receiver: Arc<dyn Receiver> = self.tracer.clone();
        let connected = TASK_HANDLERS
            .iter()
            .filter(|(signal, uid)| bus.connect(*signal, uid, Arc::clone(&receiver)))
            .count();
        debug!(connected, "task signals instrumented");
        connected
    }

    /// Unsubscribe every task-event handler. Returns how many were connected.
    pub fn uninstrument(&self, bus: &SignalBus) -> usize {
        let disconnected = TASK_HANDLERS
            .iter()
            .filter(|(signal, uid)| bus.disconnect(*signal, uid))
            .count();
        debug!(disconnected, "task signals uninstrumented");
        disconnected
    }

    /// Whether every task-event handler is connected to `bus`.
    pub fn is_instrumented(&self, bus: &SignalBus) -> bool {
        TASK_HANDLERS
            .iter()
            .all(|(signal, uid)| bus.is_connected(*signal, uid))
    }

    /// Bind instrumentation to the worker process lifecycle signals of `bus`.
    ///
    /// The hooks hold the bus weakly, so dropping the bus drops them too.
    pub fn install(self: &Arc<Self>, bus: &Arc<SignalBus>) {
        let on_init = {
            let this = Arc::clone(self);
            let bus = Arc::downgrade(bus);
            move |_: &mut TaskEvent| this.on_worker_init(&bus)
        };
        let on_shutdown = {
            let this = Arc::clone(self);
            let bus = Arc::downgrade(bus);
            move |_: &mut TaskEvent| this.on_worker_shutdown(&bus)
        };

        bus.connect(Signal::WorkerProcessInit, WORKER_INIT_UID, Arc::new(on_init));
        bus.connect(
            Signal::WorkerProcessShutdown,
            WORKER_SHUTDOWN_UID,
            Arc::new(on_shutdown),
        );
    }

    /// Remove the lifecycle hooks and any task-event handlers.
    pub fn uninstall(&self, bus: &SignalBus) {
        bus.disconnect(Signal::WorkerProcessInit, WORKER_INIT_UID);
        bus.disconnect(Signal::WorkerProcessShutdown, WORKER_SHUTDOWN_UID);
        self.uninstrument(bus);
    }

    fn on_worker_init(&self, bus: &Weak<SignalBus>) {
        let Some(bus) = bus.upgrade() else {
            return;
        };
        let discarded = self.tracer.recorder().reset();
        self.instrument(&bus);
        info!(discarded, "worker process tracing initialized");
    }

    fn on_worker_shutdown(&self, bus: &Weak<SignalBus>) {
        let Some(bus) = bus.upgrade() else {
            return;
        };
        self.uninstrument(&bus);
        let closed = self.tracer.recorder().shutdown();
        info!(closed, "worker process tracing shut down");
    }
}
