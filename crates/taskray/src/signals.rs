//! Task lifecycle signals and the bus that dispatches them.
//!
//! A worker host emits a [`TaskEvent`] at each point of a task's life; the
//! [`SignalBus`] hands it synchronously to every receiver connected for that
//! [`Signal`]. Receivers are keyed by a dispatch uid, which makes
//! `connect`/`disconnect` idempotent set operations.
//!
//! ## Ordering
//! The host guarantees, per execution context:
//! - `TaskPrerun` precedes the matching `TaskPostrun`
//! - `BeforeTaskPublish` precedes the matching `AfterTaskPublish`
//! - `TaskFailure` and `TaskRetry` fire between prerun and postrun
//!
//! ## Isolation
//! A panicking receiver is caught and logged; the remaining receivers still
//! run and the emitting task never sees the panic.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use taskray_recorder::StackFrame;
use tracing::error;

/// Message headers and bodies as they travel through the broker.
pub type Headers = serde_json::Map<String, serde_json::Value>;

/// Key a receiver is registered under.
pub type DispatchUid = &'static str;

/// Classification of task lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// A worker process (or thread standing in for one) started.
    WorkerProcessInit,
    /// A worker process is about to exit.
    WorkerProcessShutdown,
    /// A task is about to execute.
    TaskPrerun,
    /// A task finished executing, successfully or not.
    TaskPostrun,
    /// A task message is about to be sent to the broker.
    BeforeTaskPublish,
    /// A task message was handed to the broker.
    AfterTaskPublish,
    /// A task raised.
    TaskFailure,
    /// A task asked to be retried.
    TaskRetry,
}

impl Signal {
    /// Signal name as the host documents it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerProcessInit => "worker_process_init",
            Self::WorkerProcessShutdown => "worker_process_shutdown",
            Self::TaskPrerun => "task_prerun",
            Self::TaskPostrun => "task_postrun",
            Self::BeforeTaskPublish => "before_task_publish",
            Self::AfterTaskPublish => "after_task_publish",
            Self::TaskFailure => "task_failure",
            Self::TaskRetry => "task_retry",
        }
    }
}

/// Request context of an executing task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task id from the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Headers of the message the task was delivered in.
    #[serde(default)]
    pub headers: Headers,
}

/// The task a prerun event is about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Registered task name (e.g. `polls.tasks.add`).
    pub name: String,

    #[serde(default)]
    pub request: TaskRequest,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>, request: TaskRequest) -> Self {
        Self {
            name: name.into(),
            request,
        }
    }
}

/// Exception details carried by a failure event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Exception type name.
    pub kind: String,

    pub message: String,

    /// Traceback of the failing task, innermost frame first. May be empty.
    #[serde(default)]
    pub traceback: Vec<StackFrame>,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<StackFrame>) -> Self {
        self.traceback = traceback;
        self
    }
}

/// Payload of a signal. Optional fields mirror what a partial event may omit.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    WorkerProcessInit,

    WorkerProcessShutdown,

    TaskPrerun {
        sender: Option<TaskInfo>,
        task_id: Option<String>,
    },

    TaskPostrun {
        task_id: Option<String>,
    },

    /// Receivers may rewrite `headers`; the host sends whatever they leave.
    BeforeTaskPublish {
        sender: Option<String>,
        headers: Headers,
        body: Headers,
    },

    AfterTaskPublish {
        sender: Option<String>,
    },

    TaskFailure {
        task_id: Option<String>,
        einfo: Option<ExceptionInfo>,
    },

    TaskRetry {
        reason: Option<String>,
    },
}

impl TaskEvent {
    /// The signal this event is emitted on.
    pub fn signal(&self) -> Signal {
        match self {
            Self::WorkerProcessInit => Signal::WorkerProcessInit,
            Self::WorkerProcessShutdown => Signal::WorkerProcessShutdown,
            Self::TaskPrerun { .. } => Signal::TaskPrerun,
            Self::TaskPostrun { .. } => Signal::TaskPostrun,
            Self::BeforeTaskPublish { .. } => Signal::BeforeTaskPublish,
            Self::AfterTaskPublish { .. } => Signal::AfterTaskPublish,
            Self::TaskFailure { .. } => Signal::TaskFailure,
            Self::TaskRetry { .. } => Signal::TaskRetry,
        }
    }

    /// Prerun event for `task`.
    pub fn prerun(task: TaskInfo, task_id: impl Into<String>) -> Self {
        Self::TaskPrerun {
            sender: Some(task),
            task_id: Some(task_id.into()),
        }
    }

    /// Before-publish event for a message about to be sent.
    pub fn before_publish(task_name: impl Into<String>, headers: Headers, body: Headers) -> Self {
        Self::BeforeTaskPublish {
            sender: Some(task_name.into()),
            headers,
            body,
        }
    }
}

/// Handles events for the signals it is connected to.
pub trait Receiver: Send + Sync {
    fn receive(&self, event: &mut TaskEvent);
}

impl<F> Receiver for F
where
    F: Fn(&mut TaskEvent) + Send + Sync,
{
    fn receive(&self, event: &mut TaskEvent) {
        self(event)
    }
}

struct Registration {
    uid: DispatchUid,
    receiver: Arc<dyn Receiver>,
}

/// Registry of receivers per signal.
#[derive(Default)]
pub struct SignalBus {
    receivers: RwLock<HashMap<Signal, Vec<Registration>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `receiver` to `signal` under `uid`.
    ///
    /// Returns `false` (and keeps the existing receiver) if `uid` is already
    /// connected to `signal`.
    pub fn connect(&self, signal: Signal, uid: DispatchUid, receiver: Arc<dyn Receiver>) -> bool {
        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        let registrations = receivers.entry(signal).or_default();
        if registrations.iter().any(|r| r.uid == uid) {
            return false;
        }
        registrations.push(Registration { uid, receiver });
        true
    }

    /// Disconnect the receiver registered under `uid`. Returns whether one was.
    pub fn disconnect(&self, signal: Signal, uid: DispatchUid) -> bool {
        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(registrations) = receivers.get_mut(&signal) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.uid != uid);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            receivers.remove(&signal);
        }
        removed
    }

    pub fn is_connected(&self, signal: Signal, uid: DispatchUid) -> bool {
        self.receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&signal)
            .is_some_and(|regs| regs.iter().any(|r| r.uid == uid))
    }

    /// Number of receivers connected to `signal`.
    pub fn receiver_count(&self, signal: Signal) -> usize {
        self.receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&signal)
            .map_or(0, Vec::len)
    }

    /// Number of receivers across all signals.
    pub fn len(&self) -> usize {
        self.receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch `event` to every receiver of its signal, in connection order.
    ///
    /// The registry lock is released before receivers run, so a receiver may
    /// connect or disconnect others. Returns the number of receivers invoked.
    pub fn send(&self, event: &mut TaskEvent) -> usize {
        let signal = event.signal();
        let targets: Vec<(DispatchUid, Arc<dyn Receiver>)> = self
            .receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&signal)
            .map(|regs| {
                regs.iter()
                    .map(|r| (r.uid, Arc::clone(&r.receiver)))
                    .collect()
            })
            .unwrap_or_default();

        for (uid, receiver) in &targets {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| receiver.receive(event)));
            if outcome.is_err() {
                error!(signal = signal.name(), receiver = *uid, "signal receiver panicked");
            }
        }
        targets.len()
    }
}
