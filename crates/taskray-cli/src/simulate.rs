//! In-process producer and worker pool driven through the signal bus.
//!
//! Every participant stands in for a separate process: it owns a recorder, a
//! signal bus and an instrumentor, and receives `worker_process_init` before
//! doing any work. Only the emitter is shared. Task messages travel between
//! them over channels, carrying the headers the producer's publish handlers
//! left behind.
//!
//! Recorder state is keyed by thread, so each participant runs on a blocking
//! thread for its whole life rather than hopping between async tasks.

use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use taskray::{
    ExceptionInfo, Headers, Instrumentor, SignalBus, TaskEvent, TaskInfo, TaskRequest, TaskTracer,
};
use taskray_recorder::{
    Emitter, Recorder, RecorderConfig, RecorderStats, SamplingDecision, StackFrame,
};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Name of the task the simulated producer publishes.
pub const TASK_NAME: &str = "tasks.add";

/// Parameters of one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub tasks: usize,
    pub workers: usize,
    /// Every n-th task raises. `None` or `Some(0)` never fails.
    pub fail_every: Option<usize>,
    /// Every n-th task asks to be retried before finishing.
    pub retry_every: Option<usize>,
    pub recorder: RecorderConfig,
}

/// Outcome of a simulation run.
#[derive(Debug, Default)]
pub struct SimulationReport {
    pub published: usize,
    pub executed: usize,
    pub failures: usize,
    pub retries: usize,
    /// Begin/end counts summed over every participant.
    pub stats: RecorderStats,
}

/// A task message as it sits on the broker.
#[derive(Debug)]
struct TaskMessage {
    id: String,
    headers: Headers,
}

#[derive(Debug, Default)]
struct WorkerTally {
    executed: usize,
    failures: usize,
    retries: usize,
}

/// A participant's tracing setup, as a worker process would build it at boot.
struct Participant {
    recorder: Arc<Recorder>,
    bus: Arc<SignalBus>,
}

impl Participant {
    fn boot(config: &RecorderConfig, emitter: &Arc<dyn Emitter>) -> Self {
        let recorder = Arc::new(Recorder::new(config.clone(), Arc::clone(emitter)));
        let tracer = Arc::new(TaskTracer::new(Arc::clone(&recorder)));
        let instrumentor = Arc::new(Instrumentor::new(tracer));

        let bus = Arc::new(SignalBus::new());
        instrumentor.install(&bus);
        bus.send(&mut TaskEvent::WorkerProcessInit);
        Self { recorder, bus }
    }

    fn shutdown(self) -> RecorderStats {
        self.bus.send(&mut TaskEvent::WorkerProcessShutdown);
        self.recorder.stats()
    }
}

/// Run the simulation, emitting every sampled segment to `emitter`.
pub async fn run(options: SimulationOptions, emitter: Arc<dyn Emitter>) -> Result<SimulationReport> {
    let workers = options.workers.max(1);
    let (senders, inboxes): (Vec<_>, Vec<_>) =
        (0..workers).map(|_| mpsc::channel::<TaskMessage>()).unzip();

    // Queued ahead of the workers so a saturated blocking pool still runs it;
    // channels are unbounded, so it never waits on a worker.
    let producer = {
        let config = options.recorder.clone();
        let emitter = Arc::clone(&emitter);
        let tasks = options.tasks;
        tokio::task::spawn_blocking(move || produce(tasks, senders, &config, &emitter))
    };

    let handles: Vec<JoinHandle<(WorkerTally, RecorderStats)>> = inboxes
        .into_iter()
        .enumerate()
        .map(|(index, rx)| {
            let config = options.recorder.clone();
            let emitter = Arc::clone(&emitter);
            let fail_every = options.fail_every;
            let retry_every = options.retry_every;
            tokio::task::spawn_blocking(move || {
                consume(index, rx, &config, &emitter, fail_every, retry_every)
            })
        })
        .collect();

    let (published, producer_stats) = producer.await.context("producer thread panicked")??;
    let mut report = SimulationReport {
        published,
        stats: producer_stats,
        ..SimulationReport::default()
    };

    for handle in handles {
        let (tally, stats) = handle.await.context("worker thread panicked")?;
        report.executed += tally.executed;
        report.failures += tally.failures;
        report.retries += tally.retries;
        report.stats = merge(report.stats, stats);
    }

    info!(
        published = report.published,
        executed = report.executed,
        failures = report.failures,
        retries = report.retries,
        "simulation finished"
    );
    Ok(report)
}

fn produce(
    tasks: usize,
    senders: Vec<mpsc::Sender<TaskMessage>>,
    config: &RecorderConfig,
    emitter: &Arc<dyn Emitter>,
) -> Result<(usize, RecorderStats)> {
    let producer = Participant::boot(config, emitter);
    producer
        .recorder
        .begin_segment("simulate.producer", None, None, SamplingDecision::Unknown);

    let mut published = 0;
    for n in 0..tasks {
        let id = uuid::Uuid::new_v4().to_string();
        let headers = publish(&producer.bus, &id, n)?;
        let worker = &senders[n % senders.len()];
        worker
            .send(TaskMessage { id, headers })
            .context("worker stopped before the producer finished")?;
        published += 1;
    }

    producer
        .recorder
        .end_segment()
        .context("producer segment was closed early")?;
    drop(senders);
    Ok((published, producer.shutdown()))
}

/// Fire the publish signals for one message and return the headers it leaves with.
fn publish(bus: &SignalBus, id: &str, n: usize) -> Result<Headers> {
    let mut headers = Headers::new();
    headers.insert("id".to_string(), Value::from(id));
    headers.insert("task".to_string(), Value::from(TASK_NAME));
    let mut body = Headers::new();
    body.insert("id".to_string(), Value::from(id));
    body.insert("args".to_string(), json!([n, n]));

    let mut event = TaskEvent::before_publish(TASK_NAME, headers, body);
    bus.send(&mut event);
    bus.send(&mut TaskEvent::AfterTaskPublish {
        sender: Some(TASK_NAME.to_string()),
    });

    match event {
        TaskEvent::BeforeTaskPublish { headers, .. } => Ok(headers),
        other => anyhow::bail!("publish event changed to {:?}", other.signal()),
    }
}

fn consume(
    index: usize,
    rx: mpsc::Receiver<TaskMessage>,
    config: &RecorderConfig,
    emitter: &Arc<dyn Emitter>,
    fail_every: Option<usize>,
    retry_every: Option<usize>,
) -> (WorkerTally, RecorderStats) {
    let worker = Participant::boot(config, emitter);
    let mut tally = WorkerTally::default();

    for message in rx {
        tally.executed += 1;
        let n = tally.executed;
        debug!(worker = index, task_id = %message.id, "executing task");

        let request = TaskRequest {
            id: Some(message.id.clone()),
            headers: message.headers,
        };
        worker
            .bus
            .send(&mut TaskEvent::prerun(TaskInfo::new(TASK_NAME, request), &message.id));

        if hits(retry_every, n) {
            tally.retries += 1;
            worker.bus.send(&mut TaskEvent::TaskRetry {
                reason: Some(format!("simulated retry on worker {index}")),
            });
        }
        if hits(fail_every, n) {
            tally.failures += 1;
            let einfo = ExceptionInfo::new("SimulatedFailure", format!("task {} failed", message.id))
                .with_traceback(vec![
                    StackFrame::new("add").with_location("tasks.py", 12),
                    StackFrame::new("run").with_location("worker.py", 88),
                ]);
            worker.bus.send(&mut TaskEvent::TaskFailure {
                task_id: Some(message.id.clone()),
                einfo: Some(einfo),
            });
        }

        worker.bus.send(&mut TaskEvent::TaskPostrun {
            task_id: Some(message.id),
        });
    }

    (tally, worker.shutdown())
}

fn hits(every: Option<usize>, n: usize) -> bool {
    every.is_some_and(|every| every > 0 && n % every == 0)
}

fn merge(a: RecorderStats, b: RecorderStats) -> RecorderStats {
    RecorderStats {
        segments_begun: a.segments_begun + b.segments_begun,
        segments_ended: a.segments_ended + b.segments_ended,
        subsegments_begun: a.subsegments_begun + b.subsegments_begun,
        subsegments_ended: a.subsegments_ended + b.subsegments_ended,
    }
}
