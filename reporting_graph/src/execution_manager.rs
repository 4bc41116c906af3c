use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use common::{Shared, WaitGroup};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::code::CodeBundle;
use crate::data::{RawData, RawResult};
use crate::runtime::{QueryRuntime, RunRequest, Schema};

/// A query whose properties are all resolved, waiting for a worker.
#[derive(Debug, Clone)]
pub struct RunQueueItem {
    pub query_id: String,
    pub code_bundle: Arc<CodeBundle>,
    pub props: HashMap<String, RawData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Completed,
    RuntimeFailed(String),
    TimedOut,
    Cancelled,
}

impl QueryOutcome {
    fn failure_message(&self) -> String {
        match self {
            QueryOutcome::RuntimeFailed(message) => format!("query execution failed: {message}"),
            QueryOutcome::TimedOut => "query execution timed out".to_string(),
            QueryOutcome::Completed | QueryOutcome::Cancelled => {
                "query execution cancelled".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExecutionEvent {
    Result {
        query_id: String,
        result: RawResult,
    },
    QueryFinished {
        query_id: String,
        outcome: QueryOutcome,
    },
}

/// Handed to the runtime for one query execution. Accepts exactly one
/// result per expected checksum; anything else, or anything arriving after
/// the query timed out, is dropped.
#[derive(Clone)]
pub struct ResultSink {
    query_id: String,
    pending: Arc<Mutex<HashSet<String>>>,
    wait_group: WaitGroup,
    events: mpsc::Sender<ExecutionEvent>,
}

impl ResultSink {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn is_pending(&self, checksum: &str) -> bool {
        self.pending.lock().contains(checksum)
    }

    /// Returns `true` if the result was accepted and delivered. Intake
    /// capacity is reserved before the checksum leaves `pending`, so a send
    /// cancelled by the query timeout still gets its failure synthesized.
    pub async fn send(&self, result: RawResult) -> bool {
        if !self.is_pending(&result.code_id) {
            trace!(query_id = %self.query_id, checksum = %result.code_id, "dropping unexpected result");
            return false;
        }

        let permit = self.events.reserve().await.ok();
        if !self.pending.lock().remove(&result.code_id) {
            trace!(query_id = %self.query_id, checksum = %result.code_id, "dropping late result");
            return false;
        }

        let checksum = result.code_id.clone();
        let delivered = match permit {
            Some(permit) => {
                permit.send(ExecutionEvent::Result {
                    query_id: self.query_id.clone(),
                    result,
                });
                true
            }
            None => false,
        };
        self.wait_group.done(&checksum);

        delivered
    }

    pub async fn send_data<S: Into<String>>(&self, checksum: S, data: RawData) -> bool {
        self.send(RawResult::new(checksum, data)).await
    }
}

impl fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSink")
            .field("query_id", &self.query_id)
            .finish_non_exhaustive()
    }
}

struct WorkerContext {
    runtime: Arc<dyn QueryRuntime>,
    schema: Schema,
    query_timeout: Duration,
    events: mpsc::Sender<ExecutionEvent>,
    in_flight: Mutex<HashMap<String, WaitGroup>>,
}

/// The only component that talks to the runtime. Owns the bounded run queue
/// fed by query nodes and the result intake drained by the executor.
pub struct ExecutionManager {
    context: Arc<WorkerContext>,
    worker_count: usize,
    run_queue: mpsc::Sender<RunQueueItem>,
    run_rx: Mutex<Option<mpsc::Receiver<RunQueueItem>>>,
    events_rx: Mutex<Option<mpsc::Receiver<ExecutionEvent>>>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionManager {
    pub fn new(
        runtime: Arc<dyn QueryRuntime>,
        schema: Schema,
        query_timeout: Duration,
        worker_count: usize,
        query_count: usize,
        result_buffer: usize,
    ) -> Self {
        let (run_queue, run_rx) = mpsc::channel(query_count.max(1));
        let (events, events_rx) = mpsc::channel(result_buffer.max(1));
        let (stop_tx, _) = watch::channel(false);

        Self {
            context: Arc::new(WorkerContext {
                runtime,
                schema,
                query_timeout,
                events,
                in_flight: Mutex::new(HashMap::new()),
            }),
            worker_count: worker_count.clamp(1, query_count.max(1)),
            run_queue,
            run_rx: Mutex::new(Some(run_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            stop_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.context.query_timeout
    }

    pub fn run_queue(&self) -> mpsc::Sender<RunQueueItem> {
        self.run_queue.clone()
    }

    pub(crate) fn take_events(&self) -> Option<mpsc::Receiver<ExecutionEvent>> {
        self.events_rx.lock().take()
    }

    /// Spawns the workers. Does nothing when already started.
    pub fn start(&self) {
        let Some(run_rx) = self.run_rx.lock().take() else {
            return;
        };
        let run_rx = Shared::new(run_rx);

        let mut workers = self.workers.lock();
        for _ in 0..self.worker_count {
            let context = Arc::clone(&self.context);
            let run_rx = run_rx.clone();
            let stop_rx = self.stop_tx.subscribe();
            workers.push(tokio::spawn(worker_loop(context, run_rx, stop_rx)));
        }
        debug!(workers = workers.len(), "execution manager started");
    }

    /// Cancels in-flight queries and joins the workers.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        for wait_group in self.context.in_flight.lock().values() {
            wait_group.decommission();
        }

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                error!(%err, "execution worker failed");
            }
        }
    }
}

impl Drop for ExecutionManager {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
    }
}

async fn worker_loop(
    context: Arc<WorkerContext>,
    run_rx: Shared<mpsc::Receiver<RunQueueItem>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
            item = async { run_rx.lock().await.recv().await } => item,
        };
        let Some(item) = item else { break };

        run_query(&context, item, &mut stop_rx).await;
    }
}

async fn run_query(
    context: &WorkerContext,
    item: RunQueueItem,
    stop_rx: &mut watch::Receiver<bool>,
) {
    let RunQueueItem {
        query_id,
        code_bundle,
        props,
    } = item;

    let checksums: HashSet<String> = match code_bundle.codepoint_checksums() {
        Ok(checksums) => checksums.into_iter().collect(),
        Err(err) => {
            error!(%query_id, %err, "cannot execute query");
            send_finished(context, query_id, QueryOutcome::RuntimeFailed(err.to_string())).await;
            return;
        }
    };

    let wait_group = WaitGroup::new();
    for checksum in checksums.iter() {
        wait_group.add(checksum.as_str());
    }
    let pending = Arc::new(Mutex::new(checksums));
    context
        .in_flight
        .lock()
        .insert(query_id.clone(), wait_group.clone());

    let sink = ResultSink {
        query_id: query_id.clone(),
        pending: Arc::clone(&pending),
        wait_group: wait_group.clone(),
        events: context.events.clone(),
    };
    let request = RunRequest {
        query_id: query_id.clone(),
        code_bundle,
        props,
        schema: context.schema.clone(),
    };

    debug!(%query_id, "executing query");
    let run = async {
        context.runtime.run(request, sink).await?;
        wait_group.wait().await;
        anyhow::Ok(())
    };

    let outcome = tokio::select! {
        result = tokio::time::timeout(context.query_timeout, run) => match result {
            Ok(Ok(())) if wait_group.stats().num_active == 0 => QueryOutcome::Completed,
            Ok(Ok(())) => QueryOutcome::Cancelled,
            Ok(Err(err)) => QueryOutcome::RuntimeFailed(format!("{err:#}")),
            Err(_) => QueryOutcome::TimedOut,
        },
        _ = stop_rx.wait_for(|stopped| *stopped) => QueryOutcome::Cancelled,
    };

    // late results from a runtime still working in the background become no-ops
    wait_group.decommission();
    context.in_flight.lock().remove(&query_id);

    let mut unreported: Vec<String> = pending.lock().drain().collect();
    unreported.sort();

    match &outcome {
        QueryOutcome::Completed => debug!(%query_id, "query completed"),
        QueryOutcome::RuntimeFailed(message) => {
            warn!(%query_id, %message, unreported = unreported.len(), "query failed")
        }
        QueryOutcome::TimedOut => {
            warn!(%query_id, timeout = ?context.query_timeout, unreported = unreported.len(), "query timed out")
        }
        QueryOutcome::Cancelled => debug!(%query_id, "query cancelled"),
    }

    if !unreported.is_empty() {
        let message = outcome.failure_message();
        for checksum in unreported {
            let event = ExecutionEvent::Result {
                query_id: query_id.clone(),
                result: RawResult::error(checksum, message.as_str()),
            };
            if context.events.send(event).await.is_err() {
                return;
            }
        }
    }

    send_finished(context, query_id, outcome).await;
}

async fn send_finished(context: &WorkerContext, query_id: String, outcome: QueryOutcome) {
    let event = ExecutionEvent::QueryFinished { query_id, outcome };
    if context.events.send(event).await.is_err() {
        trace!("result intake closed");
    }
}
