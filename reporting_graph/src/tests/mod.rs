
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::code::{Block, CodeBundle};
use crate::collector::{DatapointCollector, ProgressReporter};
use crate::data::{RawData, RawResult};
use crate::execution_manager::ResultSink;
use crate::runtime::{FuncRuntime, QueryRuntime, RunRequest, RuntimeFuture};

pub(crate) const BUNDLES_PATH: &str = "../test_resources/reporting_bundles.yaml";

pub(crate) fn load_bundles() -> anyhow::Result<HashMap<String, Arc<CodeBundle>>> {
    let bundles: Vec<CodeBundle> = common::serde::deserialize_file(BUNDLES_PATH)?;
    Ok(bundles
        .into_iter()
        .map(|bundle| (bundle.id.clone(), Arc::new(bundle)))
        .collect())
}

/// A bundle whose single block declares the given checksums.
pub(crate) fn bundle(id: &str, entrypoints: &[&str], datapoints: &[&str]) -> Arc<CodeBundle> {
    let mut checksums = HashMap::new();
    let mut block = Block::default();
    for (code_ref, checksum) in entrypoints.iter().chain(datapoints).enumerate() {
        let code_ref = code_ref as u64 + 1;
        checksums.insert(code_ref, checksum.to_string());
        if (code_ref as usize) <= entrypoints.len() {
            block.entrypoints.push(code_ref);
        } else {
            block.datapoints.push(code_ref);
        }
    }

    Arc::new(CodeBundle {
        id: id.to_string(),
        checksums,
        blocks: vec![block],
        ..Default::default()
    })
}

pub(crate) fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(name, checksum)| (name.to_string(), checksum.to_string()))
        .collect()
}

/// Reports every checksum of every query: the configured value, or `true`.
pub(crate) fn echo_runtime(
    values: HashMap<String, RawData>,
    requests: Arc<Mutex<Vec<RunRequest>>>,
) -> Arc<dyn QueryRuntime> {
    let values = Arc::new(values);
    Arc::new(FuncRuntime::new(
        move |request: RunRequest, sink: ResultSink| -> RuntimeFuture<'static> {
            requests.lock().push(request.clone());
            let values = Arc::clone(&values);
            Box::pin(async move {
                for checksum in request.code_bundle.codepoint_checksums()? {
                    let data = values
                        .get(&checksum)
                        .cloned()
                        .unwrap_or_else(|| RawData::bool(true));
                    sink.send_data(checksum, data).await;
                }
                Ok(())
            })
        },
    ))
}

/// Accepts queries and never reports anything.
pub(crate) fn silent_runtime() -> Arc<dyn QueryRuntime> {
    Arc::new(FuncRuntime::new(
        |_request: RunRequest, _sink: ResultSink| -> RuntimeFuture<'static> {
            Box::pin(async move { Ok(()) })
        },
    ))
}

/// Echoes like [`echo_runtime`], except that `hung` queries never report and
/// `slow` ones report after `delay`. Tracks how many queries run at once.
#[derive(Default)]
pub(crate) struct StagedRuntime {
    pub hung: Vec<&'static str>,
    pub slow: Vec<&'static str>,
    pub delay: Duration,
    pub values: HashMap<String, RawData>,
    pub requests: Mutex<Vec<RunRequest>>,
    pub active: Mutex<usize>,
    pub max_active: Mutex<usize>,
}

impl StagedRuntime {
    pub fn ran(&self, query_id: &str) -> Option<RunRequest> {
        self.requests
            .lock()
            .iter()
            .find(|request| request.query_id == query_id)
            .cloned()
    }
}

impl QueryRuntime for StagedRuntime {
    fn run(&self, request: RunRequest, sink: ResultSink) -> RuntimeFuture<'_> {
        Box::pin(async move {
            self.requests.lock().push(request.clone());
            if self.hung.contains(&request.query_id.as_str()) {
                return pending::<anyhow::Result<()>>().await;
            }

            {
                let mut active = self.active.lock();
                *active += 1;
                let mut max_active = self.max_active.lock();
                *max_active = (*max_active).max(*active);
            }
            if self.slow.contains(&request.query_id.as_str()) {
                tokio::time::sleep(self.delay).await;
            }
            *self.active.lock() -= 1;

            for checksum in request.code_bundle.codepoint_checksums()? {
                let data = self
                    .values
                    .get(&checksum)
                    .cloned()
                    .unwrap_or_else(|| RawData::bool(true));
                sink.send_data(checksum, data).await;
            }
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingCollector {
    pub batches: Mutex<Vec<Vec<RawResult>>>,
}

impl RecordingCollector {
    pub fn collected(&self) -> Vec<RawResult> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl DatapointCollector for RecordingCollector {
    fn sink_data(&self, results: &[RawResult]) {
        self.batches.lock().push(results.to_vec());
    }
}

#[derive(Default)]
pub(crate) struct RecordingReporter {
    pub progress: Mutex<Vec<(usize, usize)>>,
    pub completed: Mutex<usize>,
}

impl ProgressReporter for RecordingReporter {
    fn progress(&self, current: usize, total: usize) {
        self.progress.lock().push((current, total));
    }

    fn completed(&self) {
        *self.completed.lock() += 1;
    }
}
