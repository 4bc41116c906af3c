use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::code::{CodeBundle, EngineVersion};
use crate::collector::{DatapointCollector, NoopProgressReporter, ProgressReporter};
use crate::completion::CompletionSignal;
use crate::config::ExecutorConfig;
use crate::data::{DataType, RawData, RawResult, Value};
use crate::error::{BuildError, BuildResult};
use crate::execution_manager::ExecutionManager;
use crate::executor::GraphExecutor;
use crate::node::{
    CollectionFinisherNodeData, DatapointCollectorNodeData, DatapointNodeData,
    ExecutionQueryNodeData, Node, NodeData, NodeId, QueryProperty,
};
use crate::priority::{add_edge, prioritize, Edges};
use crate::runtime::{QueryRuntime, Schema};

#[derive(Debug, Clone)]
struct QueryRecord {
    code_bundle: Arc<CodeBundle>,
    required_props: HashMap<String, String>,
    resolved_props: HashMap<String, Value>,
}

/// Collects queries and datapoint requirements, then freezes them into a
/// [`GraphExecutor`].
pub struct GraphBuilder {
    queries: Vec<QueryRecord>,
    datapoint_types: HashMap<String, DataType>,
    collect_datapoints: Vec<String>,
    collectors: Vec<Arc<dyn DatapointCollector>>,
    progress_reporter: Arc<dyn ProgressReporter>,
    query_timeout: Duration,
    worker_count: usize,
    result_buffer: usize,
    engine_version: Option<EngineVersion>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::with_config(&ExecutorConfig::default())
    }

    pub fn with_config(config: &ExecutorConfig) -> Self {
        Self {
            queries: Vec::new(),
            datapoint_types: HashMap::new(),
            collect_datapoints: Vec::new(),
            collectors: Vec::new(),
            progress_reporter: Arc::new(NoopProgressReporter),
            query_timeout: config.query_timeout(),
            worker_count: config.resolved_worker_count(),
            result_buffer: config.result_buffer,
            engine_version: None,
        }
    }

    /// Registers a compiled query. `required_props` maps property names to
    /// the checksum producing them; properties already known go into
    /// `resolved_props` and add no dependency.
    pub fn add_query(
        &mut self,
        code_bundle: Arc<CodeBundle>,
        required_props: HashMap<String, String>,
        resolved_props: HashMap<String, Value>,
    ) {
        self.queries.push(QueryRecord {
            code_bundle,
            required_props,
            resolved_props,
        });
    }

    pub fn add_datapoint_type<S: Into<String>>(&mut self, checksum: S, data_type: DataType) {
        self.datapoint_types.insert(checksum.into(), data_type);
    }

    pub fn collect_datapoint<S: Into<String>>(&mut self, checksum: S) {
        self.collect_datapoints.push(checksum.into());
    }

    pub fn add_datapoint_collector(&mut self, collector: Arc<dyn DatapointCollector>) {
        self.collectors.push(collector);
    }

    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress_reporter = reporter;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    /// Queries requiring a newer engine are not run. Empty, `unstable` and
    /// unparseable versions disable the check.
    pub fn with_engine_version(mut self, version: &str) -> Self {
        let version = version.trim();
        self.engine_version = if version.is_empty() || version == "unstable" {
            None
        } else {
            match version.parse::<EngineVersion>() {
                Ok(version) => Some(version),
                Err(err) => {
                    warn!(%err, "engine version check disabled");
                    None
                }
            }
        };
        self
    }

    pub fn build<S: Into<String>>(
        self,
        schema: Schema,
        runtime: Arc<dyn QueryRuntime>,
        asset_id: S,
    ) -> BuildResult<GraphExecutor> {
        let asset_id = asset_id.into();

        // the last registration of a query id wins
        let mut seen = HashSet::new();
        let mut runnable = Vec::new();
        let mut unrunnable = Vec::new();
        for query in self.queries.iter().rev() {
            if !seen.insert(query.code_bundle.id.as_str()) {
                continue;
            }
            let checksums = query.code_bundle.codepoint_checksums().map_err(|source| {
                BuildError::InvalidCode {
                    query_id: query.code_bundle.id.clone(),
                    source,
                }
            })?;

            if query.code_bundle.can_run_on(self.engine_version.as_ref()) {
                runnable.push((query, checksums));
            } else {
                unrunnable.push((query, checksums));
            }
        }

        let execution_manager = ExecutionManager::new(
            runtime,
            schema,
            self.query_timeout,
            self.worker_count,
            runnable.len(),
            self.result_buffer,
        );
        let run_queue = execution_manager.run_queue();

        let mut edges = Edges::new();
        let mut datapoints: BTreeMap<NodeId, DatapointNodeData> = BTreeMap::new();
        let mut queries: Vec<(NodeId, ExecutionQueryNodeData)> = Vec::new();

        let ensure_datapoint = |datapoints: &mut BTreeMap<NodeId, DatapointNodeData>,
                                    checksum: &str| {
            let id = NodeId::from(checksum);
            datapoints.entry(id.clone()).or_insert_with(|| {
                DatapointNodeData::new(self.datapoint_types.get(checksum).copied())
            });
            id
        };

        for (query, checksums) in runnable.iter() {
            let query_id = NodeId::query(&query.code_bundle.id);

            let mut properties = BTreeMap::new();
            for (name, value) in query.resolved_props.iter() {
                let property = QueryProperty {
                    checksum: query.required_props.get(name).cloned(),
                    resolved: true,
                    value: Some(RawData::new(value.clone())),
                };
                properties.insert(name.clone(), property);
            }
            for (name, checksum) in query.required_props.iter() {
                if properties.contains_key(name) {
                    continue;
                }
                let datapoint = ensure_datapoint(&mut datapoints, checksum);
                add_edge(&mut edges, datapoint, query_id.clone());
                let property = QueryProperty {
                    checksum: Some(checksum.clone()),
                    ..Default::default()
                };
                properties.insert(name.clone(), property);
            }

            for checksum in checksums.iter() {
                let datapoint = ensure_datapoint(&mut datapoints, checksum);
                add_edge(&mut edges, query_id.clone(), datapoint);
            }

            let data = ExecutionQueryNodeData::new(
                query.code_bundle.id.clone(),
                Arc::clone(&query.code_bundle),
                properties,
                run_queue.clone(),
            );
            queries.push((query_id, data));
        }

        let produced: HashSet<&str> = runnable
            .iter()
            .flat_map(|(_, checksums)| checksums.iter().map(String::as_str))
            .collect();
        for (query, checksums) in unrunnable.iter() {
            let required = query
                .code_bundle
                .min_engine_version
                .as_deref()
                .unwrap_or_default();
            warn!(query_id = %query.code_bundle.id, required, "query requires a newer engine");

            let message = format!("unable to run query, engine version {required} required");
            for checksum in checksums.iter() {
                if produced.contains(checksum.as_str()) {
                    continue;
                }
                let datapoint = ensure_datapoint(&mut datapoints, checksum);
                if let Some(data) = datapoints.get_mut(&datapoint) {
                    data.report(RawResult::error(checksum.as_str(), message.as_str()));
                }
            }
        }

        let collector_id = NodeId::datapoint_collector();
        for checksum in self.collect_datapoints.iter() {
            let datapoint = ensure_datapoint(&mut datapoints, checksum);
            add_edge(&mut edges, datapoint, collector_id.clone());
        }

        let finisher_id = NodeId::collection_finisher();
        for datapoint in datapoints.keys() {
            add_edge(&mut edges, datapoint.clone(), finisher_id.clone());
        }

        let completion = CompletionSignal::new();
        let remaining: HashSet<NodeId> = datapoints.keys().cloned().collect();

        let mut nodes: HashMap<NodeId, Node> =
            HashMap::with_capacity(queries.len() + datapoints.len() + 2);
        for (id, data) in queries {
            nodes.insert(id.clone(), Node::new(id, NodeData::ExecutionQuery(data)));
        }
        for (id, data) in datapoints {
            nodes.insert(id.clone(), Node::new(id, NodeData::Datapoint(data)));
        }
        nodes.insert(
            collector_id.clone(),
            Node::new(
                collector_id,
                NodeData::DatapointCollector(DatapointCollectorNodeData::new(self.collectors)),
            ),
        );
        nodes.insert(
            finisher_id.clone(),
            Node::new(
                finisher_id.clone(),
                NodeData::CollectionFinisher(CollectionFinisherNodeData::new(
                    remaining,
                    self.progress_reporter,
                    completion.clone(),
                )),
            ),
        );

        let priorities = prioritize(nodes.keys(), &edges, Some(&finisher_id))?;

        debug!(
            %asset_id,
            nodes = nodes.len(),
            queries = runnable.len(),
            skipped_queries = unrunnable.len(),
            "reporting graph built"
        );

        Ok(GraphExecutor::new(
            asset_id,
            nodes,
            edges,
            priorities,
            execution_manager,
            completion,
        ))
    }
}
