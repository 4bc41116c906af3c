use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::code::CodeBundle;
use crate::collector::{DatapointCollector, ProgressReporter};
use crate::completion::CompletionSignal;
use crate::data::{DataType, RawData, RawResult};
use crate::execution_manager::{QueryOutcome, RunQueueItem};

pub const DATAPOINT_COLLECTOR_ID: &str = "__datapoint_collector__";
pub const COLLECTION_FINISHER_ID: &str = "__collection_finisher__";

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn query(query_id: &str) -> Self {
        Self(format!("{}/{}", NodeType::ExecutionQuery, query_id))
    }

    pub fn datapoint_collector() -> Self {
        Self::new(DATAPOINT_COLLECTOR_ID)
    }

    pub fn collection_finisher() -> Self {
        Self::new(COLLECTION_FINISHER_ID)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::borrow::Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
    ExecutionQuery,
    Datapoint,
    DatapointCollector,
    CollectionFinisher,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum QueryRunState {
    #[default]
    NotReady,
    Ready,
    Queued,
    Reported,
    Done,
    Failed,
}

impl QueryRunState {
    /// Whether the query has been handed to the execution manager.
    pub fn is_submitted(&self) -> bool {
        !matches!(self, QueryRunState::NotReady | QueryRunState::Ready)
    }
}

/// What a recalculated node hands to its children.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub result: Option<RawResult>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryProperty {
    pub checksum: Option<String>,
    pub resolved: bool,
    pub value: Option<RawData>,
}

#[derive(Debug)]
pub struct ExecutionQueryNodeData {
    pub query_id: String,
    pub code_bundle: Arc<CodeBundle>,
    pub required_properties: BTreeMap<String, QueryProperty>,
    pub run_state: QueryRunState,
    run_queue: mpsc::Sender<RunQueueItem>,
    abandoned: bool,
    invalidated: bool,
}

#[derive(Debug, Default)]
pub struct DatapointNodeData {
    pub expected_type: Option<DataType>,
    pub is_reported: bool,
    pub result: Option<RawResult>,
    invalidated: bool,
}

pub struct DatapointCollectorNodeData {
    pub collectors: Vec<Arc<dyn DatapointCollector>>,
    // sorted by checksum so sinks see a stable order
    pub unreported: BTreeMap<String, RawResult>,
}

pub struct CollectionFinisherNodeData {
    pub remaining_datapoints: HashSet<NodeId>,
    pub total_datapoints: usize,
    pub progress_reporter: Arc<dyn ProgressReporter>,
    pub completion: CompletionSignal,
    invalidated: bool,
}

pub enum NodeData {
    ExecutionQuery(ExecutionQueryNodeData),
    Datapoint(DatapointNodeData),
    DatapointCollector(DatapointCollectorNodeData),
    CollectionFinisher(CollectionFinisherNodeData),
}

/// A graph node. Topology is frozen after build; only the payload behind
/// the per-node lock changes while executing.
pub struct Node {
    id: NodeId,
    node_type: NodeType,
    data: Mutex<NodeData>,
}

impl Node {
    pub fn new(id: NodeId, data: NodeData) -> Self {
        Self {
            id,
            node_type: data.node_type(),
            data: Mutex::new(data),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn data(&self) -> MutexGuard<'_, NodeData> {
        self.data.lock()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .finish_non_exhaustive()
    }
}

impl NodeData {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeData::ExecutionQuery(_) => NodeType::ExecutionQuery,
            NodeData::Datapoint(_) => NodeType::Datapoint,
            NodeData::DatapointCollector(_) => NodeType::DatapointCollector,
            NodeData::CollectionFinisher(_) => NodeType::CollectionFinisher,
        }
    }

    /// Prepares the node for the first wave.
    pub fn initialize(&mut self) {
        match self {
            NodeData::ExecutionQuery(data) => data.invalidated = true,
            NodeData::Datapoint(data) => data.invalidated = data.is_reported,
            NodeData::DatapointCollector(_) => {}
            NodeData::CollectionFinisher(data) => data.invalidated = true,
        }
    }

    /// Folds a parent's output into this node's state.
    pub fn consume(&mut self, from: &NodeId, envelope: &Envelope) {
        match self {
            NodeData::ExecutionQuery(data) => data.consume(from, envelope),
            NodeData::Datapoint(_) => {}
            NodeData::DatapointCollector(data) => data.consume(from, envelope),
            NodeData::CollectionFinisher(data) => data.consume(from),
        }
    }

    /// Brings the node up to date. Returns what its children should consume,
    /// or `None` when nothing changed for them.
    pub fn recalculate(&mut self) -> Option<Envelope> {
        match self {
            NodeData::ExecutionQuery(data) => {
                data.recalculate();
                None
            }
            NodeData::Datapoint(data) => data.recalculate(),
            NodeData::DatapointCollector(data) => {
                data.recalculate();
                None
            }
            NodeData::CollectionFinisher(data) => {
                data.recalculate();
                None
            }
        }
    }
}

impl ExecutionQueryNodeData {
    pub fn new(
        query_id: String,
        code_bundle: Arc<CodeBundle>,
        required_properties: BTreeMap<String, QueryProperty>,
        run_queue: mpsc::Sender<RunQueueItem>,
    ) -> Self {
        Self {
            query_id,
            code_bundle,
            required_properties,
            run_state: QueryRunState::NotReady,
            run_queue,
            abandoned: false,
            invalidated: false,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.run_state,
            QueryRunState::Queued | QueryRunState::Reported
        )
    }

    /// Stops a query that never ran from ever being queued.
    pub fn abandon(&mut self) {
        if !self.run_state.is_submitted() {
            self.abandoned = true;
        }
    }

    pub fn unresolved_properties(&self) -> impl Iterator<Item = &str> {
        self.required_properties
            .iter()
            .filter(|(_, property)| !property.resolved)
            .map(|(name, _)| name.as_str())
    }

    fn consume(&mut self, from: &NodeId, envelope: &Envelope) {
        // runs once; later property updates are ignored
        if self.abandoned || self.run_state.is_submitted() {
            return;
        }
        let Some(result) = &envelope.result else {
            return;
        };

        for property in self.required_properties.values_mut() {
            if property.checksum.as_deref() == Some(from.as_str()) {
                property.value = Some(result.data.clone());
                property.resolved = true;
                self.invalidated = true;
            }
        }
    }

    fn recalculate(&mut self) {
        if !std::mem::take(&mut self.invalidated) {
            return;
        }

        if self.run_state == QueryRunState::NotReady
            && self.required_properties.values().all(|p| p.resolved)
        {
            self.run_state = QueryRunState::Ready;
        }
        if self.run_state == QueryRunState::Ready {
            self.submit();
        }
    }

    fn submit(&mut self) {
        let props: HashMap<String, RawData> = self
            .required_properties
            .iter()
            .map(|(name, property)| {
                let value = property.value.clone().unwrap_or_else(RawData::nil);
                (name.clone(), value)
            })
            .collect();

        let item = RunQueueItem {
            query_id: self.query_id.clone(),
            code_bundle: Arc::clone(&self.code_bundle),
            props,
        };

        match self.run_queue.try_send(item) {
            Ok(()) => {
                debug!(query_id = %self.query_id, "query queued");
                self.run_state = QueryRunState::Queued;
            }
            Err(err) => {
                error!(query_id = %self.query_id, %err, "failed to queue query");
                self.run_state = QueryRunState::Failed;
            }
        }
    }

    /// The runtime produced a result for this query.
    pub fn mark_reported(&mut self) {
        if self.run_state == QueryRunState::Queued {
            self.run_state = QueryRunState::Reported;
        }
    }

    pub fn finish(&mut self, outcome: &QueryOutcome) {
        if !self.run_state.is_submitted() {
            return;
        }
        self.run_state = match outcome {
            QueryOutcome::Completed => QueryRunState::Done,
            _ => QueryRunState::Failed,
        };
    }
}

impl DatapointNodeData {
    pub fn new(expected_type: Option<DataType>) -> Self {
        Self {
            expected_type,
            ..Default::default()
        }
    }

    /// Records the datapoint's result. Only the first report counts.
    /// Returns `false` when the datapoint had already been reported.
    pub fn report(&mut self, result: RawResult) -> bool {
        if self.is_reported {
            return false;
        }

        let result = match self.expected_type {
            Some(expected) => result.cast(expected),
            None => result,
        };
        if result.is_error() {
            debug!(checksum = %result.code_id, error = ?result.data.error, "datapoint failed");
        } else {
            debug!(checksum = %result.code_id, "datapoint finished");
        }

        self.result = Some(result);
        self.is_reported = true;
        self.invalidated = true;
        true
    }

    fn recalculate(&mut self) -> Option<Envelope> {
        if !std::mem::take(&mut self.invalidated) {
            return None;
        }
        Some(Envelope {
            result: self.result.clone(),
        })
    }
}

impl DatapointCollectorNodeData {
    pub fn new(collectors: Vec<Arc<dyn DatapointCollector>>) -> Self {
        Self {
            collectors,
            unreported: BTreeMap::new(),
        }
    }

    fn consume(&mut self, from: &NodeId, envelope: &Envelope) {
        if let Some(result) = &envelope.result {
            self.unreported
                .insert(from.as_str().to_string(), result.clone());
        }
    }

    fn recalculate(&mut self) {
        if self.unreported.is_empty() {
            return;
        }

        let results: Vec<RawResult> = std::mem::take(&mut self.unreported)
            .into_values()
            .collect();
        for collector in self.collectors.iter() {
            collector.sink_data(&results);
        }
    }
}

impl CollectionFinisherNodeData {
    pub fn new(
        remaining_datapoints: HashSet<NodeId>,
        progress_reporter: Arc<dyn ProgressReporter>,
        completion: CompletionSignal,
    ) -> Self {
        Self {
            total_datapoints: remaining_datapoints.len(),
            remaining_datapoints,
            progress_reporter,
            completion,
            invalidated: false,
        }
    }

    fn consume(&mut self, from: &NodeId) {
        if self.remaining_datapoints.remove(from) {
            self.invalidated = true;
        }
    }

    fn recalculate(&mut self) {
        if !std::mem::take(&mut self.invalidated) {
            return;
        }

        let remaining = self.remaining_datapoints.len();
        self.progress_reporter
            .progress(self.total_datapoints - remaining, self.total_datapoints);

        if remaining == 0 && self.completion.fire() {
            debug!(total = self.total_datapoints, "collection finished");
            self.progress_reporter.completed();
        }
    }
}
