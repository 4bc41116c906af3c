use std::collections::BinaryHeap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::completion::{CompletionSignal, CompletionWaiter};
use crate::data::RawResult;
use crate::error::{ExecutionError, ExecutionResult};
use crate::execution_manager::{ExecutionEvent, ExecutionManager};
use crate::node::{ExecutionQueryNodeData, Node, NodeData, NodeId, NodeType, QueryRunState};
use crate::priority::{Edges, PriorityMap};

const UNRESOLVED_MESSAGE: &str = "datapoint unresolved, query never ran";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub elapsed: Duration,
    pub waves: usize,
    pub reported_datapoints: usize,
    pub failed_datapoints: usize,
}

/// A frozen reporting graph for one asset. Driven to completion by
/// [`GraphExecutor::execute`], which may only be called once.
pub struct GraphExecutor {
    asset_id: String,
    nodes: HashMap<NodeId, Node>,
    edges: Edges,
    priorities: PriorityMap,
    execution_manager: ExecutionManager,
    completion: CompletionSignal,
}

impl GraphExecutor {
    pub(crate) fn new(
        asset_id: String,
        nodes: HashMap<NodeId, Node>,
        edges: Edges,
        priorities: PriorityMap,
        execution_manager: ExecutionManager,
        completion: CompletionSignal,
    ) -> Self {
        Self {
            asset_id,
            nodes,
            edges,
            priorities,
            execution_manager,
            completion,
        }
    }

    pub async fn execute(&self) -> ExecutionResult<ExecutionStats> {
        let Some(mut events) = self.execution_manager.take_events() else {
            return Err(ExecutionError::AlreadyExecuted);
        };

        let started = Instant::now();
        let idle_timeout = self.execution_manager.query_timeout();
        info!(asset_id = %self.asset_id, nodes = self.nodes.len(), "executing reporting graph");

        self.execution_manager.start();
        for node in self.nodes.values() {
            node.data().initialize();
        }
        self.run_wave(self.nodes.keys().cloned());
        let mut waves = 1;

        let mut batch = Vec::new();
        let result = loop {
            if self.completion.is_fired() && !self.has_in_flight_queries() {
                break Ok(());
            }

            let received = tokio::select! {
                event = events.recv() => Some(event),
                _ = tokio::time::sleep(idle_timeout) => None,
            };
            match received {
                Some(Some(event)) => {
                    batch.push(event);
                    while let Ok(event) = events.try_recv() {
                        batch.push(event);
                    }
                    self.process_events(batch.drain(..));
                    waves += 1;
                }
                Some(None) => break Err(ExecutionError::ResultChannelClosed),
                None => {
                    if self.fail_unresolved() {
                        waves += 1;
                    }
                }
            }
        };

        // closing the intake first so stopping workers never block on it
        drop(events);
        self.execution_manager.stop().await;
        result?;

        let (reported_datapoints, failed_datapoints) = self.count_datapoints();
        let stats = ExecutionStats {
            elapsed: started.elapsed(),
            waves,
            reported_datapoints,
            failed_datapoints,
        };
        info!(
            asset_id = %self.asset_id,
            elapsed = ?stats.elapsed,
            waves,
            reported_datapoints,
            failed_datapoints,
            "reporting graph finished"
        );

        Ok(stats)
    }

    /// Folds a batch of runtime events into the graph and runs one wave.
    pub(crate) fn process_events<I>(&self, events: I)
    where
        I: IntoIterator<Item = ExecutionEvent>,
    {
        let mut reported = Vec::new();

        for event in events {
            match event {
                ExecutionEvent::Result { query_id, result } => {
                    self.with_query(&query_id, |query| query.mark_reported());

                    let id = NodeId::new(result.code_id.as_str());
                    if self.report_datapoint(&id, result) {
                        reported.push(id);
                    }
                }
                ExecutionEvent::QueryFinished { query_id, outcome } => {
                    debug!(%query_id, ?outcome, "query finished");
                    self.with_query(&query_id, |query| query.finish(&outcome));
                }
            }
        }

        self.run_wave(reported);
    }

    fn has_in_flight_queries(&self) -> bool {
        self.nodes.values().any(|node| match &*node.data() {
            NodeData::ExecutionQuery(query) => query.is_in_flight(),
            _ => false,
        })
    }

    fn with_query<F>(&self, query_id: &str, f: F)
    where
        F: FnOnce(&mut ExecutionQueryNodeData),
    {
        if let Some(node) = self.nodes.get(&NodeId::query(query_id)) {
            if let NodeData::ExecutionQuery(query) = &mut *node.data() {
                f(query);
            }
        }
    }

    fn report_datapoint(&self, id: &NodeId, result: RawResult) -> bool {
        let Some(node) = self.nodes.get(id) else {
            warn!(checksum = %id, "result for a datapoint outside the graph");
            return false;
        };
        match &mut *node.data() {
            NodeData::Datapoint(datapoint) => datapoint.report(result),
            _ => false,
        }
    }

    /// Recalculates everything reachable from `start`, highest priority
    /// first. Each node is recalculated at most once per wave.
    fn run_wave<I>(&self, start: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut queue: BinaryHeap<(i64, NodeId)> = BinaryHeap::new();
        let mut queued: HashSet<NodeId> = HashSet::new();

        for id in start {
            if queued.insert(id.clone()) {
                queue.push((self.priority(&id).unwrap_or_default(), id));
            }
        }

        while let Some((_, id)) = queue.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let Some(envelope) = node.data().recalculate() else {
                continue;
            };
            let Some(children) = self.edges.get(&id) else {
                continue;
            };

            for child in children.iter() {
                if let Some(child_node) = self.nodes.get(child) {
                    child_node.data().consume(&id, &envelope);
                }
                if queued.insert(child.clone()) {
                    queue.push((self.priority(child).unwrap_or_default(), child.clone()));
                }
            }
        }
    }

    /// Fails every datapoint still waiting for a result once no query is in
    /// flight. Submitted queries report through their own timeout in the
    /// execution manager, so this never races a query waiting for a worker.
    fn fail_unresolved(&self) -> bool {
        if self.has_in_flight_queries() {
            debug!(asset_id = %self.asset_id, "idle, waiting for queries in flight");
            return false;
        }

        for node in self.nodes.values() {
            if let NodeData::ExecutionQuery(query) = &mut *node.data() {
                query.abandon();
            }
        }

        let mut failed = Vec::new();
        for (id, node) in self.nodes.iter() {
            let mut data = node.data();
            let NodeData::Datapoint(datapoint) = &mut *data else {
                continue;
            };
            if datapoint.is_reported {
                continue;
            }

            datapoint.report(RawResult::error(id.as_str(), UNRESOLVED_MESSAGE));
            failed.push(id.clone());
        }

        if failed.is_empty() {
            return false;
        }
        warn!(
            asset_id = %self.asset_id,
            failed = failed.len(),
            "no results within the query timeout, failing unresolved datapoints"
        );
        self.run_wave(failed);
        true
    }

    fn count_datapoints(&self) -> (usize, usize) {
        let mut reported = 0;
        let mut failed = 0;
        for node in self.nodes.values() {
            if let NodeData::Datapoint(datapoint) = &*node.data() {
                if let Some(result) = &datapoint.result {
                    reported += 1;
                    if result.is_error() {
                        failed += 1;
                    }
                }
            }
        }
        (reported, failed)
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn edges(&self) -> &Edges {
        &self.edges
    }

    pub fn children(&self, id: &NodeId) -> &[NodeId] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn priority(&self, id: &NodeId) -> Option<i64> {
        self.priorities.get(id).copied()
    }

    pub fn completion(&self) -> CompletionWaiter {
        self.completion.waiter()
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_fired()
    }

    /// Every reported datapoint, ordered by checksum.
    pub fn results(&self) -> Vec<RawResult> {
        let mut results: Vec<RawResult> = self
            .nodes
            .values()
            .filter_map(|node| match &*node.data() {
                NodeData::Datapoint(datapoint) => datapoint.result.clone(),
                _ => None,
            })
            .collect();
        results.sort_by(|a, b| a.code_id.cmp(&b.code_id));
        results
    }

    pub fn datapoint(&self, checksum: &str) -> Option<RawResult> {
        let node = self.nodes.get(checksum)?;
        match &*node.data() {
            NodeData::Datapoint(datapoint) => datapoint.result.clone(),
            _ => None,
        }
    }

    pub fn query_state(&self, query_id: &str) -> Option<QueryRunState> {
        let node = self.nodes.get(&NodeId::query(query_id))?;
        match &*node.data() {
            NodeData::ExecutionQuery(query) => Some(query.run_state),
            _ => None,
        }
    }

    /// Graphviz rendering for debugging.
    pub fn to_dot(&self) -> String {
        let mut ids: Vec<&NodeId> = self.nodes.keys().collect();
        ids.sort();

        let mut dot = String::new();
        let _ = writeln!(dot, "digraph {:?} {{", self.asset_id);
        for id in ids.iter() {
            let node_type = self.nodes[*id].node_type();
            let shape = match node_type {
                NodeType::ExecutionQuery => "box",
                NodeType::Datapoint => "ellipse",
                NodeType::DatapointCollector | NodeType::CollectionFinisher => "doubleoctagon",
            };
            let priority = match self.priority(id) {
                Some(i64::MIN) => "min".to_string(),
                Some(priority) => priority.to_string(),
                None => "-".to_string(),
            };
            let _ = writeln!(
                dot,
                "  {:?} [shape={shape}, label=\"{}\\n{node_type} p={priority}\"];",
                id.as_str(),
                id.as_str().escape_default(),
            );
        }
        for id in ids.iter() {
            for child in self.children(id) {
                let _ = writeln!(dot, "  {:?} -> {:?};", id.as_str(), child.as_str());
            }
        }
        dot.push_str("}\n");
        dot
    }
}
