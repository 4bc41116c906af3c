use thiserror::Error;

use crate::code::CodeError;
use crate::node::NodeId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Invalid compiled code for query {query_id:?}")]
    InvalidCode {
        query_id: String,
        #[source]
        source: CodeError,
    },
    #[error("Cycle detected while prioritizing the graph at node {node_id}")]
    CycleDetected { node_id: NodeId },
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Graph executor has already been executed")]
    AlreadyExecuted,
    #[error("Result channel closed before all datapoints were reported")]
    ResultChannelClosed,
}

pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;
