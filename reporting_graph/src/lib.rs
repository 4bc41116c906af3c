pub mod builder;
pub mod code;
pub mod collector;
pub mod completion;
pub mod config;
pub mod data;
pub mod error;
pub mod execution_manager;
pub mod executor;
pub mod node;
pub mod priority;
pub mod runtime;

#[cfg(test)]
mod tests;

pub use builder::GraphBuilder;
pub use code::{CodeBundle, EngineVersion};
pub use collector::{DatapointCollector, FuncDatapointCollector, ProgressReporter};
pub use config::ExecutorConfig;
pub use data::{DataType, RawData, RawResult, Value};
pub use error::{BuildError, ExecutionError};
pub use execution_manager::{QueryOutcome, ResultSink};
pub use executor::{ExecutionStats, GraphExecutor};
pub use node::{NodeId, NodeType, QueryRunState};
pub use runtime::{FuncRuntime, QueryRuntime, RunRequest, Schema};
