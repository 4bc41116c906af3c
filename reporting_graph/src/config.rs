use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Executor settings, typically loaded from YAML or JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// How long the runtime gets to report every datapoint of one query.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Concurrent query executions. 0 = available parallelism.
    #[serde(default)]
    pub worker_count: usize,
    /// Capacity of the result intake.
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
}

fn default_query_timeout_secs() -> u64 {
    5 * 60
}

fn default_result_buffer() -> usize {
    128
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_query_timeout_secs(),
            worker_count: 0,
            result_buffer: default_result_buffer(),
        }
    }
}

impl ExecutorConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        common::serde::deserialize_file(path)
    }

    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_else(|err| {
            tracing::debug!(path, %err, "using default executor config");
            Self::default()
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_count
        }
    }
}
