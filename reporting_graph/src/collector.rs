use std::fmt;
use std::sync::Arc;

use crate::data::RawResult;

/// Receives collected datapoints. Called from the recalculation path, so
/// implementations should hand work off rather than block.
pub trait DatapointCollector: Send + Sync {
    fn sink_data(&self, results: &[RawResult]);
}

pub trait ProgressReporter: Send + Sync {
    fn progress(&self, current: usize, total: usize);
    fn completed(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressReporter;

impl ProgressReporter for NoopProgressReporter {
    fn progress(&self, _current: usize, _total: usize) {}
    fn completed(&self) {}
}

pub trait SinkFn: Fn(&[RawResult]) + Send + Sync + 'static {}

impl<T> SinkFn for T where T: Fn(&[RawResult]) + Send + Sync + 'static {}

/// Closure-backed collector.
#[derive(Clone)]
pub struct FuncDatapointCollector {
    lambda: Arc<dyn SinkFn>,
}

impl FuncDatapointCollector {
    pub fn new<F>(lambda: F) -> Self
    where
        F: SinkFn,
    {
        Self {
            lambda: Arc::new(lambda),
        }
    }
}

impl DatapointCollector for FuncDatapointCollector {
    fn sink_data(&self, results: &[RawResult]) {
        (self.lambda)(results)
    }
}

impl fmt::Debug for FuncDatapointCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncDatapointCollector").finish()
    }
}
