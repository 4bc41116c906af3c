use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::code::CodeBundle;
use crate::data::RawData;
use crate::execution_manager::ResultSink;

/// Resource schema handed through to the runtime untouched.
#[derive(Clone)]
pub struct Schema(Arc<dyn Any + Send + Sync>);

impl Schema {
    pub fn new<T: Any + Send + Sync>(schema: T) -> Self {
        Self(Arc::new(schema))
    }

    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub query_id: String,
    pub code_bundle: Arc<CodeBundle>,
    pub props: HashMap<String, RawData>,
    pub schema: Schema,
}

pub type RuntimeFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Executes compiled queries against an asset.
///
/// Results are streamed into the sink, one per checksum. The returned future
/// may resolve before every result is sent if the runtime keeps working in
/// the background; the execution manager waits for the remaining checksums
/// until the query timeout. An `Err` fails every checksum not reported yet.
pub trait QueryRuntime: Send + Sync + 'static {
    fn run(&self, request: RunRequest, sink: ResultSink) -> RuntimeFuture<'_>;
}

pub trait RuntimeFn:
    Fn(RunRequest, ResultSink) -> RuntimeFuture<'static> + Send + Sync + 'static
{
}

impl<T> RuntimeFn for T where
    T: Fn(RunRequest, ResultSink) -> RuntimeFuture<'static> + Send + Sync + 'static
{
}

/// Closure-backed runtime.
#[derive(Clone)]
pub struct FuncRuntime {
    lambda: Arc<dyn RuntimeFn>,
}

impl FuncRuntime {
    pub fn new<F>(lambda: F) -> Self
    where
        F: RuntimeFn,
    {
        Self {
            lambda: Arc::new(lambda),
        }
    }
}

impl QueryRuntime for FuncRuntime {
    fn run(&self, request: RunRequest, sink: ResultSink) -> RuntimeFuture<'_> {
        (self.lambda)(request, sink)
    }
}

impl fmt::Debug for FuncRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncRuntime").finish()
    }
}
