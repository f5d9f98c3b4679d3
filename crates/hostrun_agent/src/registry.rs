//! The boundary to the underlying test-execution engine.
//!
//! The host-side bootstrap registers every runnable test here; the agent
//! resolves descriptors against this registry instead of reflecting over the
//! host's internals.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use hostrun_utils::net_protocol::descriptor::MethodRef;
use hostrun_utils::net_protocol::results::ExceptionInfo;

use crate::fixtures::Fixture;
use crate::trace::TraceWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed(ExceptionInfo),
    Skipped(String),
}

/// Everything a test invocation receives, threaded explicitly instead of
/// looked up from ambient state.
pub struct TestContext {
    pub args: Vec<serde_json::Value>,
    fixtures: HashMap<String, Arc<dyn Fixture>>,
    pub trace: TraceWriter,
}

impl TestContext {
    pub fn new(
        args: Vec<serde_json::Value>,
        fixtures: HashMap<String, Arc<dyn Fixture>>,
        trace: TraceWriter,
    ) -> Self {
        Self {
            args,
            fixtures,
            trace,
        }
    }

    pub fn fixture(&self, key: &str) -> Option<&Arc<dyn Fixture>> {
        self.fixtures.get(key)
    }
}

pub type TestFuture = BoxFuture<'static, TestOutcome>;
pub type TestFn = Arc<dyn Fn(TestContext) -> TestFuture + Send + Sync>;

pub struct TestEntry {
    /// Keys of the shared fixtures this test requires.
    pub fixtures: Vec<String>,
    pub run: TestFn,
}

#[derive(Default)]
pub struct TestRegistry {
    tests: HashMap<MethodRef, TestEntry>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: MethodRef, entry: TestEntry) {
        self.tests.insert(method, entry);
    }

    /// Convenience registration for a test without fixture requirements.
    pub fn test<F>(&mut self, suite: &str, name: &str, run: F)
    where
        F: Fn(TestContext) -> TestFuture + Send + Sync + 'static,
    {
        self.register(
            MethodRef::new(suite, name),
            TestEntry {
                fixtures: vec![],
                run: Arc::new(run),
            },
        );
    }

    pub fn resolve(&self, method: &MethodRef) -> Option<&TestEntry> {
        self.tests.get(method)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}
