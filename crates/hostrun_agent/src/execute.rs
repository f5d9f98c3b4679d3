//! Execution of a single test case inside the host process.
//!
//! Each run is a pipeline over an explicit context: resolve the registry
//! entry, resolve shared fixtures, invoke (on the UI thread when asked),
//! report the lifecycle sequence, and fold everything into a flat
//! [RunResult]. Nothing escapes across the process boundary unstructured.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use hostrun_utils::net_protocol::descriptor::TestCaseDescriptor;
use hostrun_utils::net_protocol::results::{ExceptionInfo, RunResult, TestMessage};
use tokio::sync::mpsc;

use crate::dispatcher::{DispatchError, DispatchPriority, UiDispatcher};
use crate::fixtures::FixtureRegistry;
use crate::registry::{TestContext, TestOutcome, TestRegistry};
use crate::trace::TraceBuffer;

pub struct ExecutionEnv<'a> {
    pub registry: &'a TestRegistry,
    pub fixtures: &'a FixtureRegistry,
    pub dispatcher: &'a UiDispatcher,
    pub trace: &'a TraceBuffer,
    /// Upper bound on UI-thread waits. Set when a debugger is attached to the
    /// orchestrator; unbounded (cooperative) otherwise.
    pub ui_wait_bound: Option<Duration>,
}

/// Runs exactly one test case, streaming lifecycle events into `events`.
pub async fn run_one(
    env: ExecutionEnv<'_>,
    descriptor: &TestCaseDescriptor,
    events: &mpsc::Sender<TestMessage>,
) -> RunResult {
    let id = descriptor.id().clone();
    let started = Instant::now();

    let _ = events
        .send(TestMessage::TestStarting { id: id.clone() })
        .await;

    let outcome = invoke(&env, descriptor).await;
    let elapsed = started.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;

    // The trace buffer is drained whatever the outcome; output captured here
    // must never surface attached to a later test.
    let output = env.trace.drain();

    let (message, result) = match outcome {
        TestOutcome::Passed => (
            TestMessage::TestPassed {
                id: id.clone(),
                elapsed_ms,
                output,
            },
            RunResult {
                total: 1,
                failed: 0,
                skipped: 0,
                elapsed_ms,
                exception: None,
            },
        ),
        TestOutcome::Failed(exception) => (
            TestMessage::TestFailed {
                id: id.clone(),
                elapsed_ms,
                exception: exception.clone(),
                output,
            },
            RunResult {
                total: 1,
                failed: 1,
                skipped: 0,
                elapsed_ms,
                exception: Some(exception),
            },
        ),
        TestOutcome::Skipped(reason) => (
            TestMessage::TestSkipped {
                id: id.clone(),
                reason,
            },
            RunResult {
                total: 1,
                failed: 0,
                skipped: 1,
                elapsed_ms,
                exception: None,
            },
        ),
    };

    let _ = events.send(message).await;
    let _ = events
        .send(TestMessage::TestFinished { id, elapsed_ms })
        .await;

    result
}

async fn invoke(env: &ExecutionEnv<'_>, descriptor: &TestCaseDescriptor) -> TestOutcome {
    let entry = match env.registry.resolve(&descriptor.method) {
        Some(entry) => entry,
        None => {
            return TestOutcome::Failed(ExceptionInfo::new(
                "registry",
                format!("no test registered for {}", descriptor.method),
            ))
        }
    };

    let fixtures = match env.fixtures.resolve_all(&entry.fixtures) {
        Ok(fixtures) => fixtures,
        Err(e) => return TestOutcome::Failed(e),
    };

    let context = TestContext::new(descriptor.args.clone(), fixtures, env.trace.writer());
    let test_future = (entry.run)(context);

    if descriptor.flags.run_on_ui_thread {
        let dispatched = env
            .dispatcher
            .invoke(DispatchPriority::Background, env.ui_wait_bound, move || {
                // The dispatcher thread is single-purpose; drive the test to
                // completion right here so it is truly UI-affine.
                std::panic::catch_unwind(AssertUnwindSafe(|| {
                    futures::executor::block_on(test_future)
                }))
            })
            .await;

        match dispatched {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => TestOutcome::Failed(ExceptionInfo::from_panic(panic)),
            Err(DispatchError::Timeout(limit)) => TestOutcome::Failed(ExceptionInfo::new(
                "dispatch",
                format!("UI-thread execution did not complete within {limit:?}"),
            )),
            Err(DispatchError::Stopped) => TestOutcome::Failed(ExceptionInfo::new(
                "dispatch",
                "the host's UI dispatcher has stopped",
            )),
        }
    } else {
        match AssertUnwindSafe(test_future).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => TestOutcome::Failed(ExceptionInfo::from_panic(panic)),
        }
    }
}
