//! Scripted controller/channel fakes for exercising client and scheduler
//! policy without real host processes.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hostrun_utils::atomic;
use hostrun_utils::net_protocol::descriptor::{MethodRef, TestCaseDescriptor, TestFlags};
use hostrun_utils::net_protocol::results::{ExceptionInfo, RunResult, TestMessage};
use parking_lot::Mutex;

use crate::bus::SharedBus;
use crate::controller::{ConnectError, HostController};
use crate::transport::{AgentChannel, ChannelError};

pub(crate) fn fast_client_config() -> crate::config::ClientConfig {
    crate::config::ClientConfig {
        retry: crate::config::RetryPolicy {
            process_start_retries: 1,
            remote_connection_retries: 2,
            base_retry_sleep: Duration::from_millis(1),
        },
        start_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        debugger_attached: false,
    }
}

pub(crate) fn descriptor(suite: &str, name: &str, flags: TestFlags) -> TestCaseDescriptor {
    descriptor_with_timeout(suite, name, flags, Duration::from_secs(30))
}

pub(crate) fn descriptor_with_timeout(
    suite: &str,
    name: &str,
    flags: TestFlags,
    timeout: Duration,
) -> TestCaseDescriptor {
    TestCaseDescriptor::new(
        MethodRef::new(suite, name),
        "17.2",
        "Exp",
        timeout,
        flags,
        vec![],
    )
}

/// Scripted behavior for a single remote run.
#[derive(Clone, Copy, Debug)]
pub(crate) enum RunScript {
    Pass,
    Fail,
    /// Never completes; exercises the timeout and cancellation paths.
    Hang,
    /// The channel dies mid-run.
    Drop,
}

pub(crate) struct Span {
    pub label: String,
    pub enter: Instant,
    pub exit: Instant,
}

pub(crate) type SpanLog = Arc<Mutex<Vec<Span>>>;

pub(crate) struct FakeHarness {
    pub label: String,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub pings: AtomicUsize,
    pub runs: AtomicUsize,
    pub start_succeeds: AtomicBool,
    /// Number of upcoming pings that fail before one succeeds.
    pub failing_pings: AtomicUsize,
    pub scripts: Mutex<VecDeque<RunScript>>,
    pub run_delay: Duration,
    pub span_log: SpanLog,
}

impl FakeHarness {
    pub fn new(scripts: Vec<RunScript>) -> Arc<Self> {
        Arc::new(Self {
            label: "17.2/Exp".to_string(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            start_succeeds: AtomicBool::new(true),
            failing_pings: AtomicUsize::new(0),
            scripts: Mutex::new(scripts.into()),
            run_delay: Duration::ZERO,
            span_log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn with_label(scripts: Vec<RunScript>, label: &str, span_log: SpanLog) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            start_succeeds: AtomicBool::new(true),
            failing_pings: AtomicUsize::new(0),
            scripts: Mutex::new(scripts.into()),
            run_delay: Duration::from_millis(20),
            span_log,
        })
    }

    pub fn controller(self: &Arc<Self>) -> Box<dyn HostController> {
        Box::new(FakeController {
            harness: Arc::clone(self),
            started: false,
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(atomic::ORDERING)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(atomic::ORDERING)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(atomic::ORDERING)
    }
}

struct FakeController {
    harness: Arc<FakeHarness>,
    started: bool,
}

#[async_trait]
impl HostController for FakeController {
    fn describe(&self) -> String {
        self.harness.label.clone()
    }

    async fn start(&mut self) -> bool {
        self.harness.starts.fetch_add(1, atomic::ORDERING);
        if self.harness.start_succeeds.load(atomic::ORDERING) {
            self.started = true;
            true
        } else {
            false
        }
    }

    fn is_started(&self) -> bool {
        self.started
    }

    async fn connect(&mut self) -> Result<Box<dyn AgentChannel>, ConnectError> {
        if !self.started {
            return Err(ConnectError::NotStarted);
        }
        Ok(Box::new(FakeChannel {
            harness: Arc::clone(&self.harness),
        }))
    }

    async fn stop(&mut self) {
        self.harness.stops.fetch_add(1, atomic::ORDERING);
        self.started = false;
    }
}

struct FakeChannel {
    harness: Arc<FakeHarness>,
}

fn lost() -> ChannelError {
    ChannelError::ConnectionLost(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "scripted connection loss",
    ))
}

#[async_trait]
impl AgentChannel for FakeChannel {
    async fn ping(&mut self) -> Result<(), ChannelError> {
        self.harness.pings.fetch_add(1, atomic::ORDERING);
        let failing = &self.harness.failing_pings;
        if failing.load(atomic::ORDERING) > 0 {
            failing.fetch_sub(1, atomic::ORDERING);
            return Err(lost());
        }
        Ok(())
    }

    async fn run(
        &mut self,
        descriptor: &TestCaseDescriptor,
        bus: SharedBus,
    ) -> Result<RunResult, ChannelError> {
        self.harness.runs.fetch_add(1, atomic::ORDERING);
        let script = self
            .harness
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(RunScript::Pass);

        let id = descriptor.id().clone();
        let enter = Instant::now();
        bus.publish(TestMessage::TestStarting { id: id.clone() }).await;

        if !self.harness.run_delay.is_zero() {
            tokio::time::sleep(self.harness.run_delay).await;
        }

        let result = match script {
            RunScript::Pass => {
                bus.publish(TestMessage::TestPassed {
                    id: id.clone(),
                    elapsed_ms: 5,
                    output: None,
                })
                .await;
                Ok(RunResult {
                    total: 1,
                    failed: 0,
                    skipped: 0,
                    elapsed_ms: 5,
                    exception: None,
                })
            }
            RunScript::Fail => {
                let exception = ExceptionInfo::new("panic", "scripted failure");
                bus.publish(TestMessage::TestFailed {
                    id: id.clone(),
                    elapsed_ms: 5,
                    exception: exception.clone(),
                    output: None,
                })
                .await;
                Ok(RunResult {
                    total: 1,
                    failed: 1,
                    skipped: 0,
                    elapsed_ms: 5,
                    exception: Some(exception),
                })
            }
            RunScript::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            RunScript::Drop => Err(lost()),
        };

        if result.is_ok() {
            bus.publish(TestMessage::TestFinished {
                id,
                elapsed_ms: 5,
            })
            .await;
        }

        self.harness.span_log.lock().push(Span {
            label: self.harness.label.clone(),
            enter,
            exit: Instant::now(),
        });

        result
    }

    async fn dispose(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}
