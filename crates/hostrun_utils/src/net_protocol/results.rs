//! Results and report messages produced by the in-host agent.
//!
//! Everything here crosses the process boundary by value: no live object
//! references, no open handles. The richer reporting types of the consuming
//! test framework are reconstructed on the orchestrator side.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use super::descriptor::TestId;

/// A serializable rendition of an error or panic raised inside the host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    /// Coarse classification, e.g. "panic", "fixture", "infrastructure".
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub backtrace: Option<String>,
    /// Inner exceptions, when this is an aggregate.
    #[serde(default)]
    pub inner: Vec<ExceptionInfo>,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: None,
            inner: Vec::new(),
        }
    }

    /// Converts a panic payload (from `catch_unwind`) into a structured value.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::new("panic", message)
    }

    /// Flattens many exceptions into one. One exception is returned as-is;
    /// several are wrapped in an aggregate carrying them all.
    pub fn aggregate(mut exceptions: Vec<ExceptionInfo>) -> Option<ExceptionInfo> {
        match exceptions.len() {
            0 => None,
            1 => Some(exceptions.pop().unwrap()),
            n => Some(Self {
                kind: "aggregate".to_string(),
                message: format!("{n} errors occurred"),
                backtrace: None,
                inner: exceptions,
            }),
        }
    }
}

impl std::fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for inner in &self.inner {
            write!(f, "\n  - {inner}")?;
        }
        Ok(())
    }
}

/// Flat summary of one remote test execution, as returned by the agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub total: u64,
    pub failed: u64,
    pub skipped: u64,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub exception: Option<ExceptionInfo>,
}

impl RunResult {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Structured test lifecycle messages, the vocabulary of the result-reporting
/// boundary. Produced inside the host, relayed onto the orchestrator's
/// message bus.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum TestMessage {
    TestStarting {
        id: TestId,
    },
    TestPassed {
        id: TestId,
        elapsed_ms: u64,
        /// Diagnostic trace output captured during the run, when non-empty.
        #[serde(default)]
        output: Option<String>,
    },
    TestFailed {
        id: TestId,
        elapsed_ms: u64,
        exception: ExceptionInfo,
        #[serde(default)]
        output: Option<String>,
    },
    TestSkipped {
        id: TestId,
        reason: String,
    },
    TestFinished {
        id: TestId,
        elapsed_ms: u64,
    },
    Diagnostic {
        message: String,
    },
}

impl TestMessage {
    pub fn is_failure(&self) -> bool {
        matches!(self, TestMessage::TestFailed { .. })
    }
}

/// Additive run totals. Collection summaries sum into an assembly-level
/// summary; order of summation is irrelevant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: u64,
    pub failed: u64,
    pub skipped: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn add(&mut self, other: RunSummary) {
        self.total += other.total;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.elapsed += other.elapsed;
    }

    /// Summary of a single test that failed before it could run.
    pub fn single_failure(elapsed: Duration) -> Self {
        Self {
            total: 1,
            failed: 1,
            skipped: 0,
            elapsed,
        }
    }
}

impl From<&RunResult> for RunSummary {
    fn from(result: &RunResult) -> Self {
        Self {
            total: result.total,
            failed: result.failed,
            skipped: result.skipped,
            elapsed: result.elapsed(),
        }
    }
}
