//! Knobs for retry budgets, timeouts and parallelism.

use std::time::Duration;

use crate::debugger;

/// Retry budgets for bringing a host session up.
///
/// Retries count on top of the first attempt: a budget of 1 yields two
/// attempts in total. The sleep between attempts grows linearly: after
/// attempt `k`, the next attempt waits `base_retry_sleep * k`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries for launching the host process and seeing it become ready.
    pub process_start_retries: usize,
    /// Retries for connecting the channel and getting a `Ping` answered.
    pub remote_connection_retries: usize,
    pub base_retry_sleep: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            process_start_retries: 3,
            remote_connection_retries: 3,
            base_retry_sleep: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    /// Upper bound on a single start attempt, wrapping the controller's
    /// otherwise unbounded readiness polling.
    pub start_timeout: Duration,
    /// Upper bound on accepting the agent's dial-back for one attempt.
    pub connect_timeout: Duration,
    /// Whether a debugger is attached to the orchestrating process.
    pub debugger_attached: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            start_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            debugger_attached: debugger::debugger_attached(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrency across host-bound collections. Raised at run time to at
    /// least the number of distinct installed host versions, and forced to 1
    /// when a debugger is attached.
    pub max_parallelism: usize,
    pub client: ClientConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: num_cpus::get(),
            client: ClientConfig::default(),
        }
    }
}
