//! In-host logging for the agent.
//!
//! The agent cannot write to the orchestrating process's stderr, so when the
//! launch environment names a log directory, a non-blocking file appender is
//! installed instead.

use hostrun_utils::net_protocol::agent::HOSTRUN_AGENT_LOG;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Installs a file-backed tracing subscriber when [HOSTRUN_AGENT_LOG] is set.
/// Returns the guard keeping the background writer alive; hold it for the
/// lifetime of the agent.
pub fn init_from_env() -> Option<WorkerGuard> {
    let dir = std::env::var(HOSTRUN_AGENT_LOG).ok()?;

    let appender = tracing_appender::rolling::daily(dir, "hostrun-agent.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(guard)
}
