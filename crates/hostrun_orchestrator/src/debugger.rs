//! Debug-attach affordances.
//!
//! When a debugger drives the orchestrating process, it advertises its main
//! window through an ambient environment hint. After launching a host, the
//! controller offers that same debugger the new process; failure to attach is
//! logged and never fatal.

use std::time::Duration;

/// Ambient hint left by an attached debugger: an identifier of its main
/// window, used to find the debugger instance again for the host process.
pub static HOSTRUN_DEBUGGER_WINDOW: &str = "HOSTRUN_DEBUGGER_WINDOW";

/// Whether a debugger is attached to the orchestrating process.
pub fn debugger_attached() -> bool {
    std::env::var_os(HOSTRUN_DEBUGGER_WINDOW).is_some()
}

/// Capability: attach the debugger identified by `main_window_hint` to the
/// process `pid`. Platform shims implement this; the core never inspects
/// debugger internals.
pub trait DebuggerAttach: Send + Sync {
    fn attach_to(&self, pid: u32, main_window_hint: &str) -> anyhow::Result<()>;
}

/// Offers `pid` to the ambient debugger, retrying with exponentially growing
/// backoff. Never fails; gives up quietly after `max_attempts`.
pub async fn try_attach(
    debugger: &dyn DebuggerAttach,
    pid: u32,
    max_attempts: usize,
    base_delay: Duration,
) {
    let hint = match std::env::var(HOSTRUN_DEBUGGER_WINDOW) {
        Ok(hint) => hint,
        Err(_) => return,
    };

    let mut delay = base_delay;
    for attempt in 1..=max_attempts {
        match debugger.attach_to(pid, &hint) {
            Ok(()) => {
                tracing::info!(pid, attempt, "attached debugger to host process");
                return;
            }
            Err(error) => {
                tracing::warn!(pid, attempt, %error, "could not attach debugger to host process");
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}
