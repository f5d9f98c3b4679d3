//! Orchestration of test execution inside live host application processes.
//!
//! The orchestrator discovers or launches a host process bound to a
//! (version, isolation-profile) pair, establishes a control channel to the
//! agent injected into it, ships test cases across for remote execution, and
//! relays results back into the consuming framework's reporting stream,
//! recycling host processes on crashes, hangs and timeouts along the way.

pub mod binding;
pub mod bus;
pub mod client;
pub mod config;
pub mod controller;
pub mod debugger;
pub mod locator;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use bus::{CollectingBus, ExceptionAggregator, MessageBus, SharedBus};
pub use client::ExecutionClient;
pub use config::{ClientConfig, RetryPolicy, SchedulerConfig};
pub use controller::{HostConfig, HostController, ProcessHostController};
pub use scheduler::{CollectionScheduler, TestCollection};
