//! The result-reporting boundary: an abstract message bus for structured
//! test lifecycle messages, and an aggregator collecting exceptions for
//! later flattening.

use std::sync::Arc;

use async_trait::async_trait;
use hostrun_utils::net_protocol::results::{ExceptionInfo, TestMessage};
use parking_lot::Mutex;

/// Sink for structured test lifecycle messages.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: TestMessage);
}

pub type SharedBus = Arc<dyn MessageBus>;

/// A bus that collects every published message.
///
/// Doubles as the buffer of the recycle-on-failure policy: the first attempt
/// of a recycle-enabled test publishes here, and the buffer is either
/// replayed unchanged onto the real bus or discarded wholesale.
#[derive(Default)]
pub struct CollectingBus {
    messages: Mutex<Vec<TestMessage>>,
}

impl CollectingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<TestMessage> {
        self.messages.lock().clone()
    }

    pub fn take(&self) -> Vec<TestMessage> {
        std::mem::take(&mut self.messages.lock())
    }

    pub fn has_failures(&self) -> bool {
        self.messages.lock().iter().any(TestMessage::is_failure)
    }

    /// Replays every buffered message onto `bus`, unchanged and in order,
    /// draining the buffer.
    pub async fn replay_onto(&self, bus: &SharedBus) {
        for message in self.take() {
            bus.publish(message).await;
        }
    }
}

#[async_trait]
impl MessageBus for CollectingBus {
    async fn publish(&self, message: TestMessage) {
        self.messages.lock().push(message);
    }
}

/// Collects exceptions raised across a run and flattens them into one.
#[derive(Default)]
pub struct ExceptionAggregator {
    exceptions: Mutex<Vec<ExceptionInfo>>,
}

impl ExceptionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, exception: ExceptionInfo) {
        self.exceptions.lock().push(exception);
    }

    pub fn clear(&self) {
        self.exceptions.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.exceptions.lock().is_empty()
    }

    /// Drains the collected exceptions into a single flattened value.
    pub fn flatten(&self) -> Option<ExceptionInfo> {
        ExceptionInfo::aggregate(std::mem::take(&mut self.exceptions.lock()))
    }
}
