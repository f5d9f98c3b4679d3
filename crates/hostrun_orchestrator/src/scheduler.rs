//! Fans discovered test cases out to per-collection execution clients.
//!
//! Descriptors are grouped by (version, profile), or isolated under a
//! unique key when they demand a fresh host instance, and every collection
//! runs its tests strictly sequentially against its own client, while
//! distinct collections run concurrently under a bounded semaphore.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hostrun_utils::error::{AnyError, ErrorLocation};
use hostrun_utils::here;
use hostrun_utils::net_protocol::descriptor::{CollectionKey, TestCaseDescriptor};
use hostrun_utils::net_protocol::results::{RunSummary, TestMessage};
use tokio::sync::{watch, Semaphore};

use crate::bus::{ExceptionAggregator, SharedBus};
use crate::client::ExecutionClient;
use crate::config::SchedulerConfig;
use crate::locator::HostLocator;

/// One group of descriptors bound to a single host session.
#[derive(Clone, Debug)]
pub struct TestCollection {
    pub key: CollectionKey,
    pub descriptors: Vec<TestCaseDescriptor>,
}

/// User-overridable ordering of collections before execution.
pub trait CollectionOrderer: Send + Sync {
    fn order(&self, collections: Vec<TestCollection>) -> Result<Vec<TestCollection>, AnyError>;
}

/// The default: stable, as discovered.
pub struct DiscoveryOrderer;

impl CollectionOrderer for DiscoveryOrderer {
    fn order(&self, collections: Vec<TestCollection>) -> Result<Vec<TestCollection>, AnyError> {
        Ok(collections)
    }
}

/// The underlying framework's single-process path, for plain tests not bound
/// to any host version.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn run_local(
        &self,
        descriptor: &TestCaseDescriptor,
        bus: &SharedBus,
        aggregator: &ExceptionAggregator,
    ) -> RunSummary;
}

/// Builds the execution client for one collection.
pub trait ClientFactory: Send + Sync {
    fn create(&self, key: &CollectionKey) -> ExecutionClient;
}

impl<F> ClientFactory for F
where
    F: Fn(&CollectionKey) -> ExecutionClient + Send + Sync,
{
    fn create(&self, key: &CollectionKey) -> ExecutionClient {
        self(key)
    }
}

/// A fresh cancellation channel for [CollectionScheduler::run].
pub fn cancellation_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub struct CollectionScheduler {
    factory: Arc<dyn ClientFactory>,
    orderer: Arc<dyn CollectionOrderer>,
    local: Option<Arc<dyn LocalExecutor>>,
    locator: Option<Arc<dyn HostLocator>>,
    config: SchedulerConfig,
}

impl CollectionScheduler {
    pub fn new(factory: Arc<dyn ClientFactory>, config: SchedulerConfig) -> Self {
        Self {
            factory,
            orderer: Arc::new(DiscoveryOrderer),
            local: None,
            locator: None,
            config,
        }
    }

    pub fn with_orderer(mut self, orderer: Arc<dyn CollectionOrderer>) -> Self {
        self.orderer = orderer;
        self
    }

    pub fn with_local_executor(mut self, local: Arc<dyn LocalExecutor>) -> Self {
        self.local = Some(local);
        self
    }

    /// Lets the scheduler raise its parallelism to the number of distinct
    /// installed host versions, so no version is starved.
    pub fn with_locator(mut self, locator: Arc<dyn HostLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Partitions descriptors into collections, preserving discovery order.
    pub fn partition(cases: Vec<TestCaseDescriptor>) -> Vec<TestCollection> {
        let mut order: Vec<CollectionKey> = Vec::new();
        let mut groups: HashMap<CollectionKey, Vec<TestCaseDescriptor>> = HashMap::new();

        for descriptor in cases {
            let key = CollectionKey::for_descriptor(&descriptor);
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(descriptor);
        }

        order
            .into_iter()
            .map(|key| {
                let descriptors = groups.remove(&key).unwrap_or_default();
                TestCollection { key, descriptors }
            })
            .collect()
    }

    fn parallelism(&self) -> usize {
        if self.config.client.debugger_attached {
            // Many hosts at once make interactive debugging hopeless.
            return 1;
        }
        let installed = self
            .locator
            .as_ref()
            .map(|locator| locator.installed_versions().len())
            .unwrap_or(0);
        self.config.max_parallelism.max(installed).max(1)
    }

    /// Runs every descriptor: plain tests first through the local path, then
    /// all host-bound collections, concurrently across collections and
    /// strictly sequentially within each. The returned summary is the pure
    /// sum over collections; a cancelled collection contributes nothing.
    pub async fn run(
        &self,
        cases: Vec<TestCaseDescriptor>,
        bus: SharedBus,
        aggregator: Arc<ExceptionAggregator>,
        cancel: watch::Receiver<bool>,
    ) -> RunSummary {
        let (plain, hosted): (Vec<_>, Vec<_>) =
            cases.into_iter().partition(|case| !case.is_host_bound());

        let mut summary = RunSummary::default();

        for descriptor in &plain {
            if *cancel.borrow() {
                break;
            }
            summary.add(self.run_plain(descriptor, &bus, &aggregator).await);
        }

        let collections = Self::partition(hosted);
        let collections = match self.orderer.order(collections.clone()) {
            Ok(ordered) => ordered,
            Err(error) => {
                tracing::warn!(%error, "collection orderer failed; running unordered");
                collections
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.parallelism()));
        let mut tasks = Vec::with_capacity(collections.len());

        for collection in collections {
            let factory = Arc::clone(&self.factory);
            let bus = Arc::clone(&bus);
            let aggregator = Arc::clone(&aggregator);
            let semaphore = Arc::clone(&semaphore);
            let mut cancel = cancel.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };

                let mut client = factory.create(&collection.key);
                let mut collection_summary = RunSummary::default();
                let mut cancelled = false;

                for descriptor in &collection.descriptors {
                    if *cancel.borrow() {
                        cancelled = true;
                        break;
                    }
                    tokio::select! {
                        summary = client.run(descriptor, &bus, &aggregator) => {
                            collection_summary.add(summary);
                        }
                        _ = cancelled_signal(&mut cancel) => {
                            cancelled = true;
                            break;
                        }
                    }
                }

                // Disposal runs whether the collection completed, failed, or
                // was cancelled mid-run.
                client.dispose().await;

                if cancelled {
                    tracing::debug!(collection = %collection.key, "collection cancelled");
                    None
                } else {
                    Some(collection_summary)
                }
            }));
        }

        for task in tasks {
            match task.await {
                Ok(Some(collection_summary)) => summary.add(collection_summary),
                Ok(None) => {}
                Err(error) => {
                    let located = error.located(here!());
                    tracing::error!(error = %located, "collection task panicked");
                }
            }
        }

        summary
    }

    async fn run_plain(
        &self,
        descriptor: &TestCaseDescriptor,
        bus: &SharedBus,
        aggregator: &ExceptionAggregator,
    ) -> RunSummary {
        match &self.local {
            Some(local) => local.run_local(descriptor, bus, aggregator).await,
            None => {
                // The single-process engine is an external collaborator; with
                // none wired in, plain tests are surfaced rather than lost.
                bus.publish(TestMessage::Diagnostic {
                    message: format!(
                        "no local executor configured; skipping plain test {}",
                        descriptor.id()
                    ),
                })
                .await;
                bus.publish(TestMessage::TestSkipped {
                    id: descriptor.id().clone(),
                    reason: "no local executor configured".to_string(),
                })
                .await;
                RunSummary {
                    total: 1,
                    failed: 0,
                    skipped: 1,
                    elapsed: std::time::Duration::ZERO,
                }
            }
        }
    }
}

/// Resolves once `rx` observes a true cancellation; pends forever when the
/// sender is gone (no cancellation can ever arrive).
async fn cancelled_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
