//! Shared fixture instances cached inside the host process.
//!
//! The host process is a single shared runtime environment, so fixture
//! instances are shared across every test collection that reuses the host.
//! Construction for a given key runs exactly once; instances live until the
//! agent itself shuts down.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hostrun_utils::net_protocol::results::ExceptionInfo;
use parking_lot::{Mutex, RwLock};

/// A shared fixture instance. Teardown hooks default to no-ops.
#[async_trait]
pub trait Fixture: std::fmt::Debug + Send + Sync + 'static {
    async fn dispose_async(&self) -> Result<(), ExceptionInfo> {
        Ok(())
    }

    fn dispose(&self) -> Result<(), ExceptionInfo> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixtureScope {
    /// Shared across every suite run against this host.
    Suite,
    /// Shared by the tests of one logical collection.
    Collection,
}

pub type FixtureFactory = Arc<dyn Fn() -> Result<Arc<dyn Fixture>, ExceptionInfo> + Send + Sync>;

#[derive(Default)]
pub struct FixtureRegistry {
    factories: RwLock<HashMap<String, (FixtureScope, FixtureFactory)>>,
    suite_instances: RwLock<HashMap<String, Arc<dyn Fixture>>>,
    collection_instances: RwLock<HashMap<String, Arc<dyn Fixture>>>,
    /// Serializes first-construction; constructors are not safe to run twice
    /// for the same key.
    construction: Mutex<()>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, scope: FixtureScope, factory: FixtureFactory) {
        self.factories.write().insert(key.into(), (scope, factory));
    }

    /// Resolves (or lazily constructs) the fixture instance for `key`.
    ///
    /// Reads are lock-free dictionary lookups after first construction;
    /// inserts only ever add, never mutate existing entries.
    pub fn resolve(&self, key: &str) -> Result<Arc<dyn Fixture>, ExceptionInfo> {
        let (scope, factory) = {
            let factories = self.factories.read();
            match factories.get(key) {
                Some((scope, factory)) => (*scope, Arc::clone(factory)),
                None => {
                    return Err(ExceptionInfo::new(
                        "fixture",
                        format!("no fixture registered for key `{key}`"),
                    ))
                }
            }
        };

        let instances = match scope {
            FixtureScope::Suite => &self.suite_instances,
            FixtureScope::Collection => &self.collection_instances,
        };

        if let Some(instance) = instances.read().get(key) {
            return Ok(Arc::clone(instance));
        }

        let _constructing = self.construction.lock();
        // Double-checked: another caller may have constructed while we waited.
        if let Some(instance) = instances.read().get(key) {
            return Ok(Arc::clone(instance));
        }

        let instance = factory()?;
        instances.write().insert(key.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Resolves the fixtures for every key, failing on the first error.
    pub fn resolve_all(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Arc<dyn Fixture>>, ExceptionInfo> {
        let mut resolved = HashMap::with_capacity(keys.len());
        for key in keys {
            resolved.insert(key.clone(), self.resolve(key)?);
        }
        Ok(resolved)
    }

    /// Tears down every cached fixture: asynchronous teardown first, then
    /// synchronous, continuing past individual failures. Returns the
    /// collected errors; safe to call more than once.
    pub async fn dispose_all(&self) -> Vec<ExceptionInfo> {
        let mut errors = Vec::new();

        let instances: Vec<Arc<dyn Fixture>> = {
            let mut suite = self.suite_instances.write();
            let mut collection = self.collection_instances.write();
            suite
                .drain()
                .chain(collection.drain())
                .map(|(_, instance)| instance)
                .collect()
        };

        for instance in &instances {
            if let Err(e) = instance.dispose_async().await {
                errors.push(e);
            }
        }
        for instance in &instances {
            if let Err(e) = instance.dispose() {
                errors.push(e);
            }
        }

        errors
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use hostrun_utils::atomic;
    use hostrun_utils::net_protocol::results::ExceptionInfo;

    use super::{Fixture, FixtureRegistry, FixtureScope};

    #[derive(Debug)]
    struct CountedFixture;

    impl Fixture for CountedFixture {}

    #[derive(Debug)]
    struct FailingTeardown;

    #[async_trait::async_trait]
    impl Fixture for FailingTeardown {
        async fn dispose_async(&self) -> Result<(), ExceptionInfo> {
            Err(ExceptionInfo::new("fixture", "async teardown failed"))
        }

        fn dispose(&self) -> Result<(), ExceptionInfo> {
            Err(ExceptionInfo::new("fixture", "sync teardown failed"))
        }
    }

    fn registry_with_counted(constructions: Arc<AtomicUsize>) -> FixtureRegistry {
        let registry = FixtureRegistry::new();
        registry.register(
            "db",
            FixtureScope::Suite,
            Arc::new(move || {
                constructions.fetch_add(1, atomic::ORDERING);
                Ok(Arc::new(CountedFixture) as Arc<dyn Fixture>)
            }),
        );
        registry
    }

    #[test]
    fn construction_runs_exactly_once_under_contention() {
        let constructions = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(registry_with_counted(constructions.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve("db").unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(constructions.load(atomic::ORDERING), 1);
    }

    #[test]
    fn unregistered_key_is_an_error() {
        let registry = FixtureRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert_eq!(err.kind, "fixture");
    }

    #[test]
    fn factory_error_is_propagated_and_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let registry = FixtureRegistry::new();
        registry.register("flaky", FixtureScope::Collection, {
            let attempts = attempts.clone();
            Arc::new(move || {
                if attempts.fetch_add(1, atomic::ORDERING) == 0 {
                    Err(ExceptionInfo::new("fixture", "first construction fails"))
                } else {
                    Ok(Arc::new(CountedFixture) as Arc<dyn Fixture>)
                }
            })
        });

        assert!(registry.resolve("flaky").is_err());
        assert!(registry.resolve("flaky").is_ok());
    }

    #[tokio::test]
    async fn dispose_continues_past_failures_and_aggregates() {
        let registry = FixtureRegistry::new();
        registry.register(
            "bad",
            FixtureScope::Suite,
            Arc::new(|| Ok(Arc::new(FailingTeardown) as Arc<dyn Fixture>)),
        );
        registry.register(
            "good",
            FixtureScope::Collection,
            Arc::new(|| Ok(Arc::new(CountedFixture) as Arc<dyn Fixture>)),
        );
        registry.resolve("bad").unwrap();
        registry.resolve("good").unwrap();

        let errors = registry.dispose_all().await;
        assert_eq!(errors.len(), 2);

        // Idempotent: a second disposal has nothing left to tear down.
        assert!(registry.dispose_all().await.is_empty());
    }
}
