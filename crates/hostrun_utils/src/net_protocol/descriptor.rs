//! The identity of a single test invocation, as it crosses the channel to a
//! host process.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a test invocation, stable across processes and re-runs.
pub type TestId = String;

/// A symbolic reference to a test method, resolved by the host-side registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub suite: String,
    pub name: String,
}

impl MethodRef {
    pub fn new(suite: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for MethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.suite, self.name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestFlags {
    /// Marshal execution onto the host's single UI-affine thread.
    #[serde(default)]
    pub run_on_ui_thread: bool,
    /// If the first run fails, recycle the host session and re-run once.
    #[serde(default)]
    pub recycle_on_failure: bool,
    /// Never share a host instance with any other test.
    #[serde(default)]
    pub new_instance_per_run: bool,
}

/// Immutable identity of one test invocation.
///
/// Created once at discovery time by expanding a declarative annotation into
/// one descriptor per resolved host version. Serializable to a flat record;
/// its identity string is derived deterministically so re-runs and
/// de-duplication correlate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCaseDescriptor {
    id: TestId,
    pub method: MethodRef,
    /// Target host version; empty for plain tests not bound to a host.
    pub version: String,
    /// Isolation profile name; empty selects the host's default profile.
    pub profile: String,
    timeout_ms: u64,
    pub flags: TestFlags,
    /// Data-row arguments for parameterized tests.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl TestCaseDescriptor {
    pub fn new(
        method: MethodRef,
        version: impl Into<String>,
        profile: impl Into<String>,
        timeout: Duration,
        flags: TestFlags,
        args: Vec<serde_json::Value>,
    ) -> Self {
        let version = version.into();
        let profile = profile.into();
        let id = derive_identity(&method, &version, &profile, &args);
        Self {
            id,
            method,
            version,
            profile,
            timeout_ms: timeout.as_millis() as u64,
            flags,
            args,
        }
    }

    pub fn id(&self) -> &TestId {
        &self.id
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether this descriptor targets a host process at all.
    pub fn is_host_bound(&self) -> bool {
        !self.version.is_empty()
    }
}

fn derive_identity(
    method: &MethodRef,
    version: &str,
    profile: &str,
    args: &[serde_json::Value],
) -> TestId {
    let mut id = format!("{method} [{version}");
    if !profile.is_empty() {
        id.push('/');
        id.push_str(profile);
    }
    id.push(']');
    if !args.is_empty() {
        // Serialization of a json value is deterministic for a fixed value, so
        // data rows yield stable per-row identities.
        id.push_str(&serde_json::to_string(args).unwrap_or_default());
    }
    id
}

/// Groups descriptors into test collections.
///
/// All descriptors sharing a key run sequentially against the same host
/// process; distinct keys run concurrently. Descriptors that demand a fresh
/// host instance get a key carrying a unique token, so they can never be
/// grouped with anything else. Keys stay on the orchestrator side; only
/// descriptors cross the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub version: String,
    pub profile: String,
    unique: Option<Uuid>,
}

impl CollectionKey {
    pub fn shared(version: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            profile: profile.into(),
            unique: None,
        }
    }

    pub fn isolated(version: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            profile: profile.into(),
            unique: Some(Uuid::new_v4()),
        }
    }

    pub fn for_descriptor(descriptor: &TestCaseDescriptor) -> Self {
        if descriptor.flags.new_instance_per_run {
            Self::isolated(&descriptor.version, &descriptor.profile)
        } else {
            Self::shared(&descriptor.version, &descriptor.profile)
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.unique.is_some()
    }
}

impl std::fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.version)?;
        if !self.profile.is_empty() {
            write!(f, "/{}", self.profile)?;
        }
        if let Some(unique) = &self.unique {
            write!(f, "#{unique}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{CollectionKey, MethodRef, TestCaseDescriptor, TestFlags};

    fn descriptor(version: &str, profile: &str) -> TestCaseDescriptor {
        TestCaseDescriptor::new(
            MethodRef::new("editor_suite", "opens_document"),
            version,
            profile,
            Duration::from_secs(30),
            TestFlags::default(),
            vec![],
        )
    }

    #[test]
    fn identity_is_deterministic() {
        let d1 = descriptor("17.2", "Exp");
        let d2 = descriptor("17.2", "Exp");
        assert_eq!(d1.id(), d2.id());
    }

    #[test]
    fn identity_distinguishes_version_and_profile() {
        let base = descriptor("17.2", "Exp");
        assert_ne!(base.id(), descriptor("17.4", "Exp").id());
        assert_ne!(base.id(), descriptor("17.2", "").id());
    }

    #[test]
    fn identity_distinguishes_data_rows() {
        let row = |n: u64| {
            TestCaseDescriptor::new(
                MethodRef::new("editor_suite", "zoom_level"),
                "17.2",
                "",
                Duration::from_secs(30),
                TestFlags::default(),
                vec![serde_json::json!(n)],
            )
        };
        assert_ne!(row(1).id(), row(2).id());
    }

    #[test]
    fn identity_format() {
        let d = descriptor("17.2", "Exp");
        insta::assert_snapshot!(d.id(), @"editor_suite::opens_document [17.2/Exp]");
    }

    #[test]
    fn round_trips_through_serialization() {
        let d = descriptor("17.2", "Exp");
        let json = serde_json::to_string(&d).unwrap();
        let back: TestCaseDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.id(), d.id());
    }

    #[test]
    fn shared_keys_group_same_version_profile() {
        let d1 = descriptor("17.2", "Exp");
        let d2 = descriptor("17.2", "Exp");
        assert_eq!(
            CollectionKey::for_descriptor(&d1),
            CollectionKey::for_descriptor(&d2)
        );
    }

    #[test]
    fn isolated_keys_never_collide() {
        let mut d = descriptor("17.2", "Exp");
        d.flags.new_instance_per_run = true;
        let k1 = CollectionKey::for_descriptor(&d);
        let k2 = CollectionKey::for_descriptor(&d);
        assert_ne!(k1, k2);
        assert!(k1.is_isolated());
    }
}
