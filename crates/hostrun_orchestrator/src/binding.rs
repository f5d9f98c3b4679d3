//! Persisted assembly-probing configuration for host installations.
//!
//! The injected agent's own dependencies must be resolvable inside the host,
//! so before the first start for a (version, profile) pair the controller
//! records every directory the orchestrating process loads its dependencies
//! from into the host's probing configuration. The record is cross-process
//! shared state: writes happen only when the stored set would actually
//! change.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use etcetera::BaseStrategy;
use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingConfig {
    pub probing_paths: BTreeSet<PathBuf>,
}

/// Storage of per-(version, profile) binding configuration.
pub trait BindingStore: Send + Sync {
    fn load(&self, version: &str, profile: &str) -> io::Result<Option<BindingConfig>>;
    fn save(&self, version: &str, profile: &str, config: &BindingConfig) -> io::Result<()>;
}

/// File-backed store, one JSON document per (version, profile) hive.
pub struct FileBindingStore {
    root: PathBuf,
}

impl FileBindingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store at its conventional per-user location.
    pub fn at_default_location() -> io::Result<Self> {
        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
        Ok(Self::new(strategy.config_dir().join("hostrun").join("bindings")))
    }

    fn record_path(&self, version: &str, profile: &str) -> PathBuf {
        let profile = if profile.is_empty() { "default" } else { profile };
        self.root.join(format!("{version}-{profile}.json"))
    }
}

impl BindingStore for FileBindingStore {
    fn load(&self, version: &str, profile: &str) -> io::Result<Option<BindingConfig>> {
        let path = self.record_path(version, profile);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let config = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(config))
    }

    fn save(&self, version: &str, profile: &str, config: &BindingConfig) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let raw = serde_json::to_string_pretty(config)?;
        std::fs::write(self.record_path(version, profile), raw)
    }
}

/// The directories the orchestrating process loads its own dependencies
/// from, plus any configured extras.
pub fn dependency_dirs(extra: &[PathBuf]) -> BTreeSet<PathBuf> {
    let mut dirs = BTreeSet::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            dirs.insert(dir.to_path_buf());
        }
    }
    dirs.extend(extra.iter().cloned());
    dirs
}

/// Outcome of one reconciliation of the stored probing paths.
#[derive(Debug, PartialEq, Eq)]
pub enum BindingOutcome {
    /// No record existed; this is the first run ever for the pair.
    FirstRun,
    /// The record already covered every wanted path; nothing was written.
    Unchanged,
    Extended,
}

/// Reconciles the stored probing paths with `wanted`, writing only when the
/// stored set would change. Does not create the first-run record; callers
/// handle the throwaway launch first and then [BindingStore::save].
pub fn reconcile(
    store: &dyn BindingStore,
    version: &str,
    profile: &str,
    wanted: &BTreeSet<PathBuf>,
) -> io::Result<BindingOutcome> {
    match store.load(version, profile)? {
        None => Ok(BindingOutcome::FirstRun),
        Some(existing) if wanted.is_subset(&existing.probing_paths) => {
            Ok(BindingOutcome::Unchanged)
        }
        Some(mut existing) => {
            existing.probing_paths.extend(wanted.iter().cloned());
            store.save(version, profile, &existing)?;
            Ok(BindingOutcome::Extended)
        }
    }
}
