//! Resolving host executables for requested versions.
//!
//! Installations are discovered either through the environment convention
//! `<PRODUCT><VERSION_NO_DOTS>COMNTOOLS` (a variable per installed version,
//! pointing at the installation's tools directory) or through an
//! installation-index file maintained by the host's installer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

pub trait HostLocator: Send + Sync {
    /// Path of the host executable for `version`, if installed.
    fn locate(&self, version: &str) -> Option<PathBuf>;

    /// Distinct installed versions this locator knows about. Feeds the
    /// scheduler's parallelism floor; completeness is best-effort.
    fn installed_versions(&self) -> Vec<String>;
}

/// Locator following the tools-directory environment convention.
pub struct EnvToolsLocator {
    product: String,
    exe_name: String,
}

impl EnvToolsLocator {
    pub fn new(product: impl Into<String>, exe_name: impl Into<String>) -> Self {
        Self {
            product: product.into().to_uppercase(),
            exe_name: exe_name.into(),
        }
    }

    fn env_key(&self, version: &str) -> String {
        format!("{}{}COMNTOOLS", self.product, version.replace('.', ""))
    }
}

impl HostLocator for EnvToolsLocator {
    fn locate(&self, version: &str) -> Option<PathBuf> {
        let tools_dir = std::env::var(self.env_key(version)).ok()?;
        let exe = Path::new(&tools_dir).join(&self.exe_name);
        exe.exists().then_some(exe)
    }

    fn installed_versions(&self) -> Vec<String> {
        std::env::vars()
            .filter_map(|(key, _)| {
                let rest = key.strip_prefix(&self.product)?;
                let digits = rest.strip_suffix("COMNTOOLS")?;
                (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
                    .then(|| digits.to_string())
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstalledHost {
    pub version: String,
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InstallationIndex {
    pub installations: Vec<InstalledHost>,
}

/// Locator backed by the installer's index file.
pub struct InstallationIndexLocator {
    index_path: PathBuf,
}

impl InstallationIndexLocator {
    pub fn new(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
        }
    }

    fn read_index(&self) -> Option<InstallationIndex> {
        let raw = std::fs::read_to_string(&self.index_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(index) => Some(index),
            Err(error) => {
                tracing::warn!(path = %self.index_path.display(), %error, "malformed installation index");
                None
            }
        }
    }
}

impl HostLocator for InstallationIndexLocator {
    fn locate(&self, version: &str) -> Option<PathBuf> {
        let index = self.read_index()?;
        index
            .installations
            .into_iter()
            .find(|installed| installed.version == version)
            .map(|installed| installed.path)
    }

    fn installed_versions(&self) -> Vec<String> {
        self.read_index()
            .map(|index| {
                index
                    .installations
                    .into_iter()
                    .map(|installed| installed.version)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Tries each locator in turn.
pub struct ChainLocator {
    links: Vec<Arc<dyn HostLocator>>,
}

impl ChainLocator {
    pub fn new(links: Vec<Arc<dyn HostLocator>>) -> Self {
        Self { links }
    }
}

impl HostLocator for ChainLocator {
    fn locate(&self, version: &str) -> Option<PathBuf> {
        self.links.iter().find_map(|link| link.locate(version))
    }

    fn installed_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self
            .links
            .iter()
            .flat_map(|link| link.installed_versions())
            .collect();
        versions.sort();
        versions.dedup();
        versions
    }
}

/// Locator with a fixed version → executable table.
#[derive(Default)]
pub struct StaticLocator {
    entries: Vec<InstalledHost>,
}

impl StaticLocator {
    pub fn new(entries: Vec<(String, PathBuf)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(version, path)| InstalledHost { version, path })
                .collect(),
        }
    }
}

impl HostLocator for StaticLocator {
    fn locate(&self, version: &str) -> Option<PathBuf> {
        self.entries
            .iter()
            .find(|installed| installed.version == version)
            .map(|installed| installed.path.clone())
    }

    fn installed_versions(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|installed| installed.version.clone())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::sync::Arc;

    use super::{
        ChainLocator, EnvToolsLocator, HostLocator, InstallationIndexLocator, StaticLocator,
    };

    #[test]
    #[serial_test::serial]
    fn env_locator_follows_the_tools_convention() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("host-editor");
        std::fs::File::create(&exe).unwrap();

        std::env::set_var("EDITOR172COMNTOOLS", dir.path());

        let locator = EnvToolsLocator::new("editor", "host-editor");
        assert_eq!(locator.locate("17.2"), Some(exe));
        assert_eq!(locator.locate("17.4"), None);
        assert_eq!(locator.installed_versions(), vec!["172".to_string()]);

        std::env::remove_var("EDITOR172COMNTOOLS");
    }

    #[test]
    #[serial_test::serial]
    fn env_locator_misses_when_the_executable_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("EDITOR172COMNTOOLS", dir.path());

        let locator = EnvToolsLocator::new("editor", "host-editor");
        assert_eq!(locator.locate("17.2"), None);

        std::env::remove_var("EDITOR172COMNTOOLS");
    }

    #[test]
    fn index_locator_reads_installations() {
        let mut index_file = tempfile::NamedTempFile::new().unwrap();
        write!(
            index_file,
            r#"{{"installations": [{{"version": "17.2", "path": "/opt/host/17.2/host"}}]}}"#
        )
        .unwrap();

        let locator = InstallationIndexLocator::new(index_file.path());
        assert_eq!(
            locator.locate("17.2"),
            Some("/opt/host/17.2/host".into())
        );
        assert_eq!(locator.locate("16.0"), None);
        assert_eq!(locator.installed_versions(), vec!["17.2".to_string()]);
    }

    #[test]
    fn index_locator_tolerates_a_missing_index() {
        let locator = InstallationIndexLocator::new("/definitely/not/here.json");
        assert_eq!(locator.locate("17.2"), None);
        assert!(locator.installed_versions().is_empty());
    }

    #[test]
    fn chain_takes_the_first_hit() {
        let first = StaticLocator::new(vec![("17.2".to_string(), "/first/host".into())]);
        let second = StaticLocator::new(vec![
            ("17.2".to_string(), "/second/host".into()),
            ("17.4".to_string(), "/second/host4".into()),
        ]);
        let chain = ChainLocator::new(vec![Arc::new(first), Arc::new(second)]);

        assert_eq!(chain.locate("17.2"), Some("/first/host".into()));
        assert_eq!(chain.locate("17.4"), Some("/second/host4".into()));
        assert_eq!(
            chain.installed_versions(),
            vec!["17.2".to_string(), "17.4".to_string()]
        );
    }
}
