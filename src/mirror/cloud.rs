//! Cloud environment table
//!
//! Each environment is plain data: where its discovery page lives and which
//! file its dataset is mirrored to.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const DISCOVERY_BASE: &str = "https://www.microsoft.com/en-us/download/confirmation.aspx?id=";

/// A cloud environment whose service tags are mirrored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEnvironment {
    /// Environment name (e.g., "Public", "China")
    pub name: String,
    /// Landing page that links to the current dataset
    pub discovery_url: String,
    /// Dataset file name, relative to the data directory
    pub dataset_file: String,
}

impl CloudEnvironment {
    pub fn new(
        name: impl Into<String>,
        discovery_url: impl Into<String>,
        dataset_file: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            discovery_url: discovery_url.into(),
            dataset_file: dataset_file.into(),
        }
    }

    /// Environment on the provider's download center, stored as `data_<name>.json`
    fn download_center(name: &str, download_id: u32) -> Self {
        Self::new(
            name,
            format!("{}{}", DISCOVERY_BASE, download_id),
            format!("data_{}.json", name),
        )
    }

    /// Full path of the dataset file under `data_dir`
    pub fn dataset_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.dataset_file)
    }
}

/// Ordered table of supported environments
///
/// The first entry is the default for empty or unknown names.
#[derive(Debug, Clone)]
pub struct CloudRegistry {
    environments: Vec<CloudEnvironment>,
}

impl CloudRegistry {
    /// Build a registry from an explicit list
    ///
    /// Returns `None` for an empty list since there would be no default.
    pub fn new(environments: Vec<CloudEnvironment>) -> Option<Self> {
        if environments.is_empty() {
            return None;
        }
        Some(Self { environments })
    }

    /// The four published Azure environments
    pub fn azure() -> Self {
        Self {
            environments: vec![
                CloudEnvironment::download_center("Public", 56519),
                CloudEnvironment::download_center("AzureGovernment", 57063),
                CloudEnvironment::download_center("China", 57062),
                CloudEnvironment::download_center("AzureGermany", 57064),
            ],
        }
    }

    /// Resolve a name token to an environment
    ///
    /// Exact (case-insensitive) match wins, then the first registered name
    /// containing the token. Anything else falls back to the first entry.
    pub fn resolve(&self, name: &str) -> &CloudEnvironment {
        let token = name.trim().to_lowercase();
        let default = self.default_environment();

        if token.is_empty() {
            return default;
        }

        if let Some(env) = self
            .environments
            .iter()
            .find(|e| e.name.to_lowercase() == token)
        {
            return env;
        }

        if let Some(env) = self
            .environments
            .iter()
            .find(|e| e.name.to_lowercase().contains(&token))
        {
            return env;
        }

        debug!(
            requested = %name,
            default = %default.name,
            "Unknown cloud name, using default environment"
        );
        default
    }

    /// The default (first registered) environment
    pub fn default_environment(&self) -> &CloudEnvironment {
        &self.environments[0]
    }

    /// All environments in registration order
    pub fn environments(&self) -> &[CloudEnvironment] {
        &self.environments
    }

    pub fn names(&self) -> Vec<&str> {
        self.environments.iter().map(|e| e.name.as_str()).collect()
    }
}

impl Default for CloudRegistry {
    fn default() -> Self {
        Self::azure()
    }
}
