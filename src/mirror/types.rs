//! Service Tag Types
//!
//! Dataset model as published by the provider, plus the error and sync
//! result types shared across the mirror.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// One cloud's service tag dataset
///
/// Replaced wholesale on every sync; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub change_number: i64,
    #[serde(rename = "cloud")]
    pub cloud_name: String,
    #[serde(rename = "values")]
    pub services: Vec<ServiceEntry>,
}

/// A single service tag (id is unique within one dataset)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub id: String,
    pub properties: ServiceProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProperties {
    pub change_number: i64,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub system_service: String,
    pub address_prefixes: Vec<String>,
}

impl Dataset {
    /// Deserialize a dataset file's bytes
    pub fn from_slice(bytes: &[u8], source: &Path) -> Result<Self, MirrorError> {
        serde_json::from_slice(bytes).map_err(|e| MirrorError::Parse {
            path: source.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Serialize in the provider's indented layout
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, MirrorError> {
        serde_json::to_vec_pretty(self).map_err(|e| MirrorError::Serialization(e.to_string()))
    }
}

/// Errors produced by the mirror
///
/// Payloads are owned strings so one result can be handed to every caller
/// waiting on the same sync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    /// Discovery page did not yield the download link
    #[error("Resolution failed for {url}: {message}")]
    Resolution { url: String, message: String },

    /// Transport or HTTP failure while fetching
    #[error("Sync failed: {message}")]
    Sync { status: Option<u16>, message: String },

    /// Stored or downloaded dataset does not match the schema
    #[error("Failed to parse dataset {path}: {message}")]
    Parse { path: String, message: String },

    /// Address literal is not an IPv4/IPv6 address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Artifact could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl MirrorError {
    pub(crate) fn io(context: &str, path: &Path, err: std::io::Error) -> Self {
        MirrorError::Io(format!("{} {}: {}", context, path.display(), err))
    }

    /// HTTP status carried by a sync failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            MirrorError::Sync { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        MirrorError::Sync {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// What a sync did to the local file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Updated,
    Unchanged,
    Failed,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncAction::Updated => write!(f, "updated"),
            SyncAction::Unchanged => write!(f, "unchanged"),
            SyncAction::Failed => write!(f, "failed"),
        }
    }
}

/// Successful sync of one cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub action: SyncAction,
    pub change_number: i64,
}

/// Per-cloud result of an update request
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub cloud: String,
    pub action: SyncAction,
    pub success: bool,
    pub change_number: Option<i64>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SyncReport {
    pub fn from_result(cloud: &str, result: &Result<SyncOutcome, MirrorError>) -> Self {
        let timestamp = chrono::Utc::now();
        match result {
            Ok(outcome) => Self {
                cloud: cloud.to_string(),
                action: outcome.action,
                success: true,
                change_number: Some(outcome.change_number),
                error: None,
                timestamp,
            },
            Err(e) => Self {
                cloud: cloud.to_string(),
                action: SyncAction::Failed,
                success: false,
                change_number: None,
                error: Some(e.to_string()),
                timestamp,
            },
        }
    }
}
