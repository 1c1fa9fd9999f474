//! Service Tag Mirror Library
//!
//! Keeps a local mirror of the per-cloud service tag datasets and answers
//! lookups, address searches and artifact exports over them.

pub mod config;
pub mod mirror;

pub use config::MirrorConfig;
pub use mirror::{
    Artifact, CloudEnvironment, CloudRegistry, Dataset, DatasetStore, DatasetSynchronizer,
    MirrorError, ServiceEntry, ServiceProperties, ServiceTagMirror, SyncReport,
};
