//! Service Tag Mirror Engine
//!
//! Mirrors per-cloud service tag datasets to local JSON files and answers
//! queries over them.
//!
//! ## Architecture
//!
//! - **Cloud registry**: static table of environments and their discovery pages
//! - **Resolver**: scrapes the current download link from a discovery page
//! - **Synchronizer**: downloads a dataset and atomically replaces the local file
//! - **Store**: lazily loads snapshots, coalescing concurrent syncs per cloud
//! - **Query**: id lookup, substring search and CIDR containment
//! - **Artifacts**: route templates, prefix exports and allowlists

pub mod artifacts;
pub mod cloud;
pub mod query;
pub mod resolver;
pub mod store;
pub mod synchronizer;
pub mod types;
mod service;

pub use artifacts::Artifact;
pub use cloud::{CloudEnvironment, CloudRegistry};
pub use query::{contains_address, parse_address, parse_ids, ServiceIndex};
pub use resolver::{DownloadUrlResolver, HtmlAnchorResolver};
pub use service::ServiceTagMirror;
pub use store::DatasetStore;
pub use synchronizer::DatasetSynchronizer;
pub use types::{
    Dataset, MirrorError, ServiceEntry, ServiceProperties, SyncAction, SyncOutcome, SyncReport,
};
