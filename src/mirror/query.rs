//! Query engine
//!
//! Indexes a dataset for id lookup, substring search and address
//! containment. An index wraps one immutable dataset snapshot.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

use super::types::{Dataset, MirrorError, ServiceEntry};

/// Lookup structures over one dataset snapshot
#[derive(Debug)]
pub struct ServiceIndex {
    dataset: Arc<Dataset>,
    by_id: HashMap<String, usize>,
    v4: Vec<(Ipv4Net, usize)>,
    v6: Vec<(Ipv6Net, usize)>,
}

impl ServiceIndex {
    pub fn new(dataset: Arc<Dataset>) -> Self {
        let mut by_id = HashMap::with_capacity(dataset.services.len());
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        let mut invalid = 0usize;

        for (pos, entry) in dataset.services.iter().enumerate() {
            by_id.entry(entry.id.clone()).or_insert(pos);

            for prefix in &entry.properties.address_prefixes {
                match parse_prefix(prefix) {
                    Some(IpNet::V4(net)) => v4.push((net, pos)),
                    Some(IpNet::V6(net)) => v6.push((net, pos)),
                    None => invalid += 1,
                }
            }
        }

        if invalid > 0 {
            warn!(
                cloud = %dataset.cloud_name,
                invalid,
                "Skipped address prefixes that are not valid CIDR literals"
            );
        }

        Self {
            dataset,
            by_id,
            v4,
            v6,
        }
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub fn change_number(&self) -> i64 {
        self.dataset.change_number
    }

    /// Number of indexed prefixes (IPv4 + IPv6)
    pub fn prefix_count(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// Entries whose id is in `ids`, in dataset order
    ///
    /// Unknown ids are skipped; compare lengths to detect them.
    pub fn find_by_id<S: AsRef<str>>(&self, ids: &[S]) -> Vec<&ServiceEntry> {
        let mut positions: Vec<usize> = ids
            .iter()
            .filter_map(|id| self.by_id.get(id.as_ref()).copied())
            .collect();
        positions.sort_unstable();
        positions.dedup();

        positions
            .into_iter()
            .map(|pos| &self.dataset.services[pos])
            .collect()
    }

    /// Entries with at least one prefix containing `address`, in dataset order
    pub fn containing(&self, address: IpAddr) -> Vec<&ServiceEntry> {
        let mut positions: Vec<usize> = match normalize(address) {
            IpAddr::V4(addr) => self
                .v4
                .iter()
                .filter(|(net, _)| net.contains(&addr))
                .map(|(_, pos)| *pos)
                .collect(),
            IpAddr::V6(addr) => self
                .v6
                .iter()
                .filter(|(net, _)| net.contains(&addr))
                .map(|(_, pos)| *pos)
                .collect(),
        };
        positions.sort_unstable();
        positions.dedup();

        positions
            .into_iter()
            .map(|pos| &self.dataset.services[pos])
            .collect()
    }

    /// Case-insensitive substring match over id, name, system service and region
    ///
    /// An empty term matches every entry.
    pub fn search(&self, term: &str) -> Vec<&ServiceEntry> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return self.dataset.services.iter().collect();
        }

        self.dataset
            .services
            .iter()
            .filter(|entry| {
                [
                    entry.id.as_str(),
                    entry.name.as_str(),
                    entry.properties.system_service.as_str(),
                    entry.properties.region.as_str(),
                ]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

/// Parse an address literal (surrounding whitespace ignored)
pub fn parse_address(address: &str) -> Result<IpAddr, MirrorError> {
    address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| MirrorError::InvalidAddress(address.to_string()))
}

/// Find the services containing `address`, scanning clouds in order
///
/// Stops at the first cloud with any match and returns only that cloud's
/// entries.
pub fn contains_address<'a, I>(
    indexes: I,
    address: &str,
) -> Result<Vec<(&'a str, &'a ServiceEntry)>, MirrorError>
where
    I: IntoIterator<Item = (&'a str, &'a ServiceIndex)>,
{
    let addr = parse_address(address)?;

    for (cloud, index) in indexes {
        let matches = index.containing(addr);
        if !matches.is_empty() {
            return Ok(matches.into_iter().map(|entry| (cloud, entry)).collect());
        }
    }

    Ok(Vec::new())
}

/// Split a `;`-separated id list, dropping blanks
pub fn parse_ids(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_prefix(prefix: &str) -> Option<IpNet> {
    let prefix = prefix.trim();
    prefix
        .parse::<IpNet>()
        .ok()
        .or_else(|| prefix.parse::<IpAddr>().ok().map(IpNet::from))
}

fn normalize(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(address),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::types::fixtures::{dataset, entry};

    fn index(cloud: &str, services: Vec<ServiceEntry>) -> ServiceIndex {
        ServiceIndex::new(Arc::new(dataset(cloud, 1, services)))
    }

    fn public() -> ServiceIndex {
        index(
            "Public",
            vec![
                entry("ActionGroup", &["13.66.60.119/32", "2603:1000:4::/64"]),
                entry("Storage", &["10.0.0.0/8"]),
                entry("Storage.WestEurope", &["10.1.0.0/16", "10.2.0.0/16"]),
                entry("AzureCloud", &["20.0.0.0/8", "not-a-prefix"]),
            ],
        )
    }

    #[test]
    fn test_scenario_storage_lookup() {
        let public = index("Public", vec![entry("Storage", &["10.0.0.0/8"])]);
        let clouds = [("Public", &public)];

        let hits = contains_address(clouds, "10.1.2.3").unwrap();
        let ids: Vec<_> = hits.iter().map(|(c, e)| (*c, e.id.as_str())).collect();
        assert_eq!(ids, vec![("Public", "Storage")]);

        let misses = contains_address(clouds, "192.168.0.1").unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn test_containing_preserves_dataset_order() {
        let idx = public();
        let hits: Vec<_> = idx
            .containing("10.1.2.3".parse().unwrap())
            .into_iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(hits, vec!["Storage", "Storage.WestEurope"]);
    }

    #[test]
    fn test_containing_boundaries() {
        let idx = public();
        assert_eq!(idx.containing("13.66.60.119".parse().unwrap()).len(), 1);
        assert!(idx.containing("13.66.60.120".parse().unwrap()).is_empty());
        assert_eq!(idx.containing("10.255.255.255".parse().unwrap()).len(), 1);
        assert!(idx.containing("11.0.0.0".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_containing_ipv6_and_mapped_ipv4() {
        let idx = public();

        let v6: Vec<_> = idx
            .containing("2603:1000:4::1".parse().unwrap())
            .into_iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(v6, vec!["ActionGroup"]);

        let mapped: Vec<_> = idx
            .containing("::ffff:20.1.1.1".parse().unwrap())
            .into_iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(mapped, vec!["AzureCloud"]);
    }

    #[test]
    fn test_invalid_prefixes_are_skipped() {
        let idx = public();
        // 7 prefixes in the fixture, one of them invalid
        assert_eq!(idx.prefix_count(), 6);
    }

    #[test]
    fn test_contains_address_stops_at_first_matching_cloud() {
        let public = index("Public", vec![entry("AzureCloud", &["20.0.0.0/8"])]);
        let china = index("China", vec![entry("AzureCloud", &["20.0.0.0/8"])]);
        let government = index("AzureGovernment", vec![entry("Sql", &["52.0.0.0/8"])]);

        let clouds = [
            ("AzureGovernment", &government),
            ("Public", &public),
            ("China", &china),
        ];

        let hits = contains_address(clouds, "20.5.5.5").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "Public");
    }

    #[test]
    fn test_contains_address_rejects_malformed_input() {
        let idx = public();
        for bad in ["", "   ", "invalid.ip", "999.999.999.999", "10.0.0.0/8"] {
            let err = contains_address([("Public", &idx)], bad).unwrap_err();
            assert!(matches!(err, MirrorError::InvalidAddress(_)), "{bad:?}");
        }
    }

    #[test]
    fn test_find_by_id_is_ordered_subsequence() {
        let idx = public();
        let found: Vec<_> = idx
            .find_by_id(&["AzureCloud", "Missing", "ActionGroup", "AzureCloud"])
            .into_iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(found, vec!["ActionGroup", "AzureCloud"]);

        assert!(idx.find_by_id::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_find_by_id_is_case_sensitive() {
        let idx = public();
        assert!(idx.find_by_id(&["storage"]).is_empty());
    }

    #[test]
    fn test_search_substring() {
        let idx = public();

        let hits: Vec<_> = idx.search("stor").into_iter().map(|e| e.id.as_str()).collect();
        assert_eq!(hits, vec!["Storage", "Storage.WestEurope"]);

        assert_eq!(idx.search("").len(), 4);
        assert!(idx.search("nothing-matches").is_empty());
    }

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_ids("ActionGroup;AzureActiveDirectory"), vec!["ActionGroup", "AzureActiveDirectory"]);
        assert_eq!(parse_ids("Single"), vec!["Single"]);
        assert!(parse_ids("").is_empty());
        assert_eq!(parse_ids(" A ; ;B "), vec!["A", "B"]);
    }
}
