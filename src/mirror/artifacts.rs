//! Artifact generation
//!
//! Builds downloadable documents from matched service entries: a route
//! table deployment template, a prefix export and an allowlist (URL table).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{MirrorError, ServiceEntry, ServiceProperties};

pub const DEPLOYMENT_SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#";
pub const CONTENT_VERSION: &str = "1.0.0.0";
pub const ROUTE_TABLE_TYPE: &str = "Microsoft.Network/routeTables";
pub const ROUTE_TABLE_API_VERSION: &str = "2020-11-01";
pub const NEXT_HOP_INTERNET: &str = "Internet";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

const ALLOWLIST_BANNER: &str = "# Azure Service Tags - generated by servicetag-mirror";

/// Generated file contents plus download metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: &'static str,
}

// ============================================================
// Deployment template model
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTemplate {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub content_version: String,
    pub parameters: BTreeMap<String, TemplateParameter>,
    pub resources: Vec<RouteTableResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParameter {
    #[serde(rename = "type")]
    pub param_type: String,
    pub default_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTableResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub api_version: String,
    pub location: String,
    pub properties: RouteTableProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTableProperties {
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub properties: RouteProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteProperties {
    pub address_prefix: String,
    pub next_hop_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_ip_address: Option<String>,
}

/// Routes for every prefix of every entry
///
/// Names are `<cloud>.<id>-<seq>` where the 3-digit sequence restarts at
/// 001 for each entry.
pub fn build_routes(cloud: &str, entries: &[&ServiceEntry]) -> Vec<Route> {
    entries
        .iter()
        .flat_map(|entry| {
            entry
                .properties
                .address_prefixes
                .iter()
                .enumerate()
                .map(move |(i, prefix)| Route {
                    name: format!("{}.{}-{:03}", cloud, entry.id, i + 1),
                    properties: RouteProperties {
                        address_prefix: prefix.clone(),
                        next_hop_type: NEXT_HOP_INTERNET.to_string(),
                        next_hop_ip_address: None,
                    },
                })
        })
        .collect()
}

pub fn build_template(cloud: &str, entries: &[&ServiceEntry]) -> DeploymentTemplate {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "name".to_string(),
        TemplateParameter {
            param_type: "string".to_string(),
            default_value: "routeTable".to_string(),
        },
    );

    DeploymentTemplate {
        schema: DEPLOYMENT_SCHEMA.to_string(),
        content_version: CONTENT_VERSION.to_string(),
        parameters,
        resources: vec![RouteTableResource {
            resource_type: ROUTE_TABLE_TYPE.to_string(),
            name: "[parameters('name')]".to_string(),
            api_version: ROUTE_TABLE_API_VERSION.to_string(),
            location: "[resourceGroup().location]".to_string(),
            properties: RouteTableProperties {
                routes: build_routes(cloud, entries),
            },
        }],
    }
}

/// Route table deployment template (`<cloud>.<ids>.arm.json`)
pub fn route_template(cloud: &str, entries: &[&ServiceEntry]) -> Result<Artifact, MirrorError> {
    let template = build_template(cloud, entries);
    let bytes = serde_json::to_vec_pretty(&template)
        .map_err(|e| MirrorError::Serialization(e.to_string()))?;

    Ok(Artifact {
        bytes,
        filename: artifact_filename(cloud, entries, "arm.json", "template.json"),
        content_type: JSON_CONTENT_TYPE,
    })
}

/// Properties of each matched entry (`<cloud>.<ids>.json`)
pub fn prefix_export(cloud: &str, entries: &[&ServiceEntry]) -> Result<Artifact, MirrorError> {
    let properties: Vec<&ServiceProperties> = entries.iter().map(|e| &e.properties).collect();
    let bytes = serde_json::to_vec_pretty(&properties)
        .map_err(|e| MirrorError::Serialization(e.to_string()))?;

    Ok(Artifact {
        bytes,
        filename: artifact_filename(cloud, entries, "json", "prefixes.json"),
        content_type: JSON_CONTENT_TYPE,
    })
}

/// Plain-text allowlist (`<cloud>.<ids>.txt`)
///
/// Header lines and per-service lines start with `#`; each prefix line is
/// `<prefix> ; <id>`.
pub fn allowlist(
    cloud: &str,
    change_number: i64,
    request_url: &str,
    entries: &[&ServiceEntry],
) -> Artifact {
    let mut lines = vec![
        ALLOWLIST_BANNER.to_string(),
        format!("# {}", request_url),
        format!("# Cloud: {} - Changenumber: {}", cloud, change_number),
    ];

    for entry in entries {
        lines.push(format!(
            "# Service: {} - Changenumber: {}",
            entry.id, entry.properties.change_number
        ));
        lines.extend(
            entry
                .properties
                .address_prefixes
                .iter()
                .map(|prefix| format!("{} ; {}", prefix, entry.id)),
        );
    }

    let mut text = lines.join("\n");
    text.push('\n');

    Artifact {
        bytes: text.into_bytes(),
        filename: artifact_filename(cloud, entries, "txt", "urltable.txt"),
        content_type: TEXT_CONTENT_TYPE,
    }
}

fn artifact_filename(cloud: &str, entries: &[&ServiceEntry], suffix: &str, fallback: &str) -> String {
    if entries.is_empty() {
        return fallback.to_string();
    }

    let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
    format!("{}.{}.{}", cloud, ids.join("."), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::types::fixtures::entry;

    #[test]
    fn test_route_template_single_prefix() {
        let storage = entry("Storage", &["10.0.0.0/8"]);
        let artifact = route_template("Public", &[&storage]).unwrap();

        assert_eq!(artifact.filename, "Public.Storage.arm.json");
        assert_eq!(artifact.content_type, "application/json");

        let doc: serde_json::Value = serde_json::from_slice(&artifact.bytes).unwrap();
        assert_eq!(doc["$schema"], DEPLOYMENT_SCHEMA);
        assert_eq!(doc["contentVersion"], "1.0.0.0");

        let resources = doc["resources"].as_array().unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0]["type"], "Microsoft.Network/routeTables");

        let routes = resources[0]["properties"]["routes"].as_array().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0]["name"], "Public.Storage-001");
        assert_eq!(routes[0]["properties"]["addressPrefix"], "10.0.0.0/8");
        assert_eq!(routes[0]["properties"]["nextHopType"], "Internet");
        assert!(routes[0]["properties"].get("nextHopIpAddress").is_none());
    }

    #[test]
    fn test_route_sequence_resets_per_service() {
        let storage = entry("Storage", &["10.0.0.0/8", "10.1.0.0/16"]);
        let sql = entry("Sql", &["52.0.0.0/8", "52.1.0.0/16", "52.2.0.0/16"]);

        let names: Vec<_> = build_routes("China", &[&storage, &sql])
            .into_iter()
            .map(|r| r.name)
            .collect();

        assert_eq!(
            names,
            vec![
                "China.Storage-001",
                "China.Storage-002",
                "China.Sql-001",
                "China.Sql-002",
                "China.Sql-003",
            ]
        );
    }

    #[test]
    fn test_route_template_without_matches() {
        let artifact = route_template("Public", &[]).unwrap();
        assert_eq!(artifact.filename, "template.json");

        let template: DeploymentTemplate = serde_json::from_slice(&artifact.bytes).unwrap();
        assert!(template.resources[0].properties.routes.is_empty());
    }

    #[test]
    fn test_prefix_export_contains_properties_only() {
        let storage = entry("Storage", &["10.0.0.0/8"]);
        let group = entry("ActionGroup", &["13.66.60.119/32"]);
        let artifact = prefix_export("Public", &[&group, &storage]).unwrap();

        assert_eq!(artifact.filename, "Public.ActionGroup.Storage.json");

        let doc: serde_json::Value = serde_json::from_slice(&artifact.bytes).unwrap();
        let items = doc.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["systemService"], "ActionGroup");
        assert_eq!(items[0]["addressPrefixes"][0], "13.66.60.119/32");
        assert!(items[0].get("id").is_none());
    }

    #[test]
    fn test_prefix_export_default_filename() {
        let artifact = prefix_export("AzureGermany", &[]).unwrap();
        assert_eq!(artifact.filename, "prefixes.json");
        assert_eq!(artifact.bytes, b"[]");
    }

    #[test]
    fn test_allowlist_layout() {
        let storage = entry("Storage", &["10.0.0.0/8", "10.1.0.0/16"]);
        let group = entry("ActionGroup", &["13.66.60.119/32"]);

        let artifact = allowlist(
            "Public",
            77,
            "https://tags.example/allowlist/Public/Storage;ActionGroup",
            &[&storage, &group],
        );
        assert_eq!(artifact.filename, "Public.Storage.ActionGroup.txt");
        assert_eq!(artifact.content_type, "text/plain");

        let text = String::from_utf8(artifact.bytes).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                ALLOWLIST_BANNER,
                "# https://tags.example/allowlist/Public/Storage;ActionGroup",
                "# Cloud: Public - Changenumber: 77",
                "# Service: Storage - Changenumber: 1",
                "10.0.0.0/8 ; Storage",
                "10.1.0.0/16 ; Storage",
                "# Service: ActionGroup - Changenumber: 1",
                "13.66.60.119/32 ; ActionGroup",
            ]
        );
    }

    #[test]
    fn test_allowlist_without_matches_has_header_only() {
        let artifact = allowlist("China", 3, "cli", &[]);
        assert_eq!(artifact.filename, "urltable.txt");
        assert_eq!(String::from_utf8(artifact.bytes).unwrap().lines().count(), 3);
    }
}
