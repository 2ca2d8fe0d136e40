//! Node and Publication Model
//!
//! Nodes are the hosts that attach volumes; a publication records that a
//! volume is believed to be attached to a node.

use super::volume::{AccessMode, VolumeAccessInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Node
// =============================================================================

/// A registered host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iqn: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub topology_labels: BTreeMap<String, String>,
    /// Set while deletion waits for the node's publications to drain
    #[serde(default)]
    pub deleted: bool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Volume Publication
// =============================================================================

/// Build the `volume/node` publication name
pub fn make_publication_name(volume_name: &str, node_name: &str) -> String {
    format!("{}/{}", volume_name, node_name)
}

/// Record of one volume attached to one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumePublication {
    pub name: String,
    pub volume_name: String,
    pub node_name: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Fencing flag: the workload must not attach until this is cleared
    #[serde(default)]
    pub not_safe_to_attach: bool,
    /// Set once the fencing path has already unpublished on the backend
    #[serde(default)]
    pub unpublished: bool,
}

impl VolumePublication {
    pub fn new(volume_name: &str, node_name: &str, read_only: bool, access_mode: AccessMode) -> Self {
        Self {
            name: make_publication_name(volume_name, node_name),
            volume_name: volume_name.to_string(),
            node_name: node_name.to_string(),
            read_only,
            access_mode,
            not_safe_to_attach: false,
            unpublished: false,
        }
    }
}

// =============================================================================
// Publish Info
// =============================================================================

/// Host details passed to a driver on publish and unpublish.
///
/// On publish the driver fills `access_info`; on unpublish
/// `last_publication` tells the driver whether host access to the backend
/// volume can be revoked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumePublishInfo {
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_iqn: Option<String>,
    #[serde(default)]
    pub host_ips: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub backend_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub access_info: VolumeAccessInfo,
    #[serde(default)]
    pub last_publication: bool,
}

impl VolumePublishInfo {
    pub fn for_host(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ..Default::default()
        }
    }

    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.access_info = self.access_info.redacted();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publication_defaults() {
        let publication = VolumePublication::new("vol-1", "node-a", false, AccessMode::ReadWriteOnce);
        assert_eq!(publication.name, "vol-1/node-a");
        assert!(!publication.not_safe_to_attach);
        assert!(!publication.unpublished);
    }
}
