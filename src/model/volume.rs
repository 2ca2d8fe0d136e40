//! Volume Model
//!
//! Volume configuration, per-protocol access information, the volume entity
//! as persisted, and the protocol derivation table.

use super::REDACTED;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// Protocol / Access Mode / Volume Mode
// =============================================================================

/// Data path protocol of a volume or backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    File,
    Block,
    BlockOnFile,
    #[default]
    Any,
}

impl Protocol {
    /// Whether a backend speaking `self` can serve a volume asking for `requested`
    pub fn serves(&self, requested: Protocol) -> bool {
        requested == Protocol::Any || *self == Protocol::Any || *self == requested
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::File => write!(f, "file"),
            Protocol::Block => write!(f, "block"),
            Protocol::BlockOnFile => write!(f, "block-on-file"),
            Protocol::Any => write!(f, "any"),
        }
    }
}

/// Requested access mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "RWO")]
    ReadWriteOnce,
    #[serde(rename = "ROX")]
    ReadOnlyMany,
    #[serde(rename = "RWX")]
    ReadWriteMany,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Any => write!(f, "any"),
            AccessMode::ReadWriteOnce => write!(f, "RWO"),
            AccessMode::ReadOnlyMany => write!(f, "ROX"),
            AccessMode::ReadWriteMany => write!(f, "RWX"),
        }
    }
}

/// How the volume is presented to the workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeMode {
    #[default]
    Filesystem,
    RawBlock,
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeMode::Filesystem => write!(f, "filesystem"),
            VolumeMode::RawBlock => write!(f, "raw-block"),
        }
    }
}

/// Derive the effective protocol of a volume request.
///
/// Filesystem volumes pass the requested protocol through unless they are
/// shared read-write, which needs a file protocol. Raw block volumes always
/// need a block protocol.
pub fn derive_protocol(
    volume_mode: VolumeMode,
    access_mode: AccessMode,
    requested: Protocol,
) -> Result<Protocol> {
    let mismatch = || {
        Error::InvalidArgument(format!(
            "incompatible volume mode ({}), access mode ({}) and protocol ({})",
            volume_mode, access_mode, requested
        ))
    };

    match (volume_mode, access_mode, requested) {
        (VolumeMode::Filesystem, AccessMode::ReadWriteMany, Protocol::Any | Protocol::File) => {
            Ok(Protocol::File)
        }
        (VolumeMode::Filesystem, AccessMode::ReadWriteMany, _) => Err(mismatch()),
        (VolumeMode::Filesystem, _, protocol) => Ok(protocol),
        (VolumeMode::RawBlock, _, Protocol::Any | Protocol::Block) => Ok(Protocol::Block),
        (VolumeMode::RawBlock, _, _) => Err(mismatch()),
    }
}

// =============================================================================
// Volume State
// =============================================================================

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    #[default]
    Online,
    Deleting,
    Subordinate,
    MissingBackend,
    MissingVolume,
}

impl VolumeState {
    /// Missing-parent volumes may only be deleted
    pub fn is_missing(&self) -> bool {
        matches!(self, VolumeState::MissingBackend | VolumeState::MissingVolume)
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Online => write!(f, "online"),
            VolumeState::Deleting => write!(f, "deleting"),
            VolumeState::Subordinate => write!(f, "subordinate"),
            VolumeState::MissingBackend => write!(f, "missing-backend"),
            VolumeState::MissingVolume => write!(f, "missing-volume"),
        }
    }
}

// =============================================================================
// Access Info
// =============================================================================

/// NFS access details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NfsAccessInfo {
    #[serde(default)]
    pub nfs_server_ip: String,
    #[serde(default)]
    pub nfs_path: String,
    #[serde(default)]
    pub mount_options: String,
}

/// SMB access details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmbAccessInfo {
    #[serde(default)]
    pub smb_server: String,
    #[serde(default)]
    pub smb_path: String,
}

/// iSCSI CHAP credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IscsiChapInfo {
    #[serde(default)]
    pub use_chap: bool,
    #[serde(default)]
    pub iscsi_username: String,
    #[serde(default)]
    pub iscsi_initiator_secret: String,
    #[serde(default)]
    pub iscsi_target_username: String,
    #[serde(default)]
    pub iscsi_target_secret: String,
}

impl IscsiChapInfo {
    /// Copy with every credential replaced by the redaction token
    pub fn redacted(&self) -> Self {
        let mask = |value: &str| {
            if value.is_empty() {
                String::new()
            } else {
                REDACTED.to_string()
            }
        };
        Self {
            use_chap: self.use_chap,
            iscsi_username: mask(&self.iscsi_username),
            iscsi_initiator_secret: mask(&self.iscsi_initiator_secret),
            iscsi_target_username: mask(&self.iscsi_target_username),
            iscsi_target_secret: mask(&self.iscsi_target_secret),
        }
    }
}

impl std::fmt::Debug for IscsiChapInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IscsiChapInfo")
            .field("use_chap", &self.use_chap)
            .field("iscsi_username", &REDACTED)
            .field("iscsi_initiator_secret", &REDACTED)
            .field("iscsi_target_username", &REDACTED)
            .field("iscsi_target_secret", &REDACTED)
            .finish()
    }
}

/// iSCSI access details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IscsiAccessInfo {
    #[serde(default)]
    pub iscsi_target_portal: String,
    #[serde(default)]
    pub iscsi_portals: Vec<String>,
    #[serde(default)]
    pub iscsi_target_iqn: String,
    #[serde(default)]
    pub iscsi_lun_number: i32,
    #[serde(default)]
    pub iscsi_igroup: String,
    #[serde(default)]
    pub iscsi_lun_serial: String,
    #[serde(flatten)]
    pub chap: IscsiChapInfo,
}

/// Everything a node-local agent needs to attach the volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAccessInfo {
    #[serde(flatten)]
    pub nfs: NfsAccessInfo,
    #[serde(flatten)]
    pub smb: SmbAccessInfo,
    #[serde(flatten)]
    pub iscsi: IscsiAccessInfo,
    #[serde(default)]
    pub publish_enforcement: bool,
}

impl VolumeAccessInfo {
    pub fn is_smb(&self) -> bool {
        !self.smb.smb_path.is_empty()
    }

    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.iscsi.chap = self.iscsi.chap.redacted();
        copy
    }
}

// =============================================================================
// Volume Config
// =============================================================================

/// Requested and resolved configuration of a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    #[serde(default)]
    pub version: String,
    /// Name, unique across volumes and subordinates
    pub name: String,
    /// Name used on the backend
    #[serde(default)]
    pub internal_name: String,
    /// Requested size in bytes
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub volume_mode: VolumeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_source_volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_source_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_source_volume: Option<String>,
    #[serde(default)]
    pub subordinate_volumes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_backend_uuid: Option<String>,
    #[serde(default)]
    pub import_not_managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_volume_handle: Option<String>,
    #[serde(default)]
    pub is_mirror_destination: bool,
    #[serde(default)]
    pub luks_encryption: bool,
    #[serde(default)]
    pub luks_passphrase_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_qos_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_permissions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_policy: Option<String>,
    #[serde(default)]
    pub access_info: VolumeAccessInfo,
}

impl VolumeConfig {
    pub fn new(name: impl Into<String>, size_bytes: u64, storage_class: impl Into<String>) -> Self {
        Self {
            version: "1".to_string(),
            name: name.into(),
            size_bytes,
            storage_class: storage_class.into(),
            ..Default::default()
        }
    }

    pub fn is_subordinate(&self) -> bool {
        self.share_source_volume.is_some()
    }

    pub fn is_import(&self) -> bool {
        self.import_original_name.is_some()
    }

    /// Reject configurations that can never be provisioned
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidArgument("volume name must not be empty".into()));
        }
        if self.name.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "volume name {} must not contain '/'",
                self.name
            )));
        }
        if self.qos_policy.is_some() && self.adaptive_qos_policy.is_some() {
            return Err(Error::InvalidArgument(format!(
                "volume {} may specify either a QoS policy or an adaptive QoS policy, not both",
                self.name
            )));
        }
        if self.clone_source_snapshot.is_some() && self.clone_source_volume.is_none() {
            return Err(Error::InvalidArgument(format!(
                "volume {} names a clone source snapshot without a clone source volume",
                self.name
            )));
        }
        Ok(())
    }

    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.access_info = self.access_info.redacted();
        copy
    }
}

// =============================================================================
// Volume
// =============================================================================

/// A volume as held in the catalog and written to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub config: VolumeConfig,
    #[serde(default)]
    pub backend_uuid: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub orphaned: bool,
    #[serde(default)]
    pub state: VolumeState,
}

impl Volume {
    pub fn new(config: VolumeConfig, backend_uuid: impl Into<String>, pool: impl Into<String>) -> Self {
        let state = if config.is_subordinate() {
            VolumeState::Subordinate
        } else {
            VolumeState::Online
        };
        Self {
            config,
            backend_uuid: backend_uuid.into(),
            pool: pool.into(),
            orphaned: false,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_subordinate(&self) -> bool {
        self.config.is_subordinate()
    }

    pub fn construct_external(&self) -> VolumeExternal {
        VolumeExternal {
            config: self.config.redacted(),
            backend_uuid: self.backend_uuid.clone(),
            pool: self.pool.clone(),
            orphaned: self.orphaned,
            state: self.state,
        }
    }
}

/// API view of a volume, secrets redacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeExternal {
    pub config: VolumeConfig,
    pub backend_uuid: String,
    pub pool: String,
    pub orphaned: bool,
    pub state: VolumeState,
}

/// A volume as reported by a backend, used for imports and orphan detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendVolume {
    pub internal_name: String,
    pub size_bytes: u64,
    pub pool: String,
    #[serde(default)]
    pub protocol: Protocol,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [AccessMode; 4] = [
        AccessMode::Any,
        AccessMode::ReadWriteOnce,
        AccessMode::ReadOnlyMany,
        AccessMode::ReadWriteMany,
    ];
    const PROTOCOLS: [Protocol; 4] = [
        Protocol::Any,
        Protocol::File,
        Protocol::Block,
        Protocol::BlockOnFile,
    ];

    #[test]
    fn test_filesystem_passthrough() {
        for mode in [AccessMode::Any, AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany] {
            for protocol in PROTOCOLS {
                assert_eq!(
                    derive_protocol(VolumeMode::Filesystem, mode, protocol).unwrap(),
                    protocol,
                    "filesystem/{}/{}",
                    mode,
                    protocol
                );
            }
        }
    }

    #[test]
    fn test_filesystem_read_write_many() {
        let rwx = AccessMode::ReadWriteMany;
        assert_eq!(
            derive_protocol(VolumeMode::Filesystem, rwx, Protocol::Any).unwrap(),
            Protocol::File
        );
        assert_eq!(
            derive_protocol(VolumeMode::Filesystem, rwx, Protocol::File).unwrap(),
            Protocol::File
        );
        assert!(derive_protocol(VolumeMode::Filesystem, rwx, Protocol::Block).is_err());
        assert!(derive_protocol(VolumeMode::Filesystem, rwx, Protocol::BlockOnFile).is_err());
    }

    #[test]
    fn test_raw_block_table() {
        for mode in MODES {
            assert_eq!(
                derive_protocol(VolumeMode::RawBlock, mode, Protocol::Any).unwrap(),
                Protocol::Block
            );
            assert_eq!(
                derive_protocol(VolumeMode::RawBlock, mode, Protocol::Block).unwrap(),
                Protocol::Block
            );
            assert!(derive_protocol(VolumeMode::RawBlock, mode, Protocol::File).is_err());
            assert!(derive_protocol(VolumeMode::RawBlock, mode, Protocol::BlockOnFile).is_err());
        }
    }

    #[test]
    fn test_protocol_serves() {
        assert!(Protocol::File.serves(Protocol::Any));
        assert!(Protocol::Any.serves(Protocol::Block));
        assert!(Protocol::File.serves(Protocol::File));
        assert!(!Protocol::File.serves(Protocol::Block));
    }

    #[test]
    fn test_qos_conflict_rejected() {
        let mut config = VolumeConfig::new("v1", 1 << 30, "gold");
        config.qos_policy = Some("fixed".into());
        config.adaptive_qos_policy = Some("adaptive".into());
        assert!(config.validate().is_err());

        config.adaptive_qos_policy = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_external_redacts_chap() {
        let mut config = VolumeConfig::new("v1", 1 << 30, "gold");
        config.access_info.iscsi.chap = IscsiChapInfo {
            use_chap: true,
            iscsi_username: "user".into(),
            iscsi_initiator_secret: "secret".into(),
            iscsi_target_username: "target".into(),
            iscsi_target_secret: "target-secret".into(),
        };
        let volume = Volume::new(config, "uuid-1", "pool-a");
        let external = volume.construct_external();
        let chap = &external.config.access_info.iscsi.chap;
        assert!(chap.use_chap);
        assert_eq!(chap.iscsi_initiator_secret, REDACTED);
        assert_eq!(chap.iscsi_target_secret, REDACTED);
        assert!(!format!("{:?}", volume).contains("target-secret"));
    }

    #[test]
    fn test_access_mode_serde_names() {
        let json = serde_json::to_string(&AccessMode::ReadWriteMany).unwrap();
        assert_eq!(json, "\"RWX\"");
        let mode: VolumeMode = serde_json::from_str("\"raw-block\"").unwrap();
        assert_eq!(mode, VolumeMode::RawBlock);
        let protocol: Protocol = serde_json::from_str("\"block-on-file\"").unwrap();
        assert_eq!(protocol, Protocol::BlockOnFile);
    }
}
