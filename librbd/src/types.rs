//! Core data model: volume identity, the connection descriptor handed to
//! connectors, and the attach record that ties an attach to its detach.
//!
//! Everything here is [`Serialize`]/[`Deserialize`]; the descriptor is the
//! wire shape consumed by attach API callers and the record is what
//! `rbdctl attach` prints and `rbdctl detach` reads back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// `driver_volume_type` advertised for RBD volumes.
pub const RBD_PROTOCOL: &str = "rbd";

/// Secret type tag carried in every descriptor.
pub const CEPH_SECRET_TYPE: &str = "ceph";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Unique identifier of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The parts of a volume the attach layer cares about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRef {
    /// Unique volume identifier.
    pub id: VolumeId,
    /// Image name inside the pool, e.g. `volume-<id>`.
    pub name: String,
    /// Reference to the volume's encryption key, if it has one.
    #[serde(default)]
    pub encryption_key_id: Option<String>,
}

impl VolumeRef {
    pub fn new(id: impl Into<VolumeId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            encryption_key_id: None,
        }
    }

    pub fn with_encryption_key(mut self, key_id: impl Into<String>) -> Self {
        self.encryption_key_id = Some(key_id.into());
        self
    }

    /// `true` when the volume carries a usable encryption key reference.
    pub fn has_encryption_key(&self) -> bool {
        self.encryption_key_id
            .as_deref()
            .is_some_and(|key| !key.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Connection descriptor
// ---------------------------------------------------------------------------

/// Immutable description of how a local connector reaches a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Transport protocol tag, `"rbd"` for this driver.
    pub driver_volume_type: String,
    /// Protocol-specific payload.
    pub data: ConnectionData,
}

impl ConnectionDescriptor {
    pub fn is_encrypted(&self) -> bool {
        self.data.encrypted
    }
}

/// Payload of a [`ConnectionDescriptor`].
///
/// `encrypted` and `do_local_attach` always agree, and `auth_username` is
/// present exactly when `auth_enabled` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionData {
    /// Fully qualified image name, `<pool>/<volume name>`.
    pub name: String,
    /// Monitor hosts.
    pub hosts: Vec<String>,
    /// Monitor ports, index-aligned with `hosts`.
    pub ports: Vec<String>,
    pub cluster_name: String,
    pub auth_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_username: Option<String>,
    /// Always [`CEPH_SECRET_TYPE`].
    pub secret_type: String,
    /// Secret identifier used for credential lookup.
    pub secret_uuid: Option<String>,
    pub volume_id: VolumeId,
    pub encrypted: bool,
    /// Ask the connector to map the image on this host rather than hand the
    /// descriptor to a hypervisor.
    pub do_local_attach: bool,
}

impl ConnectionData {
    /// Split `name` into `(pool, image)`.
    pub fn pool_and_image(&self) -> Option<(&str, &str)> {
        self.name.split_once('/')
    }

    /// Monitor endpoints joined as `host:port`, IPv6 hosts bracketed.
    pub fn mon_endpoints(&self) -> Vec<String> {
        self.hosts
            .iter()
            .zip(&self.ports)
            .map(|(host, port)| {
                if host.contains(':') {
                    format!("[{host}]:{port}")
                } else {
                    format!("{host}:{port}")
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Connector plumbing
// ---------------------------------------------------------------------------

/// Transport settings resolved from host capabilities.  Passed through to
/// the connector uninterpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorSettings {
    pub use_multipath: bool,
    pub device_scan_attempts: u32,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            use_multipath: false,
            device_scan_attempts: 3,
        }
    }
}

/// Local device produced by a connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Raw block device path, e.g. `/dev/rbd0`.
    pub path: PathBuf,
    /// Connector-specific details needed for teardown.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl DeviceInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extra: HashMap::new(),
        }
    }
}

/// Everything needed to find the connector again and tear the device down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorHandle {
    pub protocol: String,
    pub settings: ConnectorSettings,
    pub device: DeviceInfo,
}

// ---------------------------------------------------------------------------
// Attach record
// ---------------------------------------------------------------------------

/// Result of a successful attach and the required input of the matching
/// detach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachRecord {
    /// The descriptor the attach was performed with.
    pub descriptor: ConnectionDescriptor,
    /// Path callers should treat as the volume's block device.  For an
    /// encrypted volume this is the `<prefix>-<volume id>` symlink.
    pub device_path: PathBuf,
    pub connector: ConnectorHandle,
}

impl AttachRecord {
    pub fn is_encrypted(&self) -> bool {
        self.descriptor.is_encrypted()
    }

    /// Device path as handed out by the connector, before any redirection.
    pub fn raw_device_path(&self) -> &Path {
        &self.connector.device.path
    }
}
