//! Driver and host configuration.
//!
//! Options are plain serde structs loaded from YAML and passed in at
//! construction time; nothing here is process-global.  Field names and
//! defaults match the established `rbd_*` option names so existing
//! configuration files carry over.
//!
//! ```yaml
//! rbd:
//!   rbd_pool: volumes
//!   rbd_user: cinder
//!   rbd_secret_uuid: 457eb676-33da-42ec-9a8c-9293d545c337
//! host:
//!   num_volume_device_scan_tries: 5
//!   unavailable_device_policy: raise
//! ```
//!
//! Environment overrides (applied by [`DriverConfig::apply_env_overrides`]):
//! `RBD_POOL`, `RBD_CLUSTER_NAME`, `RBD_USER`, `RBD_SECRET_UUID`,
//! `RBD_CEPH_CONF`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RbdError, Result};
use crate::types::ConnectorSettings;

/// Backend options of the RBD driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RbdConfig {
    /// The name of the ceph cluster.
    pub rbd_cluster_name: String,
    /// The RADOS pool where rbd volumes are stored.
    pub rbd_pool: String,
    /// RADOS client name; only set when using cephx authentication.
    pub rbd_user: Option<String>,
    /// Path to the ceph configuration file; empty means the librados default.
    pub rbd_ceph_conf: String,
    /// Flatten volumes created from snapshots to remove the dependency.
    pub rbd_flatten_volume_from_snapshot: bool,
    /// libvirt uuid of the secret for `rbd_user`.
    pub rbd_secret_uuid: Option<String>,
    /// Deprecated scratch directory for image conversion.
    pub volume_tmp_dir: Option<PathBuf>,
    /// Nested clones allowed before a flatten occurs; 0 disables cloning.
    pub rbd_max_clone_depth: u32,
    /// Object size in megabytes.
    pub rbd_store_chunk_size: u32,
    /// Seconds to wait for the cluster connection; negative keeps the
    /// librados default.
    pub rados_connect_timeout: i64,
    pub rados_connection_retries: u32,
    /// Seconds between connection retries.
    pub rados_connection_interval: u64,
}

impl Default for RbdConfig {
    fn default() -> Self {
        Self {
            rbd_cluster_name: "ceph".to_owned(),
            rbd_pool: "rbd".to_owned(),
            rbd_user: None,
            rbd_ceph_conf: String::new(),
            rbd_flatten_volume_from_snapshot: false,
            rbd_secret_uuid: None,
            volume_tmp_dir: None,
            rbd_max_clone_depth: 5,
            rbd_store_chunk_size: 4,
            rados_connect_timeout: -1,
            rados_connection_retries: 3,
            rados_connection_interval: 5,
        }
    }
}

impl RbdConfig {
    /// The cephx user, if authentication is configured.  An empty string
    /// counts as unset.
    pub fn auth_user(&self) -> Option<&str> {
        self.rbd_user.as_deref().filter(|user| !user.is_empty())
    }

    /// The ceph.conf path, if one is configured.
    pub fn ceph_conf(&self) -> Option<&Path> {
        if self.rbd_ceph_conf.is_empty() {
            None
        } else {
            Some(Path::new(&self.rbd_ceph_conf))
        }
    }

    /// Connection timeout, `None` when the librados default applies.
    pub fn connect_timeout(&self) -> Option<Duration> {
        u64::try_from(self.rados_connect_timeout)
            .ok()
            .map(Duration::from_secs)
    }
}

/// What to do when a plaintext device fails validation after a successful
/// connect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnavailableDevicePolicy {
    /// Fail the attach with [`RbdError::DeviceUnavailable`].
    #[default]
    Raise,
    /// Log a warning and hand the device out anyway.
    Accept,
}

/// Host-side capabilities and knobs for the attach path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    pub use_multipath_for_image_xfer: bool,
    /// How many times a connector may rescan for the device node.
    pub num_volume_device_scan_tries: u32,
    /// Secure network filesystem semantics: validation must not run as root.
    pub secure_file_operations: bool,
    /// Command prefix used for privileged operations; empty runs directly.
    pub root_helper: Vec<String>,
    /// Upper bound for any single host command.
    pub command_timeout_secs: u64,
    /// Encrypted volumes are exposed at `<symlink_prefix>-<volume id>`.
    pub symlink_prefix: String,
    pub unavailable_device_policy: UnavailableDevicePolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            use_multipath_for_image_xfer: false,
            num_volume_device_scan_tries: 3,
            secure_file_operations: false,
            root_helper: vec!["sudo".to_owned()],
            command_timeout_secs: 60,
            symlink_prefix: "/dev/rbd-volume".to_owned(),
            unavailable_device_policy: UnavailableDevicePolicy::default(),
        }
    }
}

impl HostConfig {
    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            use_multipath: self.use_multipath_for_image_xfer,
            device_scan_attempts: self.num_volume_device_scan_tries,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    pub rbd: RbdConfig,
    pub host: HostConfig,
}

impl DriverConfig {
    /// Parse a YAML document.  Missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(RbdError::config)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RbdError::Config(format!("read {}: {e}", path.display())))?;
        debug!(path = %path.display(), "loading driver configuration");
        Self::from_yaml_str(&yaml)
    }

    /// Apply `RBD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then re-validate.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(pool) = lookup("RBD_POOL") {
            self.rbd.rbd_pool = pool;
        }
        if let Some(cluster) = lookup("RBD_CLUSTER_NAME") {
            self.rbd.rbd_cluster_name = cluster;
        }
        if let Some(user) = lookup("RBD_USER") {
            self.rbd.rbd_user = Some(user);
        }
        if let Some(uuid) = lookup("RBD_SECRET_UUID") {
            self.rbd.rbd_secret_uuid = Some(uuid);
        }
        if let Some(conf) = lookup("RBD_CEPH_CONF") {
            self.rbd.rbd_ceph_conf = conf;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.rbd.rbd_pool.is_empty() {
            return Err(RbdError::Config("rbd_pool must not be empty".into()));
        }
        if self.rbd.rbd_cluster_name.is_empty() {
            return Err(RbdError::Config(
                "rbd_cluster_name must not be empty".into(),
            ));
        }
        if self.host.num_volume_device_scan_tries == 0 {
            return Err(RbdError::Config(
                "num_volume_device_scan_tries must be at least 1".into(),
            ));
        }
        if self.host.command_timeout_secs == 0 {
            return Err(RbdError::Config(
                "command_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
