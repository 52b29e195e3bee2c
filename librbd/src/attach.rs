//! Attach orchestration.
//!
//! Connects a volume through the connector gateway and decides what path the
//! caller gets:
//!
//! 1. **Encrypted** — the raw device is hidden behind a stable symlink at
//!    `<symlink_prefix>-<volume id>` so the encryption layer above always
//!    finds the same path.  Validation is left to that layer.
//! 2. **Plaintext** — the raw device is handed out directly after a
//!    validity check.
//!
//! If a step after a successful connect fails, the symlink (if any) is
//! removed and the device disconnected before the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::{HostConfig, UnavailableDevicePolicy};
use crate::connector::{ConnectorRegistry, DeviceCheck};
use crate::error::{RbdError, Result};
use crate::privileged::{CommandRunner, remove_force, symlink_force};
use crate::types::{AttachRecord, ConnectionDescriptor, VolumeId};

/// Path of the stable symlink an encrypted volume is exposed through.
pub fn encrypted_symlink_path(prefix: &str, volume_id: &VolumeId) -> PathBuf {
    PathBuf::from(format!("{prefix}-{volume_id}"))
}

/// Turns connection descriptors into attached local devices.
pub struct AttachOrchestrator {
    registry: Arc<ConnectorRegistry>,
    runner: Arc<dyn CommandRunner>,
    host: HostConfig,
}

impl AttachOrchestrator {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        runner: Arc<dyn CommandRunner>,
        host: HostConfig,
    ) -> Self {
        Self {
            registry,
            runner,
            host,
        }
    }

    /// Attach the volume described by `descriptor`.
    ///
    /// Connector failures are fatal and not retried.  The returned record
    /// must be passed unchanged to the matching detach.
    #[instrument(skip(self, descriptor), fields(volume_id = %descriptor.data.volume_id))]
    pub async fn attach(&self, descriptor: &ConnectionDescriptor) -> Result<AttachRecord> {
        let settings = self.host.connector_settings();
        let (raw_path, handle) = self
            .registry
            .connect(&descriptor.driver_volume_type, settings, &descriptor.data)
            .await?;
        debug!(device = %raw_path.display(), "connector attached device");

        let mut record = AttachRecord {
            descriptor: descriptor.clone(),
            device_path: raw_path.clone(),
            connector: handle,
        };

        if descriptor.is_encrypted() {
            let link = encrypted_symlink_path(&self.host.symlink_prefix, &descriptor.data.volume_id);
            if let Err(e) = symlink_force(self.runner.as_ref(), &raw_path, &link).await {
                self.roll_back(&record, Some(&link)).await;
                return Err(e);
            }
            info!(
                device = %raw_path.display(),
                link = %link.display(),
                "encrypted volume attached behind symlink",
            );
            record.device_path = link;
            return Ok(record);
        }

        // Secure network filesystems do not run validation as root.
        let allow_root_access = !self.host.secure_file_operations;
        let check = self
            .registry
            .check_valid_device(&record.connector, &raw_path, allow_root_access)
            .await;

        if !check.is_available() {
            self.unavailable(&record, &check).await?;
        }

        info!(device = %raw_path.display(), "volume attached");
        Ok(record)
    }

    /// Apply the configured policy to a device that failed validation.
    async fn unavailable(&self, record: &AttachRecord, check: &DeviceCheck) -> Result<()> {
        let path = record.raw_device_path();
        match self.host.unavailable_device_policy {
            UnavailableDevicePolicy::Accept => {
                warn!(device = %path.display(), %check, "device unavailable, attaching anyway");
                Ok(())
            }
            UnavailableDevicePolicy::Raise => {
                self.roll_back(record, None).await;
                Err(RbdError::DeviceUnavailable {
                    path: path.display().to_string(),
                    reason: check.to_string(),
                    descriptor: Box::new(record.descriptor.clone()),
                })
            }
        }
    }

    /// Best-effort undo of a partially completed attach.
    async fn roll_back(&self, record: &AttachRecord, link: Option<&Path>) {
        if let Some(link) = link {
            if let Err(e) = remove_force(self.runner.as_ref(), link).await {
                warn!(link = %link.display(), error = %e, "failed to remove symlink during rollback");
            }
        }
        if let Err(e) = self
            .registry
            .disconnect(&record.connector, &record.descriptor.data, true)
            .await
        {
            warn!(
                device = %record.raw_device_path().display(),
                error = %e,
                "failed to disconnect device during rollback",
            );
        }
    }
}
