//! Detach orchestration, the mirror of [`crate::attach`].
//!
//! Detach is split in two so a volume driver can slot its own connection
//! teardown in between: [`DetachOrchestrator::release_device`] disconnects
//! the raw device, and [`DetachOrchestrator::remove_artifacts`] deletes the
//! encrypted-volume symlink.  [`DetachOrchestrator::detach`] runs both.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::attach::encrypted_symlink_path;
use crate::connector::ConnectorRegistry;
use crate::error::{RbdError, Result};
use crate::privileged::{CommandRunner, remove_force};
use crate::types::AttachRecord;

/// Reverses what [`crate::attach::AttachOrchestrator`] did on the host.
pub struct DetachOrchestrator {
    registry: Arc<ConnectorRegistry>,
    runner: Arc<dyn CommandRunner>,
    symlink_prefix: String,
}

impl DetachOrchestrator {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        runner: Arc<dyn CommandRunner>,
        symlink_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            runner,
            symlink_prefix: symlink_prefix.into(),
        }
    }

    /// Full detach: release the device, then remove host artifacts.
    #[instrument(skip(self, record), fields(volume_id = %record.descriptor.data.volume_id))]
    pub async fn detach(&self, record: &AttachRecord, force: bool, remote: bool) -> Result<()> {
        self.verify_record(record)?;
        self.release_device(record, force, remote).await?;
        self.remove_artifacts(record).await?;
        info!(device = %record.device_path.display(), "volume detached");
        Ok(())
    }

    /// Disconnect the raw device through the connector it was attached
    /// with.  A remote detach leaves the local device alone.  Failures are
    /// returned unchanged.
    pub async fn release_device(&self, record: &AttachRecord, force: bool, remote: bool) -> Result<()> {
        if remote {
            debug!("remote detach, skipping local disconnect");
            return Ok(());
        }
        self.registry
            .disconnect(&record.connector, &record.descriptor.data, force)
            .await
    }

    /// Remove the symlink an encrypted attach created.  Already gone is
    /// fine; any other failure is returned.
    ///
    /// The link path is re-derived from the volume id; a record pointing
    /// anywhere else is rejected before anything is removed.
    pub async fn remove_artifacts(&self, record: &AttachRecord) -> Result<()> {
        let Some(link) = self.symlink_for(record)? else {
            return Ok(());
        };
        remove_force(self.runner.as_ref(), &link).await?;
        debug!(link = %link.display(), "symlink removed");
        Ok(())
    }

    /// Reject a record whose exposed path is not the one attach would have
    /// created for its volume.
    pub fn verify_record(&self, record: &AttachRecord) -> Result<()> {
        self.symlink_for(record).map(|_| ())
    }

    /// The symlink an encrypted record owns, checked against the path the
    /// record claims.
    fn symlink_for(&self, record: &AttachRecord) -> Result<Option<PathBuf>> {
        if !record.is_encrypted() {
            return Ok(None);
        }
        let link = encrypted_symlink_path(&self.symlink_prefix, &record.descriptor.data.volume_id);
        if record.device_path != link {
            return Err(RbdError::InvalidArgument(format!(
                "attach record device path {} does not match volume symlink {}",
                record.device_path.display(),
                link.display()
            )));
        }
        Ok(Some(link))
    }
}
