//! Volume driver composition.
//!
//! [`VolumeDriver`] is the base capability: the volume lifecycle that stays
//! the same whatever the attach path looks like.  [`RbdDriver`] wraps any
//! base driver, forwards the lifecycle unchanged and adds the RBD connection
//! descriptor plus the local attach/detach path on top.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::attach::AttachOrchestrator;
use crate::config::DriverConfig;
use crate::connector::ConnectorRegistry;
use crate::descriptor::build_descriptor;
use crate::detach::DetachOrchestrator;
use crate::error::Result;
use crate::monitor::MonitorSource;
use crate::privileged::CommandRunner;
use crate::types::{AttachRecord, ConnectionDescriptor, VolumeRef};

/// Host properties supplied by the attaching side (host name, initiator, ...).
pub type ConnectorProperties = HashMap<String, String>;

/// Base volume lifecycle operations.
///
/// Export and connection hooks default to no-ops; RBD needs no export.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn create_volume(&self, volume: &VolumeRef, size_gb: u64) -> Result<()>;

    async fn delete_volume(&self, volume: &VolumeRef) -> Result<()>;

    async fn create_snapshot(&self, volume: &VolumeRef, snapshot: &str) -> Result<()>;

    async fn delete_snapshot(&self, volume: &VolumeRef, snapshot: &str) -> Result<()>;

    async fn create_cloned_volume(&self, volume: &VolumeRef, source: &VolumeRef) -> Result<()>;

    async fn extend_volume(&self, volume: &VolumeRef, new_size_gb: u64) -> Result<()>;

    async fn create_export(&self, _volume: &VolumeRef) -> Result<()> {
        Ok(())
    }

    async fn remove_export(&self, _volume: &VolumeRef) -> Result<()> {
        Ok(())
    }

    async fn terminate_connection(
        &self,
        _volume: &VolumeRef,
        _properties: &ConnectorProperties,
        _force: bool,
    ) -> Result<()> {
        Ok(())
    }
}

/// RBD attach layer composed over a base [`VolumeDriver`].
pub struct RbdDriver<D> {
    inner: D,
    config: DriverConfig,
    monitors: Arc<dyn MonitorSource>,
    attacher: AttachOrchestrator,
    detacher: DetachOrchestrator,
}

impl<D: VolumeDriver> RbdDriver<D> {
    pub const VERSION: &'static str = "1.2.0";

    pub fn new(
        inner: D,
        config: DriverConfig,
        monitors: Arc<dyn MonitorSource>,
        registry: Arc<ConnectorRegistry>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let attacher = AttachOrchestrator::new(registry.clone(), runner.clone(), config.host.clone());
        let detacher = DetachOrchestrator::new(registry, runner, config.host.symlink_prefix.clone());
        Self {
            inner,
            config,
            monitors,
            attacher,
            detacher,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Describe how a connector reaches `volume`.
    #[instrument(skip(self, _properties), fields(volume_id = %volume.id))]
    pub async fn initialize_connection(
        &self,
        volume: &VolumeRef,
        _properties: &ConnectorProperties,
    ) -> Result<ConnectionDescriptor> {
        let monitors = self.monitors.mon_addrs().await?;
        let descriptor = build_descriptor(
            &self.config.rbd,
            &monitors,
            volume,
            volume.has_encryption_key(),
        );
        debug!(?descriptor, "connection data");
        Ok(descriptor)
    }

    /// Attach `descriptor` on this host.
    pub async fn connect_device(&self, descriptor: &ConnectionDescriptor) -> Result<AttachRecord> {
        self.attacher.attach(descriptor).await
    }

    /// Disconnect the volume from this host.
    ///
    /// Runs the base detach (device release, connection termination, export
    /// removal) and then removes the encrypted-volume symlink.  Errors from
    /// any step are returned as-is and stop the remaining steps.
    #[instrument(skip(self, record, volume, properties), fields(volume_id = %volume.id))]
    pub async fn detach_volume(
        &self,
        record: &AttachRecord,
        volume: &VolumeRef,
        properties: &ConnectorProperties,
        force: bool,
        remote: bool,
    ) -> Result<()> {
        self.detacher.verify_record(record)?;
        self.detacher.release_device(record, force, remote).await?;
        self.inner.terminate_connection(volume, properties, force).await?;
        self.inner.remove_export(volume).await?;
        self.detacher.remove_artifacts(record).await
    }
}

#[async_trait]
impl<D: VolumeDriver> VolumeDriver for RbdDriver<D> {
    async fn create_volume(&self, volume: &VolumeRef, size_gb: u64) -> Result<()> {
        self.inner.create_volume(volume, size_gb).await
    }

    async fn delete_volume(&self, volume: &VolumeRef) -> Result<()> {
        self.inner.delete_volume(volume).await
    }

    async fn create_snapshot(&self, volume: &VolumeRef, snapshot: &str) -> Result<()> {
        self.inner.create_snapshot(volume, snapshot).await
    }

    async fn delete_snapshot(&self, volume: &VolumeRef, snapshot: &str) -> Result<()> {
        self.inner.delete_snapshot(volume, snapshot).await
    }

    async fn create_cloned_volume(&self, volume: &VolumeRef, source: &VolumeRef) -> Result<()> {
        self.inner.create_cloned_volume(volume, source).await
    }

    async fn extend_volume(&self, volume: &VolumeRef, new_size_gb: u64) -> Result<()> {
        self.inner.extend_volume(volume, new_size_gb).await
    }

    async fn create_export(&self, volume: &VolumeRef) -> Result<()> {
        self.inner.create_export(volume).await
    }

    async fn remove_export(&self, volume: &VolumeRef) -> Result<()> {
        self.inner.remove_export(volume).await
    }

    async fn terminate_connection(
        &self,
        volume: &VolumeRef,
        properties: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        self.inner.terminate_connection(volume, properties, force).await
    }
}
