//! Connector gateway.
//!
//! A [`Connector`] knows how to make a remote volume appear as a local block
//! device for one transport protocol.  The [`ConnectorRegistry`] maps
//! protocol tags to connector factories and is the only thing the attach and
//! detach orchestrators talk to, so transports can be swapped without
//! touching orchestration.

pub mod rbd;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::error::{RbdError, Result};
use crate::privileged::CommandRunner;
use crate::types::{ConnectionData, ConnectorHandle, ConnectorSettings, DeviceInfo, RBD_PROTOCOL};

/// A transport-specific local attach mechanism.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make the volume described by `data` available locally.
    async fn connect_volume(&self, data: &ConnectionData) -> Result<DeviceInfo>;

    /// Check whether `path` is a usable block device.
    async fn check_valid_device(&self, path: &Path, run_as_root: bool) -> Result<bool>;

    /// Tear down a device previously returned by `connect_volume`.
    async fn disconnect_volume(
        &self,
        data: &ConnectionData,
        device: &DeviceInfo,
        force: bool,
    ) -> Result<()>;
}

/// Outcome of a device validity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCheck {
    Valid,
    Invalid,
    /// The check itself failed; treated as unavailable.
    Indeterminate(String),
}

impl DeviceCheck {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl fmt::Display for DeviceCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => f.write_str("device is valid"),
            Self::Invalid => f.write_str("device failed validation"),
            Self::Indeterminate(reason) => write!(f, "device validation failed: {reason}"),
        }
    }
}

/// Builds a connector for a given set of transport settings.
pub type ConnectorFactory = Arc<dyn Fn(ConnectorSettings) -> Arc<dyn Connector> + Send + Sync>;

/// Protocol-keyed collection of connector factories.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the connectors this crate ships: the kernel RBD client
    /// under `"rbd"`.
    pub fn with_defaults(runner: Arc<dyn CommandRunner>) -> Self {
        let mut registry = Self::new();
        registry.register(RBD_PROTOCOL, move |settings| {
            Arc::new(rbd::RbdKernelConnector::new(runner.clone(), settings)) as Arc<dyn Connector>
        });
        registry
    }

    /// Register (or replace) the factory for `protocol`.
    pub fn register<F>(&mut self, protocol: impl Into<String>, factory: F)
    where
        F: Fn(ConnectorSettings) -> Arc<dyn Connector> + Send + Sync + 'static,
    {
        self.factories.insert(protocol.into(), Arc::new(factory));
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the connector for `protocol`.
    pub fn connector(
        &self,
        protocol: &str,
        settings: ConnectorSettings,
    ) -> Result<Arc<dyn Connector>> {
        let factory = self.factories.get(protocol).ok_or_else(|| {
            RbdError::InvalidArgument(format!("no connector registered for protocol {protocol:?}"))
        })?;
        Ok(factory(settings))
    }

    /// Connect a volume and return its raw device path plus the handle
    /// needed for teardown.  Any connector failure is reported as
    /// [`RbdError::ConnectFailed`].
    pub async fn connect(
        &self,
        protocol: &str,
        settings: ConnectorSettings,
        data: &ConnectionData,
    ) -> Result<(PathBuf, ConnectorHandle)> {
        let connector = self.connector(protocol, settings)?;
        let device = connector
            .connect_volume(data)
            .await
            .map_err(|e| match e {
                e @ RbdError::ConnectFailed { .. } => e,
                other => RbdError::ConnectFailed {
                    protocol: protocol.to_owned(),
                    reason: other.to_string(),
                },
            })?;

        let handle = ConnectorHandle {
            protocol: protocol.to_owned(),
            settings,
            device,
        };
        Ok((handle.device.path.clone(), handle))
    }

    /// Validate `path` with the connector behind `handle`.  Errors raised by
    /// the check are absorbed into [`DeviceCheck::Indeterminate`].
    pub async fn check_valid_device(
        &self,
        handle: &ConnectorHandle,
        path: &Path,
        allow_root_access: bool,
    ) -> DeviceCheck {
        let checked = match self.connector(&handle.protocol, handle.settings) {
            Ok(connector) => connector.check_valid_device(path, allow_root_access).await,
            Err(e) => Err(e),
        };
        match checked {
            Ok(true) => DeviceCheck::Valid,
            Ok(false) => DeviceCheck::Invalid,
            Err(e) => {
                error!(path = %path.display(), error = %e, "could not validate device");
                DeviceCheck::Indeterminate(e.to_string())
            }
        }
    }

    /// Release the device behind `handle`.
    pub async fn disconnect(
        &self,
        handle: &ConnectorHandle,
        data: &ConnectionData,
        force: bool,
    ) -> Result<()> {
        let connector = self.connector(&handle.protocol, handle.settings)?;
        connector
            .disconnect_volume(data, &handle.device, force)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeConnector, ScriptedRunner, plaintext_descriptor};

    fn registry_with(fake: Arc<FakeConnector>) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register("rbd", move |_settings| fake.clone() as Arc<dyn Connector>);
        registry
    }

    #[test]
    fn defaults_register_rbd() {
        let registry = ConnectorRegistry::with_defaults(Arc::new(ScriptedRunner::new()));
        assert_eq!(registry.protocols().collect::<Vec<_>>(), vec!["rbd"]);
        assert!(registry.connector("rbd", ConnectorSettings::default()).is_ok());
    }

    #[tokio::test]
    async fn unknown_protocol_is_invalid_argument() {
        let registry = ConnectorRegistry::new();
        let desc = plaintext_descriptor("v1");
        let err = registry
            .connect("iscsi", ConnectorSettings::default(), &desc.data)
            .await
            .unwrap_err();
        assert!(matches!(err, RbdError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn connect_returns_handle_with_settings() {
        let fake = Arc::new(FakeConnector::new("/dev/rbd7"));
        let registry = registry_with(fake.clone());
        let settings = ConnectorSettings {
            use_multipath: true,
            device_scan_attempts: 9,
        };
        let desc = plaintext_descriptor("v1");

        let (path, handle) = registry.connect("rbd", settings, &desc.data).await.unwrap();
        assert_eq!(path, PathBuf::from("/dev/rbd7"));
        assert_eq!(handle.protocol, "rbd");
        assert_eq!(handle.settings, settings);
        assert_eq!(fake.connect_calls(), 1);
    }

    #[tokio::test]
    async fn connector_errors_become_connect_failed() {
        let fake = Arc::new(FakeConnector::new("/dev/rbd0").failing_connect("map timed out"));
        let registry = registry_with(fake);
        let desc = plaintext_descriptor("v1");

        let err = registry
            .connect("rbd", ConnectorSettings::default(), &desc.data)
            .await
            .unwrap_err();
        match err {
            RbdError::ConnectFailed { protocol, reason } => {
                assert_eq!(protocol, "rbd");
                assert!(reason.contains("map timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn check_errors_are_indeterminate() {
        let fake = Arc::new(FakeConnector::new("/dev/rbd0").erroring_check("ioctl failed"));
        let registry = registry_with(fake);
        let desc = plaintext_descriptor("v1");
        let (path, handle) = registry
            .connect("rbd", ConnectorSettings::default(), &desc.data)
            .await
            .unwrap();

        let check = registry.check_valid_device(&handle, &path, true).await;
        assert!(matches!(check, DeviceCheck::Indeterminate(ref r) if r.contains("ioctl failed")));
        assert!(!check.is_available());
    }
}
