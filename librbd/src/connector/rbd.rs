//! Kernel RBD connector.
//!
//! Maps images with `rbd map`, which hands back a `/dev/rbdN` node, and
//! unmaps them with `rbd unmap`.  Both run through the root helper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use super::Connector;
use crate::error::{RbdError, Result};
use crate::privileged::CommandRunner;
use crate::types::{ConnectionData, ConnectorSettings, DeviceInfo, RBD_PROTOCOL};

/// [`Connector`] for the in-kernel RBD client.
pub struct RbdKernelConnector {
    runner: Arc<dyn CommandRunner>,
    settings: ConnectorSettings,
    scan_interval: Duration,
}

impl RbdKernelConnector {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ConnectorSettings) -> Self {
        Self {
            runner,
            settings,
            scan_interval: Duration::from_secs(1),
        }
    }

    /// Base delay between device scans; attempt `n` waits `n * interval`.
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    fn map_args(data: &ConnectionData) -> Vec<String> {
        let mut args = vec![
            "map".to_owned(),
            data.name.clone(),
            "--cluster".to_owned(),
            data.cluster_name.clone(),
        ];
        if let Some(user) = data.auth_username.as_deref().filter(|_| data.auth_enabled) {
            args.extend(["--id".to_owned(), user.to_owned()]);
        }
        let endpoints = data.mon_endpoints();
        if !endpoints.is_empty() {
            args.extend(["--mon_host".to_owned(), endpoints.join(",")]);
        }
        args
    }

    /// Wait for the mapped device node to show up.
    async fn wait_for_device(&self, path: &Path) -> Result<()> {
        let attempts = self.settings.device_scan_attempts.max(1);
        for attempt in 1..=attempts {
            if tokio::fs::metadata(path).await.is_ok() {
                return Ok(());
            }
            if attempt < attempts {
                debug!(path = %path.display(), attempt, "device node not present yet, rescanning");
                tokio::time::sleep(self.scan_interval * attempt).await;
            }
        }
        Err(RbdError::ConnectFailed {
            protocol: RBD_PROTOCOL.to_owned(),
            reason: format!(
                "device {} did not appear after {attempts} scans",
                path.display()
            ),
        })
    }
}

#[async_trait]
impl Connector for RbdKernelConnector {
    #[instrument(skip(self, data), fields(image = %data.name))]
    async fn connect_volume(&self, data: &ConnectionData) -> Result<DeviceInfo> {
        if data.pool_and_image().is_none() {
            return Err(RbdError::InvalidArgument(format!(
                "image name {:?} is not of the form pool/image",
                data.name
            )));
        }

        let args = Self::map_args(data);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.runner.run_as_root("rbd", &args).await?;

        let mapped = out.stdout.trim();
        if mapped.is_empty() {
            return Err(RbdError::ConnectFailed {
                protocol: RBD_PROTOCOL.to_owned(),
                reason: format!("rbd map {} printed no device path", data.name),
            });
        }
        let path = PathBuf::from(mapped);
        self.wait_for_device(&path).await?;

        info!(device = %path.display(), "image mapped");
        let mut device = DeviceInfo::new(path);
        device.extra.insert("type".to_owned(), "block".to_owned());
        Ok(device)
    }

    async fn check_valid_device(&self, path: &Path, run_as_root: bool) -> Result<bool> {
        if run_as_root {
            let input = format!("if={}", path.display());
            return match self
                .runner
                .run_as_root("dd", &[input.as_str(), "of=/dev/null", "count=1"])
                .await
            {
                Ok(_) => Ok(true),
                Err(RbdError::CommandFailed {
                    code: Some(code),
                    stderr,
                    ..
                }) => {
                    warn!(path = %path.display(), code, %stderr, "device is not readable");
                    Ok(false)
                }
                Err(e) => Err(e),
            };
        }

        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                warn!(path = %path.display(), error = %e, "device is not accessible");
                return Ok(false);
            }
            Err(e) => return Err(RbdError::internal(format!("open {}: {e}", path.display()))),
        };
        let mut block = [0u8; 512];
        file.read(&mut block)
            .await
            .map_err(|e| RbdError::internal(format!("read {}: {e}", path.display())))?;
        Ok(true)
    }

    #[instrument(skip(self, data, device), fields(device = %device.path.display()))]
    async fn disconnect_volume(
        &self,
        data: &ConnectionData,
        device: &DeviceInfo,
        force: bool,
    ) -> Result<()> {
        let path = device.path.to_string_lossy();
        let mut args = vec!["unmap", &*path];
        if force {
            args.extend(["-o", "force"]);
        }

        match self.runner.run_as_root("rbd", &args).await {
            Ok(_) => {
                info!(image = %data.name, "image unmapped");
                Ok(())
            }
            Err(RbdError::CommandFailed { stderr, .. })
                if stderr.contains("not mapped") || stderr.contains("No such file") =>
            {
                debug!(image = %data.name, "device already unmapped");
                Ok(())
            }
            Err(e) => Err(RbdError::DisconnectFailed {
                path: device.path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ScriptedRunner, plaintext_descriptor};

    fn connector(runner: Arc<ScriptedRunner>, attempts: u32) -> RbdKernelConnector {
        RbdKernelConnector::new(
            runner,
            ConnectorSettings {
                use_multipath: false,
                device_scan_attempts: attempts,
            },
        )
        .with_scan_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn map_uses_identity_and_monitors() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("rbd0");
        std::fs::write(&dev, b"").unwrap();

        let runner = Arc::new(ScriptedRunner::with_stdout(&format!("{}\n", dev.display())));
        let mut desc = plaintext_descriptor("v1");
        desc.data.auth_enabled = true;
        desc.data.auth_username = Some("cinder".into());

        let device = connector(runner.clone(), 3)
            .connect_volume(&desc.data)
            .await
            .unwrap();
        assert_eq!(device.path, dev);
        assert_eq!(device.extra.get("type").map(String::as_str), Some("block"));

        let calls = runner.calls();
        assert!(calls[0].as_root);
        assert_eq!(
            calls[0].line,
            "rbd map rbd/volume-v1 --cluster ceph --id cinder --mon_host 10.0.0.1:6789"
        );
    }

    #[tokio::test]
    async fn map_fails_when_device_never_appears() {
        let runner = Arc::new(ScriptedRunner::with_stdout("/nonexistent/rbd99\n"));
        let desc = plaintext_descriptor("v1");
        let err = connector(runner, 2)
            .connect_volume(&desc.data)
            .await
            .unwrap_err();
        assert!(matches!(err, RbdError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn map_with_empty_output_fails() {
        let runner = Arc::new(ScriptedRunner::with_stdout("\n"));
        let desc = plaintext_descriptor("v1");
        let err = connector(runner, 1)
            .connect_volume(&desc.data)
            .await
            .unwrap_err();
        assert!(matches!(err, RbdError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn unqualified_image_name_rejected() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut desc = plaintext_descriptor("v1");
        desc.data.name = "volume-v1".into();
        let err = connector(runner.clone(), 1)
            .connect_volume(&desc.data)
            .await
            .unwrap_err();
        assert!(matches!(err, RbdError::InvalidArgument(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn root_check_maps_dd_failure_to_invalid() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure(Some(1), "Input/output error");
        let valid = connector(runner.clone(), 1)
            .check_valid_device(Path::new("/dev/rbd0"), true)
            .await
            .unwrap();
        assert!(!valid);
        assert_eq!(runner.calls()[0].line, "dd if=/dev/rbd0 of=/dev/null count=1");
    }

    #[tokio::test]
    async fn unprivileged_check_reads_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("disk");
        std::fs::write(&dev, vec![0u8; 1024]).unwrap();
        let c = connector(Arc::new(ScriptedRunner::new()), 1);

        assert!(c.check_valid_device(&dev, false).await.unwrap());
        assert!(!c.check_valid_device(&tmp.path().join("missing"), false).await.unwrap());
    }

    #[tokio::test]
    async fn unmap_tolerates_already_unmapped() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure(Some(22), "rbd: /dev/rbd0: not mapped");
        let desc = plaintext_descriptor("v1");
        connector(runner.clone(), 1)
            .disconnect_volume(&desc.data, &DeviceInfo::new("/dev/rbd0"), true)
            .await
            .unwrap();
        assert_eq!(runner.calls()[0].line, "rbd unmap /dev/rbd0 -o force");
    }

    #[tokio::test]
    async fn unmap_busy_is_disconnect_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure(Some(16), "rbd: sysfs write failed: Device or resource busy");
        let desc = plaintext_descriptor("v1");
        let err = connector(runner, 1)
            .disconnect_volume(&desc.data, &DeviceInfo::new("/dev/rbd0"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RbdError::DisconnectFailed { .. }));
    }
}
