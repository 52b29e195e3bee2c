//! Test fixtures: a scripted command runner, a recording connector and a
//! recording base driver.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::config::HostConfig;
use crate::connector::Connector;
use crate::driver::{ConnectorProperties, VolumeDriver};
use crate::error::{RbdError, Result};
use crate::privileged::{CommandOutput, CommandRunner};
use crate::types::{
    CEPH_SECRET_TYPE, ConnectionData, ConnectionDescriptor, DeviceInfo, RBD_PROTOCOL, VolumeId,
    VolumeRef,
};

pub fn plaintext_descriptor(volume_id: &str) -> ConnectionDescriptor {
    ConnectionDescriptor {
        driver_volume_type: RBD_PROTOCOL.to_owned(),
        data: ConnectionData {
            name: format!("rbd/volume-{volume_id}"),
            hosts: vec!["10.0.0.1".to_owned()],
            ports: vec!["6789".to_owned()],
            cluster_name: "ceph".to_owned(),
            auth_enabled: false,
            auth_username: None,
            secret_type: CEPH_SECRET_TYPE.to_owned(),
            secret_uuid: None,
            volume_id: VolumeId::from(volume_id),
            encrypted: false,
            do_local_attach: false,
        },
    }
}

pub fn encrypted_descriptor(volume_id: &str) -> ConnectionDescriptor {
    let mut desc = plaintext_descriptor(volume_id);
    desc.data.encrypted = true;
    desc.data.do_local_attach = true;
    desc
}

/// Host config that runs commands directly and keeps symlinks under `dir`.
pub fn local_host_config(dir: &Path) -> HostConfig {
    HostConfig {
        root_helper: Vec::new(),
        symlink_prefix: dir.join("rbd-volume").display().to_string(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Command runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub line: String,
    pub as_root: bool,
}

/// Replays queued results in order; once the queue is empty every command
/// succeeds with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<Result<CommandOutput>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdout(stdout: &str) -> Self {
        let runner = Self::new();
        runner.push(Ok(CommandOutput {
            stdout: stdout.to_owned(),
            stderr: String::new(),
        }));
        runner
    }

    pub fn push(&self, response: Result<CommandOutput>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_failure(&self, code: Option<i32>, stderr: &str) {
        self.push(Err(RbdError::CommandFailed {
            command: "scripted".to_owned(),
            code,
            stderr: stderr.to_owned(),
        }));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, program: &str, args: &[&str], as_root: bool) -> Result<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(RecordedCall { line, as_root });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::default()))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.record(program, args, false)
    }

    async fn run_as_root(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.record(program, args, true)
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connector that hands out a fixed device path and records its calls.
pub struct FakeConnector {
    device: PathBuf,
    connect_error: Option<String>,
    disconnect_error: Option<String>,
    check: Mutex<Result<bool>>,
    connects: AtomicUsize,
    checks: AtomicUsize,
    disconnects: AtomicUsize,
    last_root_access: Mutex<Option<bool>>,
    last_force: Mutex<Option<bool>>,
}

impl FakeConnector {
    pub fn new(device: impl AsRef<Path>) -> Self {
        Self {
            device: device.as_ref().to_path_buf(),
            connect_error: None,
            disconnect_error: None,
            check: Mutex::new(Ok(true)),
            connects: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            last_root_access: Mutex::new(None),
            last_force: Mutex::new(None),
        }
    }

    pub fn failing_connect(mut self, reason: &str) -> Self {
        self.connect_error = Some(reason.to_owned());
        self
    }

    pub fn failing_disconnect(mut self, reason: &str) -> Self {
        self.disconnect_error = Some(reason.to_owned());
        self
    }

    pub fn with_check(self, result: Result<bool>) -> Self {
        *self.check.lock().unwrap() = result;
        self
    }

    pub fn erroring_check(self, reason: &str) -> Self {
        self.with_check(Err(RbdError::Internal(reason.to_owned())))
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn check_calls(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn last_check_root_access(&self) -> Option<bool> {
        *self.last_root_access.lock().unwrap()
    }

    pub fn last_disconnect_force(&self) -> Option<bool> {
        *self.last_force.lock().unwrap()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect_volume(&self, _data: &ConnectionData) -> Result<DeviceInfo> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match &self.connect_error {
            Some(reason) => Err(RbdError::backend(reason)),
            None => Ok(DeviceInfo::new(&self.device)),
        }
    }

    async fn check_valid_device(&self, _path: &Path, run_as_root: bool) -> Result<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        *self.last_root_access.lock().unwrap() = Some(run_as_root);
        self.check.lock().unwrap().clone()
    }

    async fn disconnect_volume(
        &self,
        _data: &ConnectionData,
        device: &DeviceInfo,
        force: bool,
    ) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.last_force.lock().unwrap() = Some(force);
        match &self.disconnect_error {
            Some(reason) => Err(RbdError::DisconnectFailed {
                path: device.path.display().to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Base driver
// ---------------------------------------------------------------------------

/// Base driver that records every call as a short line.
#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<String>>,
    terminate_error: Option<String>,
}

impl RecordingDriver {
    pub fn failing_terminate(reason: &str) -> Self {
        Self {
            calls: Mutex::default(),
            terminate_error: Some(reason.to_owned()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        self.calls.lock().unwrap().push(line);
    }
}

#[async_trait]
impl VolumeDriver for RecordingDriver {
    async fn create_volume(&self, volume: &VolumeRef, size_gb: u64) -> Result<()> {
        self.record(format!("create_volume {} {size_gb}", volume.id));
        Ok(())
    }

    async fn delete_volume(&self, volume: &VolumeRef) -> Result<()> {
        self.record(format!("delete_volume {}", volume.id));
        Ok(())
    }

    async fn create_snapshot(&self, volume: &VolumeRef, snapshot: &str) -> Result<()> {
        self.record(format!("create_snapshot {} {snapshot}", volume.id));
        Ok(())
    }

    async fn delete_snapshot(&self, volume: &VolumeRef, snapshot: &str) -> Result<()> {
        self.record(format!("delete_snapshot {} {snapshot}", volume.id));
        Ok(())
    }

    async fn create_cloned_volume(&self, volume: &VolumeRef, source: &VolumeRef) -> Result<()> {
        self.record(format!("create_cloned_volume {} from {}", volume.id, source.id));
        Ok(())
    }

    async fn extend_volume(&self, volume: &VolumeRef, new_size_gb: u64) -> Result<()> {
        self.record(format!("extend_volume {} {new_size_gb}", volume.id));
        Ok(())
    }

    async fn remove_export(&self, volume: &VolumeRef) -> Result<()> {
        self.record(format!("remove_export {}", volume.id));
        Ok(())
    }

    async fn terminate_connection(
        &self,
        volume: &VolumeRef,
        _properties: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        self.record(format!("terminate_connection {} force={force}", volume.id));
        match &self.terminate_error {
            Some(reason) => Err(RbdError::backend(reason)),
            None => Ok(()),
        }
    }
}
