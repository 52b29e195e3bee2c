//! Monitor address discovery.
//!
//! The descriptor carries the cluster's monitor endpoints so the connector
//! can reach the cluster without a local ceph.conf.  [`CephCliMonitors`]
//! asks the cluster for its monitor map with `ceph mon dump`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::RbdConfig;
use crate::error::{RbdError, Result};
use crate::privileged::CommandRunner;

/// Monitor hosts and ports, index-aligned.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorAddrs {
    pub hosts: Vec<String>,
    pub ports: Vec<String>,
}

/// Source of the cluster's current monitor addresses.
#[async_trait]
pub trait MonitorSource: Send + Sync {
    async fn mon_addrs(&self) -> Result<MonitorAddrs>;
}

/// A fixed monitor list, e.g. from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticMonitors(pub MonitorAddrs);

#[async_trait]
impl MonitorSource for StaticMonitors {
    async fn mon_addrs(&self) -> Result<MonitorAddrs> {
        Ok(self.0.clone())
    }
}

/// Queries monitors with `ceph mon dump --format=json`.
///
/// The cluster session honours `rados_connect_timeout`, and a failed query
/// is retried `rados_connection_retries` times in total, pausing
/// `rados_connection_interval` seconds in between.
pub struct CephCliMonitors {
    runner: Arc<dyn CommandRunner>,
    args: Vec<String>,
    attempts: u32,
    interval: Duration,
}

impl CephCliMonitors {
    pub fn new(config: &RbdConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let mut args: Vec<String> = ["mon", "dump", "--format=json"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        if let Some(user) = config.auth_user() {
            args.extend(["--id".to_owned(), user.to_owned()]);
        }
        args.extend(["--cluster".to_owned(), config.rbd_cluster_name.clone()]);
        if let Some(conf) = config.ceph_conf() {
            args.extend(["--conf".to_owned(), conf.display().to_string()]);
        }
        if let Some(timeout) = config.connect_timeout() {
            args.extend(["--connect-timeout".to_owned(), timeout.as_secs().to_string()]);
        }
        Self {
            runner,
            args,
            attempts: config.rados_connection_retries.max(1),
            interval: Duration::from_secs(config.rados_connection_interval),
        }
    }
}

#[async_trait]
impl MonitorSource for CephCliMonitors {
    #[instrument(skip(self))]
    async fn mon_addrs(&self) -> Result<MonitorAddrs> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let mut attempt = 1;
        let out = loop {
            match self.runner.run("ceph", &args).await {
                Ok(out) => break out,
                Err(e) if attempt < self.attempts => {
                    warn!(attempt, attempts = self.attempts, error = %e, "monitor query failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => return Err(e),
            }
        };
        let addrs = parse_mon_dump(&out.stdout)?;
        debug!(hosts = ?addrs.hosts, "monitor map retrieved");
        Ok(addrs)
    }
}

#[derive(Deserialize)]
struct MonMap {
    mons: Vec<MonEntry>,
}

#[derive(Deserialize)]
struct MonEntry {
    addr: String,
}

/// Parse the JSON output of `ceph mon dump --format=json`.
///
/// Older releases print a `dumped monmap epoch N` banner before the JSON,
/// which is skipped.
pub fn parse_mon_dump(output: &str) -> Result<MonitorAddrs> {
    let json = match output.split_once('\n') {
        Some((first, rest)) if first.starts_with("dumped monmap epoch") => rest,
        _ => output,
    };
    let monmap: MonMap = serde_json::from_str(json)
        .map_err(|e| RbdError::backend(format!("malformed monitor map: {e}")))?;

    let mut addrs = MonitorAddrs::default();
    for mon in monmap.mons {
        let (host, port) = split_mon_addr(&mon.addr)?;
        addrs.hosts.push(host);
        addrs.ports.push(port);
    }
    Ok(addrs)
}

/// Split `host:port/nonce` into host and port, unbracketing IPv6 hosts.
fn split_mon_addr(addr: &str) -> Result<(String, String)> {
    let host_port = addr.rsplit_once('/').map_or(addr, |(hp, _nonce)| hp);
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| RbdError::backend(format!("malformed monitor address {addr:?}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_owned(), port.to_owned()))
}
