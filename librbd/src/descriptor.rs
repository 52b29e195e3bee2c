//! Connection descriptor construction.

use crate::config::RbdConfig;
use crate::monitor::MonitorAddrs;
use crate::types::{
    CEPH_SECRET_TYPE, ConnectionData, ConnectionDescriptor, RBD_PROTOCOL, VolumeRef,
};

/// Assemble the descriptor for `volume` from driver configuration and the
/// current monitor map.
///
/// Pure data assembly: no I/O and no failure modes.  `auth_enabled` follows
/// the presence of a non-empty `rbd_user`, and both `encrypted` and
/// `do_local_attach` follow `has_encryption_key`.
pub fn build_descriptor(
    config: &RbdConfig,
    monitors: &MonitorAddrs,
    volume: &VolumeRef,
    has_encryption_key: bool,
) -> ConnectionDescriptor {
    let auth_username = config.auth_user().map(str::to_owned);

    ConnectionDescriptor {
        driver_volume_type: RBD_PROTOCOL.to_owned(),
        data: ConnectionData {
            name: format!("{}/{}", config.rbd_pool, volume.name),
            hosts: monitors.hosts.clone(),
            ports: monitors.ports.clone(),
            cluster_name: config.rbd_cluster_name.clone(),
            auth_enabled: auth_username.is_some(),
            auth_username,
            secret_type: CEPH_SECRET_TYPE.to_owned(),
            secret_uuid: config.rbd_secret_uuid.clone(),
            volume_id: volume.id.clone(),
            encrypted: has_encryption_key,
            do_local_attach: has_encryption_key,
        },
    }
}
