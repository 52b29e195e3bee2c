//! # librbd — RBD volume attach/detach for volume hosts
//!
//! `librbd` turns a Ceph RBD volume into a local block device and back.  It
//! builds the connection descriptor consumers of the attach API receive,
//! drives a pluggable connector to map the image, exposes encrypted volumes
//! behind a stable `<prefix>-<volume id>` symlink, validates plaintext
//! devices, and undoes all of it on detach.  It follows the usual rk8s
//! conventions: Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `VolumeRef`, `ConnectionDescriptor`, `AttachRecord`. |
//! | [`error`] | [`RbdError`] enum covering all failure modes. |
//! | [`config`] | `rbd_*` driver options and host knobs, loaded from YAML. |
//! | [`descriptor`] | Pure connection descriptor builder. |
//! | [`monitor`] | Monitor address discovery (`ceph mon dump`). |
//! | [`connector`] | [`Connector`] trait, protocol registry, kernel RBD connector. |
//! | [`privileged`] | Host command execution through a root helper. |
//! | [`attach`] | Attach orchestration (symlink redirection, validation). |
//! | [`detach`] | Detach orchestration (device release, symlink removal). |
//! | [`driver`] | [`VolumeDriver`] base trait and the [`RbdDriver`] wrapper. |

pub mod attach;
pub mod config;
pub mod connector;
pub mod descriptor;
pub mod detach;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod privileged;
pub mod types;

#[cfg(test)]
mod test_util;

// Re-export the most commonly used items at crate root for convenience.
pub use attach::AttachOrchestrator;
pub use config::{DriverConfig, HostConfig, RbdConfig, UnavailableDevicePolicy};
pub use connector::{Connector, ConnectorRegistry, DeviceCheck};
pub use descriptor::build_descriptor;
pub use detach::DetachOrchestrator;
pub use driver::{RbdDriver, VolumeDriver};
pub use error::RbdError;
pub use types::*;
