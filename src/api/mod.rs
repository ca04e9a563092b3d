//! FRTM Proxy control API
//!
//! [`ControlPlane`] is the entry point for embedders (desktop UI, headless
//! CLI). [`init_core`] configures logging once per process.

pub mod control_plane;

pub use control_plane::{
    default_storage_dir, init_core, resolve_log_level, ControlError, ControlPlane,
};
