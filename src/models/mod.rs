//! Data models for the FRTM Proxy control plane
//!
//! Flows mirror what the interception engine reports; rules and profiles are
//! owned by the control plane and pushed to the engine as commands.

pub mod breakpoint;
pub mod flow;
pub mod map_local;
pub mod traffic;

pub use breakpoint::*;
pub use flow::*;
pub use map_local::{MapCollection, MapRule};
pub use traffic::*;
