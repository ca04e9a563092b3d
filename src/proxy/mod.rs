//! Interception engine plumbing
//!
//! Launch configuration, the line protocol, process supervision and the two
//! rule engines (map local, breakpoints) that mirror their state to the
//! engine through a [`CommandSink`].

pub mod breakpoints;
pub mod config;
pub mod line_buffer;
pub mod map_local;
pub mod protocol;
pub mod supervisor;

pub use breakpoints::{BreakpointError, BreakpointEvent, BreakpointManager};
pub use config::{EngineConfig, ProxySettings, RetentionMode, SettingsUpdate};
pub use map_local::{MapLocalError, MapLocalManager, RuleEdit};
pub use protocol::{EngineCommand, EngineEvent};
pub use supervisor::{CommandSink, EngineError, EngineLine, EngineSupervisor};
