//! # FRTM Proxy Core
//!
//! Control plane for an external traffic-interception engine (`mitmdump`
//! with the FRTM bridge addon). The engine does the TLS interception; this
//! crate supervises it and turns its event stream into a queryable,
//! editable model of network activity.
//!
//! ## Features
//!
//! - Engine supervision with newline-delimited JSON IPC
//! - Reconciliation of partial request/response events into flows
//! - Map local: persistent host+path mocks, collections and recording
//! - Request/response breakpoints with a FIFO decision queue
//! - A search language over captured flows
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │               UI / headless CLI (ControlPlane)           │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌───────┐  │
//! │  │ Supervisor│──│ FlowStore  │──│Breakpoint│  │ Query │  │
//! │  │  (stdio)  │  │ +retention │  │ MapLocal │  │       │  │
//! │  └───────────┘  └────────────┘  └──────────┘  └───────┘  │
//! ├──────────────────────────────────────────────────────────┤
//! │           Interception engine (separate process)         │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod models;
pub mod proxy;
pub mod query;
pub mod storage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
