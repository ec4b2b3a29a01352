//! Per-student lab sandboxes: container lifecycle, a browser terminal bridge,
//! file sync into the sandbox and script-based evaluation.

pub mod bridge;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod http_server;
pub mod identity;
pub mod registry;
pub mod remote;
pub mod runtime;
pub mod state;
pub mod store;
pub mod sync;
