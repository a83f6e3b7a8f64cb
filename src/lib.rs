//! Beadwork: a multi-agent work orchestrator.
//!
//! Work items ("beads") move through configurable workflows. A heartbeat
//! loop dispatches ready beads to idle agents, repairs stuck state, and
//! recovers transient blocks. Agents talk over a typed message bus and run
//! their steps against health-checked model providers.

pub mod activity;
pub mod agent;
pub mod bus;
pub mod ci_monitor;
pub mod comments;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod feedback;
pub mod knowledge;
pub mod lock;
pub mod model;
pub mod notifications;
pub mod providers;
pub mod secrets;
pub mod workflow;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
