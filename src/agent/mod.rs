//! Agent work loop.
//!
//! - [`Dispatcher`] matches ready beads to idle agents
//! - [`BeadExecutor`] runs a dispatched bead's current workflow step
//! - [`HeartbeatLoop`] drives dispatch and repairs stuck state on a timer

mod dispatch;
mod executor;
mod heartbeat;

pub use dispatch::{CANDIDATE_WINDOW, DEFAULT_DISPATCH_BUDGET, DispatchResult, Dispatcher, pick_agent};
pub use executor::{BeadExecutor, ERROR_HISTORY_LEN, LOOP_THRESHOLD, ProviderExecutor, push_error_history};
pub use heartbeat::{
    BeatReport, BlockClass, HeartbeatLoop, RALPH_BLOCK_PREFIX, TRIAGE_ROLES, classify_block,
    pick_triage_agent,
};
