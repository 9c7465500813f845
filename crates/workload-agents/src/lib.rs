//! Workload agents runtime
//!
//! Runs ephemeral agent workloads against a shared repository:
//!
//! - [`listener`] classifies inbound chat events into dispatch, routing,
//!   approval and control actions.
//! - [`manager`] owns workload lifecycles and the one-live-session rule.
//! - [`worktree_bridge`] gives each workload its own git worktree and branch.
//! - [`session_runner`] drives an agent session's event stream.
//! - [`merge_coordinator`] merges a finished branch into trunk, or sends the
//!   agent back to rebase.
//! - [`approvals`] decides tool calls from grants or by asking a human.
//! - [`engine`], [`transport`] and [`store`] are the seams to the agent
//!   engine, the chat side and record persistence.

#![allow(clippy::uninlined_format_args)]

pub mod approvals;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod manager;
pub mod merge_coordinator;
pub mod session_runner;
pub mod store;
pub mod transport;
pub mod worktree_bridge;

pub use config::AgentsConfig;
pub use engine::{AgentControl, AgentEngine, EngineEvent, ProcessEngine, SessionHandle};
pub use error::{WorkloadError, WorkloadResult};
pub use listener::{InboundEvent, Listener, ListenerAction};
pub use manager::{Delivery, DispatchRequest, WorkloadManager};
pub use store::{InMemoryWorkloadStore, WorkloadStore};
pub use transport::{BusTransport, ChatTransport};
pub use worktree_bridge::WorktreeController;
