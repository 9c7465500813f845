//! Event-driven notification of workload progress
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │   Manager    │────▶│  Event Bus   │────▶│  Chat transport  │
//! │   Runner     │     │  (broadcast) │     │  CLI / tests     │
//! └──────────────┘     └──────────────┘     └──────────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, SharedEventBus};
pub use types::WorkloadEvent;
