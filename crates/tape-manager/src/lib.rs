//! Job lifecycle coordination for the GoodTape orchestrator.
//!
//! This crate provides:
//! - `JobStateManager`: every lifecycle mutation, mediated by the lock
//!   store and the job store's optimistic status compare-and-set
//! - `RecoverySweeper`: the periodic scan that requeues or fails stuck
//!   jobs, purges expired records, and clears orphaned leases

pub mod error;
pub mod manager;
pub mod sweeper;

pub use error::{ManagerError, ManagerResult};
pub use manager::{
    JobStateManager, ManagerConfig, OrchestratorStats, StartProcessing, TransitionOutcome,
};
pub use sweeper::{RecoverySweeper, SweepReport, SweeperConfig};
