//! Reconciliation pipeline: normalize, load existing state, plan, execute, report.

mod config;
mod engine;
mod executor;
mod hooks;
mod plan;
mod report;

pub use config::{clamp_batch_size, SyncConfig, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
pub use engine::{validate_scope, DryRun, SyncEngine};
pub use executor::{update_timestamp, BatchExecutor, ExecutionOutcome, WriteOp};
pub use hooks::{FanoutHook, NoopRevalidationHook, RevalidationHook};
pub use plan::{
    plan_sync, strategy_for, ExistingIndex, IdKey, KeyStrategy, PlannedDelete, PlannedInsert,
    PlannedSkip, PlannedUpdate, SlugKey, SyncPlan,
};
pub use report::{RunContext, SyncError, SyncReporter};

pub const CRATE_NAME: &str = "recon-sync";
