mod backup;
mod error;
mod interpolate;
mod returns;
pub mod seed;
mod snapshot;
mod solver;
mod store;
mod types;

pub use backup::{Backup, Bellman, PolicyGrid};
pub use error::{ConfigError, SolveError};
pub use interpolate::Interpolator;
pub use returns::{HISTORICAL_RETURNS, ReturnDistribution};
pub use snapshot::{AnchorRow, Snapshot, SnapshotError};
pub use solver::{
    DEFAULT_DIVERGENCE_THRESHOLD, DEFAULT_MAX_SWEEPS, DEFAULT_TOLERANCE, Refinement, RunOutcome,
    RunReport, Solver, SolverConfig, SweepMode, SweepStats,
};
pub use store::{AnchorStore, LatticeStore, SpatialStore};
pub use types::{
    Anchor, DEFAULT_BONUS_DIVISOR, DEFAULT_EXPENSES, DEFAULT_MAX_INCOME, DEFAULT_POLICY_FRACTIONS,
    DEFAULT_TIME_DISCOUNT, InfoRecord, MAX_VALUE_SAFETY, Model, ModelParams, State, default_max_value,
};
