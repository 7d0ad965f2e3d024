use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use super::backup::{Backup, Bellman, PolicyGrid};
use super::error::{ConfigError, SolveError};
use super::interpolate::Interpolator;
use super::store::AnchorStore;
use super::types::{InfoRecord, Model, State};

pub const DEFAULT_TOLERANCE: f64 = 1.0 / 365.0;
pub const DEFAULT_DIVERGENCE_THRESHOLD: f64 = 1e20;
pub const DEFAULT_MAX_SWEEPS: u32 = 1_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    Plain,
    Refine,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Refinement {
    AllDependencies,
    RandomDependency,
}

#[derive(Debug, Clone, Copy)]
pub struct SolverConfig {
    pub tolerance: f64,
    pub divergence_threshold: f64,
    pub max_sweeps: u32,
    pub warmup_sweeps: u32,
    pub refinement: Refinement,
    pub refine_min_income: f64,
    pub jitter: bool,
    pub seed: u64,
}

impl SolverConfig {
    pub fn for_model(model: &Model) -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            divergence_threshold: DEFAULT_DIVERGENCE_THRESHOLD,
            max_sweeps: DEFAULT_MAX_SWEEPS,
            warmup_sweeps: 0,
            refinement: Refinement::AllDependencies,
            refine_min_income: model.expenses() / 10.0,
            jitter: false,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    pub sweep: u32,
    pub mode: SweepMode,
    pub anchors: usize,
    pub inserted: usize,
    pub aggregate_error: f64,
    pub max_abs_error: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Converged,
    Diverged,
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub sweeps: u32,
    pub aggregate_error: f64,
    pub history: Vec<SweepStats>,
    pub message: String,
}

impl RunReport {
    pub fn converged(&self) -> bool {
        self.outcome == RunOutcome::Converged
    }
}

type TraceHook = Box<dyn FnMut(&SweepStats) + Send>;

/// Value iteration over an anchor store.
pub struct Solver<S: AnchorStore> {
    model: Model,
    config: SolverConfig,
    store: S,
    rng: SmallRng,
    sweeps: u32,
    last_errors: Vec<f64>,
    trace: Option<TraceHook>,
}

impl<S: AnchorStore> Solver<S> {
    pub fn new(model: Model, store: S, config: SolverConfig) -> Result<Self, ConfigError> {
        validate_config(&config)?;
        if store.is_empty() {
            return Err(ConfigError::TooFewAnchors {
                required: 1,
                available: 0,
            });
        }
        Ok(Self {
            rng: SmallRng::seed_from_u64(config.seed),
            model,
            config,
            store,
            sweeps: 0,
            last_errors: Vec::new(),
            trace: None,
        })
    }

    pub fn with_trace<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&SweepStats) + Send + 'static,
    {
        self.trace = Some(Box::new(hook));
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn sweeps_done(&self) -> u32 {
        self.sweeps
    }

    /// Signed `old - new` error per anchor of the last sweep, in store order.
    pub fn last_errors(&self) -> &[f64] {
        &self.last_errors
    }

    pub fn estimate_value(&self, state: State) -> Result<f64, SolveError> {
        Interpolator::new(&self.model, &self.store).estimate_value(state)
    }

    pub fn evaluate(&self, state: State) -> Result<Backup, SolveError> {
        let grid = PolicyGrid::regular(self.model.params().policy_fractions);
        Bellman::new(&self.model, &self.store, &grid).evaluate(state)
    }

    pub fn sweep(&mut self, mode: SweepMode) -> Result<SweepStats, SolveError> {
        let fractions = self.model.params().policy_fractions;
        let grid = if self.config.jitter {
            PolicyGrid::jittered(fractions, &mut self.rng)
        } else {
            PolicyGrid::regular(fractions)
        };

        let bellman = Bellman::new(&self.model, &self.store, &grid);
        let snapshot: Vec<(State, InfoRecord)> =
            self.store.all().map(|(state, record)| (state, *record)).collect();
        let backups: Vec<Backup> = snapshot
            .par_iter()
            .map(|(state, _)| bellman.evaluate(*state))
            .collect::<Result<_, _>>()?;

        let mut next = self.store.empty_like();
        let mut errors = Vec::with_capacity(snapshot.len());
        for ((state, old), backup) in snapshot.iter().zip(&backups) {
            let error = SolveError::check_finite("error", *state, old.value - backup.value)?;
            errors.push(error);
            next.set(
                *state,
                InfoRecord {
                    value: backup.value,
                    policy: backup.policy,
                    weight: old.weight,
                },
            );
        }

        let mut inserted = 0;
        if mode == SweepMode::Refine {
            let worst = snapshot
                .iter()
                .zip(&errors)
                .zip(&backups)
                .filter(|(((state, _), _), _)| state.y > self.config.refine_min_income)
                .fold(None::<(f64, &Backup)>, |acc, ((_, error), backup)| match acc {
                    Some((best, _)) if error.abs() <= best => acc,
                    _ => Some((error.abs(), backup)),
                });

            let mut targets: Vec<State> = match worst {
                Some((_, backup)) => backup.dependencies.clone(),
                None => Vec::new(),
            };
            if self.config.refinement == Refinement::RandomDependency && !targets.is_empty() {
                let pick = self.rng.random_range(0..targets.len());
                targets = vec![targets[pick]];
            }
            if targets.is_empty() {
                log::debug!("refinement found no dependencies to insert");
            }

            for target in targets {
                let target = self.model.clamp_state(target);
                if next.get(target).is_some() {
                    continue;
                }
                let backup = bellman.evaluate(target)?;
                next.set(
                    target,
                    InfoRecord {
                        value: backup.value,
                        policy: backup.policy,
                        weight: None,
                    },
                );
                inserted += 1;
            }
        }

        let aggregate_error = mean_square(&errors);
        let max_abs_error = errors.iter().fold(0.0f64, |m, e| m.max(e.abs()));

        self.store = next;
        self.last_errors = errors;
        self.sweeps += 1;

        let stats = SweepStats {
            sweep: self.sweeps,
            mode,
            anchors: self.store.len(),
            inserted,
            aggregate_error,
            max_abs_error,
        };
        log::debug!(
            "sweep {:>5} {:<7?} anchors {:>7} inserted {:>3} error {:.3e}",
            stats.sweep,
            stats.mode,
            stats.anchors,
            stats.inserted,
            stats.aggregate_error
        );
        if let Some(hook) = self.trace.as_mut() {
            hook(&stats);
        }
        Ok(stats)
    }

    pub fn sweeps(&mut self, n: u32, mode: SweepMode) -> Result<f64, SolveError> {
        let mut error = f64::INFINITY;
        for _ in 0..n {
            error = self.sweep(mode)?.aggregate_error;
        }
        Ok(error)
    }

    pub fn run(&mut self, mode: SweepMode) -> Result<RunReport, SolveError> {
        log::info!(
            "solving over {} anchors (tolerance {:.3e}, budget {} sweeps)",
            self.store.len(),
            self.config.tolerance,
            self.config.max_sweeps
        );

        let mut history = Vec::new();
        let mut outcome = RunOutcome::Exhausted;
        let mut aggregate_error = f64::INFINITY;
        for run_sweep in 1..=self.config.max_sweeps {
            let stats = self.sweep(mode)?;
            history.push(stats);
            aggregate_error = stats.aggregate_error;

            if !(aggregate_error <= self.config.divergence_threshold) {
                outcome = RunOutcome::Diverged;
                break;
            }
            if run_sweep > self.config.warmup_sweeps && aggregate_error < self.config.tolerance {
                outcome = RunOutcome::Converged;
                break;
            }
        }

        let sweeps = history.len() as u32;
        let message = match outcome {
            RunOutcome::Converged => format!("Converged after {sweeps} sweeps."),
            RunOutcome::Diverged => format!(
                "Aggregate error {aggregate_error:.3e} exceeded the divergence threshold after {sweeps} sweeps."
            ),
            RunOutcome::Exhausted => format!(
                "Reached max sweeps before tolerance was met; returning best estimate (error {aggregate_error:.3e})."
            ),
        };
        match outcome {
            RunOutcome::Converged => log::info!("{message}"),
            _ => log::warn!("{message}"),
        }

        Ok(RunReport {
            outcome,
            sweeps,
            aggregate_error,
            history,
            message,
        })
    }
}

fn mean_square(errors: &[f64]) -> f64 {
    if errors.is_empty() {
        return 0.0;
    }
    errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64
}

fn validate_config(config: &SolverConfig) -> Result<(), ConfigError> {
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err(ConfigError::Invalid("tolerance must be > 0".to_string()));
    }
    if !(config.divergence_threshold > config.tolerance) {
        return Err(ConfigError::Invalid(
            "divergence_threshold must be greater than tolerance".to_string(),
        ));
    }
    if config.max_sweeps == 0 {
        return Err(ConfigError::Invalid("max_sweeps must be > 0".to_string()));
    }
    if !config.refine_min_income.is_finite() {
        return Err(ConfigError::Invalid(
            "refine_min_income must be finite".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::returns::ReturnDistribution;
    use crate::core::seed;
    use crate::core::store::SpatialStore;
    use crate::core::types::{Anchor, ModelParams};
    use std::sync::{Arc, Mutex};

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn toy_model() -> Model {
        Model::new(ModelParams {
            time_discount: 0.5,
            expenses: 1.0,
            max_value: 2.02,
            returns: ReturnDistribution::new(vec![2.0]).expect("valid"),
            min_state: State::ORIGIN,
            max_state: State::new(100.0, 1.0),
            policy_fractions: 10,
            bonus_divisor: 100.0,
        })
        .expect("valid model")
    }

    fn toy_seed() -> SpatialStore {
        seed::explicit([
            (0.0, 0.0, 0.6),
            (0.0, 2.0, 0.6),
            (0.0, 1.0, 0.8),
            (1.0, 2.0, 0.5),
            (2.0, 0.0, 0.5),
            (0.5, 0.0, -1.0),
        ])
    }

    fn toy_solver() -> Solver<SpatialStore> {
        let model = toy_model();
        let config = SolverConfig::for_model(&model);
        Solver::new(model, toy_seed(), config).expect("valid solver")
    }

    fn nearest_value(store: &SpatialStore, state: State) -> f64 {
        store.nearest_k(state, 1, |_| false)[0].1.value
    }

    #[test]
    fn toy_model_reaches_discounted_fixed_points() {
        let mut solver = toy_solver();
        solver.sweeps(10, SweepMode::Plain).expect("plain sweeps");
        solver.sweeps(10, SweepMode::Refine).expect("refine sweeps");
        let error = solver.sweeps(100, SweepMode::Plain).expect("plain sweeps");
        assert!(error < solver.config().tolerance);

        let store = solver.into_store();
        // Keeping all income at (0, 1) pays expenses exactly and lands back on (0, 1):
        // V = 1 + 0.5 V. At (2, 0) the return refills what expenses took:
        // V = 1.01 + 0.5 V.
        assert_close(nearest_value(&store, State::new(0.0, 1.0)), 2.0, 1e-9);
        assert_close(nearest_value(&store, State::new(2.0, 0.0)), 2.02, 1e-9);
        assert_eq!(store.get(State::ORIGIN).map(|r| r.value), Some(-2.02));
        assert_eq!(store.get(State::new(0.0, 1.0)).map(|r| r.policy), Some(1.0));
    }

    #[test]
    fn sweep_records_signed_errors_in_store_order() {
        let mut solver = toy_solver();
        let stats = solver.sweep(SweepMode::Plain).expect("sweep");
        let errors = solver.last_errors().to_vec();
        assert_eq!(errors.len(), 6);
        // (0, 0) falls to the ruin sentinel; (2, 0) rises from 0.5 to 1.01 + 0.5 * 0.5.
        assert_close(errors[0], 0.6 + 2.02, 1e-9);
        assert_close(errors[5], 0.5 - 1.26, 1e-9);
        let mean_square = errors.iter().map(|e| e * e).sum::<f64>() / 6.0;
        assert_close(stats.aggregate_error, mean_square, 1e-6);
        assert_eq!(stats.anchors, 6);
        assert_eq!(stats.inserted, 0);
    }

    #[test]
    fn value_falls_monotonically_into_ruin_after_a_sweep() {
        let mut solver = toy_solver();
        solver.sweep(SweepMode::Plain).expect("sweep");
        // Spending exactly the expenses is worth 1 + 0.5 * ruin = 0; one cent less is ln(0.99).
        assert_close(solver.evaluate(State::new(1.0, 0.0)).expect("finite").value, 0.0, 1e-9);
        assert_close(
            solver.evaluate(State::new(0.99, 0.0)).expect("finite").value,
            0.99_f64.ln(),
            1e-9,
        );
        let mut previous = f64::INFINITY;
        for step in (0..=120).rev() {
            let x = step as f64 * 0.01;
            let value = solver.evaluate(State::new(x, 0.0)).expect("finite").value;
            assert!(value <= previous + 1e-12, "value rose to {value} at x = {x}");
            previous = value;
        }
        assert_eq!(previous, solver.model().ruin_value());
    }

    #[test]
    fn sweeps_from_the_same_snapshot_are_identical() {
        for jitter in [false, true] {
            let model = toy_model();
            let mut config = SolverConfig::for_model(&model);
            config.jitter = jitter;
            let mut a = Solver::new(model.clone(), toy_seed(), config).expect("valid");
            let mut b = Solver::new(model, toy_seed(), config).expect("valid");
            a.sweep(SweepMode::Refine).expect("sweep");
            b.sweep(SweepMode::Refine).expect("sweep");
            assert_eq!(a.last_errors(), b.last_errors());
            assert_eq!(a.store(), b.store());
        }
    }

    #[test]
    fn refinement_inserts_dependencies_of_the_worst_anchor() {
        let mut solver = toy_solver();
        let stats = solver.sweep(SweepMode::Refine).expect("sweep");
        // (1, 2) has the largest error above the income floor; its winning policy keeps
        // 1.6 of income and depends on (3.2, 1.6), clamped into the domain.
        assert_eq!(stats.inserted, 1);
        assert_eq!(solver.store().len(), 7);
        let (state, record) = solver
            .store()
            .all()
            .find(|(s, _)| s.y == 1.0 && s.x > 3.0)
            .expect("inserted anchor");
        assert_close(state.x, 3.2, 1e-12);
        assert_close(record.value, 2.02, 1e-12);
    }

    #[test]
    fn random_refinement_inserts_at_most_one_anchor() {
        let model = Model::new(ModelParams {
            returns: ReturnDistribution::new(vec![0.5, 1.5, 2.5]).expect("valid"),
            ..toy_model().params().clone()
        })
        .expect("valid");
        let mut config = SolverConfig::for_model(&model);
        config.refinement = Refinement::RandomDependency;
        let mut solver = Solver::new(model, toy_seed(), config).expect("valid");
        let stats = solver.sweep(SweepMode::Refine).expect("sweep");
        assert!(stats.inserted <= 1);
        assert_eq!(solver.store().len(), 6 + stats.inserted);
    }

    #[test]
    fn run_stops_once_error_is_below_tolerance() {
        let mut solver = toy_solver();
        let report = solver.run(SweepMode::Plain).expect("run");
        assert!(report.converged());
        assert_eq!(report.sweeps, 4);
        assert!(report.aggregate_error < DEFAULT_TOLERANCE);
        let errors: Vec<f64> = report.history.iter().map(|s| s.aggregate_error).collect();
        assert!(errors.windows(2).all(|w| w[1] <= w[0]), "{errors:?}");
    }

    #[test]
    fn warmup_sweeps_delay_the_tolerance_check() {
        let model = toy_model();
        let mut config = SolverConfig::for_model(&model);
        config.warmup_sweeps = 6;
        let mut solver = Solver::new(model, toy_seed(), config).expect("valid");
        let report = solver.run(SweepMode::Plain).expect("run");
        assert!(report.converged());
        assert_eq!(report.sweeps, 7);
    }

    #[test]
    fn non_finite_interpolation_aborts_the_sweep_untouched() {
        let half = f64::MAX / 2.0;
        let seed = seed::explicit([(0.0, 0.0, -half), (1.0, 0.0, half), (1.0, 1.0, half)]);
        let model = toy_model();
        let config = SolverConfig::for_model(&model);
        let mut solver = Solver::new(model, seed.clone(), config).expect("valid");
        // Saving all income at (1, 1) lands on (2, 0), far outside the anchor triangle.
        let err = solver.sweep(SweepMode::Plain).expect_err("overflow");
        assert!(
            matches!(
                err,
                SolveError::NonFinite {
                    stage: "interpolated value",
                    ..
                }
            ),
            "{err:?}"
        );
        assert_eq!(solver.sweeps_done(), 0);
        assert!(solver.last_errors().is_empty());
        assert_eq!(solver.store(), &seed);
    }

    #[test]
    fn run_reports_divergence_without_failing() {
        let model = toy_model();
        let mut config = SolverConfig::for_model(&model);
        config.divergence_threshold = 1.0;
        let mut solver = Solver::new(model, toy_seed(), config).expect("valid");
        let report = solver.run(SweepMode::Plain).expect("divergence is not an error");
        assert_eq!(report.outcome, RunOutcome::Diverged);
        assert_eq!(report.sweeps, 1);
    }

    #[test]
    fn run_reports_exhausted_budget() {
        let model = toy_model();
        let mut config = SolverConfig::for_model(&model);
        config.max_sweeps = 2;
        let mut solver = Solver::new(model, toy_seed(), config).expect("valid");
        let report = solver.run(SweepMode::Plain).expect("run");
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(report.sweeps, 2);
        assert_eq!(solver.sweeps_done(), 2);
    }

    #[test]
    fn trace_hook_sees_every_sweep() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut solver = toy_solver().with_trace(move |stats| {
            sink.lock().expect("trace lock").push(stats.sweep);
        });
        solver.sweeps(3, SweepMode::Plain).expect("sweeps");
        assert_eq!(*seen.lock().expect("trace lock"), vec![1, 2, 3]);
    }

    #[test]
    fn rejects_invalid_configuration() {
        let model = toy_model();
        let mut config = SolverConfig::for_model(&model);
        config.tolerance = 0.0;
        assert!(Solver::new(model.clone(), toy_seed(), config).is_err());

        let config = SolverConfig::for_model(&model);
        assert_eq!(
            Solver::new(model, SpatialStore::new(), config).err(),
            Some(ConfigError::TooFewAnchors {
                required: 1,
                available: 0
            })
        );
    }

    #[test]
    fn geometry_errors_abort_the_sweep() {
        let model = toy_model();
        let config = SolverConfig::for_model(&model);
        let store = SpatialStore::from_anchors([Anchor {
            state: State::new(3.0, 0.5),
            record: InfoRecord::with_value(1.0),
        }]);
        let mut solver = Solver::new(model, store, config).expect("valid");
        assert!(matches!(
            solver.sweep(SweepMode::Plain),
            Err(SolveError::Config(ConfigError::TooFewAnchors { .. }))
        ));
        assert_eq!(solver.sweeps_done(), 0);
    }
}
