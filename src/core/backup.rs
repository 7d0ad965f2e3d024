use rand::Rng;

use super::error::SolveError;
use super::interpolate::Interpolator;
use super::store::AnchorStore;
use super::types::{Model, State};

#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    pub value: f64,
    pub policy: f64,
    pub dependencies: Vec<State>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyGrid {
    fractions: Vec<f64>,
}

impl PolicyGrid {
    pub fn regular(n: usize) -> Self {
        let fractions = (0..n)
            .map(|i| i as f64 / n as f64)
            .chain(std::iter::once(1.0))
            .collect();
        Self { fractions }
    }

    /// Like [`PolicyGrid::regular`], with each of the `n` fractions shifted by an
    /// independent draw from `[0, 1/n)`. The final `1` is not jittered.
    pub fn jittered<R: Rng>(n: usize, rng: &mut R) -> Self {
        let fractions = (0..n)
            .map(|i| (i as f64 + rng.random::<f64>()) / n as f64)
            .chain(std::iter::once(1.0))
            .collect();
        Self { fractions }
    }

    pub fn fractions(&self) -> &[f64] {
        &self.fractions
    }

    pub fn candidates(&self, income: f64) -> Vec<f64> {
        let mut out: Vec<f64> = Vec::with_capacity(self.fractions.len());
        for fraction in &self.fractions {
            let amount = fraction * income;
            if !out.contains(&amount) {
                out.push(amount);
            }
        }
        out
    }
}

pub struct Bellman<'a, S> {
    model: &'a Model,
    grid: &'a PolicyGrid,
    values: Interpolator<'a, S>,
}

impl<'a, S: AnchorStore> Bellman<'a, S> {
    pub fn new(model: &'a Model, store: &'a S, grid: &'a PolicyGrid) -> Self {
        Self {
            model,
            grid,
            values: Interpolator::new(model, store),
        }
    }

    pub fn evaluate(&self, state: State) -> Result<Backup, SolveError> {
        if state.x <= 0.0 && state.y == 0.0 {
            return Ok(Backup {
                value: self.model.ruin_value(),
                policy: 0.0,
                dependencies: Vec::new(),
            });
        }
        if state.x > self.model.max_state().x {
            return Ok(Backup {
                value: self.model.max_value(),
                policy: 0.0,
                dependencies: Vec::new(),
            });
        }

        let mut best = Backup {
            value: f64::NEG_INFINITY,
            policy: 0.0,
            dependencies: Vec::new(),
        };
        for policy in self.grid.candidates(state.y) {
            let (reward, dependencies) = self.reward(state, policy)?;
            let reward = SolveError::check_finite("reward", state, reward)?;
            if reward > best.value {
                best = Backup {
                    value: reward,
                    policy,
                    dependencies,
                };
            }
        }

        best.value = self.model.clamp_value(best.value);
        Ok(best)
    }

    fn reward(&self, state: State, policy: f64) -> Result<(f64, Vec<State>), SolveError> {
        let expenses = self.model.expenses();
        let mut net_worth = state.x + policy;

        if net_worth == 0.0 {
            return Ok((self.model.ruin_value(), Vec::new()));
        }
        if net_worth < expenses {
            // Continuous shortfall penalty; no continuation.
            return Ok(((net_worth / expenses).ln(), Vec::new()));
        }

        let divisor = self.model.params().bonus_divisor;
        let bonus = if state.y > 0.0 {
            (1.0 - policy / state.y) / divisor
        } else {
            1.0 / divisor
        };
        net_worth -= expenses;

        let dependencies: Vec<State> = self
            .model
            .returns()
            .as_slice()
            .iter()
            .map(|r| State::new(r * net_worth, policy))
            .collect();
        let mut total = 0.0;
        for dependency in &dependencies {
            total += self.values.estimate_value(*dependency)?;
        }
        let continuation = total / dependencies.len() as f64;

        Ok((
            1.0 + bonus + self.model.time_discount() * continuation,
            dependencies,
        ))
    }
}
