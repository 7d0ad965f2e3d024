use rand::Rng;

use super::error::ConfigError;
use super::store::{AnchorStore, LatticeStore, SpatialStore};
use super::types::{Anchor, InfoRecord, Model, State};

pub fn random_lattice<R: Rng>(
    model: &Model,
    spacing: State,
    rng: &mut R,
) -> Result<LatticeStore, ConfigError> {
    let max = model.max_state();
    let mut store = LatticeStore::new(spacing, max)?;
    for x in LatticeStore::axis(spacing.x, max.x) {
        for y in LatticeStore::axis(spacing.y, max.y) {
            let state = State::new(x, y);
            let value = if state == State::ORIGIN {
                0.0
            } else {
                rng.random::<f64>()
            };
            store.set(state, InfoRecord::with_value(value));
        }
    }
    Ok(store)
}

/// `count` log-spaced incomes around `midpoint`: half below it, half at or above,
/// the largest just under `max`.
pub fn income_breakpoints(midpoint: f64, max: f64, count: usize) -> Vec<f64> {
    if count == 0 || !(midpoint > 0.0 && max > midpoint) {
        return Vec::new();
    }
    let half = (count / 2) as i64;
    let step = 2.0 * (max / midpoint).ln() / count as f64;
    (-half..half)
        .map(|i| midpoint * (step * i as f64).exp())
        .collect()
}

pub fn log_income_spatial<R: Rng>(
    model: &Model,
    net_worth_step: f64,
    income_count: usize,
    rng: &mut R,
) -> Result<SpatialStore, ConfigError> {
    if !(net_worth_step.is_finite() && net_worth_step > 0.0) {
        return Err(ConfigError::Spacing(State::new(net_worth_step, 0.0)));
    }
    let max = model.max_state();
    let mut incomes = vec![0.0];
    incomes.extend(
        income_breakpoints(model.expenses(), max.y, income_count)
            .into_iter()
            .filter(|&y| y > 0.0 && y < max.y),
    );
    incomes.push(max.y);

    let mut store = SpatialStore::new();
    for x in LatticeStore::axis(net_worth_step, max.x) {
        for &y in &incomes {
            let state = State::new(x, y);
            let value = if state == State::ORIGIN {
                0.0
            } else {
                rng.random::<f64>()
            };
            store.set(state, InfoRecord::with_value(value));
        }
    }
    Ok(store)
}

pub fn explicit<I>(points: I) -> SpatialStore
where
    I: IntoIterator<Item = (f64, f64, f64)>,
{
    SpatialStore::from_anchors(points.into_iter().map(|(x, y, value)| Anchor {
        state: State::new(x, y),
        record: InfoRecord::with_value(value),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::returns::ReturnDistribution;
    use crate::core::types::ModelParams;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn model() -> Model {
        Model::new(ModelParams {
            time_discount: 0.5,
            expenses: 1.0,
            max_value: 2.02,
            returns: ReturnDistribution::new(vec![2.0]).expect("valid"),
            min_state: State::ORIGIN,
            max_state: State::new(10.0, 4.0),
            policy_fractions: 10,
            bonus_divisor: 100.0,
        })
        .expect("valid model")
    }

    #[test]
    fn random_lattice_covers_every_cell_corner() {
        let model = model();
        let mut rng = SmallRng::seed_from_u64(1);
        let store = random_lattice(&model, State::new(3.0, 1.0), &mut rng).expect("valid");
        // x: 0, 3, 6, 9, 10; y: 0..=4
        assert_eq!(store.len(), 5 * 5);
        assert_eq!(store.get(State::ORIGIN).map(|r| r.value), Some(0.0));
        assert!(store.get(State::new(10.0, 4.0)).is_some());
        for (_, record) in store.all() {
            assert!((0.0..1.0).contains(&record.value));
        }
    }

    #[test]
    fn random_lattice_is_reproducible_per_seed() {
        let model = model();
        let spacing = State::new(2.0, 1.0);
        let a = random_lattice(&model, spacing, &mut SmallRng::seed_from_u64(9)).expect("valid");
        let b = random_lattice(&model, spacing, &mut SmallRng::seed_from_u64(9)).expect("valid");
        assert_eq!(a, b);
    }

    #[test]
    fn random_lattice_rejects_bad_spacing() {
        let model = model();
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(matches!(
            random_lattice(&model, State::new(0.0, 1.0), &mut rng),
            Err(ConfigError::Spacing(_))
        ));
    }

    #[test]
    fn income_breakpoints_are_log_spaced_around_the_midpoint() {
        let points = income_breakpoints(40_000.0, 59_089.0, 100);
        assert_eq!(points.len(), 100);
        assert_eq!(points[50], 40_000.0);
        assert!(points.iter().filter(|&&y| y < 40_000.0).count() == 50);
        assert!(*points.last().expect("non-empty") < 59_089.0);
        let ratio = points[1] / points[0];
        for pair in points.windows(2) {
            assert!((pair[1] / pair[0] - ratio).abs() < 1e-9);
        }
    }

    #[test]
    fn income_breakpoints_need_a_range() {
        assert!(income_breakpoints(1.0, 1.0, 10).is_empty());
        assert!(income_breakpoints(1.0, 4.0, 0).is_empty());
    }

    #[test]
    fn log_income_seed_has_zero_and_max_income_rows() {
        let model = model();
        let mut rng = SmallRng::seed_from_u64(3);
        let store = log_income_spatial(&model, 5.0, 4, &mut rng).expect("valid");
        // incomes: 0, 1/4, 1/2, 1, 2, 4
        let incomes: Vec<f64> = store
            .all()
            .filter(|(s, _)| s.x == 0.0)
            .map(|(s, _)| s.y)
            .collect();
        assert_eq!(incomes.first().copied(), Some(0.0));
        assert_eq!(incomes.last().copied(), Some(4.0));
        assert_eq!(incomes.len(), 6);
        assert_eq!(store.len(), 3 * 6);
        assert_eq!(store.get(State::ORIGIN).map(|r| r.value), Some(0.0));
    }

    #[test]
    fn explicit_seed_keeps_values() {
        let store = explicit([(0.0, 1.0, 0.8), (2.0, 0.0, 0.5)]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(State::new(2.0, 0.0)).map(|r| r.value), Some(0.5));
    }
}
