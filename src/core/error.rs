use super::types::State;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("time_discount must be in (0, 1), got {0}")]
    TimeDiscount(f64),

    #[error("expenses must be finite and > 0, got {0}")]
    Expenses(f64),

    #[error("max_value must be finite and > 0, got {0}")]
    MaxValue(f64),

    #[error("return distribution must not be empty")]
    EmptyReturns,

    #[error("return multiplier at index {index} must be finite and > 0, got {value}")]
    ReturnMultiplier { index: usize, value: f64 },

    #[error("state bounds are invalid: min {min}, max {max}")]
    Bounds { min: State, max: State },

    #[error("policy_fractions must be > 0")]
    PolicyFractions,

    #[error("lattice spacing must be finite and > 0, got {0}")]
    Spacing(State),

    #[error("interpolation needs at least {required} anchors, store has {available}")]
    TooFewAnchors { required: usize, available: usize },

    #[error("no non-degenerate anchor triangle around {0}")]
    DegenerateAnchors(State),

    #[error("lattice corner {0} is missing from the anchor store")]
    MissingCorner(State),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("non-finite {stage} at {state}: {value}")]
    NonFinite {
        stage: &'static str,
        state: State,
        value: f64,
    },
}

impl SolveError {
    pub(crate) fn check_finite(stage: &'static str, state: State, value: f64) -> Result<f64, Self> {
        if value.is_finite() {
            Ok(value)
        } else {
            Err(Self::NonFinite {
                stage,
                state,
                value,
            })
        }
    }
}
