use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::returns::ReturnDistribution;

pub const MAX_VALUE_SAFETY: f64 = 1.1;
/// 1 / remaining life expectancy in years (SSA actuarial tables) folded into the discount.
pub const DEFAULT_TIME_DISCOUNT: f64 = 1.0 - 1.0 / 58.6;
pub const DEFAULT_EXPENSES: f64 = 40_000.0;
pub const DEFAULT_MAX_INCOME: f64 = 59_089.0;
pub const DEFAULT_POLICY_FRACTIONS: usize = 10;
pub const DEFAULT_BONUS_DIVISOR: f64 = 100.0;

/// A point of the (net worth, income) domain.
///
/// Equality and ordering use `f64::total_cmp` on `(x, y)` so states can key ordered
/// maps. Negative zero is folded into positive zero on construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct State {
    pub x: f64,
    pub y: f64,
}

impl State {
    pub const ORIGIN: State = State { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: fold_zero(x),
            y: fold_zero(y),
        }
    }

    pub fn distance_squared(self, other: State) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn clamp(self, min: State, max: State) -> Self {
        Self::new(self.x.clamp(min.x, max.x), self.y.clamp(min.y, max.y))
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

fn fold_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for State {}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        self.x
            .total_cmp(&other.x)
            .then_with(|| self.y.total_cmp(&other.y))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InfoRecord {
    pub value: f64,
    pub policy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl InfoRecord {
    pub fn with_value(value: f64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub state: State,
    pub record: InfoRecord,
}

#[derive(Debug, Clone)]
pub struct ModelParams {
    pub time_discount: f64,
    pub expenses: f64,
    pub max_value: f64,
    pub returns: ReturnDistribution,
    pub min_state: State,
    pub max_state: State,
    pub policy_fractions: usize,
    pub bonus_divisor: f64,
}

impl ModelParams {
    pub fn retirement() -> Self {
        Self {
            time_discount: DEFAULT_TIME_DISCOUNT,
            expenses: DEFAULT_EXPENSES,
            max_value: default_max_value(DEFAULT_TIME_DISCOUNT),
            returns: ReturnDistribution::historical(),
            min_state: State::ORIGIN,
            max_state: State::new(100.0 * DEFAULT_EXPENSES, DEFAULT_MAX_INCOME),
            policy_fractions: DEFAULT_POLICY_FRACTIONS,
            bonus_divisor: DEFAULT_BONUS_DIVISOR,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.time_discount > 0.0 && self.time_discount < 1.0) {
            return Err(ConfigError::TimeDiscount(self.time_discount));
        }
        if !self.expenses.is_finite() || self.expenses <= 0.0 {
            return Err(ConfigError::Expenses(self.expenses));
        }
        if !self.max_value.is_finite() || self.max_value <= 0.0 {
            return Err(ConfigError::MaxValue(self.max_value));
        }
        let bounds_ok = self.min_state.is_finite()
            && self.max_state.is_finite()
            && self.min_state.x >= 0.0
            && self.min_state.y >= 0.0
            && self.max_state.x > self.min_state.x
            && self.max_state.y > self.min_state.y;
        if !bounds_ok {
            return Err(ConfigError::Bounds {
                min: self.min_state,
                max: self.max_state,
            });
        }
        if self.policy_fractions == 0 {
            return Err(ConfigError::PolicyFractions);
        }
        if !self.bonus_divisor.is_finite() || self.bonus_divisor <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "bonus_divisor must be finite and > 0, got {}",
                self.bonus_divisor
            )));
        }
        Ok(())
    }
}

pub fn default_max_value(time_discount: f64) -> f64 {
    MAX_VALUE_SAFETY / (1.0 - time_discount)
}

#[derive(Debug, Clone)]
pub struct Model {
    params: ModelParams,
}

impl Model {
    pub fn new(params: ModelParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn time_discount(&self) -> f64 {
        self.params.time_discount
    }

    pub fn expenses(&self) -> f64 {
        self.params.expenses
    }

    pub fn max_value(&self) -> f64 {
        self.params.max_value
    }

    pub fn returns(&self) -> &ReturnDistribution {
        &self.params.returns
    }

    pub fn min_state(&self) -> State {
        self.params.min_state
    }

    pub fn max_state(&self) -> State {
        self.params.max_state
    }

    pub fn ruin_value(&self) -> f64 {
        -self.params.max_value
    }

    pub fn clamp_state(&self, state: State) -> State {
        state.clamp(self.params.min_state, self.params.max_state)
    }

    pub fn clamp_value(&self, value: f64) -> f64 {
        value.clamp(-self.params.max_value, self.params.max_value)
    }
}
