use serde::Serialize;

use super::error::ConfigError;

/// Yearly total-return multipliers of the Wilshire 5000 Total Market Full Cap index
/// (FRED), oldest first.
pub const HISTORICAL_RETURNS: [f64; 49] = [
    1.164, 0.952, 0.776, 1.123, 1.23, 1.03, 1.077, 1.25, 1.181, 1.15, 0.969, 1.43, 1.014, 1.221,
    1.304, 1.21, 0.961, 1.25, 1.037, 1.169, 1.152, 1.134, 1.048, 1.197, 1.258, 1.294, 1.232,
    1.216, 1.115, 0.831, 0.862, 1.007, 1.21, 1.104, 1.119, 1.15, 0.843, 0.806, 1.251, 1.14,
    1.101, 1.231, 1.198, 1.08, 1.023, 1.199, 1.142, 1.072, 1.121,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReturnDistribution(Vec<f64>);

impl ReturnDistribution {
    pub fn new(multipliers: Vec<f64>) -> Result<Self, ConfigError> {
        if multipliers.is_empty() {
            return Err(ConfigError::EmptyReturns);
        }
        if let Some((index, &value)) = multipliers
            .iter()
            .enumerate()
            .find(|(_, r)| !r.is_finite() || **r <= 0.0)
        {
            return Err(ConfigError::ReturnMultiplier { index, value });
        }
        Ok(Self(multipliers))
    }

    pub fn historical() -> Self {
        Self(HISTORICAL_RETURNS.to_vec())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn mean(&self) -> f64 {
        self.0.iter().sum::<f64>() / self.0.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_returns_are_valid_multipliers() {
        let returns = ReturnDistribution::new(HISTORICAL_RETURNS.to_vec()).expect("valid");
        assert_eq!(returns.len(), 49);
        assert!(returns.mean() > 1.0 && returns.mean() < 1.2);
    }

    #[test]
    fn rejects_empty_and_non_positive_multipliers() {
        assert_eq!(
            ReturnDistribution::new(Vec::new()),
            Err(ConfigError::EmptyReturns)
        );
        let err = ReturnDistribution::new(vec![1.1, 0.0, 0.9]).expect_err("zero multiplier");
        assert_eq!(
            err,
            ConfigError::ReturnMultiplier {
                index: 1,
                value: 0.0
            }
        );
        assert!(ReturnDistribution::new(vec![f64::NAN]).is_err());
    }
}
