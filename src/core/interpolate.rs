use super::error::SolveError;
use super::store::AnchorStore;
use super::types::{Model, State};

pub struct Interpolator<'a, S> {
    model: &'a Model,
    store: &'a S,
}

impl<'a, S: AnchorStore> Interpolator<'a, S> {
    pub fn new(model: &'a Model, store: &'a S) -> Self {
        Self { model, store }
    }

    pub fn estimate_value(&self, state: State) -> Result<f64, SolveError> {
        let state = self.model.clamp_state(state);
        if let Some(record) = self.store.get(state) {
            return Ok(record.value);
        }
        let raw = self.store.interpolate(state)?;
        let value = SolveError::check_finite("interpolated value", state, raw)?;
        Ok(self.model.clamp_value(value))
    }
}
