use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::store::{AnchorStore, LatticeStore, SpatialStore};
use super::types::{Anchor, InfoRecord, Model, State};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot does not describe a usable store: {0}")]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorRow {
    pub x: f64,
    pub y: f64,
    pub value: f64,
    pub policy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl From<Anchor> for AnchorRow {
    fn from(anchor: Anchor) -> Self {
        Self {
            x: anchor.state.x,
            y: anchor.state.y,
            value: anchor.record.value,
            policy: anchor.record.policy,
            weight: anchor.record.weight,
        }
    }
}

impl From<AnchorRow> for Anchor {
    fn from(row: AnchorRow) -> Self {
        Self {
            state: State::new(row.x, row.y),
            record: InfoRecord {
                value: row.value,
                policy: row.policy,
                weight: row.weight,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub min_state: State,
    pub max_state: State,
    pub max_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spacing: Option<State>,
    pub anchors: Vec<AnchorRow>,
}

impl Snapshot {
    pub fn capture<S: AnchorStore>(model: &Model, store: &S) -> Self {
        Self {
            min_state: model.min_state(),
            max_state: model.max_state(),
            max_value: model.max_value(),
            spacing: store.lattice_spacing(),
            anchors: store.anchors().into_iter().map(AnchorRow::from).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot = serde_json::from_str(text)?;
        snapshot.check()?;
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        fs::write(path, self.to_json()?)?;
        log::info!(
            "saved {} anchors to {}",
            self.anchors.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let snapshot = Self::from_json(&fs::read_to_string(path)?)?;
        log::info!(
            "loaded {} anchors from {}",
            snapshot.anchors.len(),
            path.display()
        );
        Ok(snapshot)
    }

    pub fn into_spatial(self) -> SpatialStore {
        SpatialStore::from_anchors(self.anchors.into_iter().map(Anchor::from))
    }

    /// Rebuild a lattice store. `spacing` overrides the recorded one; a snapshot taken
    /// from a spatial store has none and needs it.
    pub fn into_lattice(self, spacing: Option<State>) -> Result<LatticeStore, SnapshotError> {
        let spacing = spacing.or(self.spacing).ok_or_else(|| {
            ConfigError::Invalid("snapshot has no lattice spacing".to_string())
        })?;
        Ok(LatticeStore::from_anchors(
            spacing,
            self.max_state,
            self.anchors.into_iter().map(Anchor::from),
        )?)
    }

    pub fn matches(&self, model: &Model) -> bool {
        self.min_state == model.min_state()
            && self.max_state == model.max_state()
            && self.max_value == model.max_value()
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.anchors.is_empty() {
            return Err(ConfigError::TooFewAnchors {
                required: 1,
                available: 0,
            });
        }
        if let Some(row) = self
            .anchors
            .iter()
            .find(|r| !(r.x.is_finite() && r.y.is_finite() && r.value.is_finite()))
        {
            return Err(ConfigError::Invalid(format!(
                "non-finite anchor row at ({}, {})",
                row.x, row.y
            )));
        }
        Ok(())
    }
}
