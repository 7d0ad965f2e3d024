use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::error::ConfigError;
use super::types::{Anchor, InfoRecord, State};

const COLLINEAR_EPS: f64 = 1e-12;

pub trait AnchorStore: Send + Sync + Sized {
    fn get(&self, state: State) -> Option<&InfoRecord>;

    fn set(&mut self, state: State, record: InfoRecord);

    fn all(&self) -> impl Iterator<Item = (State, &InfoRecord)> + '_;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn empty_like(&self) -> Self;

    fn lattice_spacing(&self) -> Option<State> {
        None
    }

    fn interpolate(&self, state: State) -> Result<f64, ConfigError>;

    fn anchors(&self) -> Vec<Anchor> {
        self.all()
            .map(|(state, record)| Anchor {
                state,
                record: *record,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialStore {
    anchors: BTreeMap<State, InfoRecord>,
}

impl SpatialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_anchors<I: IntoIterator<Item = Anchor>>(anchors: I) -> Self {
        Self {
            anchors: anchors
                .into_iter()
                .map(|a| (State::new(a.state.x, a.state.y), a.record))
                .collect(),
        }
    }

    /// The `k` anchors nearest to `target` by Euclidean distance, nearest first, skipping
    /// any anchor for which `exclude` returns true. Equidistant anchors come out in
    /// `(x, y)` order.
    pub fn nearest_k<F>(&self, target: State, k: usize, exclude: F) -> Vec<(State, InfoRecord)>
    where
        F: Fn(State) -> bool,
    {
        if k == 0 {
            return Vec::new();
        }

        let pivot = State {
            x: target.x,
            y: f64::NEG_INFINITY,
        };
        let mut right = self.anchors.range(pivot..).peekable();
        let mut left = self.anchors.range(..pivot).rev().peekable();
        let mut best: Vec<(f64, State, InfoRecord)> = Vec::with_capacity(k + 1);

        loop {
            let gap_left = left.peek().map(|(s, _)| target.x - s.x);
            let gap_right = right.peek().map(|(s, _)| s.x - target.x);
            let (take_left, gap) = match (gap_left, gap_right) {
                (None, None) => break,
                (Some(l), None) => (true, l),
                (None, Some(r)) => (false, r),
                (Some(l), Some(r)) if l <= r => (true, l),
                (Some(_), Some(r)) => (false, r),
            };
            if best.len() == k && gap * gap > best[k - 1].0 {
                break;
            }

            let next = if take_left { left.next() } else { right.next() };
            let Some((&state, &record)) = next else {
                break;
            };
            if exclude(state) {
                continue;
            }

            let dist = state.distance_squared(target);
            let pos = best.partition_point(|(d, s, _)| {
                d.total_cmp(&dist).then_with(|| s.cmp(&state)) == Ordering::Less
            });
            if pos < k {
                best.insert(pos, (dist, state, record));
                best.truncate(k);
            }
        }

        best.into_iter().map(|(_, s, r)| (s, r)).collect()
    }

    /// Three anchors around `state` forming a non-degenerate triangle.
    fn triangle(&self, state: State) -> Result<[(State, InfoRecord); 3], ConfigError> {
        if self.anchors.len() < 3 {
            return Err(ConfigError::TooFewAnchors {
                required: 3,
                available: self.anchors.len(),
            });
        }

        let mut picked = self.nearest_k(state, 3, |_| false);
        if !spans_plane(&picked) {
            picked.truncate(1);
            while picked.len() < 3 {
                let strict = self
                    .nearest_k(state, 1, |c| {
                        picked.iter().any(|(s, _)| s.x == c.x || s.y == c.y)
                            || (picked.len() == 2 && collinear(picked[0].0, picked[1].0, c))
                    })
                    .pop();
                let next = strict.or_else(|| {
                    self.nearest_k(state, 1, |c| {
                        picked.iter().any(|(s, _)| *s == c)
                            || (picked.len() == 2 && collinear(picked[0].0, picked[1].0, c))
                    })
                    .pop()
                });
                match next {
                    Some(anchor) => picked.push(anchor),
                    None => return Err(ConfigError::DegenerateAnchors(state)),
                }
            }
        }

        match picked.as_slice() {
            [a, b, c] => Ok([*a, *b, *c]),
            _ => Err(ConfigError::DegenerateAnchors(state)),
        }
    }
}

impl AnchorStore for SpatialStore {
    fn get(&self, state: State) -> Option<&InfoRecord> {
        self.anchors.get(&state)
    }

    fn set(&mut self, state: State, record: InfoRecord) {
        self.anchors.insert(State::new(state.x, state.y), record);
    }

    fn all(&self) -> impl Iterator<Item = (State, &InfoRecord)> + '_ {
        self.anchors.iter().map(|(s, r)| (*s, r))
    }

    fn len(&self) -> usize {
        self.anchors.len()
    }

    fn empty_like(&self) -> Self {
        Self::new()
    }

    fn interpolate(&self, state: State) -> Result<f64, ConfigError> {
        let [a, b, c] = self.triangle(state)?;
        let weights = barycentric(a.0, b.0, c.0, state);
        Ok(weights[0] * a.1.value + weights[1] * b.1.value + weights[2] * c.1.value)
    }
}

fn spans_plane(anchors: &[(State, InfoRecord)]) -> bool {
    match anchors {
        [a, b, c] => !collinear(a.0, b.0, c.0),
        _ => false,
    }
}

/// True when the three points do not enclose a proper triangle. Covers the shared-x and
/// shared-y cases as well as diagonal lines.
fn collinear(a: State, b: State, c: State) -> bool {
    let span_x = a.x.max(b.x).max(c.x) - a.x.min(b.x).min(c.x);
    let span_y = a.y.max(b.y).max(c.y) - a.y.min(b.y).min(c.y);
    if span_x == 0.0 || span_y == 0.0 {
        return true;
    }
    let twice_area = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    twice_area.abs() <= COLLINEAR_EPS * span_x * span_y
}

/// Barycentric coordinates of `p` with respect to triangle `(a, b, c)`. Points outside
/// the triangle get negative weights (linear extrapolation).
fn barycentric(a: State, b: State, c: State, p: State) -> [f64; 3] {
    let det = (b.y - c.y) * (a.x - c.x) + (c.x - b.x) * (a.y - c.y);
    let l1 = ((b.y - c.y) * (p.x - c.x) + (c.x - b.x) * (p.y - c.y)) / det;
    let l2 = ((c.y - a.y) * (p.x - c.x) + (a.x - c.x) * (p.y - c.y)) / det;
    [l1, l2, 1.0 - l1 - l2]
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatticeStore {
    anchors: BTreeMap<State, InfoRecord>,
    spacing: State,
    max: State,
}

impl LatticeStore {
    pub fn new(spacing: State, max: State) -> Result<Self, ConfigError> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(spacing.x) || !valid(spacing.y) {
            return Err(ConfigError::Spacing(spacing));
        }
        Ok(Self {
            anchors: BTreeMap::new(),
            spacing,
            max,
        })
    }

    pub fn from_anchors<I: IntoIterator<Item = Anchor>>(
        spacing: State,
        max: State,
        anchors: I,
    ) -> Result<Self, ConfigError> {
        let mut store = Self::new(spacing, max)?;
        for anchor in anchors {
            store.set(anchor.state, anchor.record);
        }
        Ok(store)
    }

    pub fn spacing(&self) -> State {
        self.spacing
    }

    pub fn axis(step: f64, max: f64) -> Vec<f64> {
        let count = (max / step).floor() as usize;
        let mut coords: Vec<f64> = (0..=count).map(|i| i as f64 * step).collect();
        if coords.last().is_some_and(|&last| last < max) {
            coords.push(max);
        }
        coords
    }

    fn corner(&self, x: f64, y: f64) -> Result<f64, ConfigError> {
        let state = State::new(x, y);
        self.anchors
            .get(&state)
            .map(|r| r.value)
            .ok_or(ConfigError::MissingCorner(state))
    }
}

fn bracket(v: f64, step: f64, max: f64) -> (f64, f64, f64) {
    let low = ((v / step).floor() * step).min(max);
    let high = ((v / step).ceil() * step).min(max);
    let frac = if high > low { (v - low) / (high - low) } else { 0.0 };
    (low, high, frac)
}

impl AnchorStore for LatticeStore {
    fn get(&self, state: State) -> Option<&InfoRecord> {
        self.anchors.get(&state)
    }

    fn set(&mut self, state: State, record: InfoRecord) {
        self.anchors.insert(State::new(state.x, state.y), record);
    }

    fn all(&self) -> impl Iterator<Item = (State, &InfoRecord)> + '_ {
        self.anchors.iter().map(|(s, r)| (*s, r))
    }

    fn len(&self) -> usize {
        self.anchors.len()
    }

    fn empty_like(&self) -> Self {
        Self {
            anchors: BTreeMap::new(),
            spacing: self.spacing,
            max: self.max,
        }
    }

    fn lattice_spacing(&self) -> Option<State> {
        Some(self.spacing)
    }

    fn interpolate(&self, state: State) -> Result<f64, ConfigError> {
        let (x_low, x_high, px) = bracket(state.x, self.spacing.x, self.max.x);
        let (y_low, y_high, py) = bracket(state.y, self.spacing.y, self.max.y);
        let on_x_edge = px == 0.0 || px == 1.0;
        let on_y_edge = py == 0.0 || py == 1.0;
        let x_edge = if px == 1.0 { x_high } else { x_low };
        let y_edge = if py == 1.0 { y_high } else { y_low };

        match (on_x_edge, on_y_edge) {
            (true, true) => self.corner(x_edge, y_edge),
            (true, false) => {
                Ok(self.corner(x_edge, y_low)? * (1.0 - py) + self.corner(x_edge, y_high)? * py)
            }
            (false, true) => {
                Ok(self.corner(x_low, y_edge)? * (1.0 - px) + self.corner(x_high, y_edge)? * px)
            }
            (false, false) => {
                let low_low = self.corner(x_low, y_low)?;
                let low_high = self.corner(x_low, y_high)?;
                let high_low = self.corner(x_high, y_low)?;
                let high_high = self.corner(x_high, y_high)?;
                Ok(low_low * (1.0 - px) * (1.0 - py)
                    + low_high * (1.0 - px) * py
                    + high_low * px * (1.0 - py)
                    + high_high * px * py)
            }
        }
    }
}
