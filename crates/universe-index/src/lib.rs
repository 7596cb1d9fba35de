//! Toroidal geometry and neighborhood indices for particle neighbor queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A position handed to `rebuild` was NaN or infinite.
    #[error("position {index} is not finite")]
    NonFinitePosition { index: usize },
}

/// Square world of side `extent` whose axes wrap around.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Torus {
    extent: f64,
}

impl Torus {
    /// Construct a torus with the provided side length.
    pub fn new(extent: f64) -> Result<Self, IndexError> {
        if !extent.is_finite() || extent <= 0.0 {
            return Err(IndexError::InvalidConfig("torus extent must be positive"));
        }
        Ok(Self { extent })
    }

    /// Side length of the world.
    #[must_use]
    pub const fn extent(&self) -> f64 {
        self.extent
    }

    /// Wrap a coordinate into `[0, extent)`.
    #[must_use]
    pub fn wrap(&self, value: f64) -> f64 {
        let mut v = value.rem_euclid(self.extent);
        // rem_euclid can round up to exactly `extent` for tiny negative inputs.
        if v >= self.extent {
            v = 0.0;
        }
        v
    }

    /// Shortest wrapped separation along one axis, always in `[0, extent/2]`.
    #[must_use]
    pub fn axis_distance(&self, a: f64, b: f64) -> f64 {
        let d = (a - b).abs();
        if d > self.extent * 0.5 {
            self.extent - d
        } else {
            d
        }
    }

    /// Signed shortest displacement from `from` to `to` along one axis.
    #[must_use]
    pub fn axis_delta(&self, from: f64, to: f64) -> f64 {
        let half = self.extent * 0.5;
        let mut d = to - from;
        if d > half {
            d -= self.extent;
        } else if d < -half {
            d += self.extent;
        }
        d
    }

    /// Shortest displacement vector pointing from `from` to `to`.
    #[must_use]
    pub fn delta(&self, from: (f64, f64), to: (f64, f64)) -> (f64, f64) {
        (
            self.axis_delta(from.0, to.0),
            self.axis_delta(from.1, to.1),
        )
    }

    /// Squared toroidal distance.
    #[must_use]
    pub fn distance_sq(&self, a: (f64, f64), b: (f64, f64)) -> f64 {
        let dx = self.axis_distance(a.0, b.0);
        let dy = self.axis_distance(a.1, b.1);
        dx * dx + dy * dy
    }

    /// Euclidean distance measured on the torus.
    #[must_use]
    pub fn distance(&self, a: (f64, f64), b: (f64, f64)) -> f64 {
        self.distance_sq(a, b).sqrt()
    }

    /// Bounding-box pre-filter: true when both wrapped axis separations fit within `radius`.
    #[must_use]
    pub fn within_box(&self, a: (f64, f64), b: (f64, f64), radius: f64) -> bool {
        self.axis_distance(a.0, b.0) <= radius && self.axis_distance(a.1, b.1) <= radius
    }
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from particle positions.
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError>;

    /// Visit every other indexed point whose toroidal distance to `idx` is at most `radius`.
    ///
    /// The visitor receives the neighbor index and its distance. Points are never
    /// reported twice and `idx` itself is never reported.
    fn neighbors_within(
        &self,
        idx: usize,
        radius: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    );

    /// Collect neighbor indices sorted ascending.
    fn collect_neighbors(&self, idx: usize, radius: f64) -> Vec<usize> {
        let mut out = Vec::new();
        self.neighbors_within(idx, radius, &mut |other, _| out.push(other));
        out.sort_unstable();
        out
    }
}

/// Reference full scan, O(n) per query.
#[derive(Debug, Clone)]
pub struct BruteForceIndex {
    torus: Torus,
    positions: Vec<(f64, f64)>,
}

impl BruteForceIndex {
    #[must_use]
    pub fn new(torus: Torus) -> Self {
        Self {
            torus,
            positions: Vec::new(),
        }
    }
}

impl NeighborhoodIndex for BruteForceIndex {
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError> {
        validate_positions(positions)?;
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        Ok(())
    }

    fn neighbors_within(
        &self,
        idx: usize,
        radius: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        let Some(&center) = self.positions.get(idx) else {
            return;
        };
        let radius_sq = radius * radius;
        for (other, &pos) in self.positions.iter().enumerate() {
            if other == idx {
                continue;
            }
            let dist_sq = self.torus.distance_sq(center, pos);
            if dist_sq <= radius_sq {
                visitor(other, OrderedFloat(dist_sq.sqrt()));
            }
        }
    }
}

/// Upper bound on grid cells along one axis; the grid allocates the square of this.
pub const MAX_CELLS_PER_AXIS: usize = 1024;

/// Uniform grid bucketing keyed by `floor(pos / cell_width)` with wraparound lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Requested edge length of each grid cell.
    pub cell_size: f64,
    torus: Torus,
    cells_per_axis: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f64, f64)>,
}

impl UniformGridIndex {
    /// Create a new grid over `torus`. The effective cell width is the smallest
    /// value not below `cell_size` that evenly tiles the world.
    pub fn new(cell_size: f64, torus: Torus) -> Result<Self, IndexError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        let cells = (torus.extent() / cell_size).floor();
        if cells > MAX_CELLS_PER_AXIS as f64 {
            return Err(IndexError::InvalidConfig(
                "cell_size is too small for the world extent",
            ));
        }
        let cells_per_axis = (cells as usize).max(1);
        Ok(Self {
            cell_size,
            torus,
            cells_per_axis,
            buckets: Vec::new(),
            positions: Vec::new(),
        })
    }

    /// Number of cells along each axis.
    #[must_use]
    pub const fn cells_per_axis(&self) -> usize {
        self.cells_per_axis
    }

    fn cell_width(&self) -> f64 {
        self.torus.extent() / self.cells_per_axis as f64
    }

    fn cell_of(&self, value: f64) -> usize {
        let wrapped = self.torus.wrap(value);
        ((wrapped / self.cell_width()).floor() as usize).min(self.cells_per_axis - 1)
    }

    /// Cell offsets to visit along one axis for a query of `radius`.
    fn axis_cells(&self, center_cell: usize, radius: f64) -> Vec<usize> {
        let n = self.cells_per_axis;
        let span = (radius / self.cell_width()).ceil() as usize;
        if 2 * span + 1 >= n {
            return (0..n).collect();
        }
        (0..=2 * span)
            .map(|offset| (center_cell + n + offset - span) % n)
            .collect()
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError> {
        validate_positions(positions)?;
        let n = self.cells_per_axis;
        self.buckets.clear();
        self.buckets.resize_with(n * n, Vec::new);
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let cx = self.cell_of(x);
            let cy = self.cell_of(y);
            self.buckets[cy * n + cx].push(idx);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        idx: usize,
        radius: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        let Some(&center) = self.positions.get(idx) else {
            return;
        };
        let n = self.cells_per_axis;
        let radius_sq = radius * radius;
        let xs = self.axis_cells(self.cell_of(center.0), radius);
        let ys = self.axis_cells(self.cell_of(center.1), radius);
        for &cy in &ys {
            for &cx in &xs {
                for &other in &self.buckets[cy * n + cx] {
                    if other == idx {
                        continue;
                    }
                    let pos = self.positions[other];
                    if !self.torus.within_box(center, pos, radius) {
                        continue;
                    }
                    let dist_sq = self.torus.distance_sq(center, pos);
                    if dist_sq <= radius_sq {
                        visitor(other, OrderedFloat(dist_sq.sqrt()));
                    }
                }
            }
        }
    }
}

fn validate_positions(positions: &[(f64, f64)]) -> Result<(), IndexError> {
    match positions
        .iter()
        .position(|(x, y)| !x.is_finite() || !y.is_finite())
    {
        Some(index) => Err(IndexError::NonFinitePosition { index }),
        None => Ok(()),
    }
}
