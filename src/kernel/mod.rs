//! The resampling kernels that move swath values onto a target grid.
//!
//! Resampling is split in two: [`ResamplingKernel::compute_mapping`] does
//! the expensive geometric work once per set of swath coordinates, and
//! [`ResamplingKernel::resample`] applies that mapping to each 2-D layer of
//! every variable sharing those coordinates.
use ndarray::{Array2, ArrayView2};

use crate::target_area::TargetArea;

mod native;
pub use native::{rows_per_scan, NativeKernel};

/// Default search radius for nearest neighbour and bilinear resampling, in metres.
pub const RADIUS_OF_INFLUENCE: f64 = 50_000.0;
/// Default nearest-neighbour approximation factor.
pub const EPSILON: f64 = 0.5;
/// Default number of neighbours considered for bilinear resampling.
pub const NEIGHBOURS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("Swath longitude and latitude shapes differ: {0:?} vs {1:?}")]
    SwathShapeMismatch(Vec<usize>, Vec<usize>),

    #[error("Data with shape {got:?} does not match the swath shape {expected:?}")]
    DataShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Swath has no valid coordinates")]
    NoValidCoordinates,
}

/// The families of precomputed mapping. EWA with and without the maximum
/// weight mode share a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MappingKind {
    Nearest,
    Bilinear,
    Ewa,
}

/// Tuning constants for the neighbour searches.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct KernelParameters {
    /// Maximum distance between a target pixel and a swath point, in metres.
    pub radius_of_influence: f64,
    /// Allowed relative error of an approximate neighbour search. The native
    /// kernel searches exactly, which always satisfies this bound.
    pub epsilon: f64,
    /// Candidate neighbours examined per target pixel for bilinear resampling.
    pub neighbours: usize,
}

impl Default for KernelParameters {
    fn default() -> Self {
        Self {
            radius_of_influence: RADIUS_OF_INFLUENCE,
            epsilon: EPSILON,
            neighbours: NEIGHBOURS,
        }
    }
}

/// Swath geolocation, with rows along track. Longitudes should be in
/// [-180, 180).
#[derive(Debug, Clone)]
pub struct SwathDefinition {
    pub lons: Array2<f64>,
    pub lats: Array2<f64>,
}

impl SwathDefinition {
    pub fn new(lons: Array2<f64>, lats: Array2<f64>) -> Result<Self, KernelError> {
        if lons.shape() != lats.shape() {
            return Err(KernelError::SwathShapeMismatch(
                lons.shape().to_vec(),
                lats.shape().to_vec(),
            ));
        }
        Ok(Self { lons, lats })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.lons.dim()
    }

    /// Flat (row-major) indices of the points with usable coordinates.
    pub fn valid_input_index(&self) -> Vec<usize> {
        self.lons
            .iter()
            .zip(self.lats.iter())
            .enumerate()
            .filter(|(_, (lon, lat))| lon.is_finite() && lat.is_finite() && lat.abs() <= 90.0)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Precomputed mapping between a swath and a target grid.
///
/// Input indices are flat indices into the swath; output indices are flat
/// (row-major) indices into the target grid.
#[derive(Debug, Clone, PartialEq)]
pub enum ResamplingInfo {
    Nearest {
        /// (rows, columns) of the swath the mapping was computed for.
        input_shape: (usize, usize),
        valid_input_index: Vec<usize>,
        valid_output_index: Vec<usize>,
        /// For each valid output pixel, the position in `valid_input_index`
        /// of its nearest swath point.
        index_array: Vec<usize>,
        distance_array: Vec<f64>,
    },
    Bilinear {
        input_shape: (usize, usize),
        valid_input_index: Vec<usize>,
        valid_output_index: Vec<usize>,
        /// Upper-left, upper-right, lower-left and lower-right neighbours of
        /// each valid output pixel, as positions in `valid_input_index`.
        valid_point_mapping: Vec<[usize; 4]>,
        /// Fractional distance of the output pixel from the upper to the lower edge.
        vertical_distances: Vec<f64>,
        /// Fractional distance of the output pixel from the left to the right edge.
        horizontal_distances: Vec<f64>,
    },
    Ewa {
        /// Fractional target column of every swath pixel, NaN if it is not on the grid.
        cols: Array2<f64>,
        /// Fractional target row of every swath pixel, NaN if it is not on the grid.
        rows: Array2<f64>,
        rows_per_scan: usize,
    },
}

impl ResamplingInfo {
    pub fn kind(&self) -> MappingKind {
        match self {
            Self::Nearest { .. } => MappingKind::Nearest,
            Self::Bilinear { .. } => MappingKind::Bilinear,
            Self::Ewa { .. } => MappingKind::Ewa,
        }
    }

    /// (rows, columns) of the swath data this mapping accepts.
    pub fn input_shape(&self) -> (usize, usize) {
        match self {
            Self::Nearest { input_shape, .. } | Self::Bilinear { input_shape, .. } => *input_shape,
            Self::Ewa { cols, .. } => cols.dim(),
        }
    }
}

/// A swath-to-grid resampler.
///
/// Implementations are pure: the same inputs must always give the same
/// mapping, so that a mapping can be cached and reused for every variable
/// sharing a set of coordinates.
pub trait ResamplingKernel: Send + Sync {
    fn compute_mapping(
        &self,
        kind: MappingKind,
        swath: &SwathDefinition,
        target: &TargetArea,
        parameters: &KernelParameters,
    ) -> error_stack::Result<ResamplingInfo, KernelError>;

    /// Resample one layer of swath data, returning a (height, width) array
    /// with NaN where no value could be computed. Input NaNs are treated as
    /// missing.
    fn resample(
        &self,
        info: &ResamplingInfo,
        data: ArrayView2<f64>,
        target: &TargetArea,
        maximum_weight_mode: bool,
    ) -> error_stack::Result<Array2<f64>, KernelError>;
}
