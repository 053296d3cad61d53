//! Reprojection of every science variable in a granule.
//!
//! The [`Resampler`] walks the science variables one at a time. For each
//! one it finds the cached target grid and kernel mapping for the
//! variable's coordinates (computing them on first use), resamples each 2-D
//! layer of the variable, and writes the result to a single band file.
//! Failures only skip the variable concerned.
use std::{collections::BTreeSet, path::PathBuf};

use error_stack::ResultExt;
use ndarray::{Array2, Array3, ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{
    cache::ReprojectionCache,
    dataset::{DatasetIo, Variable},
    error::{ReprojectError, VariableError},
    geometry::CoordinateData,
    kernel::{KernelParameters, MappingKind, ResamplingKernel, SwathDefinition},
    parameters::RequestParameters,
    single_band::{variable_file_path, write_single_band_output, BandPacking},
    target_area::build_target_area,
    variables::{
        axes_permutation, coordinate_matching_substring, coordinate_requires_transpose,
        preferred_ordered_dimensions, CoordinateSet, VarInfo,
    },
};

/// The supported interpolation methods.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
pub enum Interpolation {
    #[strum(serialize = "near")]
    #[serde(rename = "near")]
    Nearest,
    #[strum(serialize = "bilinear")]
    #[serde(rename = "bilinear")]
    Bilinear,
    /// Elliptically weighted average.
    #[strum(serialize = "ewa")]
    #[serde(rename = "ewa")]
    Ewa,
    /// Elliptically weighted average, taking the value of the swath pixel
    /// with the largest weight instead of the weighted mean.
    #[default]
    #[strum(serialize = "ewa-nn")]
    #[serde(rename = "ewa-nn")]
    EwaNearestNeighbour,
}

impl Interpolation {
    pub fn mapping_kind(&self) -> MappingKind {
        match self {
            Self::Nearest => MappingKind::Nearest,
            Self::Bilinear => MappingKind::Bilinear,
            Self::Ewa | Self::EwaNearestNeighbour => MappingKind::Ewa,
        }
    }

    pub fn maximum_weight_mode(&self) -> bool {
        matches!(self, Self::EwaNearestNeighbour)
    }
}

/// A science variable that could not be reprojected.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedVariable {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResampleSummary {
    /// Variables with a single band file, in the order they were processed.
    pub reprojected: Vec<String>,
    pub skipped: Vec<SkippedVariable>,
}

/// Swath data arranged for the kernel: one (rows, columns) layer per
/// combination of the non-spatial dimensions.
struct LayeredValues {
    layers: Array3<f64>,
    non_spatial_dimensions: Vec<(String, usize)>,
}

pub struct Resampler<'a> {
    parameters: &'a RequestParameters,
    var_info: &'a VarInfo,
    kernel: &'a dyn ResamplingKernel,
    io: &'a dyn DatasetIo,
    kernel_parameters: KernelParameters,
    cache: ReprojectionCache,
}

impl<'a> Resampler<'a> {
    pub fn new(
        parameters: &'a RequestParameters,
        var_info: &'a VarInfo,
        kernel: &'a dyn ResamplingKernel,
        io: &'a dyn DatasetIo,
        kernel_parameters: KernelParameters,
    ) -> error_stack::Result<Self, ReprojectError> {
        let cache = ReprojectionCache::new(parameters)?;
        Ok(Self {
            parameters,
            var_info,
            kernel,
            io,
            kernel_parameters,
            cache,
        })
    }

    pub fn cache(&self) -> &ReprojectionCache {
        &self.cache
    }

    /// Where the single band file for `variable` is written.
    pub fn output_path(&self, variable: &str) -> PathBuf {
        variable_file_path(
            &self.parameters.output_dir,
            variable,
            &self.parameters.input_extension(),
        )
    }

    /// Reproject each variable in turn. A variable that fails is logged and
    /// reported as skipped; it never stops the others.
    pub fn resample_all_variables(&mut self, science_variables: &BTreeSet<String>) -> ResampleSummary {
        let mut summary = ResampleSummary::default();

        for variable in science_variables {
            log::info!("Reprojecting variable \"{variable}\"");
            match self.resample_variable(variable) {
                Ok(()) => summary.reprojected.push(variable.clone()),
                Err(e) => {
                    log::error!("Cannot reproject {variable}");
                    log::debug!("{e:?}");
                    summary.skipped.push(SkippedVariable {
                        name: variable.clone(),
                        reason: e.current_context().to_string(),
                    });
                }
            }
        }

        summary
    }

    /// Reproject one variable and write its single band file.
    pub fn resample_variable(&mut self, variable_path: &str) -> error_stack::Result<(), VariableError> {
        let var_info: &'a VarInfo = self.var_info;
        let dataset = var_info.dataset();
        let variable = dataset
            .variable(variable_path)
            .ok_or_else(|| VariableError::MissingVariable(variable_path.to_string()))?;
        let key = var_info
            .coordinate_set(variable_path)
            .cloned()
            .unwrap_or_default();
        if key.is_empty() {
            return Err(VariableError::missing_coordinates::<&str>(&[]).into());
        }

        let latitudes = coordinate_matching_substring(dataset, &key, "lat")?;
        let longitudes = coordinate_matching_substring(dataset, &key, "lon")?;

        let kind = self.parameters.interpolation.mapping_kind();
        if self.cache.lookup(&key, kind).is_none() {
            log::debug!("Deriving interpolation information for {variable_path}");
            self.compute_mapping(&key, kind, longitudes, latitudes)?;
        } else {
            log::debug!("Retrieving previous interpolation information for {variable_path}");
        }

        let values = layered_values(variable, latitudes)?;
        let entry = self
            .cache
            .get(&key)
            .ok_or_else(|| VariableError::context("retrieving cached interpolation information"))?;
        let target = entry.target().clone();

        let (height, width) = target.shape();
        let n_layers = values.layers.len_of(Axis(0));
        let mut results = Array3::from_elem((n_layers, height, width), f64::NAN);
        for (i, layer) in values.layers.axis_iter(Axis(0)).enumerate() {
            let resampled = self
                .kernel
                .resample(
                    entry.mapping(),
                    layer,
                    &target,
                    self.parameters.interpolation.maximum_weight_mode(),
                )
                .change_context(VariableError::Kernel)?;
            results.index_axis_mut(Axis(0), i).assign(&resampled);
        }

        let mut shape: Vec<usize> = values.non_spatial_dimensions.iter().map(|(_, n)| *n).collect();
        shape.extend([height, width]);
        let results = results
            .into_shape(IxDyn(&shape))
            .change_context_lazy(|| VariableError::context("stacking resampled layers"))?;

        let output_path = self.output_path(variable_path);
        log::info!("Reprojected output: \"{}\"", output_path.display());
        write_single_band_output(
            &target,
            &results,
            variable_path,
            &output_path,
            &mut self.cache,
            &key,
            &BandPacking::from_variable(variable),
            &values.non_spatial_dimensions,
            self.io,
        )
    }

    /// Derive the target grid (unless already known) and the kernel mapping
    /// for one set of coordinates, and cache them.
    fn compute_mapping(
        &mut self,
        key: &CoordinateSet,
        kind: MappingKind,
        longitudes: &Variable,
        latitudes: &Variable,
    ) -> error_stack::Result<(), VariableError> {
        let lons = longitudes.unpacked_values();
        let lats = latitudes.unpacked_values();

        let target = if let Some(target) = self.cache.target_area(key) {
            target.clone()
        } else if let Some(target) = self.cache.request_target() {
            log::debug!("Using target area defined in the request.");
            target.clone()
        } else {
            log::debug!("Deriving target area from associated coordinates.");
            let coordinates = CoordinateData::new(lons.clone(), lats.clone());
            build_target_area(self.parameters, &key.to_string(), &coordinates)
                .map_err(|e| {
                    let reason = e.current_context().to_string();
                    e.change_context(VariableError::TargetArea(reason))
                })?
        };

        let swath = swath_definition(lons, lats)?;
        let mapping = self
            .kernel
            .compute_mapping(kind, &swath, &target, &self.kernel_parameters)
            .change_context(VariableError::Kernel)?;
        self.cache.insert(key.clone(), target, mapping);
        Ok(())
    }
}

/// Wrap longitudes into [-180, 180).
fn wrap_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Arrange coordinates as the 2-D swath the kernel expects: 1-D lists of
/// points become a single column, and 2-D arrays with fewer rows than
/// columns are transposed so that rows run along the longer dimension.
fn swath_definition(lons: ArrayD<f64>, lats: ArrayD<f64>) -> Result<SwathDefinition, VariableError> {
    fn as_swath_array(values: ArrayD<f64>) -> Result<Array2<f64>, VariableError> {
        let shape = values.shape().to_vec();
        match shape.len() {
            1 => values
                .into_shape((shape[0], 1))
                .map_err(|_| VariableError::UnsupportedCoordinateShape(shape)),
            2 => {
                let values: Array2<f64> = values
                    .into_dimensionality()
                    .map_err(|_| VariableError::UnsupportedCoordinateShape(shape.clone()))?;
                if coordinate_requires_transpose(&shape) {
                    Ok(values.reversed_axes().as_standard_layout().into_owned())
                } else {
                    Ok(values)
                }
            }
            _ => Err(VariableError::UnsupportedCoordinateShape(shape)),
        }
    }

    let lons = as_swath_array(lons)?.mapv(wrap_longitude);
    let lats = as_swath_array(lats)?;
    SwathDefinition::new(lons, lats)
        .map_err(|e| VariableError::context(format!("defining the swath: {e}")))
}

/// Read a variable's physical values and reorder them so the track
/// dimensions come last, matching the orientation of [`swath_definition`].
fn layered_values(variable: &Variable, coordinate: &Variable) -> Result<LayeredValues, VariableError> {
    let (ordered, non_spatial_dimensions) = if let [track_dim] = coordinate.dimensions() {
        if !variable.dimensions().contains(track_dim) {
            return Err(VariableError::InvalidDimensions {
                varname: variable.name().to_string(),
                dims: variable.dimensions().to_vec(),
            });
        }
        let non_spatial: Vec<(String, usize)> = variable
            .dimensions()
            .iter()
            .zip(variable.shape())
            .filter(|(d, _)| *d != track_dim)
            .map(|(d, &n)| (d.clone(), n))
            .collect();
        let mut ordered: Vec<String> = non_spatial.iter().map(|(d, _)| d.clone()).collect();
        ordered.push(track_dim.clone());
        (ordered, non_spatial)
    } else {
        preferred_ordered_dimensions(variable, coordinate)?
    };

    let axes = axes_permutation(variable.dimensions(), &ordered);
    let values = variable
        .unpacked_values()
        .permuted_axes(IxDyn(&axes))
        .as_standard_layout()
        .into_owned();

    let n_layers: usize = non_spatial_dimensions.iter().map(|(_, n)| n).product();
    let shape = values.shape();
    let (rows, cols) = if coordinate.dimensions().len() == 1 {
        (shape[shape.len() - 1], 1)
    } else {
        (shape[shape.len() - 2], shape[shape.len() - 1])
    };

    let layers = values
        .into_shape((n_layers, rows, cols))
        .map_err(|_| VariableError::InvalidDimensions {
            varname: variable.name().to_string(),
            dims: variable.dimensions().to_vec(),
        })?;
    Ok(LayeredValues {
        layers,
        non_spatial_dimensions,
    })
}
