//! Intermediate files holding one reprojected science variable each.
//!
//! Every single band file contains:
//!
//! - the science variable, at the same path it had in the source file,
//!   dimensioned by any non-spatial dimensions followed by the grid's y and
//!   x dimensions;
//! - a 1-D dimension variable for each of the y and x dimensions, at the root;
//! - a scalar grid-mapping variable describing the target CRS, at the root.
//!
//! The merge step later collects these back into a single output file.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use ndarray::ArrayD;

use crate::{
    cache::ReprojectionCache,
    dataset::{AttrValue, Dataset, DatasetIo, ScaleOffset, Variable},
    error::VariableError,
    nc_utils::{DataType, NcArray},
    target_area::TargetArea,
    variables::CoordinateSet,
};

/// Fallback name for a grid-mapping variable when the CRS has no CF name.
pub const DEFAULT_GRID_MAPPING: &str = "crs";

/// CF metadata for a spatial dimension variable, chosen by name prefix.
fn dimension_metadata(dimension: &str) -> [(&'static str, &'static str); 3] {
    if dimension.starts_with("lat") {
        [("long_name", "latitude"), ("standard_name", "latitude"), ("units", "degrees_north")]
    } else if dimension.starts_with("lon") {
        [("long_name", "longitude"), ("standard_name", "longitude"), ("units", "degrees_east")]
    } else if dimension.starts_with('x') {
        [
            ("long_name", "x coordinate of projection"),
            ("standard_name", "projection_x_coordinate"),
            ("units", "m"),
        ]
    } else {
        [
            ("long_name", "y coordinate of projection"),
            ("standard_name", "projection_y_coordinate"),
            ("units", "m"),
        ]
    }
}

/// How resampled physical values are stored: the source variable's type,
/// fill value and packing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandPacking {
    pub dtype: DataType,
    /// The fill value as stored, i.e. packed.
    pub fill_value: Option<f64>,
    pub scale_offset: Option<ScaleOffset>,
}

impl BandPacking {
    pub fn from_variable(variable: &Variable) -> Self {
        Self {
            dtype: variable.dtype(),
            fill_value: variable.fill_value(),
            scale_offset: variable.scale_and_offset(),
        }
    }

    /// Convert physical values to the stored representation. NaN becomes the
    /// fill value when there is one.
    pub fn pack(&self, physical: &ArrayD<f64>) -> NcArray {
        let packed = physical.mapv(|v| {
            if v.is_nan() {
                self.fill_value.unwrap_or(f64::NAN)
            } else if let Some(so) = self.scale_offset {
                so.pack(v)
            } else {
                v
            }
        });
        NcArray::from_f64(self.dtype, &packed)
    }
}

/// The path of the single band file for `variable`. Leading slashes are
/// dropped and inner ones replaced by underscores, so that variables with
/// the same name in different groups get different files, e.g.
/// `/gt1r/land_segments/dem_h` becomes `gt1r_land_segments_dem_h.nc`.
pub fn variable_file_path(work_dir: &Path, variable: &str, extension: &str) -> PathBuf {
    let name = variable.trim_start_matches('/').replace('/', "_");
    work_dir.join(format!("{name}{extension}"))
}

/// Whether a pair of dimension names is one of the unsuffixed pairs.
fn is_canonical(dimensions: &(String, String)) -> bool {
    matches!(
        (dimensions.0.as_str(), dimensions.1.as_str()),
        ("lat", "lon") | ("y", "x")
    )
}

/// Write one reprojected variable to its own file.
///
/// `data` holds physical values with NaN where there is no data, and has
/// the non-spatial dimensions (if any) first, then the target grid's rows
/// and columns.
#[allow(clippy::too_many_arguments)]
pub fn write_single_band_output(
    target_area: &TargetArea,
    data: &ArrayD<f64>,
    variable_name: &str,
    output_path: &Path,
    cache: &mut ReprojectionCache,
    key: &CoordinateSet,
    packing: &BandPacking,
    non_spatial_dimensions: &[(String, usize)],
    io: &dyn DatasetIo,
) -> error_stack::Result<(), VariableError> {
    let projection = target_area.projection();
    let dimensions = cache.dimension_names(key, projection.is_geographic());
    let (y_dim, x_dim) = (&dimensions.0, &dimensions.1);

    let mut dataset = Dataset::new();
    for (name, len) in non_spatial_dimensions {
        dataset.add_dimension(name, *len);
    }
    dataset.add_dimension(y_dim, target_area.height());
    dataset.add_dimension(x_dim, target_area.width());

    let gm_base = projection
        .grid_mapping_name()
        .unwrap_or(DEFAULT_GRID_MAPPING);
    let (gm_variable, gm_reference) = if is_canonical(&dimensions) {
        (gm_base.to_string(), gm_base.to_string())
    } else {
        let name = format!("{gm_base}_{y_dim}_{x_dim}");
        let reference = format!("{name}: {y_dim} {x_dim}");
        (name, reference)
    };

    let mut grid_mapping = Variable::new(&gm_variable, &[] as &[&str], NcArray::scalar_char());
    grid_mapping.set_attributes(projection.to_cf());

    let mut var_dims: Vec<&str> = non_spatial_dimensions.iter().map(|(d, _)| d.as_str()).collect();
    var_dims.push(y_dim);
    var_dims.push(x_dim);

    let mut science = Variable::new(variable_name, &var_dims, packing.pack(data));
    if let Some(fill) = packing.fill_value {
        science.set_attribute("_FillValue", AttrValue::scalar_of_type(packing.dtype, fill));
    }
    if let Some(so) = packing.scale_offset {
        science.set_attribute("scale_factor", so.scale_factor);
        science.set_attribute("add_offset", so.add_offset);
    }
    science.set_attribute("grid_mapping", gm_reference);

    let mut y_var = Variable::new(y_dim, &[y_dim], target_area.y_coordinates().into_dyn().into());
    let mut x_var = Variable::new(x_dim, &[x_dim], target_area.x_coordinates().into_dyn().into());
    for (var, name) in [(&mut y_var, y_dim), (&mut x_var, x_dim)] {
        for (att, value) in dimension_metadata(name) {
            var.set_attribute(att, value);
        }
    }

    let add = |dataset: &mut Dataset, path: &str, variable: Variable| {
        dataset
            .add_variable(path, variable)
            .change_context_lazy(|| VariableError::Write(output_path.to_path_buf()))
    };
    add(&mut dataset, &gm_variable, grid_mapping)?;
    add(&mut dataset, variable_name, science)?;
    add(&mut dataset, y_dim, y_var)?;
    add(&mut dataset, x_dim, x_var)?;

    io.write(output_path, &dataset)
        .change_context_lazy(|| VariableError::Write(output_path.to_path_buf()))?;
    log::debug!("Saved {variable_name} output to temporary file: {}", output_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::MemoryIo,
        geometry::Extent,
        kernel::ResamplingInfo,
        projection::Projection,
    };
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array2, IxDyn};

    fn target(crs: &str, extent: Extent) -> TargetArea {
        TargetArea::from_extent("test", Projection::new(crs).unwrap(), (2, 3), extent).unwrap()
    }

    fn geographic_target() -> TargetArea {
        target(
            "EPSG:4326",
            Extent {
                x_min: 0.0,
                x_max: 3.0,
                y_min: 0.0,
                y_max: 2.0,
            },
        )
    }

    fn cache_with(keys: &[&CoordinateSet], target: &TargetArea) -> ReprojectionCache {
        let mut cache = ReprojectionCache::default();
        for key in keys {
            cache.insert(
                (*key).clone(),
                target.clone(),
                ResamplingInfo::Ewa {
                    cols: Array2::zeros((1, 1)),
                    rows: Array2::zeros((1, 1)),
                    rows_per_scan: 1,
                },
            );
        }
        cache
    }

    fn data() -> ArrayD<f64> {
        arr2(&[[1.0, 2.0, f64::NAN], [4.0, 5.0, 6.0]]).into_dyn()
    }

    #[test]
    fn test_variable_file_path() {
        assert_eq!(
            variable_file_path(Path::new("/tmp/work"), "/gt1r/land_segments/dem_h", ".nc"),
            PathBuf::from("/tmp/work/gt1r_land_segments_dem_h.nc")
        );
        assert_eq!(
            variable_file_path(Path::new("/tmp/work"), "red_var", ".h5"),
            PathBuf::from("/tmp/work/red_var.h5")
        );
    }

    #[test]
    fn test_pack_restores_stored_values() {
        let packing = BandPacking {
            dtype: DataType::I16,
            fill_value: Some(-9999.0),
            scale_offset: Some(ScaleOffset {
                scale_factor: 0.5,
                add_offset: 10.0,
            }),
        };
        let packed = packing.pack(&data());
        let NcArray::I16(values) = packed else {
            panic!("expected i16 data");
        };
        assert_eq!(values[[0, 0]], -18);
        assert_eq!(values[[0, 2]], -9999);
        assert_eq!(values[[1, 2]], -8);
    }

    #[test]
    fn test_geographic_single_band() {
        let io = MemoryIo::new();
        let key = CoordinateSet::new(&["/lat", "/lon"]);
        let target = geographic_target();
        let mut cache = cache_with(&[&key], &target);
        let packing = BandPacking {
            dtype: DataType::F32,
            fill_value: Some(-1.0),
            scale_offset: None,
        };

        let path = Path::new("/work/group_red_var.nc");
        write_single_band_output(&target, &data(), "/group/red_var", path, &mut cache, &key, &packing, &[], &io)
            .unwrap();

        let ds = io.read(path).unwrap();
        let science = ds.variable("/group/red_var").unwrap();
        assert_eq!(science.dimensions(), &["lat", "lon"]);
        assert_eq!(science.attribute_string("grid_mapping").as_deref(), Some("latitude_longitude"));
        assert_eq!(science.fill_value(), Some(-1.0));
        assert_eq!(science.values_f64()[[0, 2]], -1.0);

        let gm = ds.variable("/latitude_longitude").unwrap();
        assert_eq!(
            gm.attribute_string("grid_mapping_name").as_deref(),
            Some("latitude_longitude")
        );

        let lat = ds.variable("/lat").unwrap();
        assert_eq!(lat.attribute_string("units").as_deref(), Some("degrees_north"));
        assert_relative_eq!(lat.values_f64()[[0]], 1.5);
        assert_relative_eq!(lat.values_f64()[[1]], 0.5);
        let lon = ds.variable("/lon").unwrap();
        assert_eq!(lon.attribute_string("standard_name").as_deref(), Some("longitude"));
        assert_relative_eq!(lon.values_f64()[[2]], 2.5);
    }

    #[test]
    fn test_second_grid_is_suffixed() {
        let io = MemoryIo::new();
        let first = CoordinateSet::new(&["/lat", "/lon"]);
        let second = CoordinateSet::new(&["/other/lat", "/other/lon"]);
        let target = target(
            "EPSG:6933",
            Extent {
                x_min: 0.0,
                x_max: 3000.0,
                y_min: 0.0,
                y_max: 2000.0,
            },
        );
        let mut cache = cache_with(&[&first, &second], &target);
        let packing = BandPacking {
            dtype: DataType::F64,
            fill_value: None,
            scale_offset: None,
        };

        write_single_band_output(&target, &data(), "/a", Path::new("/work/a.nc"), &mut cache, &first, &packing, &[], &io)
            .unwrap();
        write_single_band_output(&target, &data(), "/b", Path::new("/work/b.nc"), &mut cache, &second, &packing, &[], &io)
            .unwrap();

        let a = io.read(Path::new("/work/a.nc")).unwrap();
        assert_eq!(a.variable("/a").unwrap().dimensions(), &["y", "x"]);
        assert_eq!(
            a.variable("/a").unwrap().attribute_string("grid_mapping").as_deref(),
            Some("lambert_cylindrical_equal_area")
        );
        assert_eq!(
            a.variable("/x").unwrap().attribute_string("units").as_deref(),
            Some("m")
        );

        let b = io.read(Path::new("/work/b.nc")).unwrap();
        let var = b.variable("/b").unwrap();
        assert_eq!(var.dimensions(), &["y_1", "x_1"]);
        assert_eq!(
            var.attribute_string("grid_mapping").as_deref(),
            Some("lambert_cylindrical_equal_area_y_1_x_1: y_1 x_1")
        );
        assert!(b.contains_variable("/lambert_cylindrical_equal_area_y_1_x_1"));
        assert_eq!(
            b.variable("/y_1").unwrap().attribute_string("standard_name").as_deref(),
            Some("projection_y_coordinate")
        );
        // Missing values stay NaN without a fill value.
        assert!(var.values_f64()[[0, 2]].is_nan());
    }

    #[test]
    fn test_non_spatial_dimensions() {
        let io = MemoryIo::new();
        let key = CoordinateSet::new(&["/lat", "/lon"]);
        let target = geographic_target();
        let mut cache = cache_with(&[&key], &target);
        let packing = BandPacking {
            dtype: DataType::F64,
            fill_value: None,
            scale_offset: None,
        };
        let layered = ArrayD::from_elem(IxDyn(&[4, 2, 3]), 1.0);
        let dims = vec![("band".to_string(), 4)];

        write_single_band_output(&target, &layered, "/v", Path::new("/work/v.nc"), &mut cache, &key, &packing, &dims, &io)
            .unwrap();
        let ds = io.read(Path::new("/work/v.nc")).unwrap();
        assert_eq!(ds.variable("/v").unwrap().dimensions(), &["band", "lat", "lon"]);
        assert_eq!(ds.dimension_len("band"), Some(4));
    }
}
