//! Reprojection of one granule from start to finish.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;

use crate::{
    config::ProjectorConfig,
    dataset::DatasetIo,
    error::ReprojectError,
    interpolation::{ResampleSummary, Resampler},
    kernel::ResamplingKernel,
    merge::create_output,
    parameters::{Request, RequestParameters},
    single_band::variable_file_path,
    variables::VarInfo,
};

/// Runs requests against one storage backend and resampling kernel.
pub struct SwathProjector<I: DatasetIo, K: ResamplingKernel> {
    io: I,
    kernel: K,
    config: ProjectorConfig,
}

impl<I: DatasetIo, K: ResamplingKernel> SwathProjector<I, K> {
    pub fn new(io: I, kernel: K, config: ProjectorConfig) -> Self {
        Self { io, kernel, config }
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    /// Reproject every science variable of `source` onto the requested grid
    /// and return the path of the merged output.
    ///
    /// Single band files and the output (`<stem>_repr<ext>`) are written to
    /// `work_dir`. `granule_url` is what the provenance records as the input;
    /// it defaults to `source` itself.
    pub fn reproject(
        &self,
        request: &Request,
        source: &Path,
        granule_url: Option<&str>,
        work_dir: &Path,
    ) -> error_stack::Result<PathBuf, ReprojectError> {
        let parameters = RequestParameters::from_request(request, source, granule_url, work_dir, &self.io)?;
        log::info!("Reprojecting file {} as {}", source.display(), output_file_path(&parameters).display());
        log::info!("Selected CRS: {}\tInterpolation: {}", parameters.crs, parameters.interpolation);

        let var_info = VarInfo::from_file(&self.io, source)?;
        let science_variables = var_info.science_variables();
        if science_variables.is_empty() {
            return Err(ReprojectError::NoScienceVariables.into());
        }
        log::info!("Input file has {} science variables", science_variables.len());

        let summary = self.resample(&parameters, &var_info)?;
        if summary.reprojected.is_empty() {
            return Err(ReprojectError::NoVariablesReprojected.into());
        }
        log::info!(
            "Reprojected {} of {} variables",
            summary.reprojected.len(),
            science_variables.len()
        );

        let output_file = output_file_path(&parameters);
        create_output(
            &parameters,
            &output_file,
            work_dir,
            &summary.reprojected,
            var_info.metadata_variables(),
            &var_info,
            &self.io,
            &self.config.provenance,
            self.config.output.deflate_level,
        )?;

        if self.config.output.keep_intermediate_files {
            log::debug!("Keeping single band files in {}", work_dir.display());
        } else {
            let extension = parameters.input_extension();
            for variable in &summary.reprojected {
                let path = variable_file_path(work_dir, variable, &extension);
                self.io.remove(&path).change_context_lazy(|| {
                    ReprojectError::context(format!("removing {}", path.display()))
                })?;
            }
        }

        log::info!("Reprojection complete: {}", output_file.display());
        Ok(output_file)
    }

    fn resample(
        &self,
        parameters: &RequestParameters,
        var_info: &VarInfo,
    ) -> error_stack::Result<ResampleSummary, ReprojectError> {
        let mut resampler = Resampler::new(
            parameters,
            var_info,
            &self.kernel,
            &self.io,
            self.config.resampling,
        )?;
        let summary = resampler.resample_all_variables(var_info.science_variables());
        for skipped in &summary.skipped {
            log::warn!("Skipped {}: {}", skipped.name, skipped.reason);
        }
        Ok(summary)
    }
}

/// `<work_dir>/<stem>_repr<ext>` for the request's input file.
fn output_file_path(parameters: &RequestParameters) -> PathBuf {
    let stem = parameters
        .input_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    parameters
        .output_dir
        .join(format!("{stem}_repr{}", parameters.input_extension()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{Dataset, MemoryIo, Variable},
        geometry::CoordinateData,
        kernel::NativeKernel,
        nc_utils::{DataType, NcArray},
        projection::Projection,
        test_utils::{add, four_band_swath, swath_latitudes, swath_longitudes, CountingKernel},
    };
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array2, ArrayD, IxDyn};
    use rstest::{fixture, rstest};

    const SOURCE: &str = "/data/swath.nc";
    const WORK_DIR: &str = "/work";

    type TestProjector = SwathProjector<MemoryIo, CountingKernel<NativeKernel>>;

    fn projector_with(dataset: Dataset, config: ProjectorConfig) -> TestProjector {
        let io = MemoryIo::new();
        io.insert(SOURCE, dataset);
        SwathProjector::new(io, CountingKernel::new(NativeKernel), config)
    }

    #[fixture]
    fn projector() -> TestProjector {
        projector_with(four_band_swath(), ProjectorConfig::default())
    }

    fn request(json: &str) -> Request {
        serde_json::from_str(json).unwrap()
    }

    fn run(projector: &TestProjector, json: &str) -> error_stack::Result<PathBuf, ReprojectError> {
        projector.reproject(&request(json), Path::new(SOURCE), None, Path::new(WORK_DIR))
    }

    /// First pixel's lower edge and last pixel's upper edge of a coordinate variable.
    fn edges(values: &ArrayD<f64>) -> (f64, f64) {
        let n = values.len();
        let first = values[[0]];
        let last = values[[n - 1]];
        let half_res = (values[[1]] - first) / 2.0;
        (first - half_res, last + half_res)
    }

    #[rstest]
    fn test_default_request(projector: TestProjector) {
        let output = run(&projector, r#"{"format": {}}"#).unwrap();
        assert_eq!(output, PathBuf::from("/work/swath_repr.nc"));

        let ds = projector.io().read(&output).unwrap();
        assert_eq!(
            ds.variable_paths(),
            vec![
                "/alpha_var",
                "/latitude_longitude",
                "/lat",
                "/lon",
                "/blue_var",
                "/green_var",
                "/red_var",
            ]
        );
        for var in ["/alpha_var", "/blue_var", "/green_var", "/red_var"] {
            let var = ds.variable(var).unwrap();
            assert_eq!(var.dimensions(), &["lat", "lon"]);
            assert_eq!(var.attribute_string("grid_mapping").as_deref(), Some("latitude_longitude"));
            // 2-D source coordinates, 1-D reprojected ones
            assert!(var.attribute("coordinates").is_none());
        }
        assert_eq!(
            ds.variable("/green_var").unwrap().dtype(),
            DataType::I16
        );

        assert_eq!(projector.kernel().mapping_calls(), 1);
        assert_eq!(projector.kernel().resample_calls(), 4);
        // Only the input and the merged output are left.
        assert_eq!(
            projector.io().paths(),
            vec![PathBuf::from(SOURCE), PathBuf::from("/work/swath_repr.nc")]
        );
    }

    #[rstest]
    fn test_explicit_extent_and_bilinear(projector: TestProjector) {
        let output = run(
            &projector,
            r#"{"format": {"crs": "EPSG:4326", "interpolation": "bilinear",
                "scaleExtent": {"x": {"min": -20, "max": 60}, "y": {"min": 10, "max": 35}}}}"#,
        )
        .unwrap();
        let ds = projector.io().read(&output).unwrap();

        let (x_min, x_max) = edges(&ds.variable("/lon").unwrap().values_f64());
        assert_abs_diff_eq!(x_min, -20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(x_max, 60.0, epsilon = 1e-9);
        // latitudes decrease down the grid
        let (y_max, y_min) = edges(&ds.variable("/lat").unwrap().values_f64());
        assert_abs_diff_eq!(y_max, 35.0, epsilon = 1e-9);
        assert_abs_diff_eq!(y_min, 10.0, epsilon = 1e-9);

        let history = ds.attribute("history").and_then(|a| a.as_string()).unwrap();
        assert!(history.contains(
            r#"{"crs": "EPSG:4326", "interpolation": "bilinear", "#
        ));
        assert!(history.contains(r#""x_min": -20.0, "x_max": 60.0, "y_min": 10.0, "y_max": 35.0}"#));
        assert!(!history.contains("input_file"));
    }

    #[rstest]
    fn test_dimensions_only_uses_swath_extent(projector: TestProjector) {
        let output = run(&projector, r#"{"format": {"height": 5, "width": 6}}"#).unwrap();
        let ds = projector.io().read(&output).unwrap();
        assert_eq!(ds.dimension_len("lat"), Some(5));
        assert_eq!(ds.dimension_len("lon"), Some(6));

        let coordinates = CoordinateData::new(swath_longitudes(), swath_latitudes());
        let projection = Projection::new(crate::projection::DEFAULT_CRS).unwrap();
        let expected = crate::geometry::extents_from_perimeter(&projection, &coordinates).unwrap();

        let (x_min, x_max) = edges(&ds.variable("/lon").unwrap().values_f64());
        let (y_max, y_min) = edges(&ds.variable("/lat").unwrap().values_f64());
        assert_abs_diff_eq!(x_min, expected.x_min, epsilon = 1e-6);
        assert_abs_diff_eq!(x_max, expected.x_max, epsilon = 1e-6);
        assert_abs_diff_eq!(y_min, expected.y_min, epsilon = 1e-6);
        assert_abs_diff_eq!(y_max, expected.y_max, epsilon = 1e-6);
        assert_abs_diff_eq!(x_min, 40.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y_max, 25.0, epsilon = 1e-6);
    }

    #[test]
    fn test_scale_factor_without_offset() {
        let mut dataset = four_band_swath();
        let raw = ArrayD::from_elem(IxDyn(&[3, 4]), 10.0);
        add(
            &mut dataset,
            "/scaled_var",
            Variable::new("scaled_var", &["along", "across"], NcArray::from_f64(DataType::I16, &raw))
                .with_attribute("_FillValue", -1i16)
                .with_attribute("scale_factor", 0.5)
                .with_attribute("coordinates", "lat lon"),
        );
        let projector = projector_with(dataset, ProjectorConfig::default());
        let output = run(&projector, r#"{"format": {}}"#).unwrap();

        let ds = projector.io().read(&output).unwrap();
        let var = ds.variable("/scaled_var").unwrap();
        assert_eq!(var.dtype(), DataType::I16);
        let physical = var.unpacked_values();
        let filled: Vec<f64> = physical.iter().copied().filter(|v| v.is_finite()).collect();
        assert!(!filled.is_empty());
        for value in filled {
            assert_abs_diff_eq!(value, 5.0, epsilon = 1e-9);
        }
        assert!(var.values_f64().iter().all(|&v| v == 10.0 || v == -1.0));
    }

    #[test]
    fn test_two_coordinate_sets_get_separate_grids() {
        let mut dataset = four_band_swath();
        let dims = ["rows", "cols"];
        dataset.add_dimension("rows", 3);
        dataset.add_dimension("cols", 5);
        let lat = Array2::from_shape_fn((3, 5), |(i, _)| 35.0 - 2.5 * i as f64).into_dyn();
        let lon = Array2::from_shape_fn((3, 5), |(_, j)| 60.0 + 2.5 * j as f64).into_dyn();
        add(&mut dataset, "/lat2", Variable::new("lat2", &dims, NcArray::F64(lat)));
        add(&mut dataset, "/lon2", Variable::new("lon2", &dims, NcArray::F64(lon)));
        add(
            &mut dataset,
            "/other_var",
            Variable::new("other_var", &dims, NcArray::F64(ArrayD::from_elem(IxDyn(&[3, 5]), 7.0)))
                .with_attribute("_FillValue", -9999.0)
                .with_attribute("coordinates", "lat2 lon2"),
        );
        let projector = projector_with(dataset, ProjectorConfig::default());
        let output = run(&projector, r#"{"format": {}}"#).unwrap();

        let ds = projector.io().read(&output).unwrap();
        assert_eq!(projector.kernel().mapping_calls(), 2);

        let red = ds.variable("/red_var").unwrap();
        assert_eq!(red.dimensions(), &["lat", "lon"]);
        assert_eq!(red.attribute_string("grid_mapping").as_deref(), Some("latitude_longitude"));

        let other = ds.variable("/other_var").unwrap();
        assert_eq!(other.dimensions(), &["lat_1", "lon_1"]);
        assert_eq!(
            other.attribute_string("grid_mapping").as_deref(),
            Some("latitude_longitude_lat_1_lon_1: lat_1 lon_1")
        );
        assert!(ds.contains_variable("/latitude_longitude"));
        assert!(ds.contains_variable("/latitude_longitude_lat_1_lon_1"));
        assert_eq!(
            ds.variable("/lat_1").unwrap().attribute_string("standard_name").as_deref(),
            Some("latitude")
        );

        // each grid covers its own swath
        let (x_min, _) = edges(&ds.variable("/lon").unwrap().values_f64());
        let (x_min_1, _) = edges(&ds.variable("/lon_1").unwrap().values_f64());
        assert_abs_diff_eq!(x_min, 40.0, epsilon = 1e-6);
        assert_abs_diff_eq!(x_min_1, 60.0, epsilon = 1e-6);
        assert!(other.unpacked_values().iter().any(|&v| v == 7.0));
    }

    #[rstest]
    fn test_zero_resolution_is_rejected(projector: TestProjector) {
        let err = run(
            &projector,
            r#"{"format": {"scaleExtent": {"x": {"min": -20, "max": 60}, "y": {"min": 10, "max": 35}},
                "scaleSize": {"x": 0.0, "y": 0.0}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err.current_context(), ReprojectError::InvalidTargetGrid));
        assert_eq!(projector.kernel().mapping_calls(), 0);
    }

    #[test]
    fn test_variable_without_coordinates_is_left_out() {
        let mut dataset = four_band_swath();
        add(
            &mut dataset,
            "/orphan_var",
            Variable::new("orphan_var", &["along", "across"], NcArray::F64(ArrayD::zeros(IxDyn(&[3, 4]))))
                .with_attribute("coordinates", "/missing_lat /missing_lon"),
        );
        let projector = projector_with(dataset, ProjectorConfig::default());
        let output = run(&projector, r#"{"format": {}}"#).unwrap();

        let ds = projector.io().read(&output).unwrap();
        assert!(!ds.contains_variable("/orphan_var"));
        assert!(ds.contains_variable("/red_var"));
    }

    #[test]
    fn test_sole_variable_failing_is_fatal() {
        let mut dataset = Dataset::new();
        dataset.add_dimension("n", 3);
        add(
            &mut dataset,
            "/orphan_var",
            Variable::new("orphan_var", &["n"], NcArray::F64(arr1(&[1.0, 2.0, 3.0]).into_dyn()))
                .with_attribute("coordinates", "/missing_lat /missing_lon"),
        );
        let projector = projector_with(dataset, ProjectorConfig::default());
        let err = run(&projector, r#"{"format": {}}"#).unwrap_err();
        assert!(matches!(err.current_context(), ReprojectError::NoVariablesReprojected));
        assert_eq!(projector.io().paths(), vec![PathBuf::from(SOURCE)]);
    }

    #[test]
    fn test_no_science_variables() {
        let mut dataset = Dataset::new();
        dataset.add_dimension("n", 3);
        add(&mut dataset, "/meta", Variable::new("meta", &["n"], NcArray::F64(arr1(&[1.0, 2.0, 3.0]).into_dyn())));
        let projector = projector_with(dataset, ProjectorConfig::default());
        let err = run(&projector, r#"{"format": {}}"#).unwrap_err();
        assert!(matches!(err.current_context(), ReprojectError::NoScienceVariables));
    }

    #[rstest]
    fn test_missing_source(projector: TestProjector) {
        let err = projector
            .reproject(&request("{}"), Path::new("/data/other.nc"), None, Path::new(WORK_DIR))
            .unwrap_err();
        assert!(matches!(err.current_context(), ReprojectError::MissingSourceFile(_)));
    }

    #[rstest]
    fn test_invalid_interpolation(projector: TestProjector) {
        let err = run(&projector, r#"{"format": {"interpolation": "cubic"}}"#).unwrap_err();
        assert_eq!(
            err.current_context().to_string(),
            "Invalid value for interpolation type: \"cubic\"."
        );
    }

    #[test]
    fn test_intermediate_files_can_be_kept() {
        let config = ProjectorConfig::from_toml_str("[output]\nkeep_intermediate_files = true\n").unwrap();
        let projector = projector_with(four_band_swath(), config);
        run(&projector, r#"{"format": {}}"#).unwrap();
        assert!(projector.io().exists(Path::new("/work/red_var.nc")));
        assert!(projector.io().exists(Path::new("/work/alpha_var.nc")));
    }

    #[rstest]
    fn test_granule_url_recorded(projector: TestProjector) {
        let output = projector
            .reproject(
                &request("{}"),
                Path::new(SOURCE),
                Some("https://example.com/swath.nc"),
                Path::new(WORK_DIR),
            )
            .unwrap();
        let ds = projector.io().read(&output).unwrap();
        let history_json: serde_json::Value =
            serde_json::from_str(&ds.attribute("history_json").and_then(|a| a.as_string()).unwrap()).unwrap();
        assert_eq!(history_json[0]["derived_from"], "https://example.com/swath.nc");
    }
}
