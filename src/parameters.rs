//! Turning a loosely structured request into validated reprojection parameters.
//!
//! A request mirrors the `format` section of a service message, e.g.:
//!
//! ```json
//! {
//!   "format": {
//!     "crs": "EPSG:4326",
//!     "interpolation": "bilinear",
//!     "scaleExtent": {"x": {"min": -20, "max": 60}, "y": {"min": 10, "max": 35}},
//!     "scaleSize": {"x": 0.5, "y": 0.5}
//!   }
//! }
//! ```
//!
//! Every field is optional; see [`RequestParameters::from_request`] for the
//! defaults and the combinations that are rejected.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use serde::{Deserialize, Serialize};

use crate::{
    dataset::DatasetIo,
    error::ReprojectError,
    geometry::Extent,
    interpolation::Interpolation,
    projection::{Projection, DEFAULT_CRS},
};

/// Relative tolerance when checking that requested resolutions and
/// dimensions describe the same grid.
const GRID_CONSISTENCY_RTOL: f64 = 1e-3;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Request {
    #[serde(default)]
    pub format: FormatRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatRequest {
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub interpolation: Option<String>,
    #[serde(default)]
    pub scale_extent: Option<ScaleExtent>,
    #[serde(default)]
    pub scale_size: Option<ScaleSize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub width: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ScaleExtent {
    #[serde(default)]
    pub x: Option<AxisExtent>,
    #[serde(default)]
    pub y: Option<AxisExtent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AxisExtent {
    pub min: f64,
    pub max: f64,
}

/// Requested pixel size along each axis, in target CRS units.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ScaleSize {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

impl Request {
    /// Read a request from a JSON file.
    pub fn from_json_file(path: &Path) -> error_stack::Result<Self, ReprojectError> {
        let f = std::fs::File::open(path).change_context_lazy(|| {
            ReprojectError::context(format!("opening request file {}", path.display()))
        })?;
        serde_json::from_reader(std::io::BufReader::new(f)).change_context_lazy(|| {
            ReprojectError::context(format!("parsing request file {}", path.display()))
        })
    }

    fn x_extent(&self) -> Option<AxisExtent> {
        self.format.scale_extent.as_ref().and_then(|e| e.x)
    }

    fn y_extent(&self) -> Option<AxisExtent> {
        self.format.scale_extent.as_ref().and_then(|e| e.y)
    }

    fn x_res(&self) -> Option<f64> {
        self.format.scale_size.as_ref().and_then(|s| s.x)
    }

    fn y_res(&self) -> Option<f64> {
        self.format.scale_size.as_ref().and_then(|s| s.y)
    }

    /// False only if resolutions and dimensions are both fully given and
    /// either there is no extent to reconcile them, or they disagree with it.
    pub fn has_self_consistent_grid(&self) -> bool {
        let extents = self.x_extent().zip(self.y_extent());
        let sizes = self.x_res().zip(self.y_res());
        let dimensions = self.format.height.zip(self.format.width);

        match (extents, sizes, dimensions) {
            (Some((x, y)), Some((x_res, y_res)), Some((height, width))) => {
                consistent_dimension(x.max, x.min, width, x_res)
                    && consistent_dimension(y.max, y.min, height, y_res)
            }
            (None, Some(_), Some(_)) => false,
            _ => true,
        }
    }
}

fn consistent_dimension(max: f64, min: f64, n_elements: usize, resolution: f64) -> bool {
    let expected = (max - min) / resolution;
    (n_elements as f64 - expected).abs() <= GRID_CONSISTENCY_RTOL * expected.abs()
}

/// The validated parameters of one reprojection.
#[derive(Debug, Clone)]
pub struct RequestParameters {
    pub crs: String,
    projection: Projection,
    pub interpolation: Interpolation,
    pub x_min: Option<f64>,
    pub x_max: Option<f64>,
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub x_res: Option<f64>,
    pub y_res: Option<f64>,
    /// Local path of the granule being reprojected.
    pub input_file: PathBuf,
    /// Where the granule came from, recorded in the output provenance.
    pub granule_url: String,
    /// Directory for the intermediate and final output files.
    pub output_dir: PathBuf,
}

impl RequestParameters {
    /// Validate a request and fill in defaults.
    ///
    /// - `crs` defaults to `+proj=longlat +ellps=WGS84`.
    /// - `interpolation` defaults to `ewa-nn` if missing, empty or `"None"`.
    /// - resolutions must be finite and non-zero.
    /// - resolutions given together with dimensions must be consistent with
    ///   the requested extent.
    /// - the source file must exist.
    /// - x and y extents, and height and width, must be given in pairs.
    pub fn from_request(
        request: &Request,
        input_file: &Path,
        granule_url: Option<&str>,
        output_dir: &Path,
        io: &dyn DatasetIo,
    ) -> error_stack::Result<Self, ReprojectError> {
        let format = &request.format;
        let crs = format.crs.clone().unwrap_or_else(|| DEFAULT_CRS.to_string());
        let projection =
            Projection::new(&crs).change_context_lazy(|| ReprojectError::InvalidCrs(crs.clone()))?;

        let interpolation = match format.interpolation.as_deref() {
            None | Some("") | Some("None") => Interpolation::default(),
            Some(name) => name
                .parse()
                .map_err(|_| ReprojectError::InvalidInterpolation(name.to_string()))?,
        };

        let unusable_res = [request.x_res(), request.y_res()]
            .into_iter()
            .flatten()
            .any(|res| !res.is_finite() || res == 0.0);
        if unusable_res {
            return Err(ReprojectError::InvalidTargetGrid.into());
        }

        let any_res = request.x_res().is_some() || request.y_res().is_some();
        let any_dims = format.height.is_some() || format.width.is_some();
        if any_res && any_dims && !request.has_self_consistent_grid() {
            return Err(ReprojectError::InvalidTargetGrid.into());
        }

        if !io.exists(input_file) {
            return Err(ReprojectError::MissingSourceFile(input_file.to_path_buf()).into());
        }

        match (request.x_extent(), request.y_extent()) {
            (None, Some(_)) => return Err(ReprojectError::MissingExtent('x').into()),
            (Some(_), None) => return Err(ReprojectError::MissingExtent('y').into()),
            _ => {}
        }
        match (format.height, format.width) {
            (None, Some(_)) => return Err(ReprojectError::MissingDimension("height").into()),
            (Some(_), None) => return Err(ReprojectError::MissingDimension("width").into()),
            _ => {}
        }

        let x_extent = request.x_extent();
        let y_extent = request.y_extent();
        Ok(Self {
            crs,
            projection,
            interpolation,
            x_min: x_extent.map(|e| e.min),
            x_max: x_extent.map(|e| e.max),
            y_min: y_extent.map(|e| e.min),
            y_max: y_extent.map(|e| e.max),
            height: format.height,
            width: format.width,
            x_res: request.x_res(),
            y_res: request.y_res(),
            input_file: input_file.to_path_buf(),
            granule_url: granule_url
                .map(|u| u.to_string())
                .unwrap_or_else(|| input_file.display().to_string()),
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// The requested extent, if all four limits were given.
    pub fn grid_extent(&self) -> Option<Extent> {
        Some(Extent {
            x_min: self.x_min?,
            x_max: self.x_max?,
            y_min: self.y_min?,
            y_max: self.y_max?,
        })
    }

    /// The requested (height, width), if both were given.
    pub fn dimensions(&self) -> Option<(usize, usize)> {
        self.height.zip(self.width)
    }

    /// The requested (x, y) resolutions, if both were given.
    pub fn resolutions(&self) -> Option<(f64, f64)> {
        self.x_res.zip(self.y_res)
    }

    /// The file extension of the input, including the leading dot, or an
    /// empty string if it has none.
    pub fn input_extension(&self) -> String {
        self.input_file
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }

    /// The parameters recorded in the output provenance, in a fixed order.
    /// Unset values are omitted and `input_file` is the granule URL.
    pub fn history_parameters(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut params = serde_json::Map::new();
        params.insert("crs".to_string(), self.crs.clone().into());
        params.insert("input_file".to_string(), self.granule_url.clone().into());
        params.insert("interpolation".to_string(), self.interpolation.to_string().into());

        let optional: [(&str, Option<serde_json::Value>); 8] = [
            ("width", self.width.map(Into::into)),
            ("height", self.height.map(Into::into)),
            ("xres", self.x_res.map(Into::into)),
            ("yres", self.y_res.map(Into::into)),
            ("x_min", self.x_min.map(Into::into)),
            ("x_max", self.x_max.map(Into::into)),
            ("y_min", self.y_min.map(Into::into)),
            ("y_max", self.y_max.map(Into::into)),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                params.insert(key.to_string(), value);
            }
        }
        params
    }
}

#[cfg(test)]
impl RequestParameters {
    /// Parameters for an input that is never read, with every grid option unset.
    pub(crate) fn for_tests() -> Self {
        Self {
            crs: DEFAULT_CRS.to_string(),
            projection: Projection::new(DEFAULT_CRS).unwrap(),
            interpolation: Interpolation::default(),
            x_min: None,
            x_max: None,
            y_min: None,
            y_max: None,
            height: None,
            width: None,
            x_res: None,
            y_res: None,
            input_file: PathBuf::from("/input/granule.nc"),
            granule_url: "https://example.com/granule.nc".to_string(),
            output_dir: PathBuf::from("/output"),
        }
    }

    pub(crate) fn with_extent(mut self, x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Self {
        self.x_min = Some(x_min);
        self.x_max = Some(x_max);
        self.y_min = Some(y_min);
        self.y_max = Some(y_max);
        self
    }

    pub(crate) fn with_dimensions(mut self, height: usize, width: usize) -> Self {
        self.height = Some(height);
        self.width = Some(width);
        self
    }

    pub(crate) fn with_resolutions(mut self, x_res: f64, y_res: f64) -> Self {
        self.x_res = Some(x_res);
        self.y_res = Some(y_res);
        self
    }

    pub(crate) fn with_crs(mut self, crs: &str) -> Self {
        self.crs = crs.to_string();
        self.projection = Projection::new(crs).unwrap();
        self
    }

    pub(crate) fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }
}
