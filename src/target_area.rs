//! The regular grid that swath data are resampled onto.
use error_stack::ResultExt;
use ndarray::Array1;

use crate::{
    geometry::{extents_from_perimeter, projected_resolution, CoordinateData, Extent},
    parameters::RequestParameters,
    projection::Projection,
};

/// Area identifier used for a grid fully defined by the request.
pub const REQUEST_TARGET: &str = "request_target";

#[derive(Debug, thiserror::Error)]
pub enum TargetAreaError {
    #[error("Target grid dimensions must be at least 1x1, got {height}x{width}")]
    InvalidDimensions { height: usize, width: usize },

    #[error("Target grid resolutions must be finite and non-zero, got ({x_res}, {y_res})")]
    InvalidResolution { x_res: f64, y_res: f64 },

    #[error("Target grid extent is empty or not finite: {0:?}")]
    InvalidExtent(Extent),

    #[error("Could not derive the target grid from the swath coordinates")]
    Geometry,
}

/// A regular, north-up grid in a target projection.
///
/// Pixel (0, 0) is the upper-left corner of the grid: columns increase with
/// x and rows decrease in y, so the y resolution is negative.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetArea {
    area_id: String,
    projection: Projection,
    height: usize,
    width: usize,
    extent: Extent,
}

impl TargetArea {
    /// Define an area from its extent and pixel dimensions, as (height, width).
    pub fn from_extent<S: ToString>(
        area_id: S,
        projection: Projection,
        (height, width): (usize, usize),
        extent: Extent,
    ) -> Result<Self, TargetAreaError> {
        if height == 0 || width == 0 {
            return Err(TargetAreaError::InvalidDimensions { height, width });
        }
        let finite = [extent.x_min, extent.x_max, extent.y_min, extent.y_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite || extent.x_min == extent.x_max || extent.y_min == extent.y_max {
            return Err(TargetAreaError::InvalidExtent(extent));
        }

        Ok(Self {
            area_id: area_id.to_string(),
            projection,
            height,
            width,
            extent,
        })
    }

    pub fn area_id(&self) -> &str {
        &self.area_id
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn x_res(&self) -> f64 {
        (self.extent.x_max - self.extent.x_min) / self.width as f64
    }

    pub fn y_res(&self) -> f64 {
        -(self.extent.y_max - self.extent.y_min) / self.height as f64
    }

    /// GDAL-style affine transform: `[x_res, 0, x_origin, 0, y_res, y_origin]`
    /// where the origin is the upper-left corner of the grid.
    pub fn transform(&self) -> [f64; 6] {
        [
            self.x_res(),
            0.0,
            self.extent.x_min,
            0.0,
            self.y_res(),
            self.extent.y_max,
        ]
    }

    /// x values of the pixel centres, increasing.
    pub fn x_coordinates(&self) -> Array1<f64> {
        let res = self.x_res();
        Array1::from_iter((0..self.width).map(|i| self.extent.x_min + (i as f64 + 0.5) * res))
    }

    /// y values of the pixel centres, decreasing.
    pub fn y_coordinates(&self) -> Array1<f64> {
        let res = self.y_res();
        Array1::from_iter((0..self.height).map(|j| self.extent.y_max + (j as f64 + 0.5) * res))
    }

    /// Fractional (column, row) of a projected point, such that pixel
    /// centres fall on whole numbers.
    pub fn col_row(&self, x: f64, y: f64) -> (f64, f64) {
        let col = (x - self.extent.x_min) / self.x_res() - 0.5;
        let row = (y - self.extent.y_max) / self.y_res() - 0.5;
        (col, row)
    }

    /// Projected coordinates of the centre of pixel (row, col).
    pub fn pixel_centre(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.extent.x_min + (col as f64 + 0.5) * self.x_res(),
            self.extent.y_max + (row as f64 + 0.5) * self.y_res(),
        )
    }
}

/// Pixel counts along x and y for an extent and (signed) resolutions.
/// Ties round to even.
fn dimensions_from_resolutions(
    extent: &Extent,
    x_res: f64,
    y_res: f64,
) -> Result<(usize, usize), TargetAreaError> {
    let x_range = extent.x_max - extent.x_min;
    let y_range = extent.y_min - extent.y_max;
    let width = (x_range / x_res).round_ties_even().abs();
    let height = (y_range / y_res).round_ties_even().abs();
    if !width.is_finite() || !height.is_finite() {
        return Err(TargetAreaError::InvalidResolution { x_res, y_res });
    }
    Ok((height as usize, width as usize))
}

/// The grid defined entirely by the request: an extent plus either
/// dimensions or resolutions. Returns `None` when the request does not
/// define a complete grid.
pub fn request_target_area(
    parameters: &RequestParameters,
) -> Result<Option<TargetArea>, TargetAreaError> {
    let Some(extent) = parameters.grid_extent() else {
        return Ok(None);
    };

    let dimensions = if let Some(dims) = parameters.dimensions() {
        dims
    } else if let Some((x_res, y_res)) = parameters.resolutions() {
        dimensions_from_resolutions(&extent, x_res, y_res)?
    } else {
        return Ok(None);
    };

    TargetArea::from_extent(
        REQUEST_TARGET,
        parameters.projection().clone(),
        dimensions,
        extent,
    )
    .map(Some)
}

/// Define the target area for one set of swath coordinates, using whatever
/// the request specifies and deriving the rest from the swath geometry.
pub fn build_target_area(
    parameters: &RequestParameters,
    area_id: &str,
    coordinates: &CoordinateData,
) -> error_stack::Result<TargetArea, TargetAreaError> {
    let projection = parameters.projection();

    let extent = match parameters.grid_extent() {
        Some(extent) => {
            log::info!("Request x extent: x_min: {}, x_max: {}", extent.x_min, extent.x_max);
            log::info!("Request y extent: y_min: {}, y_max: {}", extent.y_min, extent.y_max);
            extent
        }
        None => {
            let extent = extents_from_perimeter(projection, coordinates)
                .change_context(TargetAreaError::Geometry)?;
            log::info!("Calculated x extent: x_min: {}, x_max: {}", extent.x_min, extent.x_max);
            log::info!("Calculated y extent: y_min: {}, y_max: {}", extent.y_min, extent.y_max);
            extent
        }
    };

    let x_range = extent.x_max - extent.x_min;
    let y_range = extent.y_min - extent.y_max;
    let dimensions = parameters.dimensions();

    let (x_res, y_res) = match (parameters.resolutions(), dimensions) {
        (Some(res), _) => {
            log::info!("Resolutions from request: ({}, {})", res.0, res.1);
            res
        }
        (None, Some((height, width))) => (x_range / width as f64, y_range / height as f64),
        (None, None) => {
            let x_res = projected_resolution(projection, coordinates)
                .change_context(TargetAreaError::Geometry)?;
            let y_res = -x_res;
            log::info!("Calculated projected resolutions: ({x_res}, {y_res})");
            (x_res, y_res)
        }
    };

    let dimensions = match dimensions {
        Some(dims) => dims,
        None => {
            let (height, width) = dimensions_from_resolutions(&extent, x_res, y_res)?;
            log::info!("Calculated width: {width}");
            log::info!("Calculated height: {height}");
            (height, width)
        }
    };

    Ok(TargetArea::from_extent(
        area_id,
        projection.clone(),
        dimensions,
        extent,
    )?)
}
