//! Swath geometry: extents and resolution of swath data in a target projection.
//!
//! The perimeter of a swath is approximated by the first and last valid
//! pixel in every row and column. Those points are projected to the target
//! CRS, where their bounding box gives the extents and the area of the
//! polygon they enclose (shared equally between all valid pixels, which are
//! assumed square) gives the resolution.
use std::collections::BTreeSet;

use itertools::Itertools;
use ndarray::{Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2, Zip};

use crate::projection::Projection;

/// A (longitude, latitude) or (x, y) pair.
pub type Point = (f64, f64);

/// Longitude jump between adjacent pixels above which a swath is assumed
/// to cross the antimeridian.
const DATE_LINE_THRESHOLD: f64 = 90.0;

#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("No valid coordinates in swath")]
    NoValidCoordinates,

    #[error("Longitude and latitude shapes differ: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),

    #[error("Coordinates with shape {0:?} are not supported")]
    UnsupportedShape(Vec<usize>),

    #[error("Could not project swath coordinates")]
    Projection,
}

/// Projected bounding box, in target CRS units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

/// Longitude and latitude values for a swath, either 2-D arrays or 1-D
/// lists of points, with the fill values of their variables.
#[derive(Debug, Clone)]
pub struct CoordinateData {
    pub longitudes: ArrayD<f64>,
    pub latitudes: ArrayD<f64>,
    pub lon_fill: Option<f64>,
    pub lat_fill: Option<f64>,
}

impl CoordinateData {
    pub fn new(longitudes: ArrayD<f64>, latitudes: ArrayD<f64>) -> Self {
        Self {
            longitudes,
            latitudes,
            lon_fill: None,
            lat_fill: None,
        }
    }

    pub fn with_fill_values(mut self, lon_fill: Option<f64>, lat_fill: Option<f64>) -> Self {
        self.lon_fill = lon_fill;
        self.lat_fill = lat_fill;
        self
    }

    pub fn shape(&self) -> &[usize] {
        self.longitudes.shape()
    }

    fn check_shapes(&self) -> Result<(), GeometryError> {
        if self.longitudes.shape() != self.latitudes.shape() {
            return Err(GeometryError::ShapeMismatch(
                self.longitudes.shape().to_vec(),
                self.latitudes.shape().to_vec(),
            ));
        }
        Ok(())
    }

    fn as_2d(&self) -> Option<(ArrayView2<f64>, ArrayView2<f64>)> {
        let lon = self.longitudes.view().into_dimensionality::<Ix2>().ok()?;
        let lat = self.latitudes.view().into_dimensionality::<Ix2>().ok()?;
        Some((lon, lat))
    }

    fn as_1d(&self) -> Option<(ArrayView1<f64>, ArrayView1<f64>)> {
        let lon = self.longitudes.view().into_dimensionality::<Ix1>().ok()?;
        let lat = self.latitudes.view().into_dimensionality::<Ix1>().ok()?;
        Some((lon, lat))
    }

    /// Valid (longitude, latitude) points of a 1-D coordinate pair.
    fn valid_points_1d(&self, lon: ArrayView1<f64>, lat: ArrayView1<f64>) -> Vec<Point> {
        lon.iter()
            .zip(lat.iter())
            .filter(|&(&x, &y)| is_valid(x, self.lon_fill) && is_valid(y, self.lat_fill))
            .map(|(&x, &y)| (x, y))
            .collect()
    }
}

fn is_valid(value: f64, fill: Option<f64>) -> bool {
    value.is_finite() && fill.map_or(true, |f| value != f)
}

/// Find the swath extents in the target CRS from the projected perimeter
/// points (or all points, for 1-D coordinates).
pub fn extents_from_perimeter(
    projection: &Projection,
    coordinates: &CoordinateData,
) -> error_stack::Result<Extent, GeometryError> {
    coordinates.check_shapes()?;
    let points = if let Some((lon, lat)) = coordinates.as_2d() {
        let mask = valid_coordinates_mask(lon, lat, coordinates.lon_fill, coordinates.lat_fill);
        perimeter_coordinates(lon, lat, mask.view())
    } else if let Some((lon, lat)) = coordinates.as_1d() {
        coordinates.valid_points_1d(lon, lat)
    } else {
        return Err(GeometryError::UnsupportedShape(coordinates.shape().to_vec()).into());
    };

    let (xs, ys) = reproject_coordinates(&points, projection)?;
    let min_max = |values: &[f64]| {
        values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
    };
    let (x_min, x_max) = min_max(&xs);
    let (y_min, y_max) = min_max(&ys);
    Ok(Extent {
        x_min,
        x_max,
        y_min,
        y_max,
    })
}

/// Find the resolution of the swath in the target CRS.
///
/// For 2-D coordinates this is the square root of the projected perimeter
/// polygon area divided by the number of valid pixels. For 1-D coordinates
/// it is the mean distance between consecutive projected points.
pub fn projected_resolution(
    projection: &Projection,
    coordinates: &CoordinateData,
) -> error_stack::Result<f64, GeometryError> {
    coordinates.check_shapes()?;
    if let Some((lon, lat)) = coordinates.as_2d() {
        let mask = valid_coordinates_mask(lon, lat, coordinates.lon_fill, coordinates.lat_fill);
        let n_valid = mask.iter().filter(|&&m| m).count();
        let points = perimeter_coordinates(lon, lat, mask.view());
        let (xs, ys) = reproject_coordinates(&points, projection)?;
        let (ordered_x, ordered_y) = sort_perimeter_points(&xs, &ys);
        let area = polygon_area(&ordered_x, &ordered_y);
        Ok(absolute_resolution(area, n_valid))
    } else if let Some((lon, lat)) = coordinates.as_1d() {
        let points = coordinates.valid_points_1d(lon, lat);
        let (xs, ys) = reproject_coordinates(&points, projection)?;
        Ok(one_dimensional_resolution(&xs, &ys))
    } else {
        Err(GeometryError::UnsupportedShape(coordinates.shape().to_vec()).into())
    }
}

/// Project (longitude, latitude) points. Points the projection cannot
/// handle are dropped; it is an error if none remain.
pub fn reproject_coordinates(
    points: &[Point],
    projection: &Projection,
) -> error_stack::Result<(Vec<f64>, Vec<f64>), GeometryError> {
    if points.is_empty() {
        return Err(GeometryError::NoValidCoordinates.into());
    }

    let mut xs = Vec::with_capacity(points.len());
    let mut ys = Vec::with_capacity(points.len());
    let mut last_error = None;
    for &(lon, lat) in points {
        match projection.forward(lon, lat) {
            Ok((x, y)) => {
                xs.push(x);
                ys.push(y);
            }
            Err(e) => last_error = Some(e),
        }
    }

    if xs.is_empty() {
        return match last_error {
            Some(e) => Err(error_stack::Report::new(e).change_context(GeometryError::Projection)),
            None => Err(GeometryError::Projection.into()),
        };
    }
    if last_error.is_some() {
        log::debug!(
            "{} of {} perimeter points could not be projected to {}",
            points.len() - xs.len(),
            points.len(),
            projection.definition()
        );
    }
    Ok((xs, ys))
}

/// True where both longitude and latitude are finite and not equal to
/// their respective fill values.
pub fn valid_coordinates_mask(
    lon: ArrayView2<f64>,
    lat: ArrayView2<f64>,
    lon_fill: Option<f64>,
    lat_fill: Option<f64>,
) -> Array2<bool> {
    Zip::from(&lon)
        .and(&lat)
        .map_collect(|&x, &y| is_valid(x, lon_fill) && is_valid(y, lat_fill))
}

/// Coordinates of the first and last valid pixel in every row and column.
///
/// If the swath crosses the antimeridian, longitudes are shifted by 360°
/// so that they are continuous, keeping the hemisphere where most pixels
/// lie unchanged.
pub fn perimeter_coordinates(
    lon: ArrayView2<f64>,
    lat: ArrayView2<f64>,
    mask: ArrayView2<bool>,
) -> Vec<Point> {
    let mut indices: BTreeSet<(usize, usize)> = BTreeSet::new();

    for (irow, row) in mask.axis_iter(Axis(0)).enumerate() {
        let valid: Vec<usize> = row.iter().positions(|&m| m).collect();
        indices.extend(slice_edges(&valid, irow, true));
    }

    for (icol, col) in mask.axis_iter(Axis(1)).enumerate() {
        let valid: Vec<usize> = col.iter().positions(|&m| m).collect();
        indices.extend(slice_edges(&valid, icol, false));
    }

    let masked_lon = Zip::from(&lon)
        .and(&mask)
        .map_collect(|&x, &m| if m { x } else { f64::NAN });

    let shift: fn(f64) -> f64 = if crosses_international_date_line(masked_lon.view()) {
        let median = median(masked_lon.iter().copied().filter(|v| v.is_finite()));
        if median < 0.0 {
            // Most pixels are in the western hemisphere
            |v: f64| if v > 0.0 { v - 360.0 } else { v }
        } else {
            |v: f64| if v < 0.0 { v + 360.0 } else { v }
        }
    } else {
        |v: f64| v
    };

    indices
        .into_iter()
        .map(|(i, j)| (shift(lon[[i, j]]), lat[[i, j]]))
        .collect()
}

/// The 2-D indices of the first and last entries in `valid_indices` (which
/// must be sorted), for a row or column at `slice_index`.
pub fn slice_edges(valid_indices: &[usize], slice_index: usize, is_row: bool) -> Vec<(usize, usize)> {
    let (Some(&first), Some(&last)) = (valid_indices.first(), valid_indices.last()) else {
        return vec![];
    };

    if is_row {
        vec![(slice_index, first), (slice_index, last)]
    } else {
        vec![(first, slice_index), (last, slice_index)]
    }
}

/// Check for a longitude discontinuity between adjacent rows or columns.
/// Non-finite values are ignored.
pub fn crosses_international_date_line(lon: ArrayView2<f64>) -> bool {
    let max_diff = |axis: usize| {
        let n = lon.len_of(Axis(axis));
        if n < 2 {
            return 0.0;
        }
        let a = lon.slice_axis(Axis(axis), (0..n - 1).into());
        let b = lon.slice_axis(Axis(axis), (1..n).into());
        Zip::from(&a)
            .and(&b)
            .fold(0.0_f64, |acc, &x, &y| acc.max((y - x).abs()))
    };

    max_diff(0).max(max_diff(1)) > DATE_LINE_THRESHOLD
}

fn median<I: Iterator<Item = f64>>(values: I) -> f64 {
    let mut values: Vec<f64> = values.collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Order points clockwise around their centroid, starting from the
/// direction of the positive y axis.
pub fn sort_perimeter_points(xs: &[f64], ys: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = xs.len().min(ys.len());
    if n == 0 {
        return (vec![], vec![]);
    }
    let centroid = (
        xs[..n].iter().sum::<f64>() / n as f64,
        ys[..n].iter().sum::<f64>() / n as f64,
    );

    let mut keyed: Vec<((f64, f64), Point)> = xs
        .iter()
        .zip(ys.iter())
        .map(|(&x, &y)| (clockwise_point_sort(centroid, (x, y)), (x, y)))
        .collect();
    keyed.sort_by(|(ka, _), (kb, _)| ka.0.total_cmp(&kb.0).then(ka.1.total_cmp(&kb.1)));

    keyed.into_iter().map(|(_, p)| p).unzip()
}

/// Sort key for [`sort_perimeter_points`]: the signed angle between the
/// vector `origin -> point` and a vertical reference vector, and the
/// vector's length. A point at the origin gets an angle of -π.
pub fn clockwise_point_sort(origin: Point, point: Point) -> (f64, f64) {
    let vector = (point.0 - origin.0, point.1 - origin.1);
    let length = vector.0.hypot(vector.1);
    if length == 0.0 {
        return (-std::f64::consts::PI, 0.0);
    }

    let (nx, ny) = (vector.0 / length, vector.1 / length);
    // Reference vector is (0, 1)
    let dot = ny;
    let determinant = nx;
    (determinant.atan2(dot), length)
}

/// Shoelace formula; points must be ordered along the perimeter.
pub fn polygon_area(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = (0..n)
        .map(|i| {
            let prev = (i + n - 1) % n;
            xs[i] * ys[prev] - ys[i] * xs[prev]
        })
        .sum();
    0.5 * sum.abs()
}

/// Side length of square pixels that share `area` equally.
pub fn absolute_resolution(area: f64, n_pixels: usize) -> f64 {
    (area / n_pixels as f64).sqrt()
}

/// Mean distance between consecutive points.
pub fn one_dimensional_resolution(xs: &[f64], ys: &[f64]) -> f64 {
    let distances: Vec<f64> = xs
        .windows(2)
        .zip(ys.windows(2))
        .map(|(x, y)| euclidean_distance(x[0], x[1], y[0], y[1]))
        .collect();
    if distances.is_empty() {
        return f64::NAN;
    }
    distances.iter().sum::<f64>() / distances.len() as f64
}

pub fn euclidean_distance(x_one: f64, x_two: f64, y_one: f64, y_two: f64) -> f64 {
    (x_one - x_two).hypot(y_one - y_two)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};
    use rstest::{fixture, rstest};

    use crate::projection::DEFAULT_CRS;

    #[fixture]
    fn swath() -> CoordinateData {
        let lat = arr2(&[
            [25.0, 25.0, 25.0, 25.0],
            [20.0, 20.0, 20.0, 20.0],
            [15.0, 15.0, 15.0, 15.0],
        ]);
        let lon = arr2(&[
            [40.0, 45.0, 50.0, 55.0],
            [40.0, 45.0, 50.0, 55.0],
            [40.0, 45.0, 50.0, 55.0],
        ]);
        CoordinateData::new(lon.into_dyn(), lat.into_dyn())
    }

    fn geographic() -> Projection {
        Projection::new(DEFAULT_CRS).unwrap()
    }

    #[test]
    fn test_euclidean_distance() {
        assert_relative_eq!(euclidean_distance(2.3, 5.3, 6.8, 2.8), 5.0, epsilon = 1e-12);
    }

    #[rstest]
    fn test_projected_resolution_geographic(swath: CoordinateData) {
        let res = projected_resolution(&geographic(), &swath).unwrap();
        assert_relative_eq!(res, 3.536, epsilon = 1e-3);
    }

    #[test]
    fn test_projected_resolution_1d() {
        let coords = CoordinateData::new(
            arr1(&[2.0, 6.0, 10.0, 14.0]).into_dyn(),
            arr1(&[0.0, 3.0, 6.0, 9.0]).into_dyn(),
        );
        let res = projected_resolution(&geographic(), &coords).unwrap();
        assert_relative_eq!(res, 5.0, epsilon = 1e-12);

        let extent = extents_from_perimeter(&geographic(), &coords).unwrap();
        assert_eq!(
            extent,
            Extent {
                x_min: 2.0,
                x_max: 14.0,
                y_min: 0.0,
                y_max: 9.0
            }
        );
    }

    #[rstest]
    fn test_extents_geographic(swath: CoordinateData) {
        let extent = extents_from_perimeter(&geographic(), &swath).unwrap();
        assert_relative_eq!(extent.x_min, 40.0);
        assert_relative_eq!(extent.x_max, 55.0);
        assert_relative_eq!(extent.y_min, 15.0);
        assert_relative_eq!(extent.y_max, 25.0);
    }

    #[rstest]
    fn test_extents_projected(swath: CoordinateData) {
        let ease = Projection::new("EPSG:6933").unwrap();
        let extent = extents_from_perimeter(&ease, &swath).unwrap();
        assert_relative_eq!(extent.x_min, 3859451.210, max_relative = 1e-6);
        assert_relative_eq!(extent.x_max, 5306745.414, max_relative = 1e-6);
    }

    #[rstest]
    fn test_perimeter_coordinates(swath: CoordinateData) {
        let valid = arr2(&[
            [false, true, true, false],
            [true, true, true, true],
            [true, true, false, false],
        ]);
        let lon = swath.longitudes.view().into_dimensionality::<Ix2>().unwrap();
        let lat = swath.latitudes.view().into_dimensionality::<Ix2>().unwrap();
        let points = perimeter_coordinates(lon, lat, valid.view());

        let expected: Vec<Point> = [(0, 1), (0, 2), (1, 0), (1, 3), (2, 0), (2, 1), (1, 2)]
            .iter()
            .map(|&(i, j)| (lon[[i, j]], lat[[i, j]]))
            .sorted_by(|a, b| a.partial_cmp(b).unwrap())
            .collect();
        let actual: Vec<Point> = points
            .into_iter()
            .sorted_by(|a, b| a.partial_cmp(b).unwrap())
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_perimeter_date_line_shift() {
        let lon = arr2(&[[170.0, 175.0, -175.0, -170.0], [170.0, 175.0, -175.0, -170.0]]);
        let lat = arr2(&[[10.0, 10.0, 10.0, 10.0], [5.0, 5.0, 5.0, 5.0]]);
        let mask = valid_coordinates_mask(lon.view(), lat.view(), None, None);
        let points = perimeter_coordinates(lon.view(), lat.view(), mask.view());

        // Median is 0 here, so the eastern hemisphere is kept.
        let mut lons: Vec<f64> = points.iter().map(|p| p.0).collect();
        lons.sort_by(|a, b| a.total_cmp(b));
        lons.dedup();
        assert_eq!(lons, vec![170.0, 175.0, 185.0, 190.0]);
        assert!(lons.windows(2).all(|w| (w[1] - w[0]).abs() <= 90.0));
    }

    #[test]
    fn test_crosses_date_line() {
        let not_crossing = arr2(&[[10.0, 20.0, 30.0], [10.0, 20.0, 30.0]]);
        let crossing = arr2(&[[165.0, 175.0, -175.0], [165.0, 175.0, -175.0]]);
        let crossing_vertical = arr2(&[[101.0, 101.0], [10.0, 10.0]]);
        assert!(!crosses_international_date_line(not_crossing.view()));
        assert!(crosses_international_date_line(crossing.view()));
        assert!(crosses_international_date_line(crossing_vertical.view()));
    }

    #[rstest]
    #[case((0.0, 0.0), (0.0, 0.0), (-std::f64::consts::PI, 0.0))]
    #[case((0.0, 0.0), (0.0, 30.0), (0.0, 30.0))]
    #[case((0.0, 0.0), (3.0, 3.0), (std::f64::consts::FRAC_PI_4, 18.0_f64.sqrt()))]
    fn test_clockwise_point_sort(#[case] origin: Point, #[case] point: Point, #[case] expected: (f64, f64)) {
        let (angle, length) = clockwise_point_sort(origin, point);
        assert_relative_eq!(angle, expected.0, epsilon = 1e-12);
        assert_relative_eq!(length, expected.1, epsilon = 1e-12);
    }

    #[rstest]
    #[case(vec![(0., 0.), (0., 1.), (0., 2.), (1., 2.), (2., 2.), (2., 1.), (2., 0.), (1., 0.)])]
    #[case(vec![
        (20., 10.), (10., 30.), (20., 40.), (10., 50.), (20., 60.), (30., 60.),
        (40., 50.), (50., 60.), (50., 40.), (60., 40.), (50., 30.), (60., 10.)
    ])]
    fn test_sort_perimeter_points(#[case] ordered: Vec<Point>) {
        // Reverse and rotate to get a deterministic disorder.
        let mut disordered = ordered.clone();
        disordered.reverse();
        disordered.rotate_left(3);
        let (xs, ys): (Vec<f64>, Vec<f64>) = disordered.into_iter().unzip();
        let (sorted_x, sorted_y) = sort_perimeter_points(&xs, &ys);
        let (expected_x, expected_y): (Vec<f64>, Vec<f64>) = ordered.into_iter().unzip();
        assert_eq!(sorted_x, expected_x);
        assert_eq!(sorted_y, expected_y);
    }

    #[test]
    fn test_polygon_area() {
        assert_eq!(polygon_area(&[1.0, 3.0, 1.0], &[1.0, 1.0, 3.0]), 2.0);
        assert_eq!(polygon_area(&[1.0, 3.0, 3.0, 1.0], &[2.0, 2.0, 4.0, 4.0]), 4.0);
    }

    #[test]
    fn test_absolute_resolution() {
        assert_eq!(absolute_resolution(16.0, 4), 2.0);
    }

    #[test]
    fn test_one_dimensional_resolution() {
        let res = one_dimensional_resolution(&[2.0, 6.0, 10.0, 14.0], &[0.0, 3.0, 6.0, 9.0]);
        assert_relative_eq!(res, 5.0, epsilon = 1e-12);
    }

    #[rstest]
    #[case(arr2(&[[1.0, 2.0], [3.0, 4.0]]), arr2(&[[5.0, 6.0], [7.0, 8.0]]), arr2(&[[true, true], [true, true]]))]
    #[case(arr2(&[[f64::NAN, 2.0], [3.0, 4.0]]), arr2(&[[5.0, 6.0], [7.0, 8.0]]), arr2(&[[false, true], [true, true]]))]
    #[case(arr2(&[[1.0, 2.0], [-9999.0, 4.0]]), arr2(&[[5.0, 6.0], [7.0, 8.0]]), arr2(&[[true, true], [false, true]]))]
    #[case(arr2(&[[1.0, 2.0], [3.0, 4.0]]), arr2(&[[5.0, f64::NAN], [7.0, -9999.0]]), arr2(&[[true, false], [true, false]]))]
    #[case(arr2(&[[f64::NAN, 2.0], [-9999.0, 4.0]]), arr2(&[[5.0, f64::NAN], [7.0, -9999.0]]), arr2(&[[false, false], [false, false]]))]
    fn test_valid_coordinates_mask(
        #[case] lon: Array2<f64>,
        #[case] lat: Array2<f64>,
        #[case] expected: Array2<bool>,
    ) {
        let mask = valid_coordinates_mask(lon.view(), lat.view(), Some(-9999.0), Some(-9999.0));
        assert_eq!(mask, expected);
    }

    #[test]
    fn test_slice_edges() {
        let valid = [2, 3, 4, 5, 6, 7, 8, 9];
        assert_eq!(slice_edges(&valid, 6, true), vec![(6, 2), (6, 9)]);
        assert_eq!(slice_edges(&valid, 6, false), vec![(2, 6), (9, 6)]);
        assert!(slice_edges(&[], 6, true).is_empty());
    }
}
