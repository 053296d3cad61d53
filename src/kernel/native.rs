//! Pure Rust resampling kernels.
//!
//! Neighbour searches run on an R*-tree of swath points in Earth-centred
//! cartesian coordinates, so the radius of influence is in metres whatever
//! the target CRS. The EWA implementation follows the classic `ll2cr` +
//! `fornav` approach: swath pixels are first mapped to fractional grid
//! columns and rows, then each pixel is spread over the grid cells inside an
//! ellipse derived from the local swath geometry of its scan.
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use rstar::{primitives::GeomWithData, RTree};

use super::{KernelError, KernelParameters, MappingKind, ResamplingInfo, ResamplingKernel, SwathDefinition};
use crate::target_area::TargetArea;

/// Mean Earth radius used for the cartesian neighbour search, in metres.
const EARTH_RADIUS: f64 = 6_370_997.0;

const EWA_WEIGHT_COUNT: usize = 10_000;
const EWA_WEIGHT_MIN: f64 = 0.01;
const EWA_DISTANCE_MAX: f64 = 1.0;
const EWA_DELTA_MAX: f64 = 10.0;
const EWA_EPSILON: f64 = 1e-8;

/// Iteration limit when inverting the bilinear interpolation of a quadrilateral.
const BILINEAR_MAX_ITERATIONS: usize = 20;
/// How far outside [0, 1] a fractional distance may fall and still count as inside.
const BILINEAR_TOLERANCE: f64 = 1e-6;

/// A valid swath point; the data is its position in the valid input index.
type SwathPoint = GeomWithData<[f64; 3], usize>;

/// Kernels that need nothing outside this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeKernel;

impl ResamplingKernel for NativeKernel {
    fn compute_mapping(
        &self,
        kind: MappingKind,
        swath: &SwathDefinition,
        target: &TargetArea,
        parameters: &KernelParameters,
    ) -> error_stack::Result<ResamplingInfo, KernelError> {
        let info = match kind {
            MappingKind::Nearest => nearest_mapping(swath, target, parameters)?,
            MappingKind::Bilinear => bilinear_mapping(swath, target, parameters)?,
            MappingKind::Ewa => ewa_mapping(swath, target),
        };
        Ok(info)
    }

    fn resample(
        &self,
        info: &ResamplingInfo,
        data: ArrayView2<f64>,
        target: &TargetArea,
        maximum_weight_mode: bool,
    ) -> error_stack::Result<Array2<f64>, KernelError> {
        if data.dim() != info.input_shape() {
            let (rows, cols) = info.input_shape();
            return Err(KernelError::DataShapeMismatch {
                expected: vec![rows, cols],
                got: data.shape().to_vec(),
            }
            .into());
        }

        let (height, width) = target.shape();
        let mut output = Array2::from_elem((height, width), f64::NAN);

        match info {
            ResamplingInfo::Nearest {
                valid_input_index,
                valid_output_index,
                index_array,
                ..
            } => {
                let flat: Vec<f64> = data.iter().copied().collect();
                for (&out, &idx) in valid_output_index.iter().zip(index_array) {
                    output[[out / width, out % width]] = flat[valid_input_index[idx]];
                }
            }
            ResamplingInfo::Bilinear {
                valid_input_index,
                valid_output_index,
                valid_point_mapping,
                vertical_distances,
                horizontal_distances,
                ..
            } => {
                let flat: Vec<f64> = data.iter().copied().collect();
                for (k, &out) in valid_output_index.iter().enumerate() {
                    let [p1, p2, p3, p4] = valid_point_mapping[k].map(|i| flat[valid_input_index[i]]);
                    let s = horizontal_distances[k];
                    let t = vertical_distances[k];
                    output[[out / width, out % width]] = (1.0 - s) * (1.0 - t) * p1
                        + s * (1.0 - t) * p2
                        + (1.0 - s) * t * p3
                        + s * t * p4;
                }
            }
            ResamplingInfo::Ewa {
                cols,
                rows,
                rows_per_scan,
            } => {
                fornav(
                    cols.view(),
                    rows.view(),
                    *rows_per_scan,
                    data,
                    &mut output,
                    maximum_weight_mode,
                );
            }
        }

        Ok(output)
    }
}

/// Number of swath rows treated as one scan by EWA: the smallest divisor of
/// the row count between 2 and its square root, or the whole swath if there
/// is none.
pub fn rows_per_scan(total_rows: usize) -> usize {
    if total_rows < 2 {
        return 1;
    }
    (2..)
        .take_while(|d| d * d <= total_rows)
        .find(|d| total_rows % d == 0)
        .unwrap_or(total_rows)
}

fn lonlat_to_xyz(lon: f64, lat: f64) -> [f64; 3] {
    let (lon, lat) = (lon.to_radians(), lat.to_radians());
    [
        EARTH_RADIUS * lat.cos() * lon.cos(),
        EARTH_RADIUS * lat.cos() * lon.sin(),
        EARTH_RADIUS * lat.sin(),
    ]
}

fn build_tree(swath: &SwathDefinition, valid_input_index: &[usize]) -> RTree<SwathPoint> {
    let ncols = swath.shape().1;
    let points = valid_input_index
        .iter()
        .enumerate()
        .map(|(k, &flat)| {
            let (i, j) = (flat / ncols, flat % ncols);
            GeomWithData::new(lonlat_to_xyz(swath.lons[[i, j]], swath.lats[[i, j]]), k)
        })
        .collect();
    RTree::bulk_load(points)
}

/// Cartesian position of every target pixel centre, row-major. Pixels whose
/// centre has no geographic location are `None`.
fn target_points(target: &TargetArea) -> Vec<Option<[f64; 3]>> {
    let (height, width) = target.shape();
    (0..height * width)
        .into_par_iter()
        .map(|k| {
            let (x, y) = target.pixel_centre(k / width, k % width);
            let (lon, lat) = target.projection().inverse(x, y).ok()?;
            (lon.is_finite() && lat.is_finite() && lat.abs() <= 90.0)
                .then(|| lonlat_to_xyz(lon, lat))
        })
        .collect()
}

fn checked_valid_input_index(swath: &SwathDefinition) -> Result<Vec<usize>, KernelError> {
    let valid_input_index = swath.valid_input_index();
    if valid_input_index.is_empty() {
        return Err(KernelError::NoValidCoordinates);
    }
    Ok(valid_input_index)
}

fn nearest_mapping(
    swath: &SwathDefinition,
    target: &TargetArea,
    parameters: &KernelParameters,
) -> Result<ResamplingInfo, KernelError> {
    let valid_input_index = checked_valid_input_index(swath)?;
    let tree = build_tree(swath, &valid_input_index);
    let radius_2 = parameters.radius_of_influence.powi(2);

    let matches: Vec<Option<(usize, f64)>> = target_points(target)
        .into_par_iter()
        .map(|point| {
            let point = point?;
            let (neighbour, distance_2) = tree.nearest_neighbor_iter_with_distance_2(&point).next()?;
            (distance_2 <= radius_2).then(|| (neighbour.data, distance_2.sqrt()))
        })
        .collect();

    let mut valid_output_index = vec![];
    let mut index_array = vec![];
    let mut distance_array = vec![];
    for (out, m) in matches.into_iter().enumerate() {
        if let Some((idx, distance)) = m {
            valid_output_index.push(out);
            index_array.push(idx);
            distance_array.push(distance);
        }
    }
    log::debug!(
        "Nearest neighbour mapping: {} of {} target pixels have a neighbour",
        valid_output_index.len(),
        target.height() * target.width()
    );

    Ok(ResamplingInfo::Nearest {
        input_shape: swath.shape(),
        valid_input_index,
        valid_output_index,
        index_array,
        distance_array,
    })
}

fn bilinear_mapping(
    swath: &SwathDefinition,
    target: &TargetArea,
    parameters: &KernelParameters,
) -> Result<ResamplingInfo, KernelError> {
    let valid_input_index = checked_valid_input_index(swath)?;
    let tree = build_tree(swath, &valid_input_index);
    let radius_2 = parameters.radius_of_influence.powi(2);
    let ncols = swath.shape().1;

    // Swath points in target coordinates, to locate each pixel inside a quadrilateral.
    let projected: Vec<Option<(f64, f64)>> = valid_input_index
        .par_iter()
        .map(|&flat| {
            let (i, j) = (flat / ncols, flat % ncols);
            target
                .projection()
                .forward(swath.lons[[i, j]], swath.lats[[i, j]])
                .ok()
        })
        .collect();

    let width = target.width();
    let corners: Vec<Option<([usize; 4], f64, f64)>> = target_points(target)
        .into_par_iter()
        .enumerate()
        .map(|(k, point)| {
            let point = point?;
            let centre = target.pixel_centre(k / width, k % width);
            let mut quadrants: [Option<usize>; 4] = [None; 4];
            for (neighbour, _) in tree
                .nearest_neighbor_iter_with_distance_2(&point)
                .take_while(|(_, d2)| *d2 <= radius_2)
                .take(parameters.neighbours)
            {
                let Some((x, y)) = projected[neighbour.data] else {
                    continue;
                };
                let quadrant = match (x - centre.0 > 0.0, y - centre.1 >= 0.0) {
                    (false, true) => 0,
                    (true, true) => 1,
                    (false, false) => 2,
                    (true, false) => 3,
                };
                quadrants[quadrant].get_or_insert(neighbour.data);
            }

            let [Some(p1), Some(p2), Some(p3), Some(p4)] = quadrants else {
                return None;
            };
            let quad = [p1, p2, p3, p4].map(|p| projected[p]);
            let [Some(c1), Some(c2), Some(c3), Some(c4)] = quad else {
                return None;
            };
            let (s, t) = fractional_distances([c1, c2, c3, c4], centre)?;
            Some(([p1, p2, p3, p4], s, t))
        })
        .collect();

    let mut valid_output_index = vec![];
    let mut valid_point_mapping = vec![];
    let mut horizontal_distances = vec![];
    let mut vertical_distances = vec![];
    for (out, c) in corners.into_iter().enumerate() {
        if let Some((mapping, s, t)) = c {
            valid_output_index.push(out);
            valid_point_mapping.push(mapping);
            horizontal_distances.push(s);
            vertical_distances.push(t);
        }
    }
    log::debug!(
        "Bilinear mapping: {} of {} target pixels are inside the swath",
        valid_output_index.len(),
        target.height() * target.width()
    );

    Ok(ResamplingInfo::Bilinear {
        input_shape: swath.shape(),
        valid_input_index,
        valid_output_index,
        valid_point_mapping,
        vertical_distances,
        horizontal_distances,
    })
}

/// Invert the bilinear interpolation of the quadrilateral with corners
/// upper-left, upper-right, lower-left, lower-right: find (s, t) such that
/// interpolating the corners gives `point`. Returns `None` if the point is
/// outside the quadrilateral or the quadrilateral is degenerate.
fn fractional_distances(corners: [(f64, f64); 4], point: (f64, f64)) -> Option<(f64, f64)> {
    let [p1, p2, p3, p4] = corners;
    let (mut s, mut t) = (0.5, 0.5);

    for _ in 0..BILINEAR_MAX_ITERATIONS {
        let fx = (1.0 - s) * (1.0 - t) * p1.0 + s * (1.0 - t) * p2.0 + (1.0 - s) * t * p3.0 + s * t * p4.0
            - point.0;
        let fy = (1.0 - s) * (1.0 - t) * p1.1 + s * (1.0 - t) * p2.1 + (1.0 - s) * t * p3.1 + s * t * p4.1
            - point.1;

        let dxs = (1.0 - t) * (p2.0 - p1.0) + t * (p4.0 - p3.0);
        let dys = (1.0 - t) * (p2.1 - p1.1) + t * (p4.1 - p3.1);
        let dxt = (1.0 - s) * (p3.0 - p1.0) + s * (p4.0 - p2.0);
        let dyt = (1.0 - s) * (p3.1 - p1.1) + s * (p4.1 - p2.1);

        let det = dxs * dyt - dxt * dys;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let ds = (fx * dyt - dxt * fy) / det;
        let dt = (dxs * fy - dys * fx) / det;
        s -= ds;
        t -= dt;
        if ds.abs() < 1e-12 && dt.abs() < 1e-12 {
            break;
        }
    }

    let inside = |v: f64| (-BILINEAR_TOLERANCE..=1.0 + BILINEAR_TOLERANCE).contains(&v);
    (inside(s) && inside(t)).then(|| (s.clamp(0.0, 1.0), t.clamp(0.0, 1.0)))
}

/// Map every swath pixel to fractional target columns and rows.
fn ewa_mapping(swath: &SwathDefinition, target: &TargetArea) -> ResamplingInfo {
    let (nrows, ncols) = swath.shape();
    let mapped: Vec<(f64, f64)> = (0..nrows * ncols)
        .into_par_iter()
        .map(|k| {
            let (i, j) = (k / ncols, k % ncols);
            let (lon, lat) = (swath.lons[[i, j]], swath.lats[[i, j]]);
            if !lon.is_finite() || !lat.is_finite() {
                return (f64::NAN, f64::NAN);
            }
            match target.projection().forward(lon, lat) {
                Ok((x, y)) => target.col_row(x, y),
                Err(_) => (f64::NAN, f64::NAN),
            }
        })
        .collect();

    let cols = Array2::from_shape_fn((nrows, ncols), |(i, j)| mapped[i * ncols + j].0);
    let rows = Array2::from_shape_fn((nrows, ncols), |(i, j)| mapped[i * ncols + j].1);
    ResamplingInfo::Ewa {
        cols,
        rows,
        rows_per_scan: rows_per_scan(nrows),
    }
}

/// Gaussian weights indexed by the scaled ellipse distance `q`.
struct EwaWeights {
    table: Vec<f64>,
    qmax: f64,
    qfactor: f64,
}

impl EwaWeights {
    fn new() -> Self {
        let qmax = EWA_DISTANCE_MAX * EWA_DISTANCE_MAX;
        let alpha = -EWA_WEIGHT_MIN.ln() / qmax;
        let qfactor = EWA_WEIGHT_COUNT as f64 / qmax;
        let table = (0..EWA_WEIGHT_COUNT)
            .map(|i| (-alpha * i as f64 / qfactor).exp())
            .collect();
        Self { table, qmax, qfactor }
    }

    fn weight(&self, q: f64) -> f64 {
        let iw = ((q * self.qfactor) as usize).min(EWA_WEIGHT_COUNT - 1);
        self.table[iw]
    }
}

/// The ellipse `a u² + b u v + c v² < f` that a swath pixel covers on the
/// grid, and the half-extents of its bounding box.
#[derive(Debug, Clone, Copy)]
struct EwaParameters {
    a: f64,
    b: f64,
    c: f64,
    f: f64,
    u_del: f64,
    v_del: f64,
}

/// Ellipse parameters for every column of the scan `scan_start..scan_end`,
/// from the grid distance between adjacent columns of its first row (u) and
/// between its first and last rows (v).
fn ewa_parameters(
    cols: ArrayView2<f64>,
    rows: ArrayView2<f64>,
    scan_start: usize,
    scan_end: usize,
    weights: &EwaWeights,
) -> Vec<Option<EwaParameters>> {
    let (nrows, ncols) = cols.dim();
    let first = scan_start;
    let last = scan_end - 1;

    // Single-row scans borrow the along-track step from an adjacent row.
    let (v_first, v_last) = if last > first {
        (first, last)
    } else if first + 1 < nrows {
        (first, first + 1)
    } else {
        (first.saturating_sub(1), first)
    };
    let v_span = (v_last - v_first).max(1) as f64;

    (0..ncols)
        .map(|j| {
            let (jl, jr) = (j.saturating_sub(1), (j + 1).min(ncols - 1));
            let u_span = (jr - jl).max(1) as f64;
            let ux = (cols[[first, jr]] - cols[[first, jl]]) / u_span * EWA_DISTANCE_MAX;
            let uy = (rows[[first, jr]] - rows[[first, jl]]) / u_span * EWA_DISTANCE_MAX;
            let vx = (cols[[v_last, j]] - cols[[v_first, j]]) / v_span * EWA_DISTANCE_MAX;
            let vy = (rows[[v_last, j]] - rows[[v_first, j]]) / v_span * EWA_DISTANCE_MAX;
            if ![ux, uy, vx, vy].iter().all(|v| v.is_finite()) {
                return None;
            }

            let f_scale = (ux * vy - uy * vx).powi(2).max(EWA_EPSILON);
            let f_scale = weights.qmax / f_scale;
            let a = (vx * vx + vy * vy) * f_scale;
            let b = -2.0 * (ux * vx + uy * vy) * f_scale;
            let c = (ux * ux + uy * uy) * f_scale;
            let d = (4.0 * a * c - b * b).max(EWA_EPSILON);
            let d = 4.0 * weights.qmax / d;
            Some(EwaParameters {
                a,
                b,
                c,
                f: weights.qmax,
                u_del: (c * d).sqrt().min(EWA_DELTA_MAX),
                v_del: (a * d).sqrt().min(EWA_DELTA_MAX),
            })
        })
        .collect()
}

/// Forward navigation: spread every swath value over the grid cells in its
/// ellipse and normalise. In maximum weight mode each cell takes the value
/// with the largest weight instead of the weighted mean.
fn fornav(
    cols: ArrayView2<f64>,
    rows: ArrayView2<f64>,
    rows_per_scan: usize,
    data: ArrayView2<f64>,
    output: &mut Array2<f64>,
    maximum_weight_mode: bool,
) {
    let weights = EwaWeights::new();
    let (nrows, ncols) = cols.dim();
    let (height, width) = output.dim();
    let mut accum = Array2::<f64>::zeros((height, width));
    let mut weight_sum = Array2::<f64>::zeros((height, width));

    for scan_start in (0..nrows).step_by(rows_per_scan.max(1)) {
        let scan_end = (scan_start + rows_per_scan.max(1)).min(nrows);
        let parameters = ewa_parameters(cols, rows, scan_start, scan_end, &weights);

        for i in scan_start..scan_end {
            for j in 0..ncols {
                let Some(p) = parameters[j] else {
                    continue;
                };
                let (u0, v0, value) = (cols[[i, j]], rows[[i, j]], data[[i, j]]);
                if !u0.is_finite() || !v0.is_finite() || !value.is_finite() {
                    continue;
                }

                let iu1 = ((u0 - p.u_del).floor() as i64).max(0);
                let iu2 = ((u0 + p.u_del).floor() as i64).min(width as i64 - 1);
                let iv1 = ((v0 - p.v_del).floor() as i64).max(0);
                let iv2 = ((v0 + p.v_del).floor() as i64).min(height as i64 - 1);
                if iu1 > iu2 || iv1 > iv2 {
                    continue;
                }

                let ddq = 2.0 * p.a;
                let u = iu1 as f64 - u0;
                let a2up1 = p.a * (2.0 * u + 1.0);
                let bu = p.b * u;
                let au2 = p.a * u * u;

                for iv in iv1..=iv2 {
                    let v = iv as f64 - v0;
                    let mut dq = a2up1 + p.b * v;
                    let mut q = (p.c * v + bu) * v + au2;
                    for iu in iu1..=iu2 {
                        if q < p.f {
                            let weight = weights.weight(q);
                            let cell = [iv as usize, iu as usize];
                            if maximum_weight_mode {
                                if weight > weight_sum[cell] {
                                    weight_sum[cell] = weight;
                                    accum[cell] = value;
                                }
                            } else {
                                weight_sum[cell] += weight;
                                accum[cell] += value * weight;
                            }
                        }
                        q += dq;
                        dq += ddq;
                    }
                }
            }
        }
    }

    ndarray::Zip::from(output)
        .and(&accum)
        .and(&weight_sum)
        .for_each(|out, &acc, &w| {
            if w > EWA_EPSILON {
                *out = if maximum_weight_mode { acc } else { acc / w };
            }
        });
}
