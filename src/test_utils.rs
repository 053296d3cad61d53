//! Synthetic granules and kernel wrappers shared by the unit tests.
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{Array2, ArrayD, ArrayView2, IxDyn};

use crate::{
    dataset::{Dataset, Variable},
    kernel::{KernelError, KernelParameters, MappingKind, ResamplingInfo, ResamplingKernel, SwathDefinition},
    nc_utils::NcArray,
    target_area::TargetArea,
};

pub(crate) const ALONG_TRACK: usize = 3;
pub(crate) const ACROSS_TRACK: usize = 4;

/// Latitudes of the synthetic swath: 25, 20 and 15 degrees north, one per row.
pub(crate) fn swath_latitudes() -> ArrayD<f64> {
    Array2::from_shape_fn((ALONG_TRACK, ACROSS_TRACK), |(i, _)| 25.0 - 5.0 * i as f64).into_dyn()
}

/// Longitudes of the synthetic swath: 40 to 55 degrees east, one per column.
pub(crate) fn swath_longitudes() -> ArrayD<f64> {
    Array2::from_shape_fn((ALONG_TRACK, ACROSS_TRACK), |(_, j)| 40.0 + 5.0 * j as f64).into_dyn()
}

fn band_values(offset: f64) -> ArrayD<f64> {
    ArrayD::from_shape_fn(IxDyn(&[ALONG_TRACK, ACROSS_TRACK]), |idx| {
        offset + (idx[0] * ACROSS_TRACK + idx[1]) as f64
    })
}

/// A granule with 2-D `/lat` and `/lon` coordinates and four science
/// variables georeferenced by them, each with a different storage type:
///
/// - `/alpha_var`: f64, no fill value
/// - `/blue_var`: f32 with a fill value
/// - `/green_var`: i16, packed with `scale_factor` and `add_offset`
/// - `/red_var`: f64 with a fill value and units
pub(crate) fn four_band_swath() -> Dataset {
    let dims = ["along", "across"];
    let mut ds = Dataset::new();
    ds.add_dimension("along", ALONG_TRACK);
    ds.add_dimension("across", ACROSS_TRACK);
    ds.set_attribute("title", "Synthetic four band swath");

    let lat = Variable::new("lat", &dims, NcArray::F64(swath_latitudes()))
        .with_attribute("units", "degrees_north")
        .with_attribute("standard_name", "latitude");
    let lon = Variable::new("lon", &dims, NcArray::F64(swath_longitudes()))
        .with_attribute("units", "degrees_east")
        .with_attribute("standard_name", "longitude");
    add(&mut ds, "/lat", lat);
    add(&mut ds, "/lon", lon);

    let alpha = Variable::new("alpha_var", &dims, NcArray::F64(band_values(0.0)))
        .with_attribute("coordinates", "lat lon");
    let blue = Variable::new("blue_var", &dims, NcArray::from_f64(crate::nc_utils::DataType::F32, &band_values(100.0)))
        .with_attribute("_FillValue", -9999.0f32)
        .with_attribute("coordinates", "lat lon");
    let green_packed = band_values(0.0).mapv(|v| v * 10.0);
    let green = Variable::new("green_var", &dims, NcArray::from_f64(crate::nc_utils::DataType::I16, &green_packed))
        .with_attribute("_FillValue", -1i16)
        .with_attribute("scale_factor", 0.1)
        .with_attribute("add_offset", 200.0)
        .with_attribute("coordinates", "lat lon");
    let red = Variable::new("red_var", &dims, NcArray::F64(band_values(300.0)))
        .with_attribute("_FillValue", -9999.0)
        .with_attribute("units", "K")
        .with_attribute("coordinates", "lat lon");
    add(&mut ds, "/alpha_var", alpha);
    add(&mut ds, "/blue_var", blue);
    add(&mut ds, "/green_var", green);
    add(&mut ds, "/red_var", red);
    ds
}

/// Add a variable to a test dataset, panicking if it is inconsistent.
pub(crate) fn add(ds: &mut Dataset, path: &str, variable: Variable) {
    ds.add_variable(path, variable)
        .unwrap_or_else(|e| panic!("could not add {path} to the test dataset: {e}"));
}

/// Wraps a kernel to count how often mappings are computed.
#[derive(Debug, Default)]
pub(crate) struct CountingKernel<K> {
    inner: K,
    mapping_calls: AtomicUsize,
    resample_calls: AtomicUsize,
}

impl<K> CountingKernel<K> {
    pub(crate) fn new(inner: K) -> Self {
        Self {
            inner,
            mapping_calls: AtomicUsize::new(0),
            resample_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn mapping_calls(&self) -> usize {
        self.mapping_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn resample_calls(&self) -> usize {
        self.resample_calls.load(Ordering::SeqCst)
    }
}

impl<K: ResamplingKernel> ResamplingKernel for CountingKernel<K> {
    fn compute_mapping(
        &self,
        kind: MappingKind,
        swath: &SwathDefinition,
        target: &TargetArea,
        parameters: &KernelParameters,
    ) -> error_stack::Result<ResamplingInfo, KernelError> {
        self.mapping_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.compute_mapping(kind, swath, target, parameters)
    }

    fn resample(
        &self,
        info: &ResamplingInfo,
        data: ArrayView2<f64>,
        target: &TargetArea,
        maximum_weight_mode: bool,
    ) -> error_stack::Result<Array2<f64>, KernelError> {
        self.resample_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resample(info, data, target, maximum_weight_mode)
    }
}
