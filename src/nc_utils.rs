use ndarray::{ArrayD, IxDyn};
use num_traits::{NumCast, ToPrimitive};

// netCDF default fill values of the integer types (netcdf.h).
const NC_FILL_BYTE: i8 = -127;
const NC_FILL_SHORT: i16 = -32767;
const NC_FILL_INT: i32 = -2147483647;
const NC_FILL_INT64: i64 = -9223372036854775806;
const NC_FILL_UBYTE: u8 = 255;
const NC_FILL_USHORT: u16 = 65535;
const NC_FILL_UINT: u32 = 4294967295;
const NC_FILL_UINT64: u64 = 18446744073709551614;

/// The primitive element types an [`NcArray`] can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Char,
}

impl DataType {
    pub fn is_integer(&self) -> bool {
        !matches!(self, Self::F32 | Self::F64 | Self::Char)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

/// A type that can hold a variety of arrays that might be stored
/// in a netCDF file. With the `netcdf` feature it is best created by
/// reading from a netCDF variable (see [`crate::dataset::netcdf_io`]).
#[derive(Debug, Clone, PartialEq)]
pub enum NcArray {
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    Char(ArrayD<u8>),
}

macro_rules! map_numeric {
    ($self:expr, $arr:ident => $body:expr) => {
        match $self {
            NcArray::I8($arr) => $body,
            NcArray::I16($arr) => $body,
            NcArray::I32($arr) => $body,
            NcArray::I64($arr) => $body,
            NcArray::U8($arr) => $body,
            NcArray::U16($arr) => $body,
            NcArray::U32($arr) => $body,
            NcArray::U64($arr) => $body,
            NcArray::F32($arr) => $body,
            NcArray::F64($arr) => $body,
            NcArray::Char($arr) => $body,
        }
    };
}

impl NcArray {
    pub fn dtype(&self) -> DataType {
        match self {
            NcArray::I8(_) => DataType::I8,
            NcArray::I16(_) => DataType::I16,
            NcArray::I32(_) => DataType::I32,
            NcArray::I64(_) => DataType::I64,
            NcArray::U8(_) => DataType::U8,
            NcArray::U16(_) => DataType::U16,
            NcArray::U32(_) => DataType::U32,
            NcArray::U64(_) => DataType::U64,
            NcArray::F32(_) => DataType::F32,
            NcArray::F64(_) => DataType::F64,
            NcArray::Char(_) => DataType::Char,
        }
    }

    pub fn shape(&self) -> &[usize] {
        map_numeric!(self, arr => arr.shape())
    }

    pub fn len(&self) -> usize {
        map_numeric!(self, arr => arr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty scalar character array, used for container variables such as
    /// grid mappings that only carry attributes.
    pub fn scalar_char() -> Self {
        Self::Char(ArrayD::zeros(IxDyn(&[])))
    }

    /// Convert every element to `f64`. Values that cannot be represented
    /// (which should not happen for the supported types) become NaN.
    pub fn to_f64(&self) -> ArrayD<f64> {
        map_numeric!(self, arr => arr.mapv(|v| v.to_f64().unwrap_or(f64::NAN)))
    }

    /// Build an array of type `dtype` from floating point values.
    ///
    /// Integer targets are rounded to the nearest integer. Integer types have
    /// no NaN, so NaN or out-of-range values become the netCDF default fill
    /// value of the type (e.g. -32767 for i16), which readers treat as missing
    /// when a variable has no `_FillValue`.
    pub fn from_f64(dtype: DataType, values: &ArrayD<f64>) -> Self {
        fn cast<T: NumCast + Copy>(values: &ArrayD<f64>, fill: T) -> ArrayD<T> {
            let mut n_filled = 0usize;
            let arr = values.mapv(|v| match T::from(v.round()) {
                Some(x) if v.is_finite() => x,
                _ => {
                    n_filled += 1;
                    fill
                }
            });
            if n_filled > 0 {
                log::warn!(
                    "{n_filled} value(s) could not be stored as integers and were set to the default fill value"
                );
            }
            arr
        }

        match dtype {
            DataType::I8 => Self::I8(cast(values, NC_FILL_BYTE)),
            DataType::I16 => Self::I16(cast(values, NC_FILL_SHORT)),
            DataType::I32 => Self::I32(cast(values, NC_FILL_INT)),
            DataType::I64 => Self::I64(cast(values, NC_FILL_INT64)),
            DataType::U8 => Self::U8(cast(values, NC_FILL_UBYTE)),
            DataType::U16 => Self::U16(cast(values, NC_FILL_USHORT)),
            DataType::U32 => Self::U32(cast(values, NC_FILL_UINT)),
            DataType::U64 => Self::U64(cast(values, NC_FILL_UINT64)),
            DataType::F32 => Self::F32(values.mapv(|v| v as f32)),
            DataType::F64 => Self::F64(values.clone()),
            DataType::Char => Self::Char(cast(values, 0u8)),
        }
    }
}

impl From<ArrayD<f64>> for NcArray {
    fn from(value: ArrayD<f64>) -> Self {
        Self::F64(value)
    }
}

impl From<ArrayD<f32>> for NcArray {
    fn from(value: ArrayD<f32>) -> Self {
        Self::F32(value)
    }
}

impl From<ArrayD<i16>> for NcArray {
    fn from(value: ArrayD<i16>) -> Self {
        Self::I16(value)
    }
}

impl From<ArrayD<i32>> for NcArray {
    fn from(value: ArrayD<i32>) -> Self {
        Self::I32(value)
    }
}

impl From<ArrayD<u8>> for NcArray {
    fn from(value: ArrayD<u8>) -> Self {
        Self::U8(value)
    }
}
