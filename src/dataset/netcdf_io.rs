//! Reading and writing [`Dataset`]s as netCDF-4 files.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use netcdf::{
    types::{FloatType, IntType, NcVariableType},
    AttributeValue, Extents,
};

use super::{AttrValue, Dataset, DatasetError, DatasetIo, Group, Variable};
use crate::nc_utils::NcArray;

/// A [`DatasetIo`] backed by netCDF files on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetcdfIo;

impl DatasetIo for NetcdfIo {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read(&self, path: &Path) -> error_stack::Result<Dataset, DatasetError> {
        let err = || DatasetError::CouldNotOpen(path.display().to_string());
        let file = netcdf::open(path).change_context_lazy(err)?;
        let nc_root = file
            .root()
            .ok_or_else(err)
            .attach_printable("file has no root group")?;
        let mut ds = Dataset::new();
        read_group(&nc_root, ds.root_mut()).change_context_lazy(err)?;
        Ok(ds)
    }

    fn write(&self, path: &Path, dataset: &Dataset) -> error_stack::Result<(), DatasetError> {
        let err = || DatasetError::CouldNotWrite(path.display().to_string());

        // Write to a temporary file first so that a failed write never leaves
        // a partial file at the final path.
        let tmp_path = tmp_path_for(path);
        {
            let mut file = netcdf::create(&tmp_path).change_context_lazy(err)?;
            let mut nc_root = file
                .root_mut()
                .ok_or_else(err)
                .attach_printable("new file has no root group")?;
            write_group(&mut nc_root, dataset.root()).change_context_lazy(err)?;
        }

        std::fs::rename(&tmp_path, path)
            .change_context_lazy(err)
            .attach_printable_lazy(|| {
                format!("could not move temporary file {}", tmp_path.display())
            })?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> error_stack::Result<(), DatasetError> {
        if path.exists() {
            std::fs::remove_file(path)
                .change_context_lazy(|| DatasetError::CouldNotWrite(path.display().to_string()))?;
        }
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_group(nc: &netcdf::Group, group: &mut Group) -> error_stack::Result<(), DatasetError> {
    for att in nc.attributes() {
        let value = att
            .value()
            .change_context_lazy(|| DatasetError::Unsupported(att.name().to_string()))?;
        if let Some(value) = from_nc_attr(value) {
            group.set_attribute(att.name(), value);
        } else {
            log::debug!("Skipping group attribute '{}' with an unsupported type", att.name());
        }
    }

    for dim in nc.dimensions() {
        group.add_dimension(&dim.name(), dim.len());
    }

    for nc_var in nc.variables() {
        let varname = nc_var.name();
        let Some(data) = read_data(&nc_var)? else {
            log::debug!("Skipping variable '{varname}' with an unsupported type");
            continue;
        };
        let dims: Vec<String> = nc_var.dimensions().iter().map(|d| d.name()).collect();
        let mut var = Variable::new(&varname, &dims, data);
        for att in nc_var.attributes() {
            let value = att.value().change_context_lazy(|| {
                DatasetError::Unsupported(format!("{varname}:{}", att.name()))
            })?;
            if let Some(value) = from_nc_attr(value) {
                var.set_attribute(att.name(), value);
            }
        }
        group.insert_variable(var);
    }

    for nc_sub in nc.groups() {
        let mut sub = Group::new(nc_sub.name());
        read_group(&nc_sub, &mut sub)?;
        group.insert_group(sub);
    }

    Ok(())
}

fn read_data(var: &netcdf::Variable) -> error_stack::Result<Option<NcArray>, DatasetError> {
    let err = || DatasetError::CouldNotOpen(format!("variable '{}'", var.name()));
    let arr = match var.vartype() {
        NcVariableType::Int(IntType::I8) => NcArray::I8(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Int(IntType::I16) => NcArray::I16(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Int(IntType::I32) => NcArray::I32(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Int(IntType::I64) => NcArray::I64(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Int(IntType::U8) => NcArray::U8(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Int(IntType::U16) => NcArray::U16(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Int(IntType::U32) => NcArray::U32(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Int(IntType::U64) => NcArray::U64(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Float(FloatType::F32) => NcArray::F32(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Float(FloatType::F64) => NcArray::F64(var.get(Extents::All).change_context_lazy(err)?),
        NcVariableType::Char => {
            // Character variables are mostly attribute containers (grid
            // mappings), so only their shape matters.
            let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
            match var.get::<u8, _>(Extents::All) {
                Ok(values) => NcArray::Char(values),
                Err(_) => NcArray::Char(ndarray::ArrayD::zeros(ndarray::IxDyn(&shape))),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(arr))
}

fn write_group(nc: &mut netcdf::GroupMut, group: &Group) -> error_stack::Result<(), DatasetError> {
    for (name, value) in group.attributes() {
        nc.add_attribute(name, to_nc_attr(value))
            .change_context_lazy(|| DatasetError::CouldNotWrite(format!("attribute '{name}'")))?;
    }

    for (name, &len) in group.dimensions() {
        nc.add_dimension(name, len)
            .change_context_lazy(|| DatasetError::CouldNotWrite(format!("dimension '{name}'")))?;
    }

    for var in group.variables().values() {
        write_variable(nc, var)?;
    }

    for (name, sub) in group.groups() {
        let mut nc_sub = nc
            .add_group(name)
            .change_context_lazy(|| DatasetError::CouldNotWrite(format!("group '{name}'")))?;
        write_group(&mut nc_sub, sub)?;
    }

    Ok(())
}

macro_rules! put_var {
    ($nc:expr, $var:expr, $t:ty, $arr:expr) => {{
        let varname = $var.name();
        let err = || DatasetError::CouldNotWrite(format!("variable '{varname}'"));
        let dims: Vec<&str> = $var.dimensions().iter().map(|d| d.as_str()).collect();
        let mut nc_var = $nc.add_variable::<$t>(varname, &dims).change_context_lazy(err)?;
        if let Some(level) = $var.deflate_level() {
            if !dims.is_empty() {
                nc_var.set_compression(level, false).change_context_lazy(err)?;
            }
        }
        // Attributes (in particular `_FillValue`) must be defined before the data is written.
        for (att_name, value) in $var.attributes() {
            nc_var
                .put_attribute(att_name, to_nc_attr(value))
                .change_context_lazy(err)
                .attach_printable_lazy(|| format!("attribute '{att_name}'"))?;
        }
        nc_var.put($arr.view(), Extents::All).change_context_lazy(err)?;
    }};
}

fn write_variable(nc: &mut netcdf::GroupMut, var: &Variable) -> error_stack::Result<(), DatasetError> {
    match var.data() {
        NcArray::I8(arr) => put_var!(nc, var, i8, arr),
        NcArray::I16(arr) => put_var!(nc, var, i16, arr),
        NcArray::I32(arr) => put_var!(nc, var, i32, arr),
        NcArray::I64(arr) => put_var!(nc, var, i64, arr),
        NcArray::U8(arr) => put_var!(nc, var, u8, arr),
        NcArray::U16(arr) => put_var!(nc, var, u16, arr),
        NcArray::U32(arr) => put_var!(nc, var, u32, arr),
        NcArray::U64(arr) => put_var!(nc, var, u64, arr),
        NcArray::F32(arr) => put_var!(nc, var, f32, arr),
        NcArray::F64(arr) => put_var!(nc, var, f64, arr),
        NcArray::Char(arr) => put_var!(nc, var, u8, arr),
    }
    Ok(())
}

fn from_nc_attr(value: AttributeValue) -> Option<AttrValue> {
    let v = match value {
        AttributeValue::Str(s) => AttrValue::Str(s),
        AttributeValue::Strs(s) => AttrValue::Strs(s),
        AttributeValue::Schar(x) => AttrValue::I8(vec![x]),
        AttributeValue::Schars(x) => AttrValue::I8(x),
        AttributeValue::Uchar(x) => AttrValue::U8(vec![x]),
        AttributeValue::Uchars(x) => AttrValue::U8(x),
        AttributeValue::Short(x) => AttrValue::I16(vec![x]),
        AttributeValue::Shorts(x) => AttrValue::I16(x),
        AttributeValue::Ushort(x) => AttrValue::U16(vec![x]),
        AttributeValue::Ushorts(x) => AttrValue::U16(x),
        AttributeValue::Int(x) => AttrValue::I32(vec![x]),
        AttributeValue::Ints(x) => AttrValue::I32(x),
        AttributeValue::Uint(x) => AttrValue::U32(vec![x]),
        AttributeValue::Uints(x) => AttrValue::U32(x),
        AttributeValue::Longlong(x) => AttrValue::I64(vec![x]),
        AttributeValue::Longlongs(x) => AttrValue::I64(x),
        AttributeValue::Ulonglong(x) => AttrValue::U64(vec![x]),
        AttributeValue::Ulonglongs(x) => AttrValue::U64(x),
        AttributeValue::Float(x) => AttrValue::F32(vec![x]),
        AttributeValue::Floats(x) => AttrValue::F32(x),
        AttributeValue::Double(x) => AttrValue::F64(vec![x]),
        AttributeValue::Doubles(x) => AttrValue::F64(x),
        #[allow(unreachable_patterns)]
        _ => return None,
    };
    Some(v)
}

/// Convert to the netCDF attribute type, writing one-element vectors as scalars.
fn to_nc_attr(value: &AttrValue) -> AttributeValue {
    macro_rules! scalar_or_vec {
        ($v:expr, $one:ident, $many:ident) => {
            if $v.len() == 1 {
                AttributeValue::$one($v[0])
            } else {
                AttributeValue::$many($v.clone())
            }
        };
    }

    match value {
        AttrValue::Str(s) => AttributeValue::Str(s.clone()),
        AttrValue::Strs(s) => AttributeValue::Strs(s.clone()),
        AttrValue::I8(v) => scalar_or_vec!(v, Schar, Schars),
        AttrValue::U8(v) => scalar_or_vec!(v, Uchar, Uchars),
        AttrValue::I16(v) => scalar_or_vec!(v, Short, Shorts),
        AttrValue::U16(v) => scalar_or_vec!(v, Ushort, Ushorts),
        AttrValue::I32(v) => scalar_or_vec!(v, Int, Ints),
        AttrValue::U32(v) => scalar_or_vec!(v, Uint, Uints),
        AttrValue::I64(v) => scalar_or_vec!(v, Longlong, Longlongs),
        AttrValue::U64(v) => scalar_or_vec!(v, Ulonglong, Ulonglongs),
        AttrValue::F32(v) => scalar_or_vec!(v, Float, Floats),
        AttrValue::F64(v) => scalar_or_vec!(v, Double, Doubles),
    }
}
