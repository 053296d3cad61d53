//! An in-memory model of a self-describing, hierarchical array file.
//!
//! The reprojection code never talks to a file format directly. Instead, it
//! builds and inspects [`Dataset`] values (groups, dimensions, variables and
//! attributes) and hands them to a [`DatasetIo`] implementation to be read
//! from or persisted to a path. [`MemoryIo`] keeps everything in memory and
//! is what the tests use; with the `netcdf` feature, [`NetcdfIo`] reads and
//! writes netCDF-4 files.
//!
//! Variables and groups are addressed by absolute, slash-separated paths,
//! e.g. `/gt1r/land_segments/dem_h`. A leading slash is optional.
use indexmap::IndexMap;
use ndarray::ArrayD;

use crate::nc_utils::{DataType, NcArray};

mod io;
#[cfg(feature = "netcdf")]
pub mod netcdf_io;

pub use io::{DatasetIo, MemoryIo};
#[cfg(feature = "netcdf")]
pub use netcdf_io::NetcdfIo;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Could not open {0}")]
    CouldNotOpen(String),

    #[error("Could not write {0}")]
    CouldNotWrite(String),

    #[error("Variable '{0}' already exists")]
    DuplicateVariable(String),

    #[error("Dimension '{dimname}' needed by variable '{varname}' does not exist")]
    MissingDimension { dimname: String, varname: String },

    #[error("Dimension '{dimname}' has length {dim_len} but variable '{varname}' expects length {var_len}")]
    DimLenMismatch {
        dimname: String,
        varname: String,
        dim_len: usize,
        var_len: usize,
    },

    #[error("Variable '{varname}' has {ndims} dimensions but its data has {ndata} axes")]
    RankMismatch {
        varname: String,
        ndims: usize,
        ndata: usize,
    },

    #[error("Unsupported data type or attribute in {0}")]
    Unsupported(String),
}

/// Attribute values. Numeric attributes are always stored as vectors; a
/// scalar attribute is a vector of length one.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Strs(Vec<String>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl AttrValue {
    /// The first numeric element, as `f64`. Strings give `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Str(_) | AttrValue::Strs(_) => None,
            AttrValue::I8(v) => v.first().map(|&x| x as f64),
            AttrValue::U8(v) => v.first().map(|&x| x as f64),
            AttrValue::I16(v) => v.first().map(|&x| x as f64),
            AttrValue::U16(v) => v.first().map(|&x| x as f64),
            AttrValue::I32(v) => v.first().map(|&x| x as f64),
            AttrValue::U32(v) => v.first().map(|&x| x as f64),
            AttrValue::I64(v) => v.first().map(|&x| x as f64),
            AttrValue::U64(v) => v.first().map(|&x| x as f64),
            AttrValue::F32(v) => v.first().map(|&x| x as f64),
            AttrValue::F64(v) => v.first().copied(),
        }
    }

    /// The attribute as text. A list of strings is joined with newlines,
    /// which is how multi-entry `history` attributes are usually read.
    pub fn as_string(&self) -> Option<String> {
        match self {
            AttrValue::Str(s) => Some(s.clone()),
            AttrValue::Strs(v) => Some(v.join("\n")),
            _ => None,
        }
    }

    /// Create a scalar numeric attribute of the given element type.
    pub fn scalar_of_type(dtype: DataType, value: f64) -> Self {
        match dtype {
            DataType::I8 => AttrValue::I8(vec![value as i8]),
            DataType::U8 | DataType::Char => AttrValue::U8(vec![value as u8]),
            DataType::I16 => AttrValue::I16(vec![value as i16]),
            DataType::U16 => AttrValue::U16(vec![value as u16]),
            DataType::I32 => AttrValue::I32(vec![value as i32]),
            DataType::U32 => AttrValue::U32(vec![value as u32]),
            DataType::I64 => AttrValue::I64(vec![value as i64]),
            DataType::U64 => AttrValue::U64(vec![value as u64]),
            DataType::F32 => AttrValue::F32(vec![value as f32]),
            DataType::F64 => AttrValue::F64(vec![value]),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::F64(vec![value])
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(value: Vec<f64>) -> Self {
        Self::F64(value)
    }
}

impl From<f32> for AttrValue {
    fn from(value: f32) -> Self {
        Self::F32(vec![value])
    }
}

impl From<i16> for AttrValue {
    fn from(value: i16) -> Self {
        Self::I16(vec![value])
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        Self::I32(vec![value])
    }
}

/// CF packing parameters (`scale_factor` and `add_offset`).
///
/// Physical values are `packed * scale_factor + add_offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleOffset {
    pub scale_factor: f64,
    pub add_offset: f64,
}

impl ScaleOffset {
    pub fn unpack(&self, packed: f64) -> f64 {
        packed * self.scale_factor + self.add_offset
    }

    pub fn pack(&self, physical: f64) -> f64 {
        (physical - self.add_offset) / self.scale_factor
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    dimensions: Vec<String>,
    attributes: IndexMap<String, AttrValue>,
    data: NcArray,
    deflate_level: Option<i32>,
}

impl Variable {
    pub fn new<S: ToString, D: ToString>(name: S, dimensions: &[D], data: NcArray) -> Self {
        Self {
            name: name.to_string(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            attributes: IndexMap::new(),
            data,
            deflate_level: None,
        }
    }

    /// Builder-style helper to add an attribute.
    pub fn with_attribute<V: Into<AttrValue>>(mut self, name: &str, value: V) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_deflate_level(mut self, level: i32) -> Self {
        self.deflate_level = Some(level);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn data(&self) -> &NcArray {
        &self.data
    }

    pub fn deflate_level(&self) -> Option<i32> {
        self.deflate_level
    }

    pub fn attributes(&self) -> &IndexMap<String, AttrValue> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn attribute_string(&self, name: &str) -> Option<String> {
        self.attributes.get(name).and_then(|a| a.as_string())
    }

    pub fn set_attribute<V: Into<AttrValue>>(&mut self, name: &str, value: V) {
        self.attributes.insert(name.to_string(), value.into());
    }

    pub fn set_attributes(&mut self, attributes: IndexMap<String, AttrValue>) {
        self.attributes = attributes;
    }

    /// The numeric `_FillValue`, if there is one.
    pub fn fill_value(&self) -> Option<f64> {
        self.attributes.get("_FillValue").and_then(|v| v.as_f64())
    }

    /// The packing parameters, if either `scale_factor` or `add_offset` is
    /// present. A missing one defaults to 1 or 0 respectively.
    pub fn scale_and_offset(&self) -> Option<ScaleOffset> {
        let scale_factor = self.attributes.get("scale_factor").and_then(|a| a.as_f64());
        let add_offset = self.attributes.get("add_offset").and_then(|a| a.as_f64());
        if scale_factor.is_none() && add_offset.is_none() {
            return None;
        }
        Some(ScaleOffset {
            scale_factor: scale_factor.unwrap_or(1.0),
            add_offset: add_offset.unwrap_or(0.0),
        })
    }

    /// Read the (packed) values as `f64`.
    pub fn values_f64(&self) -> ArrayD<f64> {
        self.data.to_f64()
    }

    /// Read physical values: fill values become NaN and, if the variable is
    /// packed, `scale_factor` and `add_offset` are applied.
    pub fn unpacked_values(&self) -> ArrayD<f64> {
        let fill = self.fill_value();
        let scaling = self.scale_and_offset();
        self.data.to_f64().mapv(|v| {
            if fill.is_some_and(|f| v == f) {
                f64::NAN
            } else if let Some(so) = scaling {
                so.unpack(v)
            } else {
                v
            }
        })
    }

}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Group {
    name: String,
    attributes: IndexMap<String, AttrValue>,
    dimensions: IndexMap<String, usize>,
    variables: IndexMap<String, Variable>,
    groups: IndexMap<String, Group>,
}

impl Group {
    pub fn new<S: ToString>(name: S) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &IndexMap<String, AttrValue> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn set_attribute<V: Into<AttrValue>>(&mut self, name: &str, value: V) {
        self.attributes.insert(name.to_string(), value.into());
    }

    pub fn dimensions(&self) -> &IndexMap<String, usize> {
        &self.dimensions
    }

    pub fn variables(&self) -> &IndexMap<String, Variable> {
        &self.variables
    }

    pub fn groups(&self) -> &IndexMap<String, Group> {
        &self.groups
    }

    pub fn add_dimension(&mut self, name: &str, len: usize) {
        self.dimensions.insert(name.to_string(), len);
    }

    pub(crate) fn insert_variable(&mut self, variable: Variable) {
        self.variables.insert(variable.name.clone(), variable);
    }

    pub(crate) fn insert_group(&mut self, group: Group) {
        self.groups.insert(group.name.clone(), group);
    }

    fn subgroup_or_create(&mut self, name: &str) -> &mut Group {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
    }
}

/// Split an absolute variable path into its group components and base name.
pub fn split_path(path: &str) -> (Vec<&str>, &str) {
    let mut pieces: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let name = pieces.pop().unwrap_or("");
    (pieces, name)
}

/// Join group components into an absolute group path (`""` for the root).
pub fn group_path(groups: &[&str]) -> String {
    groups.iter().map(|g| format!("/{g}")).collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    root: Group,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    pub fn attributes(&self) -> &IndexMap<String, AttrValue> {
        &self.root.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.root.attributes.get(name)
    }

    pub fn set_attribute<V: Into<AttrValue>>(&mut self, name: &str, value: V) {
        self.root.set_attribute(name, value);
    }

    pub fn set_attributes(&mut self, attributes: IndexMap<String, AttrValue>) {
        self.root.attributes = attributes;
    }

    /// Add a dimension to the root group.
    pub fn add_dimension(&mut self, name: &str, len: usize) {
        self.root.add_dimension(name, len);
    }

    /// Add a dimension to the group at `groups`, creating any missing groups.
    pub fn add_group_dimension(&mut self, groups: &[&str], name: &str, len: usize) {
        self.group_mut_or_create(groups).add_dimension(name, len);
    }

    /// Find where the dimension `dimname` seen from the group at `groups` is
    /// defined: the number of leading `groups` components naming the
    /// defining group, and the dimension's length.
    pub fn dimension_owner(&self, groups: &[&str], dimname: &str) -> Option<(usize, usize)> {
        (0..=groups.len()).rev().find_map(|depth| {
            let group = self.group(&group_path(&groups[..depth]))?;
            group.dimensions.get(dimname).map(|&len| (depth, len))
        })
    }

    pub fn has_dimension(&self, name: &str) -> bool {
        self.root.dimensions.contains_key(name)
    }

    pub fn dimension_len(&self, name: &str) -> Option<usize> {
        self.root.dimensions.get(name).copied()
    }

    pub fn group(&self, path: &str) -> Option<&Group> {
        let mut group = &self.root;
        for piece in path.split('/').filter(|p| !p.is_empty()) {
            group = group.groups.get(piece)?;
        }
        Some(group)
    }

    fn group_mut_or_create(&mut self, groups: &[&str]) -> &mut Group {
        let mut group = &mut self.root;
        for piece in groups {
            group = group.subgroup_or_create(piece);
        }
        group
    }

    /// Look up a variable by path. Nested groups are searched, unlike a
    /// plain lookup in one group's variables.
    pub fn variable(&self, path: &str) -> Option<&Variable> {
        let (groups, name) = split_path(path);
        let mut group = &self.root;
        for piece in groups {
            group = group.groups.get(piece)?;
        }
        group.variables.get(name)
    }

    pub fn contains_variable(&self, path: &str) -> bool {
        self.variable(path).is_some()
    }

    /// Find the length of `dimname` as seen from the group at `groups`:
    /// the group itself first, then each of its ancestors.
    pub fn visible_dimension_len(&self, groups: &[&str], dimname: &str) -> Option<usize> {
        let mut chain = vec![&self.root];
        let mut group = &self.root;
        for piece in groups {
            group = group.groups.get(*piece)?;
            chain.push(group);
        }
        chain
            .iter()
            .rev()
            .find_map(|g| g.dimensions.get(dimname).copied())
    }

    /// Add a variable at `path`, creating any intermediate groups.
    ///
    /// Every dimension of the variable must already be visible from its
    /// group, with a length matching the data.
    pub fn add_variable(&mut self, path: &str, variable: Variable) -> Result<(), DatasetError> {
        if self.contains_variable(path) {
            return Err(DatasetError::DuplicateVariable(path.to_string()));
        }

        let (groups, name) = split_path(path);
        let shape = variable.shape().to_vec();
        if shape.len() != variable.dimensions.len() {
            return Err(DatasetError::RankMismatch {
                varname: path.to_string(),
                ndims: variable.dimensions.len(),
                ndata: shape.len(),
            });
        }

        for (dimname, &var_len) in variable.dimensions.iter().zip(shape.iter()) {
            match self.visible_dimension_len(&groups, dimname) {
                None => {
                    return Err(DatasetError::MissingDimension {
                        dimname: dimname.clone(),
                        varname: path.to_string(),
                    })
                }
                Some(dim_len) if dim_len != var_len => {
                    return Err(DatasetError::DimLenMismatch {
                        dimname: dimname.clone(),
                        varname: path.to_string(),
                        dim_len,
                        var_len,
                    })
                }
                Some(_) => (),
            }
        }

        let mut variable = variable;
        variable.name = name.to_string();
        self.group_mut_or_create(&groups).insert_variable(variable);
        Ok(())
    }

    /// Absolute paths of every variable in the dataset, depth first.
    pub fn variable_paths(&self) -> Vec<String> {
        fn collect(group: &Group, prefix: &str, out: &mut Vec<String>) {
            for name in group.variables.keys() {
                out.push(format!("{prefix}/{name}"));
            }
            for (name, sub) in group.groups.iter() {
                collect(sub, &format!("{prefix}/{name}"), out);
            }
        }

        let mut paths = vec![];
        collect(&self.root, "", &mut paths);
        paths
    }
}
