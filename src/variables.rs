//! Classification of the variables in a source file.
//!
//! Science variables are those with georeferencing metadata (`coordinates`
//! or `grid_mapping`) that are not themselves dimension, coordinate or
//! ancillary variables. Everything else that is not a dimension, coordinate
//! or ancillary variable is metadata, and is copied to the output unchanged.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    path::Path,
    sync::OnceLock,
};

use error_stack::ResultExt;

use crate::{
    dataset::{split_path, Dataset, DatasetIo, Group, Variable},
    error::{ReprojectError, VariableError},
};

static REFERENCE_SPLIT_REGEX: OnceLock<regex::Regex> = OnceLock::new();

/// The sorted, deduplicated absolute paths of the coordinate variables
/// georeferencing a science variable. Used as the key of the
/// reprojection cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordinateSet(Vec<String>);

impl CoordinateSet {
    pub fn new<S: ToString>(references: &[S]) -> Self {
        let mut refs: Vec<String> = references.iter().map(|r| r.to_string()).collect();
        refs.sort();
        refs.dedup();
        Self(refs)
    }

    pub fn references(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// References whose base name contains `substring`, e.g. "lat".
    /// Only the base name is checked, as group names may contain either
    /// substring as part of another word.
    pub fn matching(&self, substring: &str) -> impl Iterator<Item = &str> {
        let substring = substring.to_string();
        self.0
            .iter()
            .filter(move |r| split_path(r).1.contains(&substring))
            .map(|r| r.as_str())
    }
}

impl Display for CoordinateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}

/// What the rest of the pipeline needs to know about one source variable.
#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub path: String,
    pub dimensions: Vec<String>,
    pub shape: Vec<usize>,
    pub coordinates: CoordinateSet,
}

/// The variables of a source file, classified as science or metadata.
#[derive(Debug)]
pub struct VarInfo {
    dataset: Dataset,
    variables: BTreeMap<String, VariableInfo>,
    science: BTreeSet<String>,
    metadata: BTreeSet<String>,
}

impl VarInfo {
    /// Read and classify the variables in `path`. An unreadable file is fatal.
    pub fn from_file(io: &dyn DatasetIo, path: &Path) -> error_stack::Result<Self, ReprojectError> {
        let dataset = io
            .read(path)
            .change_context(ReprojectError::UnreadableSource)
            .attach_printable_lazy(|| format!("source file: {}", path.display()))?;
        Ok(Self::from_dataset(dataset))
    }

    pub fn from_dataset(dataset: Dataset) -> Self {
        let mut walker = Walker::default();
        walker.walk(&dataset, dataset.root(), &[]);

        let excluded: BTreeSet<&String> = walker
            .dimension_vars
            .iter()
            .chain(walker.coordinates.iter())
            .chain(walker.ancillary.iter())
            .collect();

        let science = walker
            .with_coordinates
            .iter()
            .filter(|v| !excluded.contains(v))
            .cloned()
            .collect();
        let metadata = walker
            .metadata
            .iter()
            .filter(|v| !excluded.contains(v))
            .cloned()
            .collect();

        Self {
            dataset,
            variables: walker.variables,
            science,
            metadata,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn science_variables(&self) -> &BTreeSet<String> {
        &self.science
    }

    pub fn metadata_variables(&self) -> &BTreeSet<String> {
        &self.metadata
    }

    pub fn variable(&self, path: &str) -> Option<&VariableInfo> {
        self.variables.get(path)
    }

    pub fn coordinate_set(&self, path: &str) -> Option<&CoordinateSet> {
        self.variables.get(path).map(|v| &v.coordinates)
    }

    pub fn has_dimension(&self, name: &str) -> bool {
        self.dataset.has_dimension(name)
    }
}

#[derive(Debug, Default)]
struct Walker {
    variables: BTreeMap<String, VariableInfo>,
    with_coordinates: BTreeSet<String>,
    metadata: BTreeSet<String>,
    dimension_vars: BTreeSet<String>,
    coordinates: BTreeSet<String>,
    ancillary: BTreeSet<String>,
}

impl Walker {
    fn walk(&mut self, dataset: &Dataset, group: &Group, groups: &[&str]) {
        let group_path = crate::dataset::group_path(groups);

        for (name, var) in group.variables() {
            let path = format!("{group_path}/{name}");

            if var.dimensions().len() == 1 && var.dimensions()[0] == *name {
                self.dimension_vars.insert(path.clone());
            }

            let coordinate_refs: Vec<String> = var
                .attribute_string("coordinates")
                .map(|c| {
                    split_references(&c)
                        .map(|r| qualify_reference(r, &group_path, group))
                        .collect()
                })
                .unwrap_or_default();
            self.coordinates.extend(coordinate_refs.iter().cloned());

            let grid_mapping = var.attribute_string("grid_mapping");
            if let Some(gm) = grid_mapping.as_deref() {
                let (mappings, gm_coords) = parse_grid_mapping(gm);
                self.ancillary
                    .extend(mappings.iter().map(|m| qualify_reference(m, &group_path, group)));
                self.coordinates
                    .extend(gm_coords.iter().map(|c| qualify_reference(c, &group_path, group)));
            }

            for attr in ["ancillary_variables", "bounds"] {
                if let Some(refs) = var.attribute_string(attr) {
                    self.ancillary.extend(
                        split_references(&refs).map(|r| qualify_reference(r, &group_path, group)),
                    );
                }
            }

            if !coordinate_refs.is_empty() || grid_mapping.is_some() {
                self.with_coordinates.insert(path.clone());
            } else {
                self.metadata.insert(path.clone());
            }

            let coordinates = if coordinate_refs.is_empty() {
                CoordinateSet::new(&dimension_coordinates(dataset, var, groups))
            } else {
                CoordinateSet::new(&coordinate_refs)
            };

            self.variables.insert(
                path.clone(),
                VariableInfo {
                    path,
                    dimensions: var.dimensions().to_vec(),
                    shape: var.shape().to_vec(),
                    coordinates,
                },
            );
        }

        for (name, subgroup) in group.groups() {
            let mut sub_groups = groups.to_vec();
            sub_groups.push(name.as_str());
            self.walk(dataset, subgroup, &sub_groups);
        }
    }
}

/// Split a list of variable references on whitespace and/or commas.
pub fn split_references(references: &str) -> impl Iterator<Item = &str> {
    let re = REFERENCE_SPLIT_REGEX.get_or_init(|| regex::Regex::new(r"[\s,]+").unwrap());
    re.split(references).filter(|r| !r.is_empty())
}

/// Parse a `grid_mapping` attribute, either the plain form (`"crs"`) or the
/// extended form (`"crs: x y other_crs: lat lon"`). Returns the grid
/// mapping variable names and any coordinate names in the extended form.
pub fn parse_grid_mapping(value: &str) -> (Vec<String>, Vec<String>) {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if !tokens.iter().any(|t| t.ends_with(':')) {
        return (tokens.iter().map(|t| t.to_string()).collect(), vec![]);
    }

    let mut mappings = vec![];
    let mut coords = vec![];
    for tok in tokens {
        if let Some(name) = tok.strip_suffix(':') {
            mappings.push(name.to_string());
        } else {
            coords.push(tok.to_string());
        }
    }
    (mappings, coords)
}

/// Take a reference to a variable, as stored in the metadata of a variable in
/// the group at `group_path`, and make it an absolute path:
///
/// - `/base_var` is already absolute,
/// - `../base_var` ascends one group per `../`,
/// - `./group_var` is in the referring variable's group,
/// - `group_var` is in the referring variable's group if it exists there,
///   otherwise it is assumed to be in the root group.
pub fn qualify_reference(raw_reference: &str, group_path: &str, group: &Group) -> String {
    if raw_reference.starts_with("../") {
        construct_absolute_path(raw_reference, group_path)
    } else if raw_reference.starts_with('/') {
        raw_reference.to_string()
    } else if let Some(rest) = raw_reference.strip_prefix("./") {
        format!("{group_path}/{rest}")
    } else if group.variables().contains_key(raw_reference) {
        construct_absolute_path(raw_reference, group_path)
    } else {
        construct_absolute_path(raw_reference, "")
    }
}

/// Combine a relative reference (e.g. `../latitude`) with the path of the
/// referring variable's group.
pub fn construct_absolute_path(reference: &str, group_path: &str) -> String {
    let mut pieces: Vec<&str> = group_path.split('/').collect();
    let mut reference = reference;
    while let Some(rest) = reference.strip_prefix("../") {
        reference = rest;
        pieces.pop();
    }
    pieces.push(reference);
    let joined = pieces.join("/");
    format!("/{}", joined.trim_start_matches('/'))
}

/// For variables without a `coordinates` attribute: the dimension variables
/// of its dimensions that look like latitude or longitude.
fn dimension_coordinates(dataset: &Dataset, var: &Variable, groups: &[&str]) -> Vec<String> {
    var.dimensions()
        .iter()
        .filter(|d| d.contains("lat") || d.contains("lon"))
        .filter_map(|d| {
            // The dimension variable lives in the closest enclosing group that has one.
            (0..=groups.len()).rev().find_map(|n| {
                let path = format!("{}/{d}", crate::dataset::group_path(&groups[..n]));
                dataset.contains_variable(&path).then_some(path)
            })
        })
        .collect()
}

/// Find the coordinate variable for `substring` ("lat" or "lon") in `coordinates`.
pub fn coordinate_matching_substring<'d>(
    dataset: &'d Dataset,
    coordinates: &CoordinateSet,
    substring: &str,
) -> Result<&'d Variable, VariableError> {
    coordinates
        .matching(substring)
        .find_map(|path| dataset.variable(path))
        .ok_or_else(|| VariableError::missing_coordinates(coordinates.references()))
}

/// Whether a 2-D coordinate has fewer rows than columns, in which case it
/// (and the data it georeferences) is transposed before resampling.
pub fn coordinate_requires_transpose(shape: &[usize]) -> bool {
    shape.len() == 2 && shape[0] < shape[1]
}

/// The track dimensions of a 2-D coordinate variable, longest first.
pub fn ordered_track_dims(coordinate: &Variable) -> Result<Vec<String>, VariableError> {
    if coordinate.dimensions().len() != 2 {
        return Err(VariableError::UnsupportedCoordinateShape(
            coordinate.shape().to_vec(),
        ));
    }
    let mut dims = coordinate.dimensions().to_vec();
    if coordinate_requires_transpose(coordinate.shape()) {
        dims.reverse();
    }
    Ok(dims)
}

/// A variable's dimensions, reordered so the track dimensions are last (in
/// the order given by [`ordered_track_dims`]), and the non-track dimensions
/// with their lengths, in their original relative order.
pub fn preferred_ordered_dimensions(
    variable: &Variable,
    coordinate: &Variable,
) -> Result<(Vec<String>, Vec<(String, usize)>), VariableError> {
    let track_dims = ordered_track_dims(coordinate)?;
    let current = variable.dimensions();
    if !track_dims.iter().all(|d| current.contains(d)) {
        return Err(VariableError::InvalidDimensions {
            varname: variable.name().to_string(),
            dims: current.to_vec(),
        });
    }

    let non_track: Vec<(String, usize)> = current
        .iter()
        .zip(variable.shape().iter())
        .filter(|(d, _)| !track_dims.contains(d))
        .map(|(d, &n)| (d.clone(), n))
        .collect();

    let ordered = non_track
        .iter()
        .map(|(d, _)| d.clone())
        .chain(track_dims)
        .collect();
    Ok((ordered, non_track))
}

/// The permutation of axes that takes `old_dims` to `new_dims`.
pub fn axes_permutation<S: AsRef<str>>(old_dims: &[S], new_dims: &[S]) -> Vec<usize> {
    let mut used = vec![false; old_dims.len()];
    let mut axes = vec![];
    for new_dim in new_dims {
        if let Some(i) = old_dims
            .iter()
            .enumerate()
            .position(|(i, old)| !used[i] && old.as_ref() == new_dim.as_ref())
        {
            used[i] = true;
            axes.push(i);
        }
    }
    axes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{nc_utils::NcArray, test_utils::four_band_swath};
    use ndarray::{ArrayD, IxDyn};
    use rstest::rstest;

    fn zeros(shape: &[usize]) -> NcArray {
        NcArray::F64(ArrayD::zeros(IxDyn(shape)))
    }

    fn nested_dataset() -> Dataset {
        let mut ds = Dataset::new();
        ds.add_dimension("x", 2);
        ds.add_variable("/base_var", Variable::new("base_var", &["x"], zeros(&[2])))
            .unwrap();
        ds.add_variable("/group_one/group_var", Variable::new("group_var", &["x"], zeros(&[2])))
            .unwrap();
        ds.add_variable("/group_one/var_one", Variable::new("var_one", &["x"], zeros(&[2])))
            .unwrap();
        ds
    }

    #[rstest]
    #[case("/base_var", "/base_var")]
    #[case("../base_var", "/base_var")]
    #[case("./group_var", "/group_one/group_var")]
    #[case("group_var", "/group_one/group_var")]
    #[case("base_var", "/base_var")]
    fn test_qualify_reference(#[case] raw: &str, #[case] expected: &str) {
        let ds = nested_dataset();
        let group = ds.group("/group_one").unwrap();
        assert_eq!(qualify_reference(raw, "/group_one", group), expected);
    }

    #[test]
    fn test_construct_absolute_path() {
        assert_eq!(construct_absolute_path("../../lat", "/a/b/c"), "/a/lat");
        assert_eq!(construct_absolute_path("lat", ""), "/lat");
    }

    #[test]
    fn test_split_references() {
        let refs: Vec<&str> = split_references("lat lon, time,alt").collect();
        assert_eq!(refs, vec!["lat", "lon", "time", "alt"]);
    }

    #[rstest]
    #[case("crs", vec!["crs"], vec![])]
    #[case("crs: x y", vec!["crs"], vec!["x", "y"])]
    #[case("crs_a: lat lon crs_b: x y", vec!["crs_a", "crs_b"], vec!["lat", "lon", "x", "y"])]
    fn test_parse_grid_mapping(#[case] value: &str, #[case] mappings: Vec<&str>, #[case] coords: Vec<&str>) {
        let (m, c) = parse_grid_mapping(value);
        assert_eq!(m, mappings);
        assert_eq!(c, coords);
    }

    #[test]
    fn test_coordinate_set_is_sorted() {
        let a = CoordinateSet::new(&["/lon", "/lat"]);
        let b = CoordinateSet::new(&["/lat", "/lon", "/lat"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "/lat, /lon");
        assert_eq!(a.matching("lat").collect::<Vec<_>>(), vec!["/lat"]);
    }

    #[test]
    fn test_science_and_metadata_variables() {
        let mut ds = four_band_swath();
        ds.add_dimension("nv", 2);
        ds.add_variable(
            "/metadata_var",
            Variable::new("metadata_var", &["nv"], zeros(&[2])),
        )
        .unwrap();

        let info = VarInfo::from_dataset(ds);
        let science: Vec<&str> = info.science_variables().iter().map(|s| s.as_str()).collect();
        assert_eq!(science, vec!["/alpha_var", "/blue_var", "/green_var", "/red_var"]);
        let metadata: Vec<&str> = info.metadata_variables().iter().map(|s| s.as_str()).collect();
        assert_eq!(metadata, vec!["/metadata_var"]);
        assert_eq!(
            info.coordinate_set("/red_var"),
            Some(&CoordinateSet::new(&["/lat", "/lon"]))
        );
    }

    #[test]
    fn test_grid_mapping_is_ancillary() {
        let mut ds = Dataset::new();
        ds.add_dimension("y", 2);
        ds.add_dimension("x", 3);
        ds.add_variable("/crs", Variable::new("crs", &[] as &[&str], NcArray::scalar_char()))
            .unwrap();
        ds.add_variable(
            "/science",
            Variable::new("science", &["y", "x"], zeros(&[2, 3])).with_attribute("grid_mapping", "crs"),
        )
        .unwrap();

        let info = VarInfo::from_dataset(ds);
        assert!(info.science_variables().contains("/science"));
        assert!(info.metadata_variables().is_empty());
    }

    #[test]
    fn test_dimension_coordinate_fallback() {
        let mut ds = Dataset::new();
        ds.add_dimension("lat", 2);
        ds.add_dimension("lon", 3);
        ds.add_variable("/lat", Variable::new("lat", &["lat"], zeros(&[2]))).unwrap();
        ds.add_variable("/lon", Variable::new("lon", &["lon"], zeros(&[3]))).unwrap();
        ds.add_variable(
            "/grid/science",
            Variable::new("science", &["lat", "lon"], zeros(&[2, 3])).with_attribute("grid_mapping", "crs"),
        )
        .unwrap();

        let info = VarInfo::from_dataset(ds);
        assert_eq!(
            info.coordinate_set("/grid/science"),
            Some(&CoordinateSet::new(&["/lat", "/lon"]))
        );
        // Dimension variables are neither science nor metadata.
        assert!(!info.metadata_variables().contains("/lat"));
    }

    #[test]
    fn test_preferred_ordered_dimensions() {
        let coord = Variable::new("lat", &["across", "along"], zeros(&[3, 5]));
        let var = Variable::new("v", &["across", "time", "along"], zeros(&[3, 2, 5]));
        let (ordered, non_track) = preferred_ordered_dimensions(&var, &coord).unwrap();
        assert_eq!(ordered, vec!["time", "along", "across"]);
        assert_eq!(non_track, vec![("time".to_string(), 2)]);
        assert_eq!(
            axes_permutation(var.dimensions(), &ordered),
            vec![1, 2, 0]
        );

        let bad = Variable::new("v", &["time", "along"], zeros(&[2, 5]));
        assert!(matches!(
            preferred_ordered_dimensions(&bad, &coord),
            Err(VariableError::InvalidDimensions { .. })
        ));
    }
}
