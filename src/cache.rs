//! Resampling information shared between variables with the same coordinates.
//!
//! Deriving a target grid and a kernel mapping is by far the most expensive
//! part of reprojecting a variable, and every science variable georeferenced
//! by the same latitude and longitude variables needs exactly the same
//! ones. The cache holds one [`CacheEntry`] per [`CoordinateSet`], plus an
//! optional grid defined entirely by the request that every entry uses.
use error_stack::ResultExt;
use indexmap::IndexMap;

use crate::{
    error::ReprojectError,
    kernel::{MappingKind, ResamplingInfo},
    parameters::RequestParameters,
    target_area::{request_target_area, TargetArea},
    variables::CoordinateSet,
};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    target: TargetArea,
    mapping: ResamplingInfo,
    dimensions: Option<(String, String)>,
}

impl CacheEntry {
    pub fn target(&self) -> &TargetArea {
        &self.target
    }

    pub fn mapping(&self) -> &ResamplingInfo {
        &self.mapping
    }

    /// The (y, x) dimension names, once a variable on this grid has been written.
    pub fn dimensions(&self) -> Option<(&str, &str)> {
        self.dimensions
            .as_ref()
            .map(|(y, x)| (y.as_str(), x.as_str()))
    }
}

#[derive(Debug, Default)]
pub struct ReprojectionCache {
    request_target: Option<TargetArea>,
    entries: IndexMap<CoordinateSet, CacheEntry>,
}

impl ReprojectionCache {
    /// Create an empty cache, seeded with the request's grid if the request
    /// fully defines one.
    pub fn new(parameters: &RequestParameters) -> error_stack::Result<Self, ReprojectError> {
        let request_target =
            request_target_area(parameters).change_context(ReprojectError::InvalidTargetGrid)?;
        if let Some(target) = &request_target {
            log::debug!(
                "Using target grid from request: {} rows x {} columns",
                target.height(),
                target.width()
            );
        }
        Ok(Self {
            request_target,
            entries: IndexMap::new(),
        })
    }

    pub fn request_target(&self) -> Option<&TargetArea> {
        self.request_target.as_ref()
    }

    /// The target grid already associated with `key`, if any.
    pub fn target_area(&self, key: &CoordinateSet) -> Option<&TargetArea> {
        self.entries.get(key).map(|e| &e.target)
    }

    /// The cached grid and mapping for `key`, provided the mapping is of the
    /// requested kind.
    pub fn lookup(&self, key: &CoordinateSet, kind: MappingKind) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|e| e.mapping.kind() == kind)
    }

    pub fn get(&self, key: &CoordinateSet) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store the mapping for `key`. Replacing an existing entry keeps the
    /// dimension names already assigned to it.
    pub fn insert(&mut self, key: CoordinateSet, target: TargetArea, mapping: ResamplingInfo) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.target = target;
            entry.mapping = mapping;
        } else {
            self.entries.insert(
                key,
                CacheEntry {
                    target,
                    mapping,
                    dimensions: None,
                },
            );
        }
    }

    /// The (y, x) dimension names for the grid of `key`.
    ///
    /// The base names are `lat`/`lon` for a geographic grid and `y`/`x`
    /// otherwise. Without a grid from the request, each coordinate set may
    /// have its own grid, so every grid after the first gets a numeric
    /// suffix (`lat_1`, `lon_1`, ...). Names are fixed the first time they
    /// are requested for a key.
    pub fn dimension_names(&mut self, key: &CoordinateSet, geographic: bool) -> (String, String) {
        let (y_base, x_base) = if geographic { ("lat", "lon") } else { ("y", "x") };

        if self.request_target.is_some() {
            return (y_base.to_string(), x_base.to_string());
        }

        // Entries are never removed and their names are never cleared, so
        // this count grows by one per assignment and suffixes stay unique.
        // It can differ from `len()`: an entry whose variable failed before
        // being written holds a mapping but no names.
        let named = self.entries.values().filter(|e| e.dimensions.is_some()).count();
        let Some(entry) = self.entries.get_mut(key) else {
            return (y_base.to_string(), x_base.to_string());
        };

        if let Some(dims) = &entry.dimensions {
            return dims.clone();
        }

        let suffix = if named == 0 {
            String::new()
        } else {
            format!("_{named}")
        };
        let dims = (format!("{y_base}{suffix}"), format!("{x_base}{suffix}"));
        entry.dimensions = Some(dims.clone());
        dims
    }

    /// Number of coordinate sets with cached information.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{geometry::Extent, projection::Projection, target_area::TargetArea};
    use ndarray::Array2;

    fn target(id: &str) -> TargetArea {
        TargetArea::from_extent(
            id,
            Projection::new("EPSG:4326").unwrap(),
            (2, 2),
            Extent {
                x_min: 0.0,
                x_max: 2.0,
                y_min: 0.0,
                y_max: 2.0,
            },
        )
        .unwrap()
    }

    fn ewa_mapping() -> ResamplingInfo {
        ResamplingInfo::Ewa {
            cols: Array2::zeros((2, 2)),
            rows: Array2::zeros((2, 2)),
            rows_per_scan: 2,
        }
    }

    fn nearest_mapping() -> ResamplingInfo {
        ResamplingInfo::Nearest {
            input_shape: (2, 2),
            valid_input_index: vec![0, 1, 2, 3],
            valid_output_index: vec![],
            index_array: vec![],
            distance_array: vec![],
        }
    }

    #[test]
    fn test_request_target_seeded() {
        let params = RequestParameters::for_tests()
            .with_extent(-20.0, 60.0, 10.0, 35.0)
            .with_dimensions(25, 80);
        let cache = ReprojectionCache::new(&params).unwrap();
        let target = cache.request_target().unwrap();
        assert_eq!(target.shape(), (25, 80));
        assert!(cache.is_empty());

        let cache = ReprojectionCache::new(&RequestParameters::for_tests()).unwrap();
        assert!(cache.request_target().is_none());
    }

    #[test]
    fn test_lookup_by_kind() {
        let mut cache = ReprojectionCache::default();
        let key = CoordinateSet::new(&["/lat", "/lon"]);
        assert!(cache.lookup(&key, MappingKind::Ewa).is_none());

        cache.insert(key.clone(), target("a"), ewa_mapping());
        assert!(cache.lookup(&key, MappingKind::Ewa).is_some());
        assert!(cache.lookup(&key, MappingKind::Nearest).is_none());
        assert_eq!(cache.target_area(&key).map(|t| t.area_id()), Some("a"));
    }

    #[test]
    fn test_replacing_mapping_keeps_dimensions() {
        let mut cache = ReprojectionCache::default();
        let key = CoordinateSet::new(&["/lat", "/lon"]);
        cache.insert(key.clone(), target("a"), ewa_mapping());
        assert_eq!(cache.dimension_names(&key, true), ("lat".to_string(), "lon".to_string()));

        cache.insert(key.clone(), target("a"), nearest_mapping());
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&key, MappingKind::Nearest).is_some());
        assert_eq!(cache.get(&key).unwrap().dimensions(), Some(("lat", "lon")));
    }

    #[test]
    fn test_dimension_suffixes() {
        let mut cache = ReprojectionCache::default();
        let first = CoordinateSet::new(&["/lat", "/lon"]);
        let second = CoordinateSet::new(&["/group/lat", "/group/lon"]);
        let third = CoordinateSet::new(&["/other/lat", "/other/lon"]);
        for key in [&first, &second, &third] {
            cache.insert(key.clone(), target("a"), ewa_mapping());
        }

        assert_eq!(cache.dimension_names(&first, false), ("y".to_string(), "x".to_string()));
        assert_eq!(cache.dimension_names(&third, false), ("y_1".to_string(), "x_1".to_string()));
        assert_eq!(cache.dimension_names(&second, false), ("y_2".to_string(), "x_2".to_string()));
        // Names are stable once assigned.
        assert_eq!(cache.dimension_names(&third, false), ("y_1".to_string(), "x_1".to_string()));

        // A replaced mapping keeps its names, so the next grid does not reuse them.
        cache.insert(third.clone(), target("a"), nearest_mapping());
        let fourth = CoordinateSet::new(&["/fourth/lat", "/fourth/lon"]);
        cache.insert(fourth.clone(), target("a"), ewa_mapping());
        assert_eq!(cache.dimension_names(&fourth, false), ("y_3".to_string(), "x_3".to_string()));
    }

    #[test]
    fn test_no_suffix_with_request_target() {
        let params = RequestParameters::for_tests()
            .with_extent(-20.0, 60.0, 10.0, 35.0)
            .with_resolutions(0.5, 0.5);
        let mut cache = ReprojectionCache::new(&params).unwrap();
        let first = CoordinateSet::new(&["/lat", "/lon"]);
        let second = CoordinateSet::new(&["/group/lat", "/group/lon"]);
        cache.insert(first.clone(), target("a"), ewa_mapping());
        cache.insert(second.clone(), target("a"), ewa_mapping());
        assert_eq!(cache.dimension_names(&first, true), ("lat".to_string(), "lon".to_string()));
        assert_eq!(cache.dimension_names(&second, true), ("lat".to_string(), "lon".to_string()));
    }
}
