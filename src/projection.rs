//! Target coordinate reference systems.
//!
//! A [`Projection`] wraps a PROJ.4-style definition (or an `EPSG:<code>`
//! shorthand for a handful of common codes) and provides forward and inverse
//! transforms between longitude/latitude in degrees and the projection's
//! native x/y coordinates, plus the CF grid-mapping attributes describing it.
use std::{fmt::Debug, sync::Arc};

use indexmap::IndexMap;
use proj4rs::{proj::Proj, transform::transform};

use crate::dataset::AttrValue;

/// The default target CRS: geographic coordinates on the WGS84 ellipsoid.
pub const DEFAULT_CRS: &str = "+proj=longlat +ellps=WGS84";

/// Parameters that define the ellipsoid/datum; these are carried over to the
/// geographic side of every transform so that no datum shift is applied.
const ELLIPSOID_PARAMS: &[&str] = &["ellps", "datum", "a", "b", "R", "rf", "f", "towgs84"];

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("EPSG code {0} is not supported")]
    UnknownEpsg(String),

    #[error("'{0}' is not a PROJ.4 string or EPSG code")]
    Unsupported(String),

    #[error("Invalid projection '{definition}': {reason}")]
    Invalid { definition: String, reason: String },

    #[error("Could not transform ({0}, {1})")]
    Transform(f64, f64),
}

/// Look up the PROJ.4 definition of the EPSG codes we expect to be requested.
pub fn proj_string_for_epsg(code: u32) -> Option<String> {
    let s = match code {
        4326 => "+proj=longlat +datum=WGS84 +no_defs",
        4269 => "+proj=longlat +datum=NAD83 +no_defs",
        3857 => "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs",
        3395 => "+proj=merc +lon_0=0 +k=1 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs",
        6933 => "+proj=cea +lat_ts=30 +lon_0=0 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs",
        6931 => "+proj=laea +lat_0=90 +lon_0=0 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs",
        6932 => "+proj=laea +lat_0=-90 +lon_0=0 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs",
        3413 => "+proj=stere +lat_0=90 +lat_ts=70 +lon_0=-45 +k=1 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs",
        3995 => "+proj=stere +lat_0=90 +lat_ts=71 +lon_0=0 +k=1 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs",
        3031 => "+proj=stere +lat_0=-90 +lat_ts=-71 +lon_0=0 +k=1 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs",
        32601..=32660 => {
            return Some(format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", code - 32600))
        }
        32701..=32760 => {
            return Some(format!(
                "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
                code - 32700
            ))
        }
        _ => return None,
    };
    Some(s.to_string())
}

/// Split a PROJ.4 string into its `+key[=value]` parameters, in order.
fn parse_proj_params(proj_string: &str) -> IndexMap<String, Option<String>> {
    proj_string
        .split_whitespace()
        .map(|tok| tok.trim_start_matches('+'))
        .filter(|tok| !tok.is_empty())
        .map(|tok| match tok.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (tok.to_string(), None),
        })
        .collect()
}

fn invalid<E: std::fmt::Display>(definition: &str, err: E) -> ProjectionError {
    ProjectionError::Invalid {
        definition: definition.to_string(),
        reason: err.to_string(),
    }
}

#[derive(Clone)]
pub struct Projection {
    definition: String,
    proj_string: String,
    params: IndexMap<String, Option<String>>,
    geographic: bool,
    lonlat: Arc<Proj>,
    target: Arc<Proj>,
}

impl Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("definition", &self.definition)
            .field("proj_string", &self.proj_string)
            .field("geographic", &self.geographic)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Projection {
    fn eq(&self, other: &Self) -> bool {
        self.proj_string == other.proj_string
    }
}

impl Projection {
    /// Create a projection from a PROJ.4 string (`+proj=...`) or an
    /// `EPSG:<code>` identifier.
    pub fn new(definition: &str) -> Result<Self, ProjectionError> {
        let trimmed = definition.trim();
        let proj_string = if let Some(code) = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
        {
            let code_num: u32 = code
                .parse()
                .map_err(|_| ProjectionError::UnknownEpsg(code.to_string()))?;
            proj_string_for_epsg(code_num)
                .ok_or_else(|| ProjectionError::UnknownEpsg(code.to_string()))?
        } else if trimmed.starts_with('+') {
            trimmed.to_string()
        } else {
            return Err(ProjectionError::Unsupported(definition.to_string()));
        };

        let params = parse_proj_params(&proj_string);
        let projname = match params.get("proj") {
            Some(Some(name)) => name.clone(),
            _ => {
                return Err(ProjectionError::Invalid {
                    definition: definition.to_string(),
                    reason: "no +proj parameter".to_string(),
                })
            }
        };
        let geographic = matches!(projname.as_str(), "longlat" | "latlong" | "lonlat" | "latlon");

        let target =
            Proj::from_proj_string(&proj_string).map_err(|e| invalid(definition, e))?;

        let mut lonlat_string = "+proj=longlat".to_string();
        for (key, value) in params.iter() {
            if ELLIPSOID_PARAMS.contains(&key.as_str()) {
                match value {
                    Some(v) => lonlat_string.push_str(&format!(" +{key}={v}")),
                    None => lonlat_string.push_str(&format!(" +{key}")),
                }
            }
        }
        lonlat_string.push_str(" +no_defs");
        let lonlat =
            Proj::from_proj_string(&lonlat_string).map_err(|e| invalid(definition, e))?;

        Ok(Self {
            definition: definition.to_string(),
            proj_string,
            params,
            geographic,
            lonlat: Arc::new(lonlat),
            target: Arc::new(target),
        })
    }

    /// The definition this projection was created from.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn proj_string(&self) -> &str {
        &self.proj_string
    }

    pub fn is_geographic(&self) -> bool {
        self.geographic
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_deref())
    }

    fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.param(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Project longitude/latitude (degrees) to x/y. For geographic
    /// projections this is the identity.
    pub fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), ProjectionError> {
        if self.geographic {
            return Ok((lon, lat));
        }
        let mut point = (lon.to_radians(), lat.to_radians(), 0.0);
        transform(&self.lonlat, &self.target, &mut point)
            .map_err(|_| ProjectionError::Transform(lon, lat))?;
        if point.0.is_finite() && point.1.is_finite() {
            Ok((point.0, point.1))
        } else {
            Err(ProjectionError::Transform(lon, lat))
        }
    }

    /// Convert x/y back to longitude/latitude in degrees.
    pub fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), ProjectionError> {
        if self.geographic {
            return Ok((x, y));
        }
        let mut point = (x, y, 0.0);
        transform(&self.target, &self.lonlat, &mut point)
            .map_err(|_| ProjectionError::Transform(x, y))?;
        let (lon, lat) = (point.0.to_degrees(), point.1.to_degrees());
        if lon.is_finite() && lat.is_finite() {
            Ok((lon, lat))
        } else {
            Err(ProjectionError::Transform(x, y))
        }
    }

    /// The CF `grid_mapping_name`, if this projection has a CF equivalent.
    pub fn grid_mapping_name(&self) -> Option<&'static str> {
        let name = match self.param("proj")? {
            "longlat" | "latlong" | "lonlat" | "latlon" => "latitude_longitude",
            "merc" => "mercator",
            "tmerc" | "utm" => "transverse_mercator",
            "cea" => "lambert_cylindrical_equal_area",
            "laea" => "lambert_azimuthal_equal_area",
            "lcc" => "lambert_conformal_conic",
            "aea" => "albers_conical_equal_area",
            "sinu" => "sinusoidal",
            "geos" => "geostationary",
            "stere" if self.is_polar() => "polar_stereographic",
            "stere" => "stereographic",
            _ => return None,
        };
        Some(name)
    }

    fn is_polar(&self) -> bool {
        (self.param_f64("lat_0", 0.0).abs() - 90.0).abs() < 1e-9
    }

    /// Semi-major axis and inverse flattening of the ellipsoid (the latter
    /// is zero for a sphere).
    fn ellipsoid(&self) -> (f64, f64) {
        if let Some(r) = self.param("R").and_then(|v| v.parse::<f64>().ok()) {
            return (r, 0.0);
        }
        if let Some(a) = self.param("a").and_then(|v| v.parse::<f64>().ok()) {
            if let Some(rf) = self.param("rf").and_then(|v| v.parse::<f64>().ok()) {
                return (a, rf);
            }
            let b = self.param_f64("b", a);
            let rf = if a == b { 0.0 } else { a / (a - b) };
            return (a, rf);
        }
        let name = self.param("ellps").or_else(|| match self.param("datum") {
            Some("NAD83") => Some("GRS80"),
            Some("NAD27") => Some("clrk66"),
            Some(_) => Some("WGS84"),
            None => None,
        });
        match name {
            Some("GRS80") => (6378137.0, 298.257222101),
            Some("clrk66") => (6378206.4, 294.978698214),
            Some("sphere") => (6370997.0, 0.0),
            _ => (6378137.0, 298.257223563),
        }
    }

    /// The attributes of a CF grid-mapping variable describing this projection.
    pub fn to_cf(&self) -> IndexMap<String, AttrValue> {
        let mut attrs: IndexMap<String, AttrValue> = IndexMap::new();
        let (semi_major_axis, inverse_flattening) = self.ellipsoid();
        attrs.insert("semi_major_axis".into(), semi_major_axis.into());
        attrs.insert("inverse_flattening".into(), inverse_flattening.into());
        attrs.insert("longitude_of_prime_meridian".into(), 0.0.into());

        let Some(gm_name) = self.grid_mapping_name() else {
            attrs.insert("proj4_string".into(), self.proj_string.clone().into());
            return attrs;
        };

        let lon_0 = self.param_f64("lon_0", 0.0);
        let lat_0 = self.param_f64("lat_0", 0.0);
        let false_easting = self.param_f64("x_0", 0.0);
        let false_northing = self.param_f64("y_0", 0.0);
        let mut put = |k: &str, v: f64| {
            attrs.insert(k.to_string(), v.into());
        };

        match gm_name {
            "latitude_longitude" => (),
            "mercator" => {
                put("longitude_of_projection_origin", lon_0);
                if self.param("lat_ts").is_some() {
                    put("standard_parallel", self.param_f64("lat_ts", 0.0));
                } else {
                    put("scale_factor_at_projection_origin", self.param_f64("k", 1.0));
                }
            }
            "transverse_mercator" => {
                if self.param("proj") == Some("utm") {
                    let zone = self.param_f64("zone", 1.0);
                    let south = self.params.contains_key("south");
                    put("longitude_of_central_meridian", zone * 6.0 - 183.0);
                    put("latitude_of_projection_origin", 0.0);
                    put("scale_factor_at_central_meridian", 0.9996);
                    put("false_easting", 500000.0);
                    put("false_northing", if south { 10000000.0 } else { 0.0 });
                } else {
                    put("longitude_of_central_meridian", lon_0);
                    put("latitude_of_projection_origin", lat_0);
                    put("scale_factor_at_central_meridian", self.param_f64("k", 1.0));
                }
            }
            "lambert_cylindrical_equal_area" => {
                put("longitude_of_central_meridian", lon_0);
                put("standard_parallel", self.param_f64("lat_ts", 0.0));
            }
            "lambert_azimuthal_equal_area" => {
                put("longitude_of_projection_origin", lon_0);
                put("latitude_of_projection_origin", lat_0);
            }
            "polar_stereographic" => {
                put("straight_vertical_longitude_from_pole", lon_0);
                put("latitude_of_projection_origin", lat_0);
                if self.param("lat_ts").is_some() {
                    put("standard_parallel", self.param_f64("lat_ts", 0.0));
                } else {
                    put("scale_factor_at_projection_origin", self.param_f64("k", 1.0));
                }
            }
            "stereographic" => {
                put("longitude_of_projection_origin", lon_0);
                put("latitude_of_projection_origin", lat_0);
                put("scale_factor_at_projection_origin", self.param_f64("k", 1.0));
            }
            "lambert_conformal_conic" | "albers_conical_equal_area" => {
                put("longitude_of_central_meridian", lon_0);
                put("latitude_of_projection_origin", lat_0);
            }
            "sinusoidal" => put("longitude_of_projection_origin", lon_0),
            "geostationary" => {
                put("longitude_of_projection_origin", lon_0);
                put("perspective_point_height", self.param_f64("h", 35785831.0));
            }
            _ => (),
        }

        if matches!(gm_name, "lambert_conformal_conic" | "albers_conical_equal_area") {
            let lat_1 = self.param_f64("lat_1", lat_0);
            let parallels = match self.param("lat_2").and_then(|v| v.parse::<f64>().ok()) {
                Some(lat_2) => vec![lat_1, lat_2],
                None => vec![lat_1],
            };
            attrs.insert("standard_parallel".into(), parallels.into());
        }
        if gm_name == "geostationary" {
            let sweep = self.param("sweep").unwrap_or("y").to_string();
            attrs.insert("sweep_angle_axis".into(), sweep.into());
        }
        if gm_name != "latitude_longitude" && !attrs.contains_key("false_easting") {
            attrs.insert("false_easting".into(), false_easting.into());
            attrs.insert("false_northing".into(), false_northing.into());
        }

        attrs.insert("grid_mapping_name".into(), gm_name.into());
        attrs
    }
}
