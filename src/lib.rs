pub mod error;
pub mod logging;
pub mod config;
pub mod nc_utils;
pub mod dataset;
pub mod projection;
pub mod geometry;
pub mod variables;
pub mod target_area;
pub mod kernel;
pub mod cache;
pub mod interpolation;
pub mod single_band;
pub mod merge;
pub mod parameters;
pub mod reproject;

#[cfg(test)]
pub(crate) mod test_utils;
