//! Run-wide settings that are not part of an individual request.
//!
//! Every setting has a built-in default, so no configuration is needed for
//! normal use. Settings are layered, with later sources taking precedence:
//!
//! 1. the defaults,
//! 2. an optional [TOML](https://toml.io/en/) file, and
//! 3. environment variables starting with `SWATH_PROJECTOR_`.
//!
//! The TOML file has three optional tables. A file giving every setting
//! its default value would look like this:
//!
//! ```toml
//! [resampling]
//! radius_of_influence = 50000.0
//! epsilon = 0.5
//! neighbours = 16
//!
//! [provenance]
//! program = "sds/harmony-swath-projector"
//! version = "0.1.0"
//! program_ref = "https://cmr.uat.earthdata.nasa.gov/search/concepts/S1237974711-EEDTEST"
//! schema = "https://harmony.earthdata.nasa.gov/schemas/history/0.1.0/history-v0.1.0.json"
//!
//! [output]
//! deflate_level = 6
//! keep_intermediate_files = false
//! ```
//!
//! `resampling` tunes the neighbour searches of the nearest neighbour and
//! bilinear methods: `radius_of_influence` is the maximum distance (in
//! metres) between a grid cell and a swath pixel that may contribute to it,
//! and `neighbours` is how many swath pixels are examined for each grid cell
//! when looking for the four that surround it.
//!
//! `provenance` sets what is recorded about this program in the `history`
//! and `history_json` attributes of the output.
//!
//! `output` controls the compression of the merged file, and whether the
//! per-variable intermediate files are left in the working directory once
//! the merged file has been written. (They are always left behind when a run
//! fails, to help diagnose the problem.)
//!
//! The `--config-template` option of the command line program prints the
//! configuration in effect in this format.
//!
//! Environment variables name a setting by its table and key, separated by a
//! double underscore, e.g. `SWATH_PROJECTOR_OUTPUT__KEEP_INTERMEDIATE_FILES=true`
//! or `SWATH_PROJECTOR_RESAMPLING__NEIGHBOURS=32`.
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::kernel::KernelParameters;

pub const ENV_PREFIX: &str = "SWATH_PROJECTOR_";

pub const HISTORY_JSON_SCHEMA: &str =
    "https://harmony.earthdata.nasa.gov/schemas/history/0.1.0/history-v0.1.0.json";
pub const PROGRAM: &str = "sds/harmony-swath-projector";
pub const PROGRAM_REF: &str =
    "https://cmr.uat.earthdata.nasa.gov/search/concepts/S1237974711-EEDTEST";

/// Deflate level of the variables in the merged output.
pub const DEFLATE_LEVEL: i32 = 6;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectorConfig {
    #[serde(default)]
    pub resampling: KernelParameters,
    #[serde(default)]
    pub provenance: ProvenanceConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl ProjectorConfig {
    /// Load the configuration from the defaults, the TOML file at `path` (if
    /// given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(ProjectorConfig::default()));
        if let Some(p) = path {
            if !p.is_file() {
                return Err(format!("configuration file {} does not exist", p.display()).into());
            }
            log::debug!("Reading configuration from {}", p.display());
            figment = figment.merge(Toml::file(p));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()
    }

    /// Load the configuration from the defaults and a TOML string, ignoring
    /// the environment.
    pub fn from_toml_str(s: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ProjectorConfig::default()))
            .merge(Toml::string(s))
            .extract()
    }

    /// The configuration as TOML, e.g. as a starting point for a configuration file.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// What is recorded about this program in the output's provenance.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProvenanceConfig {
    pub program: String,
    pub version: String,
    pub program_ref: String,
    /// URL of the JSON schema that `history_json` records follow.
    pub schema: String,
}

impl Default for ProvenanceConfig {
    fn default() -> Self {
        Self {
            program: PROGRAM.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            program_ref: PROGRAM_REF.to_string(),
            schema: HISTORY_JSON_SCHEMA.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutputConfig {
    pub deflate_level: i32,
    pub keep_intermediate_files: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            deflate_level: DEFLATE_LEVEL,
            keep_intermediate_files: false,
        }
    }
}
