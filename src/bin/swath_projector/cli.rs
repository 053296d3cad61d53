//! Command line interface definitions
use std::path::PathBuf;

use clap::{Args, Parser};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use swath_projector::parameters::{AxisExtent, FormatRequest, Request, ScaleExtent, ScaleSize};

/// Reproject the science variables of a swath granule onto a regular grid.
///
/// The grid is described either by a JSON request file (`--request`) or by
/// the individual grid options below. Anything not given is derived from the
/// swath itself. The merged output is written to the working directory as
/// `<input stem>_repr<input extension>`.
#[derive(Debug, Parser)]
pub(crate) struct Cli {
    /// The swath granule to reproject.
    #[clap(required_unless_present = "config_template")]
    pub(crate) input_file: Option<PathBuf>,

    /// Directory for the single band files and the merged output.
    #[clap(short = 'o', long, default_value = ".")]
    pub(crate) work_dir: PathBuf,

    /// JSON file holding the request, e.g. `{"format": {"crs": "EPSG:4326"}}`.
    #[clap(short = 'r', long)]
    pub(crate) request: Option<PathBuf>,

    #[clap(flatten)]
    pub(crate) grid: GridCli,

    /// Where the granule came from, recorded in the output provenance.
    /// Defaults to the input file path.
    #[clap(long)]
    pub(crate) granule_url: Option<String>,

    /// TOML file with resampling, provenance and output settings.
    #[clap(short = 'c', long)]
    pub(crate) config: Option<PathBuf>,

    /// Print the configuration in effect as TOML and exit.
    #[clap(long)]
    pub(crate) config_template: bool,

    /// Also write the log to this file, at DEBUG level or higher.
    #[clap(long)]
    pub(crate) log_file: Option<PathBuf>,

    #[command(flatten)]
    pub(crate) verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, Clone, Args)]
#[group(conflicts_with = "request")]
pub(crate) struct GridCli {
    /// Target CRS, as a PROJ string or "EPSG:<code>".
    #[clap(long)]
    pub(crate) crs: Option<String>,

    /// One of "near", "bilinear", "ewa" or "ewa-nn".
    #[clap(long)]
    pub(crate) interpolation: Option<String>,

    /// Extent of the grid along x, in target CRS units.
    #[clap(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub(crate) x_extent: Option<Vec<f64>>,

    /// Extent of the grid along y, in target CRS units.
    #[clap(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub(crate) y_extent: Option<Vec<f64>>,

    /// Pixel size along x, in target CRS units.
    #[clap(long)]
    pub(crate) x_res: Option<f64>,

    /// Pixel size along y, in target CRS units.
    #[clap(long, allow_negative_numbers = true)]
    pub(crate) y_res: Option<f64>,

    /// Number of grid rows.
    #[clap(long)]
    pub(crate) height: Option<usize>,

    /// Number of grid columns.
    #[clap(long)]
    pub(crate) width: Option<usize>,
}

impl GridCli {
    pub(crate) fn to_request(&self) -> Request {
        let axis = |values: &Option<Vec<f64>>| match values.as_deref() {
            Some(&[min, max]) => Some(AxisExtent { min, max }),
            _ => None,
        };

        let x = axis(&self.x_extent);
        let y = axis(&self.y_extent);
        let scale_extent = (x.is_some() || y.is_some()).then_some(ScaleExtent { x, y });
        let scale_size = (self.x_res.is_some() || self.y_res.is_some()).then_some(ScaleSize {
            x: self.x_res,
            y: self.y_res,
        });

        Request {
            format: FormatRequest {
                crs: self.crs.clone(),
                interpolation: self.interpolation.clone(),
                scale_extent,
                scale_size,
                height: self.height,
                width: self.width,
            },
        }
    }
}
