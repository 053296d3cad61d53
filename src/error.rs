//! Common errors across the swath-projector crate
use std::path::PathBuf;

/// Errors that abort a whole reprojection run.
///
/// These are carried inside an [`error_stack::Report`] so that callers
/// can attach context as they propagate. Anything that only affects a
/// single science variable should be a [`VariableError`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ReprojectError {
    /// The input granule does not exist.
    #[error("Input file {} does not exist", .0.display())]
    MissingSourceFile(PathBuf),

    /// The input granule exists, but could not be parsed.
    #[error("Unable to parse input file variables")]
    UnreadableSource,

    #[error("No science variables found in input file")]
    NoScienceVariables,

    #[error("No variables could be reprojected")]
    NoVariablesReprojected,

    /// Resolution and dimensions were both requested, but do not describe
    /// the same grid (or no extent was given to reconcile them).
    #[error("Insufficient or invalid target grid parameters.")]
    InvalidTargetGrid,

    /// Only one of the x or y extents was provided.
    #[error("Missing {0} extent")]
    MissingExtent(char),

    /// Only one of height or width was provided.
    #[error("Missing cell {0}")]
    MissingDimension(&'static str),

    #[error("Invalid value for interpolation type: \"{0}\".")]
    InvalidInterpolation(String),

    #[error("Invalid target CRS: '{0}'")]
    InvalidCrs(String),

    /// A single band file that should exist for a reprojected variable
    /// was not found when merging. This indicates an internal inconsistency.
    #[error("Could not find reprojected output file for {0}.")]
    MissingReprojectedData(String),

    #[error("Could not find coordinate {0}.")]
    MissingCoordinates(String),

    /// A wrapper error to provide more context to an underlying error.
    #[error("An error occurred while {0}")]
    Context(String),
}

impl ReprojectError {
    pub fn context<S: ToString>(ctx: S) -> Self {
        Self::Context(ctx.to_string())
    }
}

/// Errors that cause a single science variable to be skipped.
///
/// The per-variable loop in [`crate::interpolation`] logs these and moves
/// on to the next variable; they never end a run by themselves.
#[derive(Debug, thiserror::Error)]
pub enum VariableError {
    #[error("Variable '{0}' is not present in the input file")]
    MissingVariable(String),

    /// None of the variable's coordinate references point at usable
    /// latitude/longitude data.
    #[error("Could not find coordinate {0}.")]
    MissingCoordinates(String),

    #[error("Invalid dimensions {dims:?} for reprojection of '{varname}'")]
    InvalidDimensions { varname: String, dims: Vec<String> },

    #[error("Unsupported coordinate variable shape {0:?}")]
    UnsupportedCoordinateShape(Vec<usize>),

    #[error("Could not derive a target grid: {0}")]
    TargetArea(String),

    #[error("The resampling kernel failed")]
    Kernel,

    #[error("Could not write the single band output to {}", .0.display())]
    Write(PathBuf),

    /// A wrapper error to provide more context to an underlying error.
    #[error("An error occurred while {0}")]
    Context(String),
}

impl VariableError {
    pub fn context<S: ToString>(ctx: S) -> Self {
        Self::Context(ctx.to_string())
    }

    pub fn missing_coordinates<S: AsRef<str>>(refs: &[S]) -> Self {
        let refs: Vec<&str> = refs.iter().map(|s| s.as_ref()).collect();
        Self::MissingCoordinates(format!("({})", refs.join(", ")))
    }
}
