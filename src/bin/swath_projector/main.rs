use std::process::ExitCode;

use clap::Parser;
use error_stack::ResultExt;
use swath_projector::{
    config::ProjectorConfig, dataset::NetcdfIo, kernel::NativeKernel, logging::init_logging,
    parameters::Request, reproject::SwathProjector,
};

mod cli;

fn main() -> ExitCode {
    let clargs = cli::Cli::parse();
    init_logging(clargs.verbosity.log_level_filter(), clargs.log_file.as_deref());
    if let Err(e) = main_inner(clargs) {
        eprintln!("ERROR: {e:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main_inner(clargs: cli::Cli) -> error_stack::Result<(), CliError> {
    let config = ProjectorConfig::load(clargs.config.as_deref())
        .change_context_lazy(|| CliError::Config)?;
    log::debug!("Configuration: {config:?}");
    if clargs.config_template {
        let template = config
            .to_toml_string()
            .change_context_lazy(|| CliError::Config)?;
        print!("{template}");
        return Ok(());
    }
    let Some(input_file) = clargs.input_file.as_deref() else {
        return Err(CliError::NoInput.into());
    };

    let request = match &clargs.request {
        Some(path) => Request::from_json_file(path).change_context_lazy(|| CliError::Request)?,
        None => clargs.grid.to_request(),
    };

    let projector = SwathProjector::new(NetcdfIo, NativeKernel, config);
    let output = projector
        .reproject(
            &request,
            input_file,
            clargs.granule_url.as_deref(),
            &clargs.work_dir,
        )
        .change_context_lazy(|| CliError::Reprojection(input_file.display().to_string()))?;
    println!("{}", output.display());
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Could not load the configuration")]
    Config,
    #[error("No input file given")]
    NoInput,
    #[error("Could not read the request")]
    Request,
    #[error("Reprojection of {0} failed")]
    Reprojection(String),
}
