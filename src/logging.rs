use std::path::Path;

use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Config,
};

const LOG_PATTERN: &str = "{h({d(%Y-%m-%d %H:%M:%S)} [{l}] from line {L} in {M})} - {m}{n}";

/// Set up logging to stderr and, optionally, to `log_file`.
///
/// The file always records at least DEBUG messages so that the reason any
/// variable was skipped can be recovered after a run. Panics if the logger
/// cannot be configured, usually because the log file cannot be created.
pub fn init_logging(level: log::LevelFilter, log_file: Option<&Path>) {
    let stderr = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .target(Target::Stderr)
        .build();

    let mut builder = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(level)))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .append(false)
            .build(path)
            .expect("Failed to create log file");
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    let root_level = if log_file.is_some() {
        level.max(log::LevelFilter::Debug)
    } else {
        level
    };

    let config = builder
        .build(root.build(root_level))
        .expect("Failed to configure logger");

    log4rs::init_config(config).expect("Failed to initialize logger");
}
