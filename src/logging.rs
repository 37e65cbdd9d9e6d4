//! Shared log4rs bootstrap for both binaries.

use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log::LevelFilter;
use std::path::PathBuf;

pub fn init(log_file: Option<PathBuf>, level: Option<LevelFilter>) {
    let level = level.unwrap_or(LevelFilter::Info);

    let config = match log_file {
        Some(path) => {
            let logfile = FileAppender::builder()
                .encoder(Box::<PatternEncoder>::default())
                .build(path)
                .expect("failed to open log file");

            Config::builder()
                .appender(Appender::builder().build("logfile", Box::new(logfile)))
                .build(Root::builder().appender("logfile").build(level))
                .unwrap()
        }
        None => {
            let stderr = ConsoleAppender::builder()
                .encoder(Box::<PatternEncoder>::default())
                .target(Target::Stderr)
                .build();

            Config::builder()
                .appender(Appender::builder().build("stderr", Box::new(stderr)))
                .build(Root::builder().appender("stderr").build(level))
                .unwrap()
        }
    };

    log4rs::init_config(config).expect("failed to initialize logging");
}
