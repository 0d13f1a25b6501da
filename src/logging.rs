use anyhow::{Context, Result};
use simplelog::*;
use std::fs;

use crate::config::Config;

pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn"  => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off"   => LevelFilter::Off,
        _       => LevelFilter::Info,
    }
}

/// Terminal logger on stderr, plus an append-only file logger when
/// `log.file` is configured. `level` overrides `log.level`.
pub fn init(cfg: &Config, level: Option<&str>) -> Result<()> {
    let level = level_filter(level.unwrap_or(&cfg.log.level));

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ));

    if let Some(path) = cfg.log.file.clone() {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log file {}", path.display()))?;
        let cfg = simplelog::ConfigBuilder::new()
            .set_target_level(LevelFilter::Off)
            .set_location_level(LevelFilter::Off)
            .set_thread_level(LevelFilter::Off)
            .build();
        loggers.push(WriteLogger::new(level, cfg, file));
    }

    CombinedLogger::init(loggers)?;
    Ok(())
}
