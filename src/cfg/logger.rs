// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry, fmt,
    fmt::{time::ChronoLocal, writer::BoxMakeWriter},
    layer::SubscriberExt,
};

use crate::cfg::config::LogConfig;

/// Installs the process-wide tracing subscriber described by `cfg`.
///
/// A single logger is installed; log lines are pushed through a non-blocking
/// channel to a background writer thread, so hot-path code never blocks on
/// disk. The returned guard flushes the channel on drop and must be kept
/// alive for the life of the process.
pub fn init_logger(cfg: &LogConfig) -> Result<WorkerGuard> {
    let (writer, guard) = make_writer(cfg)?;

    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    let fmt_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()));

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    info!(
        level = %cfg.level,
        file = %cfg.file_name,
        max_file_size = cfg.max_file_size,
        sync_interval_ms = cfg.sync_interval_ms,
        "logger initialized"
    );

    Ok(guard)
}

fn make_writer(cfg: &LogConfig) -> Result<(BoxMakeWriter, WorkerGuard)> {
    if cfg.file_name.is_empty() {
        let (w, g) = tracing_appender::non_blocking(std::io::stdout());
        return Ok((BoxMakeWriter::new(w), g));
    }

    let dir = if cfg.file_path.is_empty() {
        Path::new(".")
    } else {
        Path::new(&cfg.file_path)
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log dir {dir:?}"))?;

    // The appender rotates by day; max_file_size is enforced by the deploy's
    // log rotation outside the process.
    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, dir, cfg.file_name.clone());
    let (w, g) = tracing_appender::non_blocking(file_appender);
    Ok((BoxMakeWriter::new(w), g))
}
