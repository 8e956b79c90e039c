use std::path::Path;

use anyhow::Context;

fn format_line(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    out.finish(format_args!(
        "[{}][{}][{}] {}",
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
        record.level(),
        record.target(),
        message
    ))
}

/// Installs the global logger: stderr, plus `file` when given.
pub fn init(level: log::LevelFilter, file: Option<&Path>) -> anyhow::Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(format_line)
        .level(level)
        // The websocket stack is chatty at debug.
        .level_for("tungstenite", log::LevelFilter::Info)
        .level_for("tokio_tungstenite", log::LevelFilter::Info)
        .level_for("rustls", log::LevelFilter::Warn)
        .chain(std::io::stderr());

    if let Some(path) = file {
        let log_file = fern::log_file(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        dispatch = dispatch.chain(log_file);
    }

    dispatch.apply().context("install logger")?;
    Ok(())
}
