use std::time::Instant;

use owo_colors::{OwoColorize, Style};

/// Diagnostics go to stderr: stdout is reserved for the proxy listings the
/// `find`/`grab` commands print, so `--json` output stays pipeable. Each
/// line carries the seconds since startup, which is what you end up
/// correlating when providers, checks and the server race each other.
pub fn setup_logger(level: Option<log::LevelFilter>) -> anyhow::Result<()> {
    let started = Instant::now();
    fern::Dispatch::new()
        .format(move |out, message, record| {
            let style = match record.level() {
                log::Level::Error => Style::new().red().bold(),
                log::Level::Warn => Style::new().yellow(),
                log::Level::Info => Style::new().green(),
                log::Level::Debug => Style::new().cyan(),
                log::Level::Trace => Style::new().dimmed(),
            };
            // The last path segment is enough: checker, pool, server...
            let unit = record.target().rsplit("::").next().unwrap_or("proxyhive");
            out.finish(format_args!(
                "{:>9.3} {:<5} {} {}",
                started.elapsed().as_secs_f64(),
                record.level().style(style),
                unit.dimmed(),
                message
            ))
        })
        // Dependencies only surface real problems; our own targets follow
        // the requested level.
        .level(log::LevelFilter::Warn)
        .level_for("proxyhive", level.unwrap_or(log::LevelFilter::Info))
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}
