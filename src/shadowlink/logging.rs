use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::shadowlink::config;

/// Keeps the background log writer alive; dropping it flushes pending lines.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Install the global subscriber. `verbose` forces debug level unless
/// `RUST_LOG` is set.
pub fn init(logging: &config::LoggingConfig, verbose: bool) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();
    let out = logging.output.trim();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level, verbose)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(out)?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text" && out == "stderr")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = if fmt == "json" {
        base_fmt.json().boxed()
    } else {
        base_fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: subscriber already installed")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn level_directive(level: &str, verbose: bool) -> &'static str {
    if verbose {
        return "debug";
    }
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn make_writer(
    output: &str,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_overrides_configured_level() {
        assert_eq!(level_directive("warn", false), "warn");
        assert_eq!(level_directive("WARNING", false), "warn");
        assert_eq!(level_directive("warn", true), "debug");
        assert_eq!(level_directive("bogus", false), "info");
    }

    #[test]
    fn file_output_creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!("shadowlink-log-{}", std::process::id()));
        let path = dir.join("nested").join("tunnel.log");
        let (_writer, _guard) = make_writer(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
