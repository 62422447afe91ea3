use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{config::LogConfig, ProxyError, Result};

const LOG_FILE: &str = "minginx.log";

/// Keeps the non-blocking writers alive; logs are flushed when it drops.
#[must_use = "dropping the guard stops log output"]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber: console output, plus a daily-rolling file
/// when `config.dir` is set. `RUST_LOG` overrides `config.level`.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            ProxyError::ConfigurationMalformed(format!("log.level `{}`: {e}", config.level))
        })?,
    };

    let mut guards = Vec::new();
    let (stdout, guard) = tracing_appender::non_blocking(io::stdout());
    guards.push(guard);
    let console = fmt::Layer::new()
        .with_writer(stdout)
        .with_span_events(FmtSpan::CLOSE);

    let file = config.dir.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        fmt::Layer::new().with_writer(writer).with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| ProxyError::Logging(e.to_string()))?;

    Ok(LogGuard { _guards: guards })
}
