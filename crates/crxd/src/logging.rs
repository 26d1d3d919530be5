//! Logging setup
//!
//! The filter sits behind a reload layer so the level from the config file
//! can be applied once it is parsed, and again after every reload.
//! `RUST_LOG` and `--log-level` pin the filter and win over the config.

use anyhow::{Context, Result};
use crx_common::config::log_filter_directive;
use crx_common::Config;
use tracing::{debug, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

#[derive(Clone)]
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    pinned: bool,
}

/// Pick the initial filter: `RUST_LOG`, then the CLI level, then `info`.
fn initial_filter(cli_level: Option<&str>) -> Result<(EnvFilter, bool)> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok((filter, true));
        }
    }

    match cli_level {
        Some(level) => {
            let directive = log_filter_directive(level)
                .with_context(|| format!("Unknown log level {:?}", level))?;
            Ok((EnvFilter::new(directive), true))
        }
        None => Ok((EnvFilter::new("info"), false)),
    }
}

/// Install the global subscriber.
pub fn init(cli_level: Option<&str>) -> Result<LogHandle> {
    let (filter, pinned) = initial_filter(cli_level)?;
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(LogHandle { handle, pinned })
}

impl LogHandle {
    /// Apply the config's `log-level` unless the level was pinned at startup.
    pub fn apply_config(&self, config: &Config) {
        if self.pinned {
            debug!("Log level pinned, ignoring log-level {}", config.log_level);
            return;
        }
        if let Err(e) = self.handle.reload(EnvFilter::new(config.log_filter())) {
            warn!("Failed to change log level: {}", e);
        }
    }
}
