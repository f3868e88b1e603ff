//! Global `tracing` subscriber for the server binary.
//!
//! Logging starts at `info` so configuration problems are reported, then
//! [`LogHandle::apply`] switches the filter to the loaded [`LoggingConfig`].
//! A set `RUST_LOG` takes precedence over both.

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

/// Reconfigures the filter of the installed subscriber.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

pub fn init_logging() -> LogHandle {
    let initial = env_filter().unwrap_or_else(|| EnvFilter::new("info"));
    let (layer, filter) = reload::Layer::new(initial);

    // fails when a subscriber is already installed; the handle is then inert
    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer().with_target(true))
        .try_init();

    LogHandle { filter }
}

impl LogHandle {
    pub fn apply(&self, config: &LoggingConfig) {
        if env_filter().is_some() {
            tracing::info!("RUST_LOG is set, ignoring configured log level");
            return;
        }
        if self.filter.reload(build_filter(config)).is_ok() {
            tracing::info!(
                level = %config.level,
                directives = config.directives.len(),
                "logging configured"
            );
        }
    }
}

fn env_filter() -> Option<EnvFilter> {
    std::env::var_os(EnvFilter::DEFAULT_ENV)?;
    EnvFilter::try_from_default_env().ok()
}

pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let mut filter = EnvFilter::new(&config.level);
    for directive in &config.directives {
        match directive.parse() {
            Ok(parsed) => filter = filter.add_directive(parsed),
            Err(e) => tracing::warn!(directive = %directive, error = %e, "ignoring log directive"),
        }
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_extend_the_base_level() {
        let filter = build_filter(&LoggingConfig {
            level: "warn".to_string(),
            directives: vec!["trenova_server=debug".to_string()],
        });
        let rendered = filter.to_string();
        assert!(rendered.contains("warn"));
        assert!(rendered.contains("trenova_server=debug"));
    }

    #[test]
    fn unparseable_directives_are_skipped() {
        let filter = build_filter(&LoggingConfig {
            level: "info".to_string(),
            directives: vec!["tower_http=loudest".to_string()],
        });
        assert_eq!(filter.to_string(), EnvFilter::new("info").to_string());
    }
}
