use crate::config::AppConfig;
use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

/// JSON lines in production, compact human output everywhere else. `RUST_LOG`
/// style directives in `log_level` are honoured.
pub fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|err| {
        eprintln!("invalid log_level '{}': {err}; falling back to info", config.log_level);
        EnvFilter::new("info")
    });

    let builder = fmt().with_env_filter(filter).with_target(false);
    let installed = if config.is_production() {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.compact().try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
