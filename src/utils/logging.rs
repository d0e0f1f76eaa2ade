//! Logger initialisation.
//!
//! The core logs through the `log` facade; applications embedding it may
//! install any logger. [`init_logging`] installs `env_logger` configured from
//! [`LoggingConfig`], with `RUST_LOG` taking precedence.

use crate::utils::LoggingConfig;

/// Install `env_logger` as the global logger.
///
/// Returns `false` if a logger was already installed, which happens when
/// several clients share one process.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.level));

    if config.timestamps {
        builder.format_timestamp_secs();
    } else {
        builder.format_timestamp(None);
    }

    builder.try_init().is_ok()
}
