//! This module provides a built-in logger implementation.
//!
//! The built-in logger uses the `env_logger` crate and is enabled by the
//! Cargo feature "builtin_env_logger" (on by default). When enabled, it is
//! initialized in [`crate::heap::Heap::new`] and shows logs of level INFO or
//! lower. Embedders that integrate with their own logging frameworks can
//! disable the feature and register their own `log` implementation instead.

/// Attempt to init an env_logger for the collector.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("Initialized the built-in logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` is only raised when a logger has
                    // already been installed, which is fine.
                    debug!("Did not initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
