use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

use crate::util::env::init_env;

/// `RUST_LOG` (from the process env or `.env`) wins over `default_filter`.
fn env_filter(default_filter: &str) -> EnvFilter {
    // `.env` must be loaded before `RUST_LOG` is read.
    init_env();
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Installs the global fmt subscriber.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    SubscriberBuilder::default()
        .with_env_filter(env_filter(default_filter))
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_the_default_filter() {
        std::env::set_var("RUST_LOG", "imdb_ratings_sync=trace");
        let filter = env_filter("warn");
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "imdb_ratings_sync=trace");
        assert_eq!(env_filter("warn").to_string(), "warn");
    }
}
