//! Configure and initialize logging for the operator.

use crate::cli::TracingFormat;
use crate::config::Config;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Build the env filter from config and install the global subscriber.
///
/// `RUST_LOG` overrides everything; otherwise the configured level applies
/// to the operator's own target while dependencies stay at warn. The HTTP
/// delivery path is pinned to info so retry loops don't flood debug runs.
pub fn setup_logging(config: &Config, format: TracingFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let base_level = &config.log_level;
        EnvFilter::new(format!(
            "warn,guardian={base_level},guardian::alerts::http=info,kube=warn"
        ))
    });

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if format.use_pretty() {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .pretty()
                .with_env_filter(filter)
                .finish(),
        )
    } else {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .json()
                .with_env_filter(filter)
                .finish(),
        )
    };

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}
