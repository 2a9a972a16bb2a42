// Tracing setup for the worker binary

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "triggerflow=info";

/// Filter directive from `RUST_LOG`, then `LOG_LEVEL`, then the default
///
/// `LOG_LEVEL` is a bare level applied to the triggerflow crates.
pub fn log_filter(rust_log: Option<String>, log_level: Option<String>) -> String {
    if let Some(filter) = rust_log.filter(|f| !f.trim().is_empty()) {
        return filter;
    }
    match log_level.filter(|l| !l.trim().is_empty()) {
        Some(level) => format!(
            "triggerflow={level},triggerflow_durable={level},triggerflow_worker={level}",
            level = level.trim()
        ),
        None => format!(
            "{},triggerflow_durable=info,triggerflow_worker=info",
            DEFAULT_FILTER
        ),
    }
}

/// Install the global subscriber
pub fn init_tracing() {
    let directive = log_filter(std::env::var("RUST_LOG").ok(), std::env::var("LOG_LEVEL").ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins() {
        assert_eq!(
            log_filter(Some("debug".into()), Some("warn".into())),
            "debug"
        );
    }

    #[test]
    fn test_log_level_fallback() {
        let filter = log_filter(None, Some("debug".into()));
        assert!(filter.starts_with("triggerflow=debug"));
        assert!(filter.contains("triggerflow_durable=debug"));
    }

    #[test]
    fn test_default_filter() {
        assert!(log_filter(None, None).starts_with("triggerflow=info"));
        assert!(log_filter(Some("  ".into()), None).starts_with("triggerflow=info"));
    }
}
