// Logging initialisation
//
// A single fmt layer filtered by RUST_LOG / LOG_LEVEL. Library code only
// emits `tracing` events; binaries call `init_telemetry` once at start-up.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for log output
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the start-up log line
    pub service_name: String,
    /// Whether to enable console logging
    pub enable_console: bool,
    /// Log filter (e.g., "info", "debug", "sagaflow_orchestrator=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sagaflow".to_string(),
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SAGAFLOW_SERVICE_NAME`: Service name (default: "sagaflow")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter (default: "info")
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SAGAFLOW_SERVICE_NAME")
                .unwrap_or_else(|_| "sagaflow".to_string()),
            enable_console: true,
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// The filter to install, falling back to `info` if unset or invalid
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber
///
/// Fails if a subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use sagaflow_orchestrator::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     init_telemetry(TelemetryConfig::from_env())?;
///     // ... your application code
///     Ok(())
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<()> {
    let console_layer = if config.enable_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(config.env_filter()),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(console_layer).try_init()?;

    tracing::debug!(service = %config.service_name, "logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults_to_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.env_filter().to_string(), "info");

        let config = TelemetryConfig::default().with_log_filter("sagaflow_orchestrator=debug");
        assert_eq!(config.env_filter().to_string(), "sagaflow_orchestrator=debug");
    }
}
