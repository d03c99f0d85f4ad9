mod metrics;

pub use metrics::{names, HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::str::FromStr;
use std::sync::Arc;

use parley_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "parley_bus" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines when true, human-readable output otherwise.
    pub json: bool,
    /// Whether to create a metrics recorder.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Builds a config from the logging section. Unparsable levels fall back
    /// to INFO for the base level and are dropped for module overrides.
    pub fn from_settings(logging: &LoggingSettings) -> Self {
        let mut module_levels: Vec<(String, Level)> = logging
            .module_levels
            .iter()
            .filter_map(|(module, level)| {
                Level::from_str(level).ok().map(|l| (module.clone(), l))
            })
            .collect();
        module_levels.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            log_level: Level::from_str(&logging.level).unwrap_or(Level::INFO),
            module_levels,
            json: logging.json,
            metrics_enabled: true,
        }
    }

    fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Holds the metrics recorder created at startup.
pub struct TelemetryGuard {
    metrics_recorder: Option<Arc<MetricsRecorder>>,
    installed: bool,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Option<&MetricsRecorder> {
        self.metrics_recorder.as_deref()
    }

    /// Shared handle for injection into agents and orchestrators.
    pub fn metrics_handle(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    /// False when another subscriber was already installed.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Installs the global tracing subscriber. A second call leaves the existing
/// subscriber in place and only builds a new guard.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let pretty_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .is_ok();

    let metrics_recorder = config
        .metrics_enabled
        .then(|| Arc::new(MetricsRecorder::new()));

    TelemetryGuard {
        metrics_recorder,
        installed,
    }
}
