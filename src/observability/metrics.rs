//! Prometheus metrics.

use crate::config::{ENV_PREFIX, ObservabilitySettings};
use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Whether the exporter is installed.
    pub enabled: bool,
    /// Address the scrape endpoint binds to.
    pub listen_addr: SocketAddr,
}

impl MetricsConfig {
    /// Builds metrics configuration from settings with env overrides.
    #[must_use]
    pub fn from_settings(settings: &ObservabilitySettings) -> Self {
        let mut config = Self {
            enabled: settings.metrics_enabled,
            listen_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                settings.metrics_port,
            ),
        };

        if let Some(enabled) = parse_bool_env(&format!("{ENV_PREFIX}METRICS_ENABLED")) {
            config.enabled = enabled;
        }
        if let Some(port) = parse_port_env(&format!("{ENV_PREFIX}METRICS_PORT")) {
            config.listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        }

        config
    }
}

/// Installs the global Prometheus recorder.
///
/// With `expose` the exporter serves `/metrics` on
/// [`MetricsConfig::listen_addr`] from its own background thread and no
/// handle is returned. Without it the recorder only collects and the
/// returned handle renders on demand.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot bind.
pub fn install_prometheus(config: &MetricsConfig, expose: bool) -> Result<Option<PrometheusHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let handle = if expose {
        PrometheusBuilder::new()
            .with_http_listener(config.listen_addr)
            .install()
            .map_err(|e| Error::operation("metrics_listener_install", e))?;
        None
    } else {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| Error::operation("metrics_recorder_install", e))?,
        )
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        exposed = expose,
        "prometheus metrics installed"
    );
    Ok(handle)
}

fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn parse_port_env(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_smoke() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("repostscan_checks_total", "verdict" => "repost").increment(2);
        });

        let rendered = handle.render();
        assert!(rendered.contains("repostscan_checks_total"));
    }

    #[test]
    fn test_disabled_metrics_install_nothing() {
        let config = MetricsConfig {
            enabled: false,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        };
        assert!(install_prometheus(&config, true).unwrap().is_none());
    }
}
