//! Central alert, metric, and health-check registry.
//!
//! - alert lifecycle: create -> acknowledge -> resolve, with idempotent
//!   acknowledge/resolve and bounded retention
//! - periodic health-check runner over registered async probes; unhealthy
//!   probes raise ERROR alerts, probes that fail to complete raise CRITICAL
//! - metric retention with time-window queries and avg/min/max/count stats

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::MonitoringConfig;
use crate::types::{AlertKind, AlertSeverity, RiskAlert};

const ALERT_CHANNEL_CAPACITY: usize = 256;
const MAX_METRIC_SAMPLES: usize = 10_000;

/// An async health probe: `Ok(())` healthy, `Err(reason)` unhealthy.
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Probe result state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Failed,
}

/// Last known status of one health check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub name: String,
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: i64,
    pub duration_ms: u64,
}

/// Aggregated statistics over a metric window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

struct MetricSample {
    value: f64,
    timestamp: i64,
}

struct Inner {
    config: MonitoringConfig,
    alerts: Mutex<VecDeque<RiskAlert>>,
    probes: Mutex<Vec<(String, HealthProbe)>>,
    health: Mutex<Vec<HealthStatus>>,
    metrics: Mutex<Vec<(String, VecDeque<MetricSample>)>>,
    alert_tx: broadcast::Sender<RiskAlert>,
}

/// Monitoring system shared across services.
#[derive(Clone)]
pub struct MonitoringSystem {
    inner: Arc<Inner>,
}

impl MonitoringSystem {
    pub fn new(config: MonitoringConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                alerts: Mutex::new(VecDeque::new()),
                probes: Mutex::new(Vec::new()),
                health: Mutex::new(Vec::new()),
                metrics: Mutex::new(Vec::new()),
                alert_tx,
            }),
        }
    }

    /// Subscribe to alerts as they fire.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<RiskAlert> {
        self.inner.alert_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Alert lifecycle
    // -------------------------------------------------------------------------

    /// Create and record an alert; broadcast to subscribers.
    pub fn create_alert(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        value: f64,
        threshold: f64,
    ) -> RiskAlert {
        let alert = RiskAlert::new(kind, severity, message, value, threshold);

        match severity {
            AlertSeverity::Critical => error!("ALERT [critical]: {}", alert.message),
            AlertSeverity::Error => error!("ALERT [error]: {}", alert.message),
            AlertSeverity::Warning => warn!("ALERT [warning]: {}", alert.message),
            AlertSeverity::Info => info!("ALERT [info]: {}", alert.message),
        }

        if let Ok(mut alerts) = self.inner.alerts.lock() {
            if alerts.len() >= self.inner.config.max_alerts {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }
        let _ = self.inner.alert_tx.send(alert.clone());
        alert
    }

    /// Mark an alert acknowledged. Returns false for unknown ids; repeated
    /// acknowledgement is a no-op.
    pub fn acknowledge_alert(&self, id: &str) -> bool {
        match self.inner.alerts.lock() {
            Ok(mut alerts) => match alerts.iter_mut().find(|a| a.id == id) {
                Some(alert) => {
                    alert.acknowledged = true;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Mark an alert resolved. Repeated resolution leaves the original
    /// `resolved_at` untouched.
    pub fn resolve_alert(&self, id: &str) -> bool {
        match self.inner.alerts.lock() {
            Ok(mut alerts) => match alerts.iter_mut().find(|a| a.id == id) {
                Some(alert) => {
                    if alert.resolved_at.is_none() {
                        alert.resolved_at = Some(chrono::Utc::now().timestamp_millis());
                    }
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// All retained alerts, oldest first.
    pub fn alerts(&self) -> Vec<RiskAlert> {
        self.inner
            .alerts
            .lock()
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Alerts that have not been resolved yet.
    pub fn active_alerts(&self) -> Vec<RiskAlert> {
        self.inner
            .alerts
            .lock()
            .map(|a| a.iter().filter(|x| x.resolved_at.is_none()).cloned().collect())
            .unwrap_or_default()
    }

    /// Look up one alert.
    pub fn alert(&self, id: &str) -> Option<RiskAlert> {
        self.inner
            .alerts
            .lock()
            .ok()
            .and_then(|a| a.iter().find(|x| x.id == id).cloned())
    }

    // -------------------------------------------------------------------------
    // Health checks
    // -------------------------------------------------------------------------

    /// Register a named async probe.
    pub fn register_check(&self, name: impl Into<String>, probe: HealthProbe) {
        if let Ok(mut probes) = self.inner.probes.lock() {
            probes.push((name.into(), probe));
        }
    }

    /// Run every registered probe once, recording statuses and raising
    /// alerts for unhealthy or failed probes.
    pub async fn run_checks(&self) {
        let probes: Vec<(String, HealthProbe)> = match self.inner.probes.lock() {
            Ok(probes) => probes.clone(),
            Err(_) => return,
        };
        let timeout = Duration::from_millis(self.inner.config.health_check_timeout_ms);

        let mut statuses = Vec::with_capacity(probes.len());
        for (name, probe) in probes {
            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(timeout, probe()).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let status = match outcome {
                Ok(Ok(())) => HealthStatus {
                    name: name.clone(),
                    state: HealthState::Healthy,
                    message: None,
                    checked_at: chrono::Utc::now().timestamp_millis(),
                    duration_ms,
                },
                Ok(Err(reason)) => {
                    self.create_alert(
                        AlertKind::HealthCheck,
                        AlertSeverity::Error,
                        format!("health check '{}' unhealthy: {}", name, reason),
                        0.0,
                        0.0,
                    );
                    HealthStatus {
                        name: name.clone(),
                        state: HealthState::Unhealthy,
                        message: Some(reason),
                        checked_at: chrono::Utc::now().timestamp_millis(),
                        duration_ms,
                    }
                }
                Err(_) => {
                    self.create_alert(
                        AlertKind::HealthCheck,
                        AlertSeverity::Critical,
                        format!("health check '{}' did not complete within {:?}", name, timeout),
                        duration_ms as f64,
                        timeout.as_millis() as f64,
                    );
                    HealthStatus {
                        name: name.clone(),
                        state: HealthState::Failed,
                        message: Some("probe timed out".to_string()),
                        checked_at: chrono::Utc::now().timestamp_millis(),
                        duration_ms,
                    }
                }
            };
            statuses.push(status);
        }

        if let Ok(mut health) = self.inner.health.lock() {
            *health = statuses;
        }
    }

    /// Last recorded status of every probe.
    pub fn health(&self) -> Vec<HealthStatus> {
        self.inner
            .health
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Spawn the periodic health-check loop.
    pub fn start(&self) {
        let monitoring = self.clone();
        let interval = Duration::from_millis(self.inner.config.health_check_interval_ms);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                monitoring.run_checks().await;
            }
        });
    }

    // -------------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------------

    /// Record one sample of a named metric.
    pub fn record_metric(&self, name: &str, value: f64) {
        let now = chrono::Utc::now().timestamp_millis();
        let retention = self.inner.config.metric_retention_ms as i64;

        let Ok(mut metrics) = self.inner.metrics.lock() else {
            return;
        };
        let idx = match metrics.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                metrics.push((name.to_string(), VecDeque::new()));
                metrics.len() - 1
            }
        };
        let series = &mut metrics[idx].1;

        series.push_back(MetricSample {
            value,
            timestamp: now,
        });
        let cutoff = now - retention;
        while series
            .front()
            .is_some_and(|s| s.timestamp < cutoff || series.len() > MAX_METRIC_SAMPLES)
        {
            series.pop_front();
        }
    }

    /// Aggregate a metric over the trailing `window`. `None` when no samples
    /// fall inside it.
    pub fn metric_stats(&self, name: &str, window: Duration) -> Option<MetricStats> {
        let cutoff = chrono::Utc::now().timestamp_millis() - window.as_millis() as i64;

        let metrics = self.inner.metrics.lock().ok()?;
        let (_, series) = metrics.iter().find(|(n, _)| n == name)?;

        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for sample in series.iter().filter(|s| s.timestamp >= cutoff) {
            count += 1;
            sum += sample.value;
            min = min.min(sample.value);
            max = max.max(sample.value);
        }

        if count == 0 {
            return None;
        }
        Some(MetricStats {
            avg: sum / count as f64,
            min,
            max,
            count,
        })
    }
}

impl Default for MonitoringSystem {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}
