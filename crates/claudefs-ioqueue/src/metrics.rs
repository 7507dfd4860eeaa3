//! Pull-style metrics sink with Prometheus-compatible export.
//!
//! Producers register groups of [`MetricDefinition`]s, each binding a label set
//! to a closure that reads a live value. The returned [`MetricGroups`] handle
//! deregisters its metrics when dropped.

use std::fmt::Write as _;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IoQueueError, IoQueueResult};

/// Type of metric for Prometheus compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    /// Monotonically increasing value
    Counter,
    /// Value that can go up or down
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Value of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    /// Counter value (u64)
    Counter(u64),
    /// Gauge value (f64)
    Gauge(f64),
}

impl MetricValue {
    /// Value as a float, for rendering.
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Counter(v) => *v as f64,
            MetricValue::Gauge(v) => *v,
        }
    }
}

/// A single metric with metadata and value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name
    pub name: String,
    /// Help text
    pub help: String,
    /// Type of metric
    pub metric_type: MetricType,
    /// Current value
    pub value: MetricValue,
    /// Label key-value pairs
    pub labels: Vec<(String, String)>,
}

/// Reads the live value of a metric.
pub type MetricFn = Arc<dyn Fn() -> MetricValue + Send + Sync>;

/// A metric to register: name, labels and a live value source.
#[derive(Clone)]
pub struct MetricDefinition {
    name: String,
    help: String,
    metric_type: MetricType,
    labels: Vec<(String, String)>,
    value: MetricFn,
}

impl MetricDefinition {
    /// A counter read from `f`.
    pub fn counter<F>(name: &str, help: &str, labels: Vec<(String, String)>, f: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        Self::new(name, help, MetricType::Counter, labels, Arc::new(move || MetricValue::Counter(f())))
    }

    /// A gauge read from `f`.
    pub fn gauge<F>(name: &str, help: &str, labels: Vec<(String, String)>, f: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self::new(name, help, MetricType::Gauge, labels, Arc::new(move || MetricValue::Gauge(f())))
    }

    fn new(
        name: &str,
        help: &str,
        metric_type: MetricType,
        mut labels: Vec<(String, String)>,
        value: MetricFn,
    ) -> Self {
        labels.sort();
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type,
            labels,
            value,
        }
    }

    /// Metric name within its group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sorted label pairs.
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }
}

impl std::fmt::Debug for MetricDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricDefinition")
            .field("name", &self.name)
            .field("metric_type", &self.metric_type)
            .field("labels", &self.labels)
            .finish()
    }
}

/// Handle to registered metrics; deregisters them on drop.
pub struct MetricGroups {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl MetricGroups {
    /// Creates a handle that runs `on_drop` when dropped.
    pub fn new(on_drop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }
}

impl Drop for MetricGroups {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

impl std::fmt::Debug for MetricGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricGroups")
            .field("registered", &self.on_drop.is_some())
            .finish()
    }
}

/// Destination for metric registrations.
pub trait MetricsSink: Send + Sync {
    /// Registers `defs` under `group`. Fails with
    /// [`IoQueueError::DuplicateMetricRegistration`] without registering
    /// anything if any `(name, labels)` is already present.
    fn add_group(&self, group: &str, defs: Vec<MetricDefinition>) -> IoQueueResult<MetricGroups>;
}

type MetricKey = (String, Vec<(String, String)>);

/// In-process metrics registry.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    metrics: Arc<DashMap<MetricKey, MetricDefinition>>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Reads the current value of a registered metric.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<MetricValue> {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        self.metrics
            .get(&(name.to_string(), labels))
            .map(|def| (def.value)())
    }

    /// Evaluates every registered metric, sorted by name then labels.
    pub fn export(&self) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .metrics
            .iter()
            .map(|entry| {
                let (name, labels) = entry.key();
                let def = entry.value();
                Metric {
                    name: name.clone(),
                    help: def.help.clone(),
                    metric_type: def.metric_type,
                    value: (def.value)(),
                    labels: labels.clone(),
                }
            })
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        metrics
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let mut last_name: Option<String> = None;
        for metric in self.export() {
            if last_name.as_deref() != Some(metric.name.as_str()) {
                let _ = writeln!(out, "# HELP {} {}", metric.name, metric.help);
                let _ = writeln!(out, "# TYPE {} {}", metric.name, metric.metric_type.as_str());
                last_name = Some(metric.name.clone());
            }
            let labels: Vec<String> = metric
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
                .collect();
            let _ = writeln!(
                out,
                "{}{{{}}} {}",
                metric.name,
                labels.join(","),
                metric.value.as_f64()
            );
        }
        out
    }
}

impl MetricsSink for MetricsRegistry {
    fn add_group(&self, group: &str, defs: Vec<MetricDefinition>) -> IoQueueResult<MetricGroups> {
        let mut inserted: Vec<MetricKey> = Vec::with_capacity(defs.len());

        for def in defs {
            let key = (format!("{}_{}", group, def.name), def.labels.clone());
            // the entry guard must be released before rolling back
            let duplicate = match self.metrics.entry(key.clone()) {
                Entry::Occupied(_) => true,
                Entry::Vacant(slot) => {
                    slot.insert(def);
                    false
                }
            };
            if duplicate {
                for k in &inserted {
                    self.metrics.remove(k);
                }
                return Err(IoQueueError::DuplicateMetricRegistration {
                    name: key.0,
                    labels: key.1,
                });
            }
            inserted.push(key);
        }

        debug!("Registered {} metrics in group {}", inserted.len(), group);
        let metrics = Arc::clone(&self.metrics);
        Ok(MetricGroups::new(move || {
            for key in &inserted {
                metrics.remove(key);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn labels(class: &str) -> Vec<(String, String)> {
        vec![
            ("mountpoint".to_string(), "/data".to_string()),
            ("class".to_string(), class.to_string()),
        ]
    }

    #[test]
    fn test_register_and_read_live_value() {
        let registry = MetricsRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let _groups = registry
            .add_group(
                "io_queue",
                vec![MetricDefinition::counter(
                    "total_operations",
                    "Total operations",
                    labels("default"),
                    move || c.load(Ordering::Relaxed),
                )],
            )
            .unwrap();

        counter.store(7, Ordering::Relaxed);
        let value = registry.value(
            "io_queue_total_operations",
            &[("class", "default"), ("mountpoint", "/data")],
        );
        assert_eq!(value, Some(MetricValue::Counter(7)));
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = MetricsRegistry::new();
        let groups = registry
            .add_group(
                "io_queue",
                vec![MetricDefinition::gauge("delay", "Delay", labels("default"), || 1.0)],
            )
            .unwrap();
        assert_eq!(registry.len(), 1);
        drop(groups);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_registration_is_atomic() {
        let registry = MetricsRegistry::new();
        let _first = registry
            .add_group(
                "io_queue",
                vec![MetricDefinition::gauge("delay", "Delay", labels("default"), || 1.0)],
            )
            .unwrap();

        let err = registry
            .add_group(
                "io_queue",
                vec![
                    MetricDefinition::gauge("shares", "Shares", labels("default"), || 1.0),
                    MetricDefinition::gauge("delay", "Delay", labels("default"), || 2.0),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, IoQueueError::DuplicateMetricRegistration { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_name_different_labels_allowed() {
        let registry = MetricsRegistry::new();
        let _a = registry
            .add_group(
                "io_queue",
                vec![MetricDefinition::gauge("delay", "Delay", labels("a"), || 1.0)],
            )
            .unwrap();
        let _b = registry
            .add_group(
                "io_queue",
                vec![MetricDefinition::gauge("delay", "Delay", labels("b"), || 1.0)],
            )
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_render_prometheus() {
        let registry = MetricsRegistry::new();
        let _groups = registry
            .add_group(
                "io_queue",
                vec![MetricDefinition::counter(
                    "total_bytes",
                    "Total bytes passed in the queue",
                    labels("default"),
                    || 4096,
                )],
            )
            .unwrap();
        let text = registry.render_prometheus();
        assert!(text.contains("# TYPE io_queue_total_bytes counter"));
        assert!(text.contains("io_queue_total_bytes{class=\"default\",mountpoint=\"/data\"} 4096"));
    }
}
