//! Metrics sink seam.
//!
//! The engine reports two families on the hot path: the cumulative dropped
//! message total across its broker subscriptions, and the remaining
//! capacity of each bounded channel (a zero here means the channel is at
//! its high-water mark and producers are blocking).

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Gauge: total messages dropped by the engine's subscriptions.
pub const DROPPED_MESSAGES: &str = "rpc_server_dropped_messages";
/// Gauge: remaining capacity of a bounded engine channel; labeled by
/// `channel`.
pub const CHANNEL_CAPACITY: &str = "channel_capacity";

pub const CHANNEL_LABEL: &str = "channel";
pub const SUB_CHANNEL: &str = "rpc_server_subchan";
pub const BINDINGS_CHANNEL: &str = "rpc_server_bindingschan";
pub const USER_PUSH_CHANNEL: &str = "rpc_server_userpushchan";

/// Metrics sink. Implementations must be cheap: the engine reports on
/// every demultiplex iteration.
pub trait Reporter: Send + Sync + 'static {
    fn report_gauge(&self, metric: &str, labels: HashMap<String, String>, value: f64);
}

/// No-op sink.
#[derive(Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report_gauge(&self, _metric: &str, _labels: HashMap<String, String>, _value: f64) {}
}

/// In-memory sink keeping the latest value per (metric, labels) series.
#[derive(Default)]
pub struct AtomicReporter {
    gauges: RwLock<HashMap<String, f64>>,
}

impl AtomicReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value for a series, if ever reported.
    pub fn gauge(&self, metric: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let labels: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.gauges.read().get(&series_key(metric, &labels)).copied()
    }

    /// Snapshot of every series, keyed by rendered series name.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.gauges.read().clone()
    }
}

impl Reporter for AtomicReporter {
    fn report_gauge(&self, metric: &str, labels: HashMap<String, String>, value: f64) {
        self.gauges.write().insert(series_key(metric, &labels), value);
    }
}

fn series_key(metric: &str, labels: &HashMap<String, String>) -> String {
    if labels.is_empty() {
        return metric.to_string();
    }
    // Sorted labels so the same series always renders the same key.
    let ordered: BTreeMap<&String, &String> = labels.iter().collect();
    let rendered: Vec<String> = ordered.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{metric}{{{}}}", rendered.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_value_wins() {
        let reporter = AtomicReporter::new();
        reporter.report_gauge(DROPPED_MESSAGES, HashMap::new(), 1.0);
        reporter.report_gauge(DROPPED_MESSAGES, HashMap::new(), 5.0);
        assert_eq!(reporter.gauge(DROPPED_MESSAGES, &[]), Some(5.0));
    }

    #[test]
    fn series_are_distinguished_by_labels() {
        let reporter = AtomicReporter::new();
        let mut labels = HashMap::new();
        labels.insert(CHANNEL_LABEL.to_string(), SUB_CHANNEL.to_string());
        reporter.report_gauge(CHANNEL_CAPACITY, labels, 75.0);
        assert_eq!(
            reporter.gauge(CHANNEL_CAPACITY, &[(CHANNEL_LABEL, SUB_CHANNEL)]),
            Some(75.0)
        );
        assert_eq!(
            reporter.gauge(CHANNEL_CAPACITY, &[(CHANNEL_LABEL, USER_PUSH_CHANNEL)]),
            None
        );
    }
}
