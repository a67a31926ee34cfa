//! Prometheus bridge for driver statistics.
//!
//! [`MetricsBridge`] turns one [`Stats`](crate::stats::Stats) snapshot into
//! nine unlabelled gauges. Metric names are part of the scrape contract and
//! must stay stable:
//!
//! ```text
//! <prefix>mgo_cluster
//! <prefix>mgo_master_conn
//! <prefix>mgo_slave_conn
//! <prefix>mgo_sent_op
//! <prefix>mgo_received_op
//! <prefix>mgo_received_doc
//! <prefix>mgo_sockets_alive
//! <prefix>mgo_sockets_in_use
//! <prefix>mgo_socket_ref
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, Opts};

use crate::error::Result;
use crate::stats::StatsSource;

/// Separator between prefix parts and the metric name.
pub const SEPARATOR: char = '_';

/// Metric name suffixes and help texts, in export order.
pub const METRICS: [(&str, &str); 9] = [
    ("mgo_cluster", "Mgo Cluster from stats"),
    ("mgo_master_conn", "Mgo Master Conn from stats"),
    ("mgo_slave_conn", "Mgo Slave Conn from stats"),
    ("mgo_sent_op", "Mgo sent op from stats"),
    ("mgo_received_op", "Mgo received op from stats"),
    ("mgo_received_doc", "Mgo received doc from stats"),
    ("mgo_sockets_alive", "Mgo sockets alive from stats"),
    ("mgo_sockets_in_use", "Mgo sockets in use from stats"),
    ("mgo_socket_ref", "Mgo socket ref from stats"),
];

/// Compute the metric name prefix for a namespace and subsystem.
///
/// Non-empty parts are joined with `_`, runs of `_` collapse into one and the
/// result ends with exactly one `_`. So `("app_", "db")` and `("app", "db")`
/// both give `app_db_`, and `("_", "")` gives `_`. The prefix is empty only
/// when both parts are.
#[must_use]
pub fn metric_prefix(namespace: &str, subsystem: &str) -> String {
    let mut prefix = String::with_capacity(namespace.len() + subsystem.len() + 2);

    for part in [namespace, subsystem].into_iter().filter(|p| !p.is_empty()) {
        if !prefix.is_empty() && !prefix.ends_with(SEPARATOR) {
            prefix.push(SEPARATOR);
        }
        for c in part.chars() {
            if c == SEPARATOR && prefix.ends_with(SEPARATOR) {
                continue;
            }
            prefix.push(c);
        }
    }

    if !prefix.is_empty() && !prefix.ends_with(SEPARATOR) {
        prefix.push(SEPARATOR);
    }
    prefix
}

/// Exports driver statistics as Prometheus gauges.
///
/// Cloning is cheap and clones share the same descriptors, which is what
/// [`prometheus::Registry::unregister`] matches on.
#[derive(Clone)]
pub struct MetricsBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    prefix: String,
    gauges: Vec<Gauge>,
    source: Arc<dyn StatsSource>,
    /// Serializes set-then-collect so concurrent scrapes see one snapshot each.
    collect_lock: Mutex<()>,
}

impl MetricsBridge {
    /// Build the bridge and its nine descriptors.
    ///
    /// Fails when the prefix makes an invalid metric name.
    pub fn new(
        namespace: &str,
        subsystem: &str,
        source: Arc<dyn StatsSource>,
    ) -> Result<Self> {
        let prefix = metric_prefix(namespace, subsystem);

        let mut gauges = Vec::with_capacity(METRICS.len());
        for (suffix, help) in METRICS {
            let name = format!("{prefix}{suffix}");
            gauges.push(Gauge::with_opts(Opts::new(name, help))?);
        }

        tracing::debug!(prefix = %prefix, "metrics bridge created");

        Ok(Self {
            inner: Arc::new(BridgeInner {
                prefix,
                gauges,
                source,
                collect_lock: Mutex::new(()),
            }),
        })
    }

    /// The computed name prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// The nine descriptors, in export order.
    ///
    /// Every call starts a fresh iterator over the same descriptors.
    pub fn describe(&self) -> impl Iterator<Item = &Desc> + '_ {
        self.inner.gauges.iter().flat_map(|gauge| gauge.desc())
    }

    /// Fully-qualified metric names, in export order.
    #[must_use]
    pub fn metric_names(&self) -> Vec<&str> {
        self.describe().map(|desc| desc.fq_name.as_str()).collect()
    }
}

impl Collector for MetricsBridge {
    fn desc(&self) -> Vec<&Desc> {
        self.describe().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _guard = self.inner.collect_lock.lock();
        let stats = self.inner.source.snapshot();

        self.inner
            .gauges
            .iter()
            .zip(stats.values())
            .flat_map(|(gauge, value)| {
                gauge.set(value as f64);
                gauge.collect()
            })
            .collect()
    }
}

impl std::fmt::Debug for MetricsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsBridge")
            .field("prefix", &self.inner.prefix)
            .field("metrics", &self.inner.gauges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::stats::DriverStats;
    use prometheus::{Encoder, TextEncoder};
    use proptest::prelude::*;

    fn bridge(namespace: &str, subsystem: &str) -> (MetricsBridge, Arc<DriverStats>) {
        let stats = Arc::new(DriverStats::new());
        let bridge = MetricsBridge::new(namespace, subsystem, stats.clone()).unwrap();
        (bridge, stats)
    }

    /// Render collected families and return `(name, value)` pairs in order.
    fn samples(families: &[MetricFamily]) -> Vec<(String, f64)> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(families, &mut buf).unwrap();
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .filter(|line| !line.starts_with('#'))
            .map(|line| {
                let (name, value) = line.split_once(' ').unwrap();
                (name.to_string(), value.parse().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_prefix_examples() {
        assert_eq!(metric_prefix("app", "db"), "app_db_");
        assert_eq!(metric_prefix("app", ""), "app_");
        assert_eq!(metric_prefix("", "db"), "db_");
        assert_eq!(metric_prefix("", ""), "");
        assert_eq!(metric_prefix("app_", "db"), "app_db_");
        assert_eq!(metric_prefix("app", "db_"), "app_db_");
        assert_eq!(metric_prefix("app", "_db"), "app_db_");
    }

    #[test]
    fn test_prefix_separator_runs() {
        assert_eq!(metric_prefix("_", ""), "_");
        assert_eq!(metric_prefix("", "__"), "_");
        assert_eq!(metric_prefix("_", "_"), "_");
        assert_eq!(metric_prefix("a__b", "db"), "a_b_db_");
        assert_eq!(metric_prefix("app__", "__db__"), "app_db_");
    }

    #[test]
    fn test_separator_only_namespace_builds_valid_names() {
        let (underscored, _) = bridge("_", "");
        assert_eq!(underscored.prefix(), "_");
        assert_eq!(underscored.metric_names()[0], "_mgo_cluster");
    }

    #[test]
    fn test_metric_names() {
        let (named, _) = bridge("app", "db");
        assert_eq!(named.prefix(), "app_db_");
        assert_eq!(
            named.metric_names(),
            vec![
                "app_db_mgo_cluster",
                "app_db_mgo_master_conn",
                "app_db_mgo_slave_conn",
                "app_db_mgo_sent_op",
                "app_db_mgo_received_op",
                "app_db_mgo_received_doc",
                "app_db_mgo_sockets_alive",
                "app_db_mgo_sockets_in_use",
                "app_db_mgo_socket_ref",
            ]
        );

        let (bare, _) = bridge("", "");
        assert_eq!(bare.metric_names()[0], "mgo_cluster");
    }

    #[test]
    fn test_help_texts() {
        let (bridge, _) = bridge("", "");
        let helps: Vec<_> = bridge.describe().map(|d| d.help.clone()).collect();
        assert_eq!(helps[0], "Mgo Cluster from stats");
        assert_eq!(helps[8], "Mgo socket ref from stats");
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let stats = Arc::new(DriverStats::new());
        let result = MetricsBridge::new("my-app", "", stats);
        assert!(matches!(result, Err(crate::Error::Metrics(_))));
    }

    #[test]
    fn test_describe_is_stable_across_collections() {
        let (bridge, stats) = bridge("svc", "");
        let before: Vec<_> = bridge.describe().map(|d| d.id).collect();
        assert_eq!(before.len(), 9);

        stats.cluster_opened();
        let _ = Collector::collect(&bridge);
        let _ = Collector::collect(&bridge);

        let after: Vec<_> = bridge.describe().map(|d| d.id).collect();
        assert_eq!(before, after);
        assert_eq!(Collector::desc(&bridge).len(), 9);
    }

    #[test]
    fn test_collect_values_in_describe_order() {
        let (bridge, stats) = bridge("app", "db");
        stats.cluster_opened();
        stats.socket_opened(true);
        stats.socket_opened(false);
        stats.socket_requested();
        stats.socket_acquired();
        stats.op_sent();
        stats.op_sent();
        stats.op_received(42);

        let families = Collector::collect(&bridge);
        assert_eq!(families.len(), 9);

        let samples = samples(&families);
        let names: Vec<_> = samples.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, bridge.metric_names());

        let values: Vec<_> = samples.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1.0, 1.0, 1.0, 2.0, 1.0, 42.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_collect_reads_fresh_snapshot() {
        let (bridge, stats) = bridge("", "");
        assert_eq!(samples(&Collector::collect(&bridge))[3].1, 0.0);

        stats.op_sent();
        assert_eq!(samples(&Collector::collect(&bridge))[3].1, 1.0);
    }

    #[test]
    fn test_register_with_registry() {
        let (bridge, stats) = bridge("app", "");
        let registry = prometheus::Registry::new();
        registry.register(Box::new(bridge.clone())).unwrap();

        stats.cluster_opened();
        let gathered = registry.gather();
        assert_eq!(gathered.len(), 9);

        let samples = samples(&gathered);
        assert!(samples.contains(&("app_mgo_cluster".to_string(), 1.0)));

        registry.unregister(Box::new(bridge)).unwrap();
        assert!(registry.gather().is_empty());
    }

    fn part() -> impl Strategy<Value = String> {
        "[a-z_]{0,8}"
    }

    proptest! {
        #[test]
        fn prop_prefix_never_doubles_separator(ns in part(), sub in part()) {
            let prefix = metric_prefix(&ns, &sub);
            prop_assert!(!prefix.contains("__"));
            prop_assert_eq!(prefix.is_empty(), ns.is_empty() && sub.is_empty());
            if !prefix.is_empty() {
                prop_assert!(prefix.ends_with('_'));
            }
        }
    }
}
