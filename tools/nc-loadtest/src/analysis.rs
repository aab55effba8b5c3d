//! Latency statistics over a captured result set.
//!
//! Error records are counted but never contribute latencies. Rows are grouped per
//! (host, operation) and come out sorted by host, then operation.
use std::collections::BTreeMap;

use serde::Serialize;

use crate::report::{self, ResultRecord};
use crate::suite::{self, HostConfig};

/// exact-match restrictions applied to groups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub operation: Option<String>,
    pub hostname: Option<String>,
}

impl Filter {
    fn matches(&self, host: &str, operation: &str) -> bool {
        self.hostname.as_deref().is_none_or(|h| h == host)
            && self.operation.as_deref().is_none_or(|op| op == operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRow {
    pub host: String,
    pub operation: String,
    pub reuse_connection: bool,
    pub requests: usize,
    pub tps: f64,
    pub mean: f64,
    pub variance: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub rows: Vec<AnalysisRow>,
    pub error_count: usize,
    pub total_requests: usize,
    pub execution_time_ms: f64,
}

/// host -> operation -> latencies of successful calls
pub type LatencyGroups = BTreeMap<String, BTreeMap<String, Vec<f64>>>;

/// split records into the error count and per-group latencies
pub fn partition(results: &[ResultRecord]) -> (usize, LatencyGroups) {
    let mut errors = 0;
    let mut groups = LatencyGroups::new();
    for record in results {
        if record.is_error() {
            errors += 1;
            continue;
        }
        groups
            .entry(record.hostname.clone())
            .or_default()
            .entry(record.operation.clone())
            .or_default()
            .push(record.latency_millis);
    }
    (errors, groups)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub count: usize,
    pub tps: f64,
    pub mean: f64,
    /// population variance
    pub variance: f64,
    pub stddev: f64,
}

impl Stats {
    /// `None` for an empty sample
    pub fn compute(latencies: &[f64]) -> Option<Self> {
        if latencies.is_empty() {
            return None;
        }
        let count = latencies.len();
        let n = count as f64;
        let mean = latencies.iter().sum::<f64>() / n;
        let variance = latencies.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count,
            // a zero mean only happens with a clock that never ticked
            tps: if mean > 0.0 { 1000.0 / mean } else { 0.0 },
            mean,
            variance,
            stddev: variance.sqrt(),
        })
    }
}

pub fn analyze(results: &[ResultRecord], hosts: &[HostConfig], filter: &Filter) -> Analysis {
    let (error_count, groups) = partition(results);

    let mut rows = Vec::new();
    for (host, operations) in &groups {
        let reuse_connection = suite::reuse_connection(hosts, host);
        for (operation, latencies) in operations {
            if !filter.matches(host, operation) {
                continue;
            }
            let Some(stats) = Stats::compute(latencies) else {
                continue;
            };
            rows.push(AnalysisRow {
                host: host.clone(),
                operation: operation.clone(),
                reuse_connection,
                requests: stats.count,
                tps: stats.tps,
                mean: stats.mean,
                variance: stats.variance,
                stddev: stats.stddev,
            });
        }
    }

    Analysis {
        rows,
        error_count,
        total_requests: results.len(),
        execution_time_ms: report::execution_time_ms(results),
    }
}
