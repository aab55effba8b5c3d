use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::Analysis;
use crate::suite::SuiteDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    SessionExpired,
    Serialization,
    RemoteSessionClosed,
    Timeout,
    Protocol,
    ResponseMismatch,
    Pattern,
}

/// Outcome of one protocol action. `error_text` is empty exactly when the call succeeded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultRecord {
    pub client_id: usize,
    pub hostname: String,
    pub operation: String,
    pub session_id: u64,
    /// ms since suite start when the record was emitted
    pub when_millis: f64,
    /// round trip of the call only, handshakes excluded
    pub latency_millis: f64,
    pub message_id: String,
    pub error_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ResultRecord {
    pub fn new(client_id: usize, hostname: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            client_id,
            hostname: hostname.into(),
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error_text.is_empty()
    }
}

/// per-client bookkeeping returned when a client task ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub client_id: usize,
    pub state: ClientState,
    pub actions: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Pending,
    Running {
        iteration: usize,
        block: usize,
        action: usize,
    },
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub clients: usize,
    pub iterations: usize,
    pub rampup_seconds: u64,
    pub requests: usize,
    pub errors: usize,
    /// largest `when_millis`, i.e. when the last action finished
    pub execution_time_ms: f64,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(suite: &SuiteDefinition, records: &[ResultRecord], cancelled: bool) -> Self {
        Self {
            clients: suite.client_count,
            iterations: suite.iteration_count,
            rampup_seconds: suite.rampup_seconds,
            requests: records.len(),
            errors: records.iter().filter(|r| r.is_error()).count(),
            execution_time_ms: execution_time_ms(records),
            cancelled,
        }
    }

    pub fn execution_time(&self) -> Duration {
        Duration::from_secs_f64(self.execution_time_ms.max(0.0) / 1000.0)
    }

    pub fn human_summary(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(
            output,
            "{} client(s) started, {} iterations per client, {} seconds wait between starting each client",
            self.clients, self.iterations, self.rampup_seconds
        );
        let _ = writeln!(
            output,
            "Total execution time: {:?}, Suite execution contained {} errors ({} requests){}",
            self.execution_time(),
            self.errors,
            self.requests,
            if self.cancelled { ", run was interrupted" } else { "" }
        );
        output
    }
}

pub fn execution_time_ms(records: &[ResultRecord]) -> f64 {
    records.iter().map(|r| r.when_millis).fold(0.0, f64::max)
}

pub const TABLE_HEADER: [&str; 8] = [
    "Host",
    "Operation",
    "ReuseConnection",
    "Requests",
    "TPS",
    "Mean",
    "Variance",
    "StdDeviation",
];

/// left aligned, space separated table with one row per (host, operation)
pub fn render_table(analysis: &Analysis) -> String {
    let rows = analysis
        .rows
        .iter()
        .map(|row| {
            [
                row.host.clone(),
                row.operation.clone(),
                row.reuse_connection.to_string(),
                row.requests.to_string(),
                format!("{:.2}", row.tps),
                format!("{:.2}", row.mean),
                format!("{:.2}", row.variance),
                format!("{:.2}", row.stddev),
            ]
        })
        .collect::<Vec<_>>();

    let mut widths = TABLE_HEADER.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut output = String::new();
    push_row(&mut output, &widths, TABLE_HEADER.iter().copied());
    for row in &rows {
        push_row(&mut output, &widths, row.iter().map(String::as_str));
    }
    output
}

fn push_row<'a>(output: &mut String, widths: &[usize], cells: impl Iterator<Item = &'a str>) {
    let line = cells
        .zip(widths.iter().copied())
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    output.push_str(line.trim_end());
    output.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{self, Filter};
    use crate::suite::SuiteDefinition;

    fn record(host: &str, op: &str, latency: f64, when: f64, err: &str) -> ResultRecord {
        ResultRecord {
            latency_millis: latency,
            when_millis: when,
            error_text: err.to_owned(),
            ..ResultRecord::new(0, host, op)
        }
    }

    #[test]
    fn summary_counts_and_execution_time() {
        let suite = SuiteDefinition::parse_str("iterations: 2\nclients: 3\nrampup: 1\n").unwrap();
        let records = [
            record("a", "get", 10.0, 1500.0, ""),
            record("a", "get", 10.0, 2500.0, "boom"),
            record("b", "get", 10.0, 900.0, ""),
        ];
        let summary = RunSummary::new(&suite, &records, false);
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.execution_time(), Duration::from_millis(2500));

        let text = summary.human_summary();
        assert!(text.contains("3 client(s) started, 2 iterations per client, 1 seconds wait"));
        assert!(text.contains("contained 1 errors"));
    }

    #[test]
    fn table_layout() {
        let suite = SuiteDefinition::parse_str(
            "iterations: 1\nclients: 1\nconfigs:\n  - {hostname: a, reuseconnection: true}\n",
        )
        .unwrap();
        let records = [
            record("a", "get", 100.0, 1.0, ""),
            record("a", "get", 200.0, 2.0, ""),
            record("a", "get", 300.0, 3.0, ""),
        ];
        let analysis = analysis::analyze(&records, &suite.host_configs, &Filter::default());
        let table = render_table(&analysis);
        let lines = table.lines().collect::<Vec<_>>();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Host  Operation  ReuseConnection  Requests"));
        let cells = lines[1].split_whitespace().collect::<Vec<_>>();
        assert_eq!(
            cells,
            ["a", "get", "true", "3", "5.00", "200.00", "6666.67", "81.65"]
        );
    }

    #[test]
    fn error_kind_is_omitted_on_success() {
        let ok = serde_json::to_string(&ResultRecord::new(1, "a", "get")).unwrap();
        assert!(!ok.contains("error_kind"));

        let failed = ResultRecord {
            error_kind: Some(ErrorKind::RemoteSessionClosed),
            error_text: "session closed by remote side".to_owned(),
            ..ResultRecord::new(1, "a", "get")
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains(r#""error_kind":"remote_session_closed""#));
    }
}
