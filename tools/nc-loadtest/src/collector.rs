use tokio::sync::mpsc;
use tracing::debug;

use crate::report::ResultRecord;

/// Drains the result stream of a run
#[derive(Debug)]
pub struct ResultCollector {
    rx: mpsc::Receiver<ResultRecord>,
}

impl ResultCollector {
    pub fn new(rx: mpsc::Receiver<ResultRecord>) -> Self {
        Self { rx }
    }

    /// Every record in arrival order, returns once all producers are gone
    pub async fn collect(mut self) -> Vec<ResultRecord> {
        let mut records = Vec::new();
        while let Some(record) = self.rx.recv().await {
            records.push(record);
        }
        debug!(records = records.len(), "result stream closed");
        records
    }
}
