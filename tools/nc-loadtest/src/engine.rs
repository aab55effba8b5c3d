use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use netconf_session::Connector;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collector::ResultCollector;
use crate::executor::{ActionError, ActionExecutor};
use crate::pool::{ConnectError, ConnectionPool};
use crate::report::{ClientState, ClientSummary, ResultRecord, RunSummary};
use crate::suite::{Action, SuiteDefinition};

pub const DEFAULT_CHANNEL_SIZE: usize = 1_024;
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);
/// how often `run` logs client progress
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// deadline per request/reply, `None` leaves it to the transport
    pub call_timeout: Option<Duration>,
    pub channel_size: usize,
    /// stops clients between actions, results already produced are still delivered
    pub cancel: CancellationToken,
    /// how long an in-flight handshake or call may keep running after `cancel`
    pub cancel_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            call_timeout: None,
            channel_size: DEFAULT_CHANNEL_SIZE,
            cancel: CancellationToken::new(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    /// arrival order
    pub records: Vec<ResultRecord>,
    pub clients: Vec<ClientSummary>,
    pub summary: RunSummary,
}

/// Drives `clientCount` concurrent clients over the suite. Owns the connection pool for
/// the duration of the run.
#[derive(Debug)]
pub struct Runner {
    suite: Arc<SuiteDefinition>,
    pool: Arc<ConnectionPool>,
    options: RunOptions,
    states: Arc<watch::Sender<Vec<ClientState>>>,
}

impl Runner {
    pub fn new(suite: SuiteDefinition, connector: Arc<dyn Connector>, options: RunOptions) -> Self {
        let (states, _) = watch::channel(vec![ClientState::Pending; suite.client_count]);
        Self {
            suite: Arc::new(suite),
            pool: Arc::new(ConnectionPool::new(connector)),
            options,
            states: Arc::new(states),
        }
    }

    /// Live state of every client, indexed by client id. The channel closes once the
    /// run has been torn down.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ClientState>> {
        self.states.subscribe()
    }

    /// Start every client and return the result stream. The stream ends once all clients
    /// have finished and the pool has been torn down; the handle yields per-client
    /// summaries ordered by client id.
    pub fn start(self) -> (mpsc::Receiver<ResultRecord>, JoinHandle<Result<Vec<ClientSummary>>>) {
        let (tx, rx) = mpsc::channel(self.options.channel_size.max(1));
        let handle = tokio::spawn(self.drive(tx));
        (rx, handle)
    }

    async fn drive(self, tx: mpsc::Sender<ResultRecord>) -> Result<Vec<ClientSummary>> {
        let started = Instant::now();
        let executor = Arc::new(
            ActionExecutor::new(Arc::clone(&self.pool), started)
                .with_call_timeout(self.options.call_timeout)
                .with_cancel(self.options.cancel.clone(), self.options.cancel_grace),
        );
        let start_times = (0..self.suite.client_count)
            .map(|client_id| {
                self.suite
                    .start_offset(client_id)
                    .and_then(|offset| started.checked_add(offset))
            })
            .collect::<Option<Vec<_>>>()
            .context("client start times overflow, lower `rampup` or `clients`")?;
        info!(
            clients = self.suite.client_count,
            iterations = self.suite.iteration_count,
            rampup = self.suite.rampup_seconds,
            "starting suite"
        );

        let mut tasks = JoinSet::new();
        for (client_id, start_at) in start_times.into_iter().enumerate() {
            let client = Client {
                id: client_id,
                start_at,
                suite: Arc::clone(&self.suite),
                executor: Arc::clone(&executor),
                tx: tx.clone(),
                cancel: self.options.cancel.clone(),
                states: Arc::clone(&self.states),
            };
            tasks.spawn(client.run());
        }

        let mut clients = Vec::with_capacity(self.suite.client_count);
        let mut joined = Ok(());
        while let Some(result) = tasks.join_next().await {
            match result.context("client task join failed") {
                Ok(summary) => clients.push(summary),
                Err(err) => joined = Err(err),
            }
        }
        self.pool.close_all().await;
        // last sender, the collector sees the end of the stream only after teardown
        drop(tx);
        joined?;

        clients.sort_by_key(|client| client.client_id);
        info!(elapsed = ?started.elapsed(), "suite finished");
        Ok(clients)
    }
}

struct Client {
    id: usize,
    start_at: Instant,
    suite: Arc<SuiteDefinition>,
    executor: Arc<ActionExecutor>,
    tx: mpsc::Sender<ResultRecord>,
    cancel: CancellationToken,
    states: Arc<watch::Sender<Vec<ClientState>>>,
}

impl Client {
    async fn run(self) -> ClientSummary {
        let mut summary = ClientSummary {
            client_id: self.id,
            state: ClientState::Pending,
            actions: 0,
            errors: 0,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return self.finish(summary, ClientState::Cancelled);
            }
            _ = tokio::time::sleep_until(self.start_at) => {}
        }
        info!(client_id = self.id, "client started");

        for iteration in 0..self.suite.iteration_count {
            for (block, actions) in self.suite.blocks.iter().enumerate() {
                for (action, step) in actions.actions.iter().enumerate() {
                    if self.cancel.is_cancelled() {
                        debug!(client_id = self.id, state = ?summary.state, "client cancelled");
                        return self.finish(summary, ClientState::Cancelled);
                    }
                    self.publish(&mut summary, ClientState::Running {
                        iteration,
                        block,
                        action,
                    });

                    match step {
                        Action::Netconf(call) => {
                            let record = match self.suite.host(&call.hostname) {
                                Some(host) => self.executor.execute(self.id, call, host).await,
                                None => self.executor.failed(
                                    self.id,
                                    call,
                                    ActionError::Connect(ConnectError::UnknownHost(
                                        call.hostname.clone(),
                                    )),
                                ),
                            };
                            summary.actions += 1;
                            if record.is_error() {
                                summary.errors += 1;
                            }
                            if self.tx.send(record).await.is_err() {
                                debug!(client_id = self.id, "result stream dropped");
                            }
                        }
                        Action::Sleep(pause) => {
                            tokio::select! {
                                _ = self.cancel.cancelled() => {}
                                _ = tokio::time::sleep(pause.duration()) => {}
                            }
                        }
                    }
                }
            }
        }

        debug!(client_id = self.id, actions = summary.actions, errors = summary.errors, "client completed");
        self.finish(summary, ClientState::Completed)
    }

    fn publish(&self, summary: &mut ClientSummary, state: ClientState) {
        summary.state = state;
        self.states.send_modify(|states| {
            if let Some(slot) = states.get_mut(self.id) {
                *slot = state;
            }
        });
    }

    fn finish(&self, mut summary: ClientSummary, state: ClientState) -> ClientSummary {
        self.publish(&mut summary, state);
        summary
    }
}

/// Log how many clients are in each state until the run is torn down
async fn log_progress(mut states: watch::Receiver<Vec<ClientState>>) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    // the first tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if states.has_changed().is_err() {
            break;
        }
        let (mut pending, mut running, mut completed, mut cancelled) = (0, 0, 0, 0);
        for state in states.borrow_and_update().iter() {
            match state {
                ClientState::Pending => pending += 1,
                ClientState::Running { .. } => running += 1,
                ClientState::Completed => completed += 1,
                ClientState::Cancelled => cancelled += 1,
            }
        }
        info!(pending, running, completed, cancelled, "progress");
    }
}

/// Run the suite to completion and collect every record
pub async fn run(
    suite: SuiteDefinition,
    connector: Arc<dyn Connector>,
    options: RunOptions,
) -> Result<RunReport> {
    let cancel = options.cancel.clone();
    let snapshot = suite.clone();
    let runner = Runner::new(suite, connector, options);
    let progress = tokio::spawn(log_progress(runner.subscribe()));
    let (rx, handle) = runner.start();

    let records = ResultCollector::new(rx).collect().await;
    let clients = handle.await.context("runner task join failed");
    progress.abort();
    let clients = clients??;
    let summary = RunSummary::new(&snapshot, &records, cancel.is_cancelled());

    Ok(RunReport {
        records,
        clients,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use netconf_session::{MockConnector, MockReply};
    use tracing_test::traced_test;

    use super::{RunOptions, Runner, run};
    use crate::collector::ResultCollector;
    use crate::report::{ClientState, ErrorKind};
    use crate::suite::SuiteDefinition;

    fn suite(clients: usize, iterations: usize, rampup: u64, reuse: bool) -> SuiteDefinition {
        SuiteDefinition::parse_str(format!(
            r#"
iterations: {iterations}
clients: {clients}
rampup: {rampup}
configs:
  - {{hostname: r1, reuseconnection: {reuse}}}
  - {{hostname: r2, reuseconnection: {reuse}}}
blocks:
  - actions:
      - netconf: {{hostname: r1, operation: get}}
      - sleep: {{duration: 1}}
      - netconf: {{hostname: r2, operation: get-config}}
  - actions:
      - netconf: {{hostname: r1, operation: edit-config, config: <system/>}}
"#
        ))
        .expect("suite")
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn every_protocol_action_yields_one_record() {
        let connector = MockConnector::new();
        let report = run(suite(3, 4, 0, true), Arc::new(connector.clone()), RunOptions::default())
            .await
            .expect("run");

        // 3 clients * 4 iterations * 3 protocol actions, sleeps emit nothing
        assert_eq!(report.records.len(), 36);
        assert_eq!(report.summary.errors, 0);
        assert!(report.clients.iter().all(|c| c.state == ClientState::Completed));
        assert_eq!(report.clients.iter().map(|c| c.actions).sum::<usize>(), 36);

        // one session per (client, host), all closed at teardown
        assert_eq!(connector.handshakes(), 6);
        assert_eq!(connector.closes(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn per_client_order_is_script_order() {
        let report = run(suite(2, 2, 0, false), Arc::new(MockConnector::new()), RunOptions::default())
            .await
            .expect("run");

        for client in 0..2 {
            let ops = report
                .records
                .iter()
                .filter(|r| r.client_id == client)
                .map(|r| r.operation.as_str())
                .collect::<Vec<_>>();
            assert_eq!(
                ops,
                ["get", "get-config", "edit-config", "get", "get-config", "edit-config"]
            );
            let whens = report
                .records
                .iter()
                .filter(|r| r.client_id == client)
                .map(|r| r.when_millis)
                .collect::<Vec<_>>();
            assert!(whens.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rampup_staggers_clients() {
        let report = run(suite(3, 1, 2, true), Arc::new(MockConnector::new()), RunOptions::default())
            .await
            .expect("run");

        let first_when = |client: usize| {
            report
                .records
                .iter()
                .find(|r| r.client_id == client)
                .map(|r| r.when_millis)
                .expect("client produced a record")
        };
        let base = first_when(0);
        for client in 1..3 {
            let offset = first_when(client) - base;
            let expected = client as f64 * 2000.0;
            assert!((offset - expected).abs() < 50.0, "client {client} offset {offset}");
        }
        // the last client starts at 4s and sleeps 1s once
        assert!(report.summary.execution_time() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_never_stop_siblings() {
        let connector = MockConnector::new()
            .reply_for("r2", MockReply::RpcError("denied".to_owned()))
            .refuse("r1");
        let report = run(suite(2, 3, 0, true), Arc::new(connector), RunOptions::default())
            .await
            .expect("run");

        assert_eq!(report.records.len(), 18);
        assert_eq!(report.summary.errors, 18);
        assert!(report.clients.iter().all(|c| c.state == ClientState::Completed));
        assert!(report.clients.iter().all(|c| c.errors == 9));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_actions_keeps_results() {
        let connector = MockConnector::new();
        let options = RunOptions::default();
        let cancel = options.cancel.clone();
        tokio::spawn(async move {
            // inside the first pause of every client
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });

        let report = run(suite(2, 10, 0, true), Arc::new(connector.clone()), options)
            .await
            .expect("run");

        assert!(report.summary.cancelled);
        assert_eq!(report.records.len(), 2);
        assert!(report.clients.iter().all(|c| c.state == ClientState::Cancelled));
        // pooled sessions are still torn down
        assert_eq!(connector.closes(), connector.handshakes());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn cancel_during_hung_call_still_tears_down() {
        for reuse in [true, false] {
            let connector = MockConnector::new().reply(MockReply::Hang);
            let options = RunOptions::default();
            let cancel = options.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });

            let report = tokio::time::timeout(
                Duration::from_secs(3600),
                run(suite(1, 1, 0, reuse), Arc::new(connector.clone()), options),
            )
            .await
            .expect("run finishes after cancel")
            .expect("run");

            assert!(report.summary.cancelled);
            // the hung call is flushed as a timeout record
            assert_eq!(report.records.len(), 1, "reuse {reuse}");
            assert_eq!(report.records[0].error_kind, Some(ErrorKind::Timeout));
            assert_eq!(report.clients[0].state, ClientState::Cancelled);
            assert_eq!(connector.handshakes(), 1);
            assert_eq!(connector.closes(), 1, "reuse {reuse}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_rampup_fails_without_panicking() {
        let mut suite = suite(2, 1, 0, true);
        // bypasses validation on purpose
        suite.rampup_seconds = u64::MAX;
        let err = run(suite, Arc::new(MockConnector::new()), RunOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("rampup"), "{err:#}");
    }

    #[tokio::test(start_paused = true)]
    async fn client_states_are_observable() {
        let connector = MockConnector::new().latency(Duration::from_secs(1));
        let runner = Runner::new(suite(2, 1, 10, true), Arc::new(connector), RunOptions::default());
        let mut states = runner.subscribe();
        assert_eq!(*states.borrow(), [ClientState::Pending, ClientState::Pending]);

        let (rx, handle) = runner.start();
        let collector = tokio::spawn(ResultCollector::new(rx).collect());

        // client 0 is inside its first call, client 1 waits out the rampup
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            *states.borrow_and_update(),
            [
                ClientState::Running {
                    iteration: 0,
                    block: 0,
                    action: 0,
                },
                ClientState::Pending,
            ]
        );

        let clients = handle.await.expect("join").expect("run");
        assert_eq!(collector.await.expect("join").len(), 6);
        assert!(clients.iter().all(|c| c.state == ClientState::Completed));
        assert_eq!(
            *states.borrow_and_update(),
            [ClientState::Completed, ClientState::Completed]
        );
        // the run is over, nothing publishes any more
        assert!(states.changed().await.is_err());
    }
}
