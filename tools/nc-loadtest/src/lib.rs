pub mod analysis;
pub mod archive;
pub mod collector;
pub mod config;
pub mod engine;
pub mod executor;
pub mod pool;
pub mod report;
pub mod scaffold;
pub mod suite;

use std::sync::Arc;
use std::time::Duration;

use netconf_session::{Connector, MockConnector, MockReply, SshConnector, TcpConnector};

pub use analysis::{Analysis, Filter};
pub use config::{Cli, Command, RunArgs, Transport};
pub use engine::{RunOptions, RunReport, Runner};
pub use report::{ResultRecord, RunSummary};
pub use suite::{HostConfig, SuiteDefinition};

pub async fn run_load_test(
    suite: SuiteDefinition,
    connector: Arc<dyn Connector>,
    options: RunOptions,
) -> anyhow::Result<RunReport> {
    engine::run(suite, connector, options).await
}

/// simulated round trip of the in-process device used by `--dry-run`
pub const DRY_RUN_LATENCY: Duration = Duration::from_millis(2);

/// The transport a `run` drives: a scripted mock device for dry runs, otherwise NETCONF
/// over the selected [`Transport`].
pub fn connector(args: &RunArgs) -> Arc<dyn Connector> {
    if args.dry_run {
        return Arc::new(
            MockConnector::new()
                .reply(MockReply::Data("<data/>".to_owned()))
                .latency(DRY_RUN_LATENCY),
        );
    }
    match args.transport {
        Transport::Ssh => Arc::new(SshConnector::new().with_timeout(args.connect_timeout())),
        Transport::Tcp => Arc::new(TcpConnector::new().with_timeout(args.connect_timeout())),
    }
}
