use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::archive::DEFAULT_RESULTS_DIR;

/// default log level, the `--log` flag or `NC_LOADTEST_LOG` env var override it
pub const DEFAULT_LOG: &str = "info";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "nc-loadtest",
    about = "Concurrent NETCONF load generator and latency analyser"
)]
pub struct Cli {
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[arg(long, global = true, env = "NC_LOADTEST_LOG", default_value = DEFAULT_LOG)]
    pub log: String,
    /// log as "standard" (unstructured), "json" or "pretty"
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Standard)]
    pub log_format: LogFormat,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a suite and archive its results
    Run(RunArgs),
    /// Print latency statistics for an archived run
    Analyse(AnalyseArgs),
    /// Create a directory holding a sample suite
    Init(InitArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// path to the suite yaml
    pub suite: PathBuf,
    /// runs are archived below this directory
    #[arg(long, default_value = DEFAULT_RESULTS_DIR)]
    pub results_dir: PathBuf,
    /// per-call reply deadline in milliseconds, unset waits for the transport
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// handshake deadline in milliseconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,
    /// "ssh" authenticates with each host's username and password, "tcp" speaks plain
    /// NETCONF and ignores the credentials
    #[arg(long, value_enum, default_value_t = Transport::Ssh)]
    pub transport: Transport,
    /// print the report as json
    #[arg(long)]
    pub json: bool,
    /// replay the suite against an in-process mock device
    #[arg(long)]
    pub dry_run: bool,
    /// skip writing the archive
    #[arg(long)]
    pub no_archive: bool,
}

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

impl RunArgs {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Args)]
pub struct AnalyseArgs {
    /// an archived run directory
    pub dir: PathBuf,
    /// only report this operation
    #[arg(short, long)]
    pub operation: Option<String>,
    /// only report this host
    #[arg(long)]
    pub hostname: Option<String>,
    /// print rows as json
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct InitArgs {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    Ssh,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Standard,
    Json,
    Pretty,
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use super::LogFormat;

    /// Install the global subscriber. Logs go to stderr so reports on stdout stay clean.
    pub fn init(log: &str, format: LogFormat) -> Result<()> {
        let filter = EnvFilter::try_new(log).or_else(|_| EnvFilter::try_new(super::DEFAULT_LOG))?;

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .try_init()?;
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .event_format(Format::default().pretty().with_source_location(false))
                            .fmt_fields(PrettyFields::new())
                            .with_writer(std::io::stderr),
                    )
                    .try_init()?;
            }
            LogFormat::Standard => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .try_init()?;
            }
        }
        Ok(())
    }
}
