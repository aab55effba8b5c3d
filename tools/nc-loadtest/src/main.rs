use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use jiff::Timestamp;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nc_loadtest::analysis::{self, Filter};
use nc_loadtest::archive::{self, ArchivedRun};
use nc_loadtest::config::{AnalyseArgs, InitArgs, trace};
use nc_loadtest::report::render_table;
use nc_loadtest::{Cli, Command, RunArgs, RunOptions, SuiteDefinition, run_load_test, scaffold};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = trace::init(&cli.log, cli.log_format) {
        eprintln!("failed to install logger: {err:#}");
        return ExitCode::from(2);
    }
    debug!(?cli);

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Analyse(args) => analyse(args),
        Command::Init(args) => init(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let suite = match SuiteDefinition::load(&args.suite) {
        Ok(suite) => suite,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return Ok(ExitCode::from(2));
        }
    };

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    let executed_at = Timestamp::now();
    let options = RunOptions {
        call_timeout: args.call_timeout(),
        cancel: token,
        ..RunOptions::default()
    };
    let report = run_load_test(suite.clone(), nc_loadtest::connector(&args), options)
        .await
        .context("run failed")?;

    let run = ArchivedRun {
        executed_at,
        summary: report.summary,
        records: report.records,
    };
    if !args.no_archive {
        archive::store(&args.results_dir, &suite, &run)?;
    }
    print_report(&suite, &run, &Filter::default(), args.json)?;
    Ok(ExitCode::SUCCESS)
}

fn analyse(args: AnalyseArgs) -> Result<ExitCode> {
    let archive = archive::load(&args.dir)?;
    info!(executed_at = %archive.run.executed_at, "suite executed at");
    info!(hosts = ?archive.suite.hostnames(), "hosts");
    let filter = Filter {
        operation: args.operation,
        hostname: args.hostname,
    };
    print_report(&archive.suite, &archive.run, &filter, args.json)?;
    Ok(ExitCode::SUCCESS)
}

fn init(args: InitArgs) -> Result<ExitCode> {
    let path = scaffold::init(&args.dir)?;
    println!("created {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn print_report(suite: &SuiteDefinition, run: &ArchivedRun, filter: &Filter, json: bool) -> Result<()> {
    let analysis = analysis::analyze(&run.records, &suite.host_configs, filter);
    if json {
        let output = json!({
            "executed_at": run.executed_at,
            "summary": run.summary,
            "rows": analysis.rows,
        });
        let output = serde_json::to_string_pretty(&output).context("failed to serialize report")?;
        println!("{output}");
    } else {
        print!("{}", run.summary.human_summary());
        println!();
        print!("{}", render_table(&analysis));
    }
    if run.summary.cancelled {
        warn!("run was interrupted, results are partial");
    }
    Ok(())
}

/// exit status after a second interrupt, 128 + SIGINT
const FORCED_EXIT: i32 = 130;

/// First interrupt stops the clients and lets the run flush its results, a second one
/// exits immediately.
async fn shutdown_signal(token: CancellationToken) {
    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to listen for interrupts");
        return;
    }
    info!("interrupt received, stopping clients, interrupt again to exit now");
    token.cancel();

    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to listen for interrupts");
        return;
    }
    warn!("second interrupt, exiting without saving results");
    std::process::exit(FORCED_EXIT);
}
