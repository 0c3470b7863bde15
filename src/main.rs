use std::{io, path::Path, process::ExitCode, sync::Arc};

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;

use blockgraph::{
    cli::{BlockgraphExitCodes, Cli, Commands, LinePrompt, ProbeArgs},
    config::AgentConfig,
    inventory::StaticInventory,
    mounts::MountRegistry,
    prober::{ProbeIssue, ProbeMode, ProbeOutcome},
    BackgroundLog, Blockgraph, MultiLogger, BLOCKGRAPH_VERSION,
};
use blockgraph_api::{
    error::{BlockgraphError, BlockgraphResultExt, ErrorKind, InternalError, ReportError},
    storage_graph::graph::GraphSummary,
};
use osutils::dependencies::SystemRunner;

/// What `probe` prints.
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ProbeDocument<'a> {
    graph: GraphSummary<'a>,
    issues: &'a [ProbeIssue],
}

fn session(config: AgentConfig, source: Option<&ProbeArgs>) -> Blockgraph {
    match source.and_then(|source| source.inventory.as_ref()) {
        // A played back inventory must not mount anything.
        Some(_) => {
            Blockgraph::with_runner(config, Arc::new(SystemRunner), MountRegistry::playback())
        }
        None => Blockgraph::new(config),
    }
}

fn probe(
    blockgraph: &mut Blockgraph,
    source: &ProbeArgs,
) -> Result<ProbeOutcome, BlockgraphError> {
    let outcome = match &source.inventory {
        Some(path) => {
            let inventory = StaticInventory::load(path)?;
            blockgraph.probe(&inventory)
        }
        None => blockgraph.probe_live(),
    }
    .message("Failed to probe storage")?;

    for issue in &outcome.report.issues {
        warn!(
            "Skipped '{}' in pass {}: {}",
            issue.device, issue.pass, issue.message
        );
    }
    Ok(outcome)
}

fn write_output(output: Option<&Path>, contents: &str) -> Result<(), BlockgraphError> {
    match output {
        Some(path) => std::fs::write(path, contents)
            .structured(InternalError::Internal("Failed to write output file")),
        None => {
            print!("{contents}");
            Ok(())
        }
    }
}

fn run(args: &Cli, mut config: AgentConfig) -> Result<BlockgraphExitCodes, BlockgraphError> {
    info!("blockgraph version: {BLOCKGRAPH_VERSION}");

    let source = match &args.command {
        Commands::Probe { source, .. } | Commands::Check { source } => Some(source),
        Commands::Activate | Commands::Deactivate => None,
    };
    if source.is_some_and(|source| source.best_effort) {
        config.probe.mode = ProbeMode::BestEffort;
    }
    let mut blockgraph = session(config, source);

    match &args.command {
        Commands::Probe { source, output } => {
            let outcome = probe(&mut blockgraph, source)?;
            let document = ProbeDocument {
                graph: outcome.graph.summary(),
                issues: &outcome.report.issues,
            };
            let yaml = serde_yaml::to_string(&document)
                .structured(InternalError::Internal("Failed to serialize device graph"))?;
            write_output(output.as_deref(), &yaml)?;
        }

        Commands::Check { source } => {
            let outcome = probe(&mut blockgraph, source)?;
            match Blockgraph::check(&outcome.graph) {
                Ok(()) => info!("Device graph passed all checks"),
                Err(e) if matches!(e.kind(), ErrorKind::Validation(_)) => {
                    error!("{}", e.kind());
                    return Ok(BlockgraphExitCodes::CheckFailed);
                }
                Err(e) => return Err(e),
            }
        }

        Commands::Activate => {
            let inventory = blockgraph.live_inventory();
            let mut prompt = LinePrompt::new(io::stdin().lock(), io::stderr());
            let report = blockgraph
                .activate(&inventory, &mut prompt)
                .message("Failed to activate storage")?;
            let yaml = serde_yaml::to_string(&report)
                .structured(InternalError::Internal("Failed to serialize activation report"))?;
            write_output(None, &yaml)?;
            if !report.failed.is_empty() {
                return Ok(BlockgraphExitCodes::Failed);
            }
        }

        Commands::Deactivate => {
            let inventory = blockgraph.live_inventory();
            blockgraph
                .deactivate(&inventory)
                .message("Failed to deactivate storage")?;
        }
    }

    Ok(BlockgraphExitCodes::Success)
}

fn setup_logging(args: &Cli) -> Result<(), Error> {
    let mut multilogger = MultiLogger::new().with_logger(Box::new(
        env_logger::builder()
            .format_timestamp(None)
            .filter_level(args.verbosity)
            .build(),
    ));

    if let Some(path) = &args.log_file {
        multilogger.add_logger(BackgroundLog::new(path).into_logger());
    }

    multilogger.init().context("Logger already registered")
}

fn setup_tracing(args: &Cli) -> Result<(), Error> {
    use tracing_subscriber::fmt::format::FmtSpan;

    if !args.trace {
        return Ok(());
    }

    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")
}

fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(e) = setup_logging(&args) {
        eprintln!("Failed to initialize logging: {e:?}");
        return BlockgraphExitCodes::SetupFailed.into();
    }

    if let Err(e) = setup_tracing(&args) {
        error!("Failed to initialize tracing: {e:?}");
        return BlockgraphExitCodes::SetupFailed.into();
    }

    let config = match AgentConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load agent configuration: {e:?}");
            return BlockgraphExitCodes::SetupFailed.into();
        }
    };

    match run(&args, config) {
        Ok(code) => code.into(),
        Err(e) => {
            error!("Command '{}' failed: {e:?}", args.command);
            BlockgraphExitCodes::Failed.into()
        }
    }
}
