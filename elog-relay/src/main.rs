use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use elog_relay::{
    ledger, ChatPublisher, Config, CycleOutcome, DryRunBackend, ElogSource, Ledger, MemoryLedger, Orchestrator,
    SqlLedger, ZulipBackend, ZulipConfig,
};
use interfaces::ChatBackend;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Relay new elog entries into Zulip stream topics.
#[derive(Debug, Parser)]
#[command(name = "elog-relay", version)]
struct Cli {
    /// TOML configuration file
    config: PathBuf,

    /// Read the logbooks but only log what would be posted; nothing is recorded
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle for every section and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("elog-relay: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = elog_relay::logging::init(&config.meta);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    info!(
        "Starting elog-relay with {} sections{}",
        config.sections.len(),
        if cli.dry_run { " (dry run)" } else { "" }
    );

    let backend: Arc<dyn ChatBackend> = if cli.dry_run {
        Arc::new(DryRunBackend::new())
    } else {
        let rc = config
            .meta
            .zulip_rc
            .as_deref()
            .context("META.zulip-rc is required unless --dry-run is given")?;
        let zulip = ZulipConfig::from_zuliprc(rc)?;
        info!("Posting to {} as {}", zulip.site, zulip.email);
        Arc::new(ZulipBackend::new(zulip, &config.meta.fetch_config())?)
    };
    let publisher = Arc::new(ChatPublisher::new(backend, config.meta.publisher_config()));

    let pool = if cli.dry_run {
        None
    } else {
        let pool = ledger::connect(&config.meta.database)
            .await
            .with_context(|| format!("cannot open ledger database {}", config.meta.database))?;
        Some(pool)
    };
    let memory_ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let mut tables: HashMap<String, Arc<dyn Ledger>> = HashMap::new();

    let mut orchestrator = Orchestrator::new(config.meta.poll_interval());
    for section in config.sections {
        let ledger: Arc<dyn Ledger> = match &pool {
            Some(pool) => match tables.get(&section.ledger_table) {
                Some(ledger) => ledger.clone(),
                None => {
                    let ledger: Arc<dyn Ledger> = Arc::new(SqlLedger::open(pool.clone(), &section.ledger_table).await?);
                    tables.insert(section.ledger_table.clone(), ledger.clone());
                    ledger
                }
            },
            None => memory_ledger.clone(),
        };
        let source = ElogSource::new(&section, config.meta.fetch_config())
            .with_context(|| format!("cannot build HTTP client for section {}", section.id))?;
        orchestrator.add_section(section, Arc::new(source), ledger, publisher.clone());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing current entries");
            shutdown.cancel();
        }
    });

    if cli.once {
        let reports = orchestrator.run_once(&cancel).await;
        for report in reports.iter().filter(|r| r.outcome != CycleOutcome::Completed) {
            warn!("[{}] cycle {}", report.section, report.outcome);
        }
    } else {
        orchestrator.run(cancel).await;
    }

    info!("elog-relay finished");
    Ok(())
}
