//! InvoiceFlow CLI entry point.
//!
//! Opens the store, wires the local collaborators into an executor and
//! dispatches the chosen subcommand.

mod cli;
mod collaborators;
mod config;
mod lockfile;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use invoiceflow_engine::{
    Executor, HitlGateway, InstanceStatus, InvoiceDocument, Priority, RunOutcome, Stores, Verdict,
};
use invoiceflow_store::{Database, SnapshotCache};
use invoiceflow_web::WebServer;

use crate::cli::{Cli, Commands, PriorityArg, VerdictArg};
use crate::collaborators::{Fixtures, HeuristicOracle, LocalTools};
use crate::config::AppConfig;
use crate::lockfile::ServeLock;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info", cli.json);

    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Serve { bind, port } => cmd_serve(config, bind, port).await,
        Commands::Submit { file, priority } => cmd_submit(config, &file, priority).await,
        Commands::Reviews { limit } => cmd_reviews(config, limit).await,
        Commands::Resolve {
            review_id,
            verdict,
            reviewer,
            rationale,
        } => cmd_resolve(config, &review_id, verdict, &reviewer, &rationale).await,
        Commands::Status {
            instance_id,
            status,
            limit,
        } => cmd_status(config, instance_id, status, limit).await,
        Commands::Trace { instance_id } => cmd_trace(config, &instance_id).await,
        Commands::Recover { force } => cmd_recover(config, force).await,
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Open the database and build an executor over the local collaborators.
async fn build_executor(config: &AppConfig) -> Result<Executor> {
    let db = Database::open_and_migrate_with(config.store.clone())
        .await
        .context("failed to open database")?;
    info!(path = %config.store.path.display(), "store initialized");

    let fixtures = match &config.fixtures {
        Some(path) => Fixtures::load(path)?,
        None => Fixtures::default(),
    };
    info!(
        purchase_orders = fixtures.purchase_orders.len(),
        "local tools ready"
    );

    let cache = SnapshotCache::new(
        config.store.cache_capacity,
        Duration::from_secs(config.store.cache_ttl_secs),
    );
    Ok(Executor::new(
        Stores::with_cache(db, cache),
        Arc::new(HeuristicOracle),
        Arc::new(LocalTools::new(fixtures)),
        config.engine.clone(),
    ))
}

async fn wait(handle: JoinHandle<invoiceflow_engine::Result<RunOutcome>>) -> Result<RunOutcome> {
    Ok(handle.await.context("run task panicked")??)
}

fn report(outcome: &RunOutcome) {
    println!(
        "{}  {}  at {}",
        outcome.instance_id, outcome.status, outcome.stage
    );
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(mut config: AppConfig, bind: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(bind) = bind {
        config.web.bind_addr = bind;
    }
    if let Some(port) = port {
        config.web.port = port;
    }

    let executor = build_executor(&config).await?;
    let addr = format!("{}:{}", config.web.bind_addr, config.web.port);
    let _lock = ServeLock::acquire(&config.store.path, &addr)?;
    let recovery = executor.recover().await?;
    for (instance_id, handle) in recovery.resumed {
        tokio::spawn(async move {
            match wait(handle).await {
                Ok(outcome) => info!(%instance_id, status = %outcome.status, "recovered instance stopped"),
                Err(e) => tracing::error!(%instance_id, error = %e, "recovered instance errored"),
            }
        });
    }

    let server = WebServer::new(config.web.clone(), executor);
    info!(addr = %server.addr(), "InvoiceFlow listening");
    server.start().await.context("web server error")?;
    info!("InvoiceFlow stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: submit
// ---------------------------------------------------------------------------

async fn cmd_submit(config: AppConfig, file: &Path, priority: Option<PriorityArg>) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let document: InvoiceDocument = serde_json::from_str(&content)
        .with_context(|| format!("{} is not an invoice document", file.display()))?;

    let priority = match priority {
        Some(PriorityArg::Critical) => Priority::Critical,
        Some(PriorityArg::High) => Priority::High,
        Some(PriorityArg::Normal) => Priority::Normal,
        Some(PriorityArg::Low) => Priority::Low,
        None if document.amount > config.engine.high_priority_amount => Priority::High,
        None => Priority::Normal,
    };

    let executor = build_executor(&config).await?;
    let instance_id = executor.submit(document, priority).await?;
    println!("submitted {instance_id} ({priority:?} priority)");

    let outcome = executor.run(&instance_id).await?;
    report(&outcome);
    if outcome.status == InstanceStatus::Paused {
        let review = executor
            .stores()
            .reviews
            .latest_for_instance(&instance_id)
            .await?;
        if let Some(review) = review {
            println!("awaiting review {}: {}", review.review_id, review.reason);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: reviews / resolve
// ---------------------------------------------------------------------------

async fn cmd_reviews(config: AppConfig, limit: i64) -> Result<()> {
    let executor = build_executor(&config).await?;
    let reviews = HitlGateway::new(executor).list_open(limit, 0).await?;
    if reviews.is_empty() {
        println!("no open reviews");
        return Ok(());
    }
    for review in reviews {
        println!(
            "{}  instance {}  {}",
            review.review_id, review.instance_id, review.reason
        );
    }
    Ok(())
}

async fn cmd_resolve(
    config: AppConfig,
    review_id: &str,
    verdict: VerdictArg,
    reviewer: &str,
    rationale: &str,
) -> Result<()> {
    if reviewer.trim().is_empty() {
        bail!("--reviewer must not be empty");
    }
    let verdict = match verdict {
        VerdictArg::Accept => Verdict::Accept,
        VerdictArg::Reject => Verdict::Reject,
    };

    let executor = build_executor(&config).await?;
    let resolution = HitlGateway::new(executor)
        .resolve(review_id, verdict, rationale, reviewer)
        .await?;
    println!("review {} resolved: {verdict}", resolution.review.review_id);
    report(&wait(resolution.run).await?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: status / trace
// ---------------------------------------------------------------------------

async fn cmd_status(
    config: AppConfig,
    instance_id: Option<String>,
    status: Option<String>,
    limit: i64,
) -> Result<()> {
    let executor = build_executor(&config).await?;

    if let Some(id) = instance_id {
        let instance = executor.load(&id).await?;
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }

    let status = status
        .map(|s| InstanceStatus::parse(&s.to_uppercase()))
        .transpose()?;
    let instances = executor.list_instances(status, limit, 0).await?;
    if instances.is_empty() {
        println!("no instances");
    }
    for inst in instances {
        println!(
            "{}  {:<9} {:<16} {:<12} {} {}",
            inst.id,
            inst.status.to_string(),
            inst.stage.to_string(),
            inst.document.invoice_id,
            inst.document.amount,
            inst.failure
                .map(|f| format!("({}: {})", f.kind, f.message))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

async fn cmd_trace(config: AppConfig, instance_id: &str) -> Result<()> {
    let executor = build_executor(&config).await?;
    executor.load(instance_id).await?;
    for entry in executor.audit_trail(instance_id).await? {
        println!(
            "{:>4}  {:<16} {:<8} {}",
            entry.seq, entry.stage, entry.kind.to_string(), entry.payload
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: recover
// ---------------------------------------------------------------------------

async fn cmd_recover(config: AppConfig, force: bool) -> Result<()> {
    lockfile::ensure_no_server(&config.store.path, force)?;
    let executor = build_executor(&config).await?;
    let recovery = executor.recover().await?;
    let runs = recovery.resumed.into_iter().map(|(_, handle)| wait(handle));
    for outcome in futures::future::join_all(runs).await {
        report(&outcome?);
    }
    for id in recovery.parked {
        println!("{id}  PAUSED  awaiting a verdict");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level`.
fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
