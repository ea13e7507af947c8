//! sluice - Online sharding migration jobs
//!
//! # Usage
//!
//! ```bash
//! # Check datasources, then run the job until cutover
//! sluice -c job.yaml precheck
//! sluice -c job.yaml run
//!
//! # From another shell
//! sluice -c job.yaml status
//! sluice -c job.yaml verify --mode digest
//! sluice -c job.yaml cutover
//! ```
//!
//! `run` and `resume` keep the process in the foreground; Ctrl+C pauses the
//! job. `pause`, `stop` and `cutover` act on a job running in another
//! process through the state directory.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sluice_pipeline::config::{ChangeStreamConfig, DatasourceConfig};
use sluice_pipeline::stream::PgLogicalPoller;
use sluice_pipeline::{
    AlgorithmRegistry, ControlFile, Datasources, FileCheckpointStore, JobConfig, JobDefinition, JobOrchestrator,
    JobState, JobStatus, VerifyMode,
};
use sluice_rdbc::connection::{ConnectionFactory, DatabaseType};
use sluice_rdbc::pool::{ConnectionPool, PoolConfig};
use sluice_rdbc::store::{SqlTableStore, TableStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(version, about = "Online migration into sharded databases")]
struct Cli {
    /// Path to the job file
    #[arg(short, long, default_value = "job.yaml")]
    config: PathBuf,

    /// Lease owner identity; reuse it to take over after a crash
    #[arg(long, env = "SLUICE_OWNER")]
    owner: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the job file
    Validate,
    /// Run the pre-flight checks
    Precheck,
    /// Start (or continue) the job in the foreground
    Run,
    /// Continue a paused, stopped or failed job in the foreground
    Resume,
    /// Show job status
    Status,
    /// Pause the job
    Pause,
    /// Stop the job
    Stop,
    /// Finish a job that is ready for cutover
    Cutover,
    /// Delete migrated rows and reset the job
    Rollback,
    /// Compare source tables with their data nodes
    Verify {
        /// count or digest (default: from the job file)
        #[arg(long)]
        mode: Option<VerifyMode>,
    },
    /// Delete the checkpoint of a finished, stopped or failed job
    Remove,
    /// List sharding algorithm types
    Algorithms,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Algorithms = cli.command {
        for name in AlgorithmRegistry::builtin().type_names() {
            println!("{name}");
        }
        return Ok(());
    }

    let config = JobConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load job file {}", cli.config.display()))?;

    if let Commands::Validate = cli.command {
        return validate(&config);
    }

    let orchestrator = build_orchestrator(&config, cli.owner).await?;
    match cli.command {
        Commands::Precheck => {
            let report = orchestrator.precheck().await.context("Pre-flight checks failed")?;
            for item in &report.passed {
                println!("ok  {:<12} {}", item.kind.to_string(), item.subject);
            }
            Ok(())
        }
        Commands::Run => run(&orchestrator, false).await,
        Commands::Resume => run(&orchestrator, true).await,
        Commands::Status => print_status(&orchestrator.status().await?),
        Commands::Pause => print_status(&orchestrator.pause().await?),
        Commands::Stop => print_status(&orchestrator.stop().await?),
        Commands::Cutover => print_status(&orchestrator.cutover().await?),
        Commands::Rollback => print_status(&orchestrator.rollback().await?),
        Commands::Remove => print_status(&orchestrator.remove().await?),
        Commands::Verify { mode } => {
            let reports = orchestrator.check_consistency(mode).await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            if let Some(report) = reports.iter().find(|r| !r.is_consistent()) {
                bail!("table {} is not consistent", report.table);
            }
            Ok(())
        }
        Commands::Validate | Commands::Algorithms => unreachable!(), // handled above
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn validate(config: &JobConfig) -> Result<()> {
    println!("Job {}", config.job_id);
    for (name, ds) in &config.datasources {
        let role = if config.source.contains(name) { "source" } else { "target" };
        println!(
            "  {role:<6} {name}: {} ({})",
            sluice_pipeline::config::redact_url(&ds.url),
            ds.resolved_type()?.name()
        );
    }
    for table in &config.tables {
        let rule = table.rule()?;
        println!(
            "  table  {} -> {} node(s) by {} ({})",
            rule.source,
            rule.data_nodes.len(),
            rule.sharding_column,
            rule.algorithm.type_name
        );
    }
    println!("Configuration is valid");
    Ok(())
}

fn connect_store(name: &str, ds: &DatasourceConfig) -> Result<Arc<dyn TableStore>> {
    let database_type = ds.resolved_type()?;
    let factory: Arc<dyn ConnectionFactory> = match database_type {
        #[cfg(feature = "postgres")]
        DatabaseType::PostgreSQL => Arc::new(sluice_rdbc::postgres::PgConnectionFactory::default()),
        #[cfg(feature = "postgres")]
        DatabaseType::OpenGauss => Arc::new(sluice_rdbc::postgres::PgConnectionFactory::opengauss()),
        #[cfg(feature = "mysql")]
        DatabaseType::MySQL => Arc::new(sluice_rdbc::mysql::MySqlConnectionFactory),
        #[allow(unreachable_patterns)]
        other => bail!("datasource '{name}': built without {} support", other.name()),
    };
    let pool = PoolConfig::new(ds.url.as_str())
        .with_max_size(ds.pool_size)
        .with_acquire_timeout(ds.acquire_timeout());
    let pool = Arc::new(ConnectionPool::new(pool, factory));
    Ok(Arc::new(SqlTableStore::new(name, database_type, pool)))
}

async fn build_orchestrator(config: &JobConfig, owner: Option<String>) -> Result<JobOrchestrator> {
    let mut datasources = Datasources::new();
    for name in &config.source {
        let store = connect_store(name, &config.datasources[name])?;
        datasources = match config.change_streams.get(name) {
            Some(ChangeStreamConfig::PgLogical(stream)) => {
                let reader = PgLogicalPoller::new(format!("{name}/{}", stream.slot), store.clone(), stream.clone());
                datasources.with_source(name.as_str(), store, Arc::new(reader))
            }
            None => {
                warn!(datasource = %name, "No change stream configured; the job cannot go past the snapshot copy");
                datasources.with_snapshot_source(name.as_str(), store)
            }
        };
    }
    for name in &config.target {
        datasources = datasources.with_target(name.as_str(), connect_store(name, &config.datasources[name])?);
    }

    let state = &config.pipeline.state;
    let store = FileCheckpointStore::with_options(&state.dir, state.fsync)
        .await
        .with_context(|| format!("Failed to open state directory {}", state.dir.display()))?;
    let job = JobDefinition::from_config(config)?;
    let mut orchestrator = JobOrchestrator::new(job, datasources, Arc::new(store))
        .with_control_file(ControlFile::new(&state.dir, &config.job_id));
    if let Some(owner) = owner {
        orchestrator = orchestrator.with_owner(owner);
    }
    Ok(orchestrator)
}

async fn run(orchestrator: &JobOrchestrator, resume: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C), pausing job");
            token.cancel();
        }
    });

    info!(job_id = %orchestrator.job_id(), owner = %orchestrator.owner(), "Starting sluice");
    let status = if resume {
        orchestrator.resume(cancel).await?
    } else {
        orchestrator.start(cancel).await?
    };
    print_status(&status)?;
    if status.state == JobState::Failed {
        let message = status.last_error.map(|e| e.message).unwrap_or_default();
        bail!("job {} failed: {message}", status.job_id);
    }
    Ok(())
}

fn print_status(status: &JobStatus) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verify_mode() {
        let cli = Cli::try_parse_from(["sluice", "-c", "orders.yaml", "verify", "--mode", "count"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("orders.yaml"));
        assert!(matches!(
            cli.command,
            Commands::Verify {
                mode: Some(VerifyMode::Count)
            }
        ));
    }

    #[test]
    fn test_validate_job_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.yaml");
        std::fs::write(
            &path,
            r#"
job_id: orders
datasources:
  src: { url: "postgres://sluice:pw@old/shop" }
  ds_0: { url: "mysql://sluice@new/shop" }
source: [src]
target: [ds_0]
tables:
  - source: src.t_order
    sharding_column: order_id
    algorithm: { type: MOD, props: { sharding-count: 1 } }
    data_nodes: [ds_0.t_order_0]
"#,
        )
        .unwrap();
        let config = JobConfig::from_file(&path).unwrap();
        validate(&config).unwrap();
    }
}
