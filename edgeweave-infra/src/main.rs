//! edgeweave-infra: converges the network infrastructure of one cluster.
//!
//! Looks up the shared tier-0 gateway, edge cluster, transport zone and SNAT
//! pool, then creates or repairs the cluster's tier-1 gateway, segment and
//! SNAT rule. The resulting references are kept in a JSON state document so
//! later runs converge instead of creating duplicates.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edgeweave_infra::catalog::rest::RestConfig;
use edgeweave_infra::{
    EnsurerContext, InfraSpec, JsonFileStore, RestCatalog, RunSummary, StateStore, TaskRunner,
};

/// edgeweave infrastructure reconciler
#[derive(Parser, Debug)]
#[command(name = "edgeweave-infra", version, about)]
struct Args {
    /// Desired infrastructure (JSON)
    #[arg(long, global = true, default_value = "infra-spec.json")]
    spec: PathBuf,

    /// State document (JSON), created on first run
    #[arg(long, global = true, default_value = "infra-state.json")]
    state: PathBuf,

    /// Policy manager address (e.g., https://nsx.example.com)
    #[arg(long, global = true, env = "EDGEWEAVE_NSX_ENDPOINT", default_value = "")]
    endpoint: String,

    #[arg(long, global = true, env = "EDGEWEAVE_NSX_USERNAME", default_value = "admin")]
    username: String,

    #[arg(
        long,
        global = true,
        env = "EDGEWEAVE_NSX_PASSWORD",
        default_value = "",
        hide_env_values = true
    )]
    password: String,

    /// Accept self-signed manager certificates
    #[arg(long, global = true)]
    insecure: bool,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value = "30")]
    request_timeout_secs: u64,

    /// Upper bound on waiting for the SNAT address to be realized
    #[arg(long, global = true, default_value = "15")]
    realization_timeout_secs: u64,

    /// Do not look for lost objects before creating them
    #[arg(long, global = true)]
    no_recovery: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover lost references, then ensure every object
    Reconcile,
    /// Delete every owned object in reverse order
    Teardown,
    /// Only re-associate lost objects by name
    Recover,
    /// Print the state document
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edgeweave_infra=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let store = JsonFileStore::new(&args.state);

    if let Command::Show = args.command {
        let state = store.load().await.context("Failed to load state")?;
        println!("{}", state.to_json()?);
        return Ok(());
    }

    if args.endpoint.is_empty() {
        bail!("--endpoint (or EDGEWEAVE_NSX_ENDPOINT) is required");
    }
    let catalog = RestCatalog::new(RestConfig {
        endpoint: args.endpoint.clone(),
        username: args.username.clone(),
        password: args.password.clone(),
        insecure: args.insecure,
        timeout: Duration::from_secs(args.request_timeout_secs),
    })
    .context("Failed to create policy API client")?;
    let ctx = EnsurerContext::new(Arc::new(catalog))
        .with_realization_timeout(Duration::from_secs(args.realization_timeout_secs));

    let mut runner = TaskRunner::standard();
    if args.no_recovery {
        runner = runner.without_recovery();
    }

    let mut state = store.load().await.context("Failed to load state")?;
    info!(state = %args.state.display(), endpoint = %args.endpoint, "Starting edgeweave-infra");

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            warn!("Signal handling unavailable: {}", e);
            return;
        }
        let _ = cancel_tx.send(true);
    });

    match args.command {
        Command::Reconcile => {
            let spec = InfraSpec::load(&args.spec)
                .await
                .context("Failed to load spec")?;
            let summary = runner
                .ensure_all(&ctx, &spec, &mut state, &store, &cancel_rx)
                .await;
            report("reconcile", summary)?;
        }
        Command::Teardown => {
            let summary = runner
                .ensure_deleted_all(&ctx, &mut state, &store, &cancel_rx)
                .await;
            report("teardown", summary)?;
        }
        Command::Recover => {
            let spec = InfraSpec::load(&args.spec)
                .await
                .context("Failed to load spec")?;
            let recovered = runner.recover(&ctx, &spec, &mut state, &store).await?;
            info!(recovered, "Recovery done");
        }
        Command::Show => {}
    }

    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Received SIGINT, stopping before the next task");
        }
        _ = sigterm.recv() => info!("Received SIGTERM, stopping before the next task"),
    }
    Ok(())
}

fn report(operation: &str, result: edgeweave_infra::Result<RunSummary>) -> Result<()> {
    match result {
        Ok(summary) => {
            for step in &summary.steps {
                println!("{:<32} {}", step.task, step.outcome);
            }
            info!(operation, changed = summary.changed(), "Run complete");
            Ok(())
        }
        Err(e) => {
            error!(
                operation,
                fatal = e.is_fatal(),
                retryable = e.is_retryable(),
                "Run failed: {}",
                e
            );
            Err(e.into())
        }
    }
}
