use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use webhook_ingest::config::Config;
use webhook_ingest::http_server::{self, ServerState};
use webhook_ingest::receiver::WebhookReceiver;
use webhook_ingest::retry_driver::RetryDriver;
use webhook_ingest::{open_store, pubsub_publisher, scheduler, signature_verifier};

#[derive(Parser)]
#[command(name = "webhook-ingest", version, about = "GitHub webhook ingestion and replay")]
struct Cli {
    /// Log output format: `text` or `json`.
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the webhook endpoint (default).
    Serve,
    /// Run one retry pass and exit; non-zero if it did not complete.
    Retry,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format.eq_ignore_ascii_case("json"));

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Retry => retry_once().await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve() -> Result<ExitCode> {
    let config = Config::from_env().context("failed to load configuration")?;
    info!(?config, "starting webhook receiver");

    let store = open_store(&config.store).context("failed to open event store")?;
    let publisher = pubsub_publisher(&config).context("failed to build publisher")?;
    let verifier = signature_verifier(&config)?;

    let receiver = Arc::new(WebhookReceiver::new(
        verifier,
        store.clone(),
        publisher.clone(),
        config.receiver_settings(),
    ));
    let driver = Arc::new(RetryDriver::new(store, publisher, config.retry_settings()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = match &config.retry_schedule {
        Some(expr) => {
            let schedule = scheduler::parse_schedule(expr).map_err(anyhow::Error::msg)?;
            info!(schedule = %expr, "in-process retry schedule enabled");
            Some(tokio::spawn(scheduler::run(driver.clone(), schedule, shutdown_rx)))
        }
        None => None,
    };

    if config.retry_auth_token.is_none() {
        info!("RETRY_AUTH_TOKEN not set; POST /retry is disabled");
    }
    let state = ServerState {
        receiver,
        driver,
        retry_auth_token: config.retry_auth_token.clone(),
    };
    let app = http_server::router(state, config.max_body_bytes);
    let addr = SocketAddr::new(config.bind_address, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    http_server::serve(listener, app, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await
    .context("HTTP server failed")?;

    let _ = shutdown_tx.send(true);
    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            warn!(error = %e, "retry scheduler task ended abnormally");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn retry_once() -> Result<ExitCode> {
    let config = Config::from_env().context("failed to load configuration")?;
    let store = open_store(&config.store).context("failed to open event store")?;
    let publisher = pubsub_publisher(&config).context("failed to build publisher")?;
    let driver = RetryDriver::new(store, publisher, config.retry_settings());

    let summary = driver.run_pass().await.context("retry pass aborted")?;
    println!("{}", serde_json::to_string(&summary)?);

    if summary.timed_out {
        warn!("retry pass did not finish before its deadline");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
