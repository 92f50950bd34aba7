//! node-agentd
//! Loads the agent configuration, wires the supervisor to the mTLS
//! control channel, and runs until SIGTERM or SIGINT

use clap::Parser;
use na_engine::adapters::grpc::NodeAgentService;
use na_engine::bootstrap::AgentConfig;
use na_engine::domain::{DomainError, Result};
use na_engine::logs::{LogBroadcaster, DEFAULT_QUEUE_DEPTH};
use na_engine::runner::{ProcessRunner, TokioProcessExecutor};
use na_engine::supervisor::Supervisor;
use na_engine::transport;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "node-agentd", about = "Proxy node agent daemon", version)]
struct Args {
    /// Path to the agent configuration file
    #[arg(short, long, default_value = "/etc/node-agent/agent.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "agent terminated with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "node agent starting");
    let config = AgentConfig::load(&args.config).await?;

    let logs = Arc::new(LogBroadcaster::new(
        config.log_buffer_lines,
        DEFAULT_QUEUE_DEPTH,
    ));
    let runner = ProcessRunner::new(
        Arc::new(TokioProcessExecutor::new(logs.clone())),
        Duration::from_millis(config.runner.grace_ms),
        Duration::from_secs(config.runner.stop_timeout_sec),
    );
    let (supervisor, exit_rx) = Supervisor::new(
        config.backends.clone(),
        config.restart.clone(),
        runner,
        logs,
    );

    let cancel = CancellationToken::new();
    let supervisor_task = tokio::spawn(supervisor.clone().run(exit_rx, cancel.clone()));

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| DomainError::io("installing SIGTERM handler", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| DomainError::io("installing SIGINT handler", e))?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        shutdown.cancel();
    });

    let service = NodeAgentService::new(supervisor);
    let result = transport::serve(config.listen_addr, &config.tls, service, cancel.clone()).await;

    // Make sure the supervisor winds the backends down even when the
    // server fell over on its own
    cancel.cancel();
    if let Err(e) = supervisor_task.await {
        error!(error = %e, "supervisor task panicked");
    }
    result?;

    info!("node agent stopped");
    Ok(())
}
