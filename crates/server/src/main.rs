//! browser-pilot - supervised browser automation over JSON-RPC

mod cli;

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use browser::{BrowserSupervisor, ChromeLauncher};
use resilience::{CancellationToken, CircuitBreakers};
use server::{
    Config, ConnectionChannel, ProtocolServer, StdioTransport, TcpTransport, Transport,
};
use tools::{register_browser_tools, BrowserToolContext, ToolRegistry};

use crate::cli::{Cli, LogFormat};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("browser-pilot: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "browser-pilot exiting");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; stdout may be the protocol stream
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    let registry = tracing_subscriber::registry().with(filter);

    match cli.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("failed to install the log subscriber")
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.load_config().context("failed to load configuration")?;
    info!(version = %config.server.version, "browser-pilot starting");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("signal received, shutting down");
            shutdown.cancel();
        });
    }

    let breakers = CircuitBreakers::default();
    let supervisor = BrowserSupervisor::with_dependencies(
        config.supervisor.clone(),
        Arc::new(ChromeLauncher::default()),
        breakers.network.clone(),
        shutdown.child_token(),
    );
    supervisor.start().await.context("failed to start the browser")?;

    let outcome = serve(&cli, &config, supervisor.clone(), breakers, shutdown.clone()).await;

    shutdown.cancel();
    supervisor.stop().await;
    info!("browser-pilot stopped");
    outcome
}

async fn serve(
    cli: &Cli,
    config: &Config,
    supervisor: BrowserSupervisor,
    breakers: CircuitBreakers,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let context = BrowserToolContext::new(supervisor.clone(), breakers.clone(), shutdown.child_token());
    let mut registry = ToolRegistry::new();
    register_browser_tools(&mut registry, Arc::new(context)).context("failed to register tools")?;
    info!(tools = ?registry.names().collect::<Vec<_>>(), "tools registered");

    let transport: Arc<dyn Transport> = match &cli.connect {
        Some(address) => Arc::new(TcpTransport::new(address.clone(), config.channel.connect_timeout)),
        None => Arc::new(StdioTransport),
    };
    let channel = ConnectionChannel::connect(transport, config.channel.clone())
        .await
        .context("failed to open the client connection")?;

    let server = ProtocolServer::new(
        config.server.clone(),
        Arc::new(registry),
        Arc::new(channel),
        breakers,
        shutdown,
    )
    .with_supervisor(supervisor);

    Arc::new(server).run().await.context("protocol server failed")
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
