use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use epd_proxy::cli::{
    format_dry_run, format_stage_summary, format_validation, Cli, Commands, ConfigKind, ServeArgs,
    StageArgs, ValidateArgs,
};
use epd_proxy::config::{
    load_proxy_config, load_stage_config, parse_config, validate_proxy_config,
    validate_stage_config, ConfigFormat, ProxyConfig, StageServerConfig,
};
use epd_proxy::runtime::ReadinessGate;
use epd_proxy::server::{create_router, AppState};
use epd_proxy::stage::{create_stage_router, EchoEngine, StageState};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let result = match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Stage(args) => stage(args).await,
        Commands::Validate(args) => validate(args),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}

/// Cancelled on Ctrl-C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        info!("Shutdown requested; cancelling in-flight work");
        trigger.cancel();
    });
    token
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_proxy_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    if let Some(host) = args.host {
        config.listen.host = host;
    }
    if let Some(port) = args.port {
        config.listen.port = port;
    }

    // Dry-run mode: print topology and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config, &args.config));
        return Ok(());
    }

    let shutdown = shutdown_token();
    let state = AppState::from_config(config.clone(), shutdown.clone())?;

    let gate = Arc::new(ReadinessGate::new(
        &config.model,
        Duration::from_millis(config.readiness.poll_interval_ms),
    )?);
    gate.gate_all(
        state.registry(),
        Duration::from_secs(config.readiness.startup_timeout_secs),
        &shutdown,
    )
    .await
    .context("stages did not become ready")?;

    if let Some(secs) = config.readiness.recheck_interval_secs {
        gate.clone().spawn_recheck(
            state.registry().clone(),
            Duration::from_secs(secs),
            shutdown.clone(),
        );
    }

    let addr = config.listen.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("epd-proxy listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health              - Health check");
    info!("  GET  /status              - Stage liveness and in-flight requests");
    info!("  POST /v1/chat/completions - OpenAI-compatible chat endpoint");

    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    info!("epd-proxy stopped");
    Ok(())
}

async fn stage(args: StageArgs) -> anyhow::Result<()> {
    let mut config = load_stage_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.listen.port = port;
    }

    let shutdown = shutdown_token();
    let state = StageState::from_config(&config, Arc::new(EchoEngine))
        .await
        .context("failed to set up cache connectors")?;
    state.spawn_eviction(
        Duration::from_secs(config.eviction_interval_secs),
        shutdown.clone(),
    );

    let addr = config.listen.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    info!("{}", format_stage_summary(&config));

    axum::serve(listener, create_stage_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    Ok(())
}

fn validate(args: ValidateArgs) -> anyhow::Result<()> {
    let result = match args.kind {
        ConfigKind::Proxy => validate_proxy_config(&read_config::<ProxyConfig>(&args.config)?),
        ConfigKind::Stage => validate_stage_config(&read_config::<StageServerConfig>(&args.config)?),
    };

    print!("{}", format_validation(&result));
    if result.has_errors() {
        anyhow::bail!("{} is invalid", args.config.display());
    }
    Ok(())
}

fn read_config<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_config(&content, ConfigFormat::from_path(path))?)
}
