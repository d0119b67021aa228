//! Sandbox Engine HTTP server
//!
//! Serves the sandbox API and drains the worker pool on Ctrl+C.

use clap::Parser;
use sandbox_engine::api::build_router;
use sandbox_engine::service::{initialize_sandbox_service, shutdown_sandbox_service};
use sandbox_engine::{Config, VERSION};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::info;

// ---- CLI ----

#[derive(Parser)]
#[command(name = "sandbox-engine-server", version = VERSION, about = "Sandbox Engine HTTP server")]
struct Args {
    /// Bind address (overrides server.bind)
    #[arg(long)]
    bind: Option<String>,

    /// Port (overrides server.port)
    #[arg(long, short)]
    port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long, env = "SANDBOX_LOG_JSON")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sandbox_engine=debug".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    // Load config
    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let service = initialize_sandbox_service(&config)?;

    // Request bodies carry the script plus context and options
    let body_limit = config.sandbox.max_script_bytes.saturating_mul(2).max(64 * 1024);
    let app = build_router(service.clone(), body_limit);

    // The pool drains while axum waits for in-flight requests
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let drain = tokio::spawn({
        let service = service.clone();
        async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
            shutdown_sandbox_service(service).await
        }
    });

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    info!("Sandbox engine listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining sandbox workers");
            let _ = stop_tx.send(true);
        })
        .await?;

    let report = drain.await?;
    info!(
        completed = report.completed,
        rejected_queued = report.rejected_queued,
        forced = report.forced,
        "Sandbox engine shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}
