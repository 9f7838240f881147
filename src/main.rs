mod cli;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use vice_exposer::clients::{HttpAnalysisResolver, HttpAppsService, HttpPermissions};
use vice_exposer::config::Settings;
use vice_exposer::controller::{Controller, time_limit_sweeper};
use vice_exposer::external::ExternalService;
use vice_exposer::gateway::Gateway;
use vice_exposer::http::{AppState, build_router};
use vice_exposer::logs::LogService;
use vice_exposer::status::{HttpStatusSink, StatusBridge};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("Starting vice-exposer...\n");
    info!("exposer_starting");

    let settings = Arc::new(Settings::from_file(&cli.config)?);

    let client = Client::try_default()
        .await
        .context("Failed to build a Kubernetes client. Is your kubeconfig valid?")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let gateway = Gateway::new(client.clone(), settings.vice_namespace());

    let apps = Arc::new(HttpAppsService::new(
        settings.apps_service_base_url.clone(),
        settings.user_suffix.clone(),
    ));
    let permissions = Arc::new(HttpPermissions::new(
        settings.permissions_url.clone(),
        settings.user_suffix.clone(),
    ));
    let resolver = Arc::new(HttpAnalysisResolver::new(
        settings.get_analysis_id_service.clone(),
    ));
    let sink = Arc::new(HttpStatusSink::new(settings.job_status_url.clone()));

    let controller = Controller::new(gateway.clone(), settings.clone());
    let ready = Arc::new(AtomicBool::new(false));

    let state = AppState {
        logs: LogService::new(gateway.clone(), apps.clone()),
        external: ExternalService::new(client, settings.clone()),
        controller: controller.clone(),
        apps,
        permissions,
        resolver,
        ready: ready.clone(),
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    print!("  Status bridge ............... ");
    let watch_handles = StatusBridge::new(gateway.clone(), sink).spawn(&shutdown_tx);
    println!("watching pods, deployments, services, ingresses");

    let sweeper_handle = tokio::spawn(time_limit_sweeper(
        controller.clone(),
        shutdown_tx.subscribe(),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {addr}"))?;
    println!("  HTTP server ................. http://{addr}");
    info!(addr = %addr, "http_server_started");

    let app = build_router(state);
    let mut http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await
    });

    ready.store(true, Ordering::Relaxed);
    println!("\nvice-exposer running. Press Ctrl+C to stop.\n");

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\nShutdown signal received. Stopping vice-exposer...");

    let _ = shutdown_tx.send(());

    http_handle.await??;
    for handle in watch_handles {
        let _ = handle.await;
    }
    let _ = sweeper_handle.await;

    info!("exposer_stopped");
    println!("vice-exposer stopped.");
    Ok(())
}
