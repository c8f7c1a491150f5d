//! seedkeeper scheduler
//!
//! Runs and repairs a key-value store cluster on an offer-based cluster
//! manager.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use seedkeeper_scheduler::{
    admin,
    artifacts::ArtifactServer,
    config::{Cli, ProbeKind, SchedulerConfig},
    coordination::{self, SessionIdentity},
    driver::{SimulatedHost, SimulatedManager},
    health::{HealthProbe, HttpHealthProbe},
    orchestrator::{self, Dependencies},
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SchedulerConfig::from_cli(Cli::parse())?;

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster = %config.cluster_name,
        master = %config.master,
        desired = config.desired_members,
        auto_reseed = config.auto_reseed,
        test_mode = config.test_mode,
        "Starting seedkeeper scheduler"
    );

    let store = coordination::open(&config.persist).context("failed to open coordination store")?;
    let identity = SessionIdentity::new(store.clone(), &config.persist_chroot, &config.cluster_name);
    let previous = identity
        .previous_framework_id()
        .await
        .context("failed to read framework ID from coordination store")?;
    match &previous {
        Some(id) => info!(framework_id = %id, "Found previous framework ID, failing over"),
        None => info!(path = identity.path(), "No previous framework ID, registering as new"),
    }

    let artifacts = ArtifactServer::new(&config.artifacts).context("artifact check failed")?;

    if config.simulate_hosts == 0 {
        bail!(
            "no cluster manager transport available for {}; run with --simulate-hosts <n>",
            config.master
        );
    }

    let events = orchestrator::event_channel();
    let manager = Arc::new(SimulatedManager::new(
        SimulatedHost::numbered(config.simulate_hosts),
        events.0.clone(),
    ));
    let probe: Arc<dyn HealthProbe> = match config.health_probe {
        ProbeKind::Manager => manager.clone(),
        ProbeKind::Http => Arc::new(
            HttpHealthProbe::new(config.health_probe_timeout)
                .context("failed to build HTTP health probe")?,
        ),
    };
    info!(probe = ?config.health_probe, "Health probe selected");
    let deps = Dependencies {
        store,
        driver: manager.clone(),
        probe,
        artifacts: artifacts.uris(),
    };
    let running = orchestrator::start(&config, deps, events)
        .await
        .context("failed to start scheduler")?;
    let shutdown_rx = running.shutdown_signal();

    let framework = config.framework_info(previous);
    let manager_handle = tokio::spawn({
        let manager = manager.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { manager.run(framework, shutdown_rx).await }
    });

    let artifact_listener = tokio::net::TcpListener::bind(artifacts.bind_addr())
        .await
        .context("failed to bind artifact server")?;
    info!(addr = %artifacts.bind_addr(), uris = ?artifacts.uris(), "Serving artifacts");
    let artifact_handle = tokio::spawn({
        let router = artifacts.router();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(artifact_listener, router)
                .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
                .await
        }
    });

    let admin_addr = format!("0.0.0.0:{}", config.admin_port);
    let admin_listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .context("failed to bind admin server")?;
    info!(addr = %admin_addr, "Admin API listening");
    let admin_handle = tokio::spawn({
        let router = admin::create_router(running.admin.clone());
        let shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(admin_listener, router)
                .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
                .await
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = admin_handle => {
            match result {
                Ok(Ok(())) => info!("Admin server exited"),
                Ok(Err(e)) => error!(error = %e, "Admin server error"),
                Err(e) => error!(error = %e, "Admin server task panicked"),
            }
        }
    }

    let shutdown_timeout = Duration::from_secs(10);
    running.shutdown(shutdown_timeout).await;
    if tokio::time::timeout(shutdown_timeout, manager_handle).await.is_err() {
        error!("Simulated manager did not shut down in time");
    }
    match tokio::time::timeout(shutdown_timeout, artifact_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Artifact server error"),
        Ok(Err(e)) => error!(error = %e, "Artifact server task panicked"),
        Err(_) => error!("Artifact server did not shut down in time"),
    }

    info!("seedkeeper scheduler stopped");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    info!("HTTP server shutting down");
}
