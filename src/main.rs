//! datastore-entry runner
//!
//! Registers the entries of the boot file that match this process,
//! bootstraps them in order and interrupts them on ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datastore_entry::{register_entries, Entry, InMemoryRegistry, Registry, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_filter.clone().into()),
        )
        .init();

    tracing::info!("Starting datastore-entry...");

    let raw = tokio::fs::read(&settings.boot_file)
        .await
        .with_context(|| format!("Failed to read boot file {}", settings.boot_file.display()))?;
    let env = settings.runtime_env();
    tracing::info!(
        "Runtime environment realm={} region={} az={} domain={}",
        env.realm,
        env.region,
        env.az,
        env.domain
    );

    let registry = InMemoryRegistry::new();
    let entries = register_entries(&raw, &env, &registry)?;
    tracing::info!("Registered {} entries", entries.len());

    let mut bootstrapped: Vec<Arc<dyn Entry>> = Vec::with_capacity(entries.len());
    for entry in entries.values() {
        if let Err(e) = entry.bootstrap().await {
            tracing::error!("Bootstrap failed, shutting down: {}", e);
            shutdown(&registry, &bootstrapped).await;
            std::process::exit(1);
        }
        bootstrapped.push(entry.clone());
    }

    tracing::info!("All entries bootstrapped, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    shutdown(&registry, &bootstrapped).await;
    Ok(())
}

/// Interrupt in reverse bootstrap order and drop from the registry.
async fn shutdown(registry: &dyn Registry, entries: &[Arc<dyn Entry>]) {
    for entry in entries.iter().rev() {
        entry.interrupt().await;
        registry.remove(entry.name());
    }
    tracing::info!("Shutdown complete");
}
