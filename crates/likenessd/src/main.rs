use anyhow::Result;
use likeness_vault::{IdentityRegistry, KeyManager};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{Bus, Config};
use dbus_interface::{LikenessService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "likenessd starting");

    let config = Config::load()?;
    tracing::debug!(?config, "configuration resolved");

    let active = KeyManager::new(&config.key_instructions_path).load_or_create(config.encryption_key.as_deref());
    let registry = Arc::new(IdentityRegistry::open(&config.data_dir, &active.key)?);
    tracing::info!(
        data_dir = %config.data_dir.display(),
        known_faces = registry.count()?,
        key_source = ?active.source,
        "identity registry ready"
    );

    let pipeline = engine::Pipeline::load(&config);
    let engine = engine::spawn_engine(pipeline, Arc::clone(&registry))?;

    let service = LikenessService::new(engine, registry, active.source);
    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "likenessd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("likenessd shutting down");

    Ok(())
}
