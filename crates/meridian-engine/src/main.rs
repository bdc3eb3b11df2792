//! # Meridian Engine
//!
//! Headless entry point for Project Meridian.
//!
//! Loads the engine configuration (from the path given as the first
//! argument, or the platform config directory) and runs the world driver.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod config;
mod driver;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::EngineConfig;

/// Main entry point.
fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("meridian=info".parse()?))
        .init();

    info!("Project Meridian starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let explicit_path = std::env::args().nth(1);
    let config = match &explicit_path {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    };

    driver::run(&config)?;

    if explicit_path.is_none() {
        if let Err(e) = config.save() {
            warn!("Failed to save config: {e}");
        }
    }

    info!("Project Meridian shutdown complete");
    Ok(())
}
