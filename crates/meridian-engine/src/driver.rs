//! Headless world driver.
//!
//! Walks the reality bubble across the world for a configured number of
//! turns, optionally hopping to another dimension halfway, and saves every
//! dimension on exit.

use anyhow::{Context, Result};
use meridian_common::{ChunkPos, ColumnPos, DimensionId};
use meridian_world::{SubmapListener, WorldStreamer};
use tracing::info;

use crate::config::EngineConfig;

/// Counts residency transitions seen by the driver.
#[derive(Debug, Default)]
pub struct TransitionStats {
    /// Load notifications received
    pub loaded: u64,
    /// Unload notifications received
    pub unloaded: u64,
}

impl SubmapListener for TransitionStats {
    fn on_submap_loaded(&mut self, _pos: ChunkPos, _dimension: &DimensionId) {
        self.loaded += 1;
    }

    fn on_submap_unloaded(&mut self, _pos: ChunkPos, _dimension: &DimensionId) {
        self.unloaded += 1;
    }
}

/// Runs the driver to completion.
pub fn run(config: &EngineConfig) -> Result<TransitionStats> {
    let mut streamer = WorldStreamer::new(config.streaming.clone());
    let mut stats = TransitionStats::default();
    let mut center = ColumnPos::new(0, 0);
    let switch_at = config.ticks / 2;
    streamer.center_bubble(center);

    for tick in 0..config.ticks {
        if tick == switch_at {
            if let Some(name) = &config.switch_dimension {
                streamer
                    .switch_dimension(DimensionId::new(name.as_str()))
                    .with_context(|| format!("Failed to switch to dimension {name}"))?;
            }
        }

        let report = streamer
            .tick(&mut [&mut stats])
            .with_context(|| format!("Turn {} failed", tick + 1))?;

        if config.report_interval > 0 && report.turn % config.report_interval == 0 {
            let store = streamer.registry().get(streamer.dimension());
            info!(
                "Turn {}: {} resident in {}, {} clusters, {} fire requests",
                report.turn,
                store.len(),
                streamer.dimension(),
                streamer.tracker().cluster_count(),
                streamer.fire().held_count()
            );
        }

        center = center.offset(config.walk_step, 0);
        streamer.center_bubble(center);
    }

    if config.save_on_exit {
        let reports = streamer.save_all().context("Failed to save world")?;
        for (dimension, report) in reports {
            info!(
                "Saved {dimension}: {} quads written, {} uniform",
                report.quads_written, report.quads_uniform
            );
        }
    }

    info!(
        "Run finished: {} loads, {} unloads",
        stats.loaded, stats.unloaded
    );
    Ok(stats)
}
