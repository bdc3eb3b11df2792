//! World streaming context.
//!
//! [`WorldStreamer`] owns every streaming subsystem and drives them once per
//! tick in a fixed order:
//!
//! 1. the load-request manager loads newly desired chunks, notifies
//!    listeners and evicts quads that left the desired set
//! 2. the distribution tracker runs grid flow and applies queued transforms
//! 3. the fire loader prunes stale requests and extends toward burning edges

use std::sync::Arc;

use meridian_common::{ColumnPos, DimensionId, RequestHandle, StreamResult};
use tracing::{debug, info};

use crate::async_loader::AsyncLoader;
use crate::config::StreamingConfig;
use crate::distribution::{DistributionTracker, GridUpdateReport};
use crate::fire::FireSpreadLoader;
use crate::generation::{QuadGenerator, WorldGenerator};
use crate::listener::SubmapListener;
use crate::load_request::{LoadRequestManager, LoadSource, UpdateReport};
use crate::registry::StoreRegistry;
use crate::store::SaveReport;
use crate::thread_pool::{default_worker_count, ThreadPool};

/// What one [`WorldStreamer::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Turn that was simulated
    pub turn: u64,
    /// Desired set changes
    pub update: UpdateReport,
    /// Grid flow results
    pub grid: GridUpdateReport,
    /// Fire requests released
    pub fire_released: usize,
    /// Fire requests issued
    pub fire_requested: usize,
}

/// Owns the streaming subsystems of one world.
pub struct WorldStreamer {
    /// Configuration
    config: StreamingConfig,
    /// Worker pool shared by loads and saves
    pool: Arc<ThreadPool>,
    /// Per-dimension stores
    registry: Arc<StoreRegistry>,
    /// Async chunk loader
    loader: AsyncLoader,
    /// Load requests and desired set
    manager: LoadRequestManager,
    /// Distribution clusters of the active dimension
    tracker: DistributionTracker,
    /// Opportunistic fire requests
    fire: FireSpreadLoader,
    /// Dimension the player is in
    dimension: DimensionId,
    /// Reality bubble request, if placed
    bubble: Option<RequestHandle>,
    /// Last simulated turn
    turn: u64,
}

impl WorldStreamer {
    /// Creates a streamer using the procedural world generator.
    #[must_use]
    pub fn new(config: StreamingConfig) -> Self {
        let generator = Arc::new(WorldGenerator::new(config.generator.clone()));
        Self::with_generator(config, generator)
    }

    /// Creates a streamer using a custom quad generator.
    #[must_use]
    pub fn with_generator(mut config: StreamingConfig, generator: Arc<dyn QuadGenerator>) -> Self {
        config.validate();
        let workers = config.worker_threads.unwrap_or_else(default_worker_count);
        let pool = Arc::new(ThreadPool::new(workers));
        let registry = Arc::new(StoreRegistry::new(config.save_dir.clone()));
        let loader = AsyncLoader::new(Arc::clone(&pool), Arc::clone(&registry), generator);
        let dimension = DimensionId::primary();
        let tracker = DistributionTracker::new(Arc::clone(&registry), dimension.clone());
        let fire = FireSpreadLoader::new(config.fire_request_cap);

        info!(
            "World streamer ready: {} workers, saving to {}",
            pool.worker_count(),
            config.save_dir.display()
        );

        Self {
            config,
            pool,
            registry,
            loader,
            manager: LoadRequestManager::new(),
            tracker,
            fire,
            dimension,
            bubble: None,
            turn: 0,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Returns the store registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// Returns the load-request manager.
    #[must_use]
    pub const fn manager(&self) -> &LoadRequestManager {
        &self.manager
    }

    /// Returns the load-request manager mutably.
    pub fn manager_mut(&mut self) -> &mut LoadRequestManager {
        &mut self.manager
    }

    /// Returns the distribution tracker.
    #[must_use]
    pub const fn tracker(&self) -> &DistributionTracker {
        &self.tracker
    }

    /// Returns the distribution tracker mutably.
    pub fn tracker_mut(&mut self) -> &mut DistributionTracker {
        &mut self.tracker
    }

    /// Returns the fire loader.
    #[must_use]
    pub const fn fire(&self) -> &FireSpreadLoader {
        &self.fire
    }

    /// Returns the active dimension.
    #[must_use]
    pub const fn dimension(&self) -> &DimensionId {
        &self.dimension
    }

    /// Returns the last simulated turn.
    #[must_use]
    pub const fn turn(&self) -> u64 {
        self.turn
    }

    /// Registers a window in the active dimension.
    pub fn request_load(
        &mut self,
        source: LoadSource,
        center: ColumnPos,
        radius: u32,
        z_min: i32,
        z_max: i32,
    ) -> RequestHandle {
        self.manager
            .request_load(source, self.dimension.clone(), center, radius, z_min, z_max)
    }

    /// Places the reality bubble at `center`, or moves it there.
    pub fn center_bubble(&mut self, center: ColumnPos) {
        match self.bubble {
            Some(handle) => self.manager.update_request(handle, center),
            None => {
                let handle = self.request_load(
                    LoadSource::RealityBubble,
                    center,
                    self.config.bubble_radius,
                    self.config.z_min,
                    self.config.z_max,
                );
                self.bubble = Some(handle);
            },
        }
    }

    /// Returns the reality bubble center, if placed.
    #[must_use]
    pub fn bubble_center(&self) -> Option<ColumnPos> {
        self.bubble
            .and_then(|handle| self.manager.request(handle))
            .map(|request| request.center)
    }

    /// Removes the reality bubble; takes effect at the next tick.
    pub fn release_bubble(&mut self) {
        if let Some(handle) = self.bubble.take() {
            self.manager.release_load(handle);
        }
    }

    /// Advances one turn. `listeners` are notified after the distribution
    /// tracker for every residency transition.
    pub fn tick(&mut self, listeners: &mut [&mut dyn SubmapListener]) -> StreamResult<TickReport> {
        self.turn += 1;
        self.loader.set_turn(self.turn);

        let mut all: Vec<&mut dyn SubmapListener> = Vec::with_capacity(listeners.len() + 1);
        all.push(&mut self.tracker);
        for listener in listeners.iter_mut() {
            all.push(&mut **listener);
        }
        let update = self.manager.update(&self.registry, &mut self.loader, &mut all)?;

        let grid = self.tracker.update(self.turn);
        let fire_released = self.fire.prune_disconnected(&mut self.manager, &self.registry);
        let fire_requested = self
            .fire
            .request_adjacent_to_fires(&mut self.manager, &self.registry);

        debug!(
            "Turn {}: +{} -{} chunks, {} fire requests held",
            self.turn,
            update.loaded.len(),
            update.unloaded.len(),
            self.fire.held_count()
        );

        Ok(TickReport {
            turn: self.turn,
            update,
            grid,
            fire_released,
            fire_requested,
        })
    }

    /// Moves the player to `dimension`.
    ///
    /// The old dimension is saved and unloaded, the distribution tracker is
    /// retargeted, and the previous desired set is forgotten so the next tick
    /// loads the new surroundings from scratch. The reality bubble keeps its
    /// center.
    pub fn switch_dimension(&mut self, dimension: DimensionId) -> StreamResult<SaveReport> {
        if dimension == self.dimension {
            return Ok(SaveReport::default());
        }
        info!("Switching dimension from {} to {dimension}", self.dimension);

        self.loader.flush_all()?;
        self.fire.release_all(&mut self.manager);
        let center = self.bubble_center();
        self.release_bubble();

        let report = self.registry.unload_dimension(&self.dimension)?;
        self.tracker.set_dimension(dimension.clone());
        self.manager.flush_prev_desired();
        self.dimension = dimension;

        if let Some(center) = center {
            self.center_bubble(center);
        }
        Ok(report)
    }

    /// Saves every dimension on the worker pool and waits for completion.
    pub fn save_all(&mut self) -> StreamResult<Vec<(DimensionId, SaveReport)>> {
        self.loader.flush_all()?;
        let reports = self.registry.save_all(&self.pool)?;
        info!("Saved {} dimensions", reports.len());
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::terrain;
    use crate::generation::GeneratorConfig;
    use meridian_common::{ChunkPos, LocalPos};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StreamingConfig {
        StreamingConfig {
            save_dir: dir.path().to_path_buf(),
            worker_threads: Some(2),
            bubble_radius: 1,
            z_min: 0,
            z_max: 0,
            generator: GeneratorConfig {
                fire_chance: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Counter {
        loaded: usize,
        unloaded: usize,
    }

    impl SubmapListener for Counter {
        fn on_submap_loaded(&mut self, _pos: ChunkPos, _dimension: &DimensionId) {
            self.loaded += 1;
        }

        fn on_submap_unloaded(&mut self, _pos: ChunkPos, _dimension: &DimensionId) {
            self.unloaded += 1;
        }
    }

    #[test]
    fn test_tick_loads_bubble() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut streamer = WorldStreamer::new(config(&dir));
        let mut counter = Counter::default();
        streamer.center_bubble(ColumnPos::new(0, 0));

        let report = streamer.tick(&mut [&mut counter]).expect("tick failed");
        assert_eq!(report.turn, 1);
        assert_eq!(report.update.loaded.len(), 9);
        assert_eq!(counter.loaded, 9);
        assert_eq!(streamer.tracker().tracked_count(), 9);
        assert_eq!(streamer.bubble_center(), Some(ColumnPos::new(0, 0)));
    }

    #[test]
    fn test_moving_bubble_keeps_tracker_in_sync() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut streamer = WorldStreamer::new(config(&dir));
        let mut counter = Counter::default();
        streamer.center_bubble(ColumnPos::new(0, 0));
        streamer.tick(&mut [&mut counter]).expect("tick failed");

        streamer.center_bubble(ColumnPos::new(10, 10));
        let report = streamer.tick(&mut [&mut counter]).expect("tick failed");
        assert_eq!(report.update.evicted_quads.len(), 4);
        assert_eq!(counter.unloaded, 9);
        assert_eq!(streamer.tracker().tracked_count(), 9);
        assert!(!streamer.tracker().is_tracked(ChunkPos::new(0, 0, 0)));
    }

    #[test]
    fn test_save_all_then_reload() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let pos = ChunkPos::new(0, 0, 0);
        let tile = LocalPos::new(3, 4);
        {
            let mut streamer = WorldStreamer::new(config(&dir));
            streamer.center_bubble(ColumnPos::new(0, 0));
            streamer.tick(&mut []).expect("tick failed");
            let chunk = streamer
                .registry()
                .primary()
                .lookup_in_memory(pos)
                .expect("chunk missing");
            chunk.write().set_terrain(tile, terrain::WATER);
            chunk.write().set_terrain(LocalPos::new(0, 0), terrain::SAND);
            streamer.save_all().expect("save failed");
        }

        let mut streamer = WorldStreamer::new(config(&dir));
        streamer.center_bubble(ColumnPos::new(0, 0));
        streamer.tick(&mut []).expect("tick failed");
        let chunk = streamer
            .registry()
            .primary()
            .lookup_in_memory(pos)
            .expect("chunk missing");
        assert_eq!(chunk.read().terrain_at(tile), Some(terrain::WATER));
        assert_eq!(chunk.read().terrain_at(LocalPos::new(0, 0)), Some(terrain::SAND));
    }

    #[test]
    fn test_switch_dimension() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut streamer = WorldStreamer::new(config(&dir));
        streamer.center_bubble(ColumnPos::new(0, 0));
        streamer.tick(&mut []).expect("tick failed");

        let lab = DimensionId::new("lab");
        streamer.switch_dimension(lab.clone()).expect("switch failed");
        assert_eq!(streamer.dimension(), &lab);
        assert!(!streamer.registry().has_any_loaded(&DimensionId::primary()));
        assert_eq!(streamer.tracker().tracked_count(), 0);

        let report = streamer.tick(&mut []).expect("tick failed");
        assert_eq!(report.update.loaded.len(), 9);
        assert!(report.update.unloaded.is_empty());
        assert!(streamer.registry().has_any_loaded(&lab));
        assert_eq!(streamer.tracker().tracked_count(), 9);
        assert_eq!(streamer.bubble_center(), Some(ColumnPos::new(0, 0)));
    }
}
