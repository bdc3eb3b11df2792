//! Opportunistic loading for spreading fire.
//!
//! Fire burning at the edge of a properly requested chunk may spread into a
//! neighbor that nobody asked for. The fire loader holds single-chunk
//! requests for such neighbors, bounded by a global cap, and releases them
//! once the fire is out or the chunk is cut off from the reality bubble.

use std::collections::BTreeMap;

use meridian_common::{ChunkPos, DimensionId, RequestHandle};
use tracing::debug;

use crate::chunk::FieldKind;
use crate::load_request::{DesiredKey, LoadRequestManager, LoadSource};
use crate::registry::StoreRegistry;

/// Default cap on opportunistic requests.
pub const DEFAULT_FIRE_REQUEST_CAP: usize = 32;

/// Holds capped single-chunk requests for chunks fire may spread into.
#[derive(Debug)]
pub struct FireSpreadLoader {
    /// Maximum number of held requests
    cap: usize,
    /// Held requests
    held: BTreeMap<DesiredKey, RequestHandle>,
}

impl Default for FireSpreadLoader {
    fn default() -> Self {
        Self::new(DEFAULT_FIRE_REQUEST_CAP)
    }
}

impl FireSpreadLoader {
    /// Creates a loader holding at most `cap` requests.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            held: BTreeMap::new(),
        }
    }

    /// Returns the request cap.
    #[must_use]
    pub const fn cap(&self) -> usize {
        self.cap
    }

    /// Returns the number of held requests.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Checks if a request for `pos` is held.
    #[must_use]
    pub fn is_held(&self, dimension: &DimensionId, pos: ChunkPos) -> bool {
        self.held.contains_key(&DesiredKey::new(dimension.clone(), pos))
    }

    /// Requests `pos` so fire can spread into it.
    ///
    /// Does nothing when the cap is reached, when `pos` is already held, or
    /// when a window of another source already covers it.
    pub fn request_for_fire(
        &mut self,
        manager: &mut LoadRequestManager,
        dimension: &DimensionId,
        pos: ChunkPos,
    ) -> Option<RequestHandle> {
        if self.held.len() >= self.cap {
            debug!("Fire request cap of {} reached; skipping {pos}", self.cap);
            return None;
        }
        let key = DesiredKey::new(dimension.clone(), pos);
        if self.held.contains_key(&key)
            || manager.is_requested_by_other_than(dimension, pos, LoadSource::Opportunistic)
        {
            return None;
        }

        let handle = manager.request_load(
            LoadSource::Opportunistic,
            dimension.clone(),
            pos.column(),
            0,
            pos.z,
            pos.z,
        );
        self.held.insert(key, handle);
        Some(handle)
    }

    /// Releases every held request whose chunk no longer burns, or none of
    /// whose cardinal neighbors is properly requested. Chunks that are not
    /// resident yet keep their request until their content is known.
    pub fn prune_disconnected(
        &mut self,
        manager: &mut LoadRequestManager,
        registry: &StoreRegistry,
    ) -> usize {
        let stale: Vec<DesiredKey> = self
            .held
            .keys()
            .filter(|key| {
                let burning = registry
                    .get(&key.dimension)
                    .lookup_in_memory(key.pos)
                    .map_or(true, |chunk| chunk.read().has_field(FieldKind::Fire));
                let connected = key
                    .pos
                    .cardinal_neighbors()
                    .into_iter()
                    .any(|n| manager.is_properly_requested(&key.dimension, n));
                !burning || !connected
            })
            .cloned()
            .collect();

        for key in &stale {
            if let Some(handle) = self.held.remove(key) {
                debug!("Releasing fire request for {} in {}", key.pos, key.dimension);
                manager.release_load(handle);
            }
        }
        stale.len()
    }

    /// Requests the neighbor across every burning edge of each properly
    /// requested resident chunk. Returns how many requests were issued.
    pub fn request_adjacent_to_fires(
        &mut self,
        manager: &mut LoadRequestManager,
        registry: &StoreRegistry,
    ) -> usize {
        let candidates: Vec<DesiredKey> = manager
            .desired()
            .iter()
            .filter(|key| manager.is_properly_requested(&key.dimension, key.pos))
            .flat_map(|key| {
                let edges = registry
                    .get(&key.dimension)
                    .lookup_in_memory(key.pos)
                    .map(|chunk| chunk.read().field_edges(FieldKind::Fire))
                    .unwrap_or_default();
                meridian_common::Direction::ALL
                    .into_iter()
                    .filter(move |dir| edges.contains(*dir))
                    .map(move |dir| DesiredKey::new(key.dimension.clone(), key.pos.neighbor(dir)))
            })
            .collect();

        candidates
            .into_iter()
            .filter(|key| self.request_for_fire(manager, &key.dimension, key.pos).is_some())
            .count()
    }

    /// Releases every held request.
    pub fn release_all(&mut self, manager: &mut LoadRequestManager) {
        for (_, handle) in std::mem::take(&mut self.held) {
            manager.release_load(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_loader::AsyncLoader;
    use crate::chunk::{terrain, Chunk};
    use crate::generation::WorldGenerator;
    use crate::thread_pool::ThreadPool;
    use meridian_common::{ColumnPos, LocalPos, SUBMAP_SIZE};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn primary() -> DimensionId {
        DimensionId::primary()
    }

    fn burning(pos: ChunkPos, tile: LocalPos) -> Chunk {
        let mut chunk = Chunk::filled(pos, terrain::GRASS);
        chunk.add_field(tile, FieldKind::Fire, 2);
        chunk
    }

    #[test]
    fn test_cap_limits_requests() {
        let mut manager = LoadRequestManager::new();
        let mut fire = FireSpreadLoader::new(1);
        assert!(fire
            .request_for_fire(&mut manager, &primary(), ChunkPos::new(5, 5, 0))
            .is_some());
        assert!(fire
            .request_for_fire(&mut manager, &primary(), ChunkPos::new(9, 9, 0))
            .is_none());
        assert_eq!(fire.held_count(), 1);
        assert_eq!(manager.request_count(), 1);
    }

    #[test]
    fn test_covered_or_held_positions_skipped() {
        let mut manager = LoadRequestManager::new();
        let mut fire = FireSpreadLoader::new(4);
        manager.request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 1, 0, 0);

        assert!(fire
            .request_for_fire(&mut manager, &primary(), ChunkPos::new(1, 1, 0))
            .is_none());
        let outside = ChunkPos::new(2, 0, 0);
        assert!(fire.request_for_fire(&mut manager, &primary(), outside).is_some());
        assert!(fire.request_for_fire(&mut manager, &primary(), outside).is_none());
        assert!(fire.is_held(&primary(), outside));
        assert!(manager.is_requested(&primary(), outside));
        assert!(!manager.is_properly_requested(&primary(), outside));
    }

    #[test]
    fn test_prune_drops_extinguished_and_disconnected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let registry = StoreRegistry::new(dir.path());
        let store = registry.primary();
        let mut manager = LoadRequestManager::new();
        let mut fire = FireSpreadLoader::new(8);
        manager.request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 1, 0, 0);

        // Burning and next to the bubble.
        let kept = ChunkPos::new(2, 0, 0);
        store.insert(burning(kept, LocalPos::new(0, 4)));
        // Next to the bubble but the fire is out.
        let extinguished = ChunkPos::new(-2, 0, 0);
        store.insert(Chunk::filled(extinguished, terrain::DIRT));
        // Burning but two columns away from the bubble.
        let far = ChunkPos::new(3, 0, 0);
        store.insert(burning(far, LocalPos::new(3, 3)));
        // Not resident yet.
        let pending = ChunkPos::new(0, 2, 0);

        for pos in [kept, extinguished, far, pending] {
            assert!(fire.request_for_fire(&mut manager, &primary(), pos).is_some());
        }

        assert_eq!(fire.prune_disconnected(&mut manager, &registry), 2);
        assert!(fire.is_held(&primary(), kept));
        assert!(fire.is_held(&primary(), pending));
        assert!(!fire.is_held(&primary(), extinguished));
        assert!(!fire.is_held(&primary(), far));
        assert!(!manager.is_requested(&primary(), far));
    }

    #[test]
    fn test_requests_across_burning_edges() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let registry = Arc::new(StoreRegistry::new(dir.path()));
        let mut loader = AsyncLoader::new(
            Arc::new(ThreadPool::new(0)),
            Arc::clone(&registry),
            Arc::new(WorldGenerator::with_seed(3)),
        );
        let mut manager = LoadRequestManager::new();
        let mut fire = FireSpreadLoader::new(8);
        let origin = ChunkPos::new(0, 0, 0);

        // The origin burns on its east edge before anything loads.
        let last = u8::try_from(SUBMAP_SIZE - 1).expect("submap size fits in u8");
        registry.primary().insert(burning(origin, LocalPos::new(last, 6)));
        manager.request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 0, 0, 0);
        manager
            .update(&registry, &mut loader, &mut [])
            .expect("update failed");

        assert_eq!(fire.request_adjacent_to_fires(&mut manager, &registry), 1);
        assert!(fire.is_held(&primary(), ChunkPos::new(1, 0, 0)));

        fire.release_all(&mut manager);
        assert_eq!(fire.held_count(), 0);
        assert_eq!(manager.request_count(), 1);
    }
}
