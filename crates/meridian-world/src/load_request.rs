//! Load-request manager.
//!
//! Subsystems register rectangular windows of chunks they need resident.
//! Every tick the manager unions all windows into the desired set, diffs it
//! against the previous tick, loads what became desired, notifies listeners of
//! every transition, and evicts quads that no longer have a desired member.

use std::collections::{BTreeMap, BTreeSet};

use meridian_common::{ChunkPos, ColumnPos, DimensionId, QuadAnchor, RequestHandle, StreamResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::async_loader::AsyncLoader;
use crate::listener::SubmapListener;
use crate::registry::StoreRegistry;

/// Who asked for a window to be resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadSource {
    /// The area around the player; the only "proper" source
    RealityBubble,
    /// A persistent base kept simulated while away
    PersistentBase,
    /// Requested by a script
    Script,
    /// Speculative single-chunk request (fire spread)
    Opportunistic,
}

/// A registered window: an inclusive square of columns across a z range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// Requester
    pub source: LoadSource,
    /// Dimension of the window
    pub dimension: DimensionId,
    /// Center column
    pub center: ColumnPos,
    /// Half-width of the square; 0 is a single column
    pub radius: u32,
    /// Lowest z level, inclusive
    pub z_min: i32,
    /// Highest z level, inclusive
    pub z_max: i32,
}

impl LoadRequest {
    fn reach(&self) -> i32 {
        i32::try_from(self.radius).unwrap_or(i32::MAX)
    }

    /// Checks if the window contains `pos` in `dimension`.
    #[must_use]
    pub fn covers(&self, dimension: &DimensionId, pos: ChunkPos) -> bool {
        let reach = i64::from(self.reach());
        &self.dimension == dimension
            && (i64::from(pos.x) - i64::from(self.center.x)).abs() <= reach
            && (i64::from(pos.y) - i64::from(self.center.y)).abs() <= reach
            && (self.z_min..=self.z_max).contains(&pos.z)
    }

    /// Returns every position in the window.
    pub fn positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        let reach = self.reach();
        let center = self.center;
        (self.z_min..=self.z_max).flat_map(move |z| {
            (center.y.saturating_sub(reach)..=center.y.saturating_add(reach)).flat_map(move |y| {
                (center.x.saturating_sub(reach)..=center.x.saturating_add(reach))
                    .map(move |x| ChunkPos::new(x, y, z))
            })
        })
    }
}

/// A desired `(dimension, position)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DesiredKey {
    /// Dimension
    pub dimension: DimensionId,
    /// Chunk position
    pub pos: ChunkPos,
}

impl DesiredKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(dimension: DimensionId, pos: ChunkPos) -> Self {
        Self { dimension, pos }
    }
}

/// What one [`LoadRequestManager::update`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Keys that became desired, in notification order
    pub loaded: Vec<DesiredKey>,
    /// Keys that stopped being desired, in notification order
    pub unloaded: Vec<DesiredKey>,
    /// Quads evicted from their stores
    pub evicted_quads: Vec<(DimensionId, QuadAnchor)>,
    /// Quads whose eviction failed; they stay resident
    pub failed_evictions: usize,
}

/// Owns every load request and the desired set derived from them.
#[derive(Debug)]
pub struct LoadRequestManager {
    /// Last handle handed out
    next_handle: u64,
    /// Active requests
    requests: BTreeMap<RequestHandle, LoadRequest>,
    /// Desired set as of the last update
    prev_desired: BTreeSet<DesiredKey>,
}

impl Default for LoadRequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadRequestManager {
    /// Creates a manager with no requests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_handle: 0,
            requests: BTreeMap::new(),
            prev_desired: BTreeSet::new(),
        }
    }

    /// Registers a window and returns its handle.
    pub fn request_load(
        &mut self,
        source: LoadSource,
        dimension: DimensionId,
        center: ColumnPos,
        radius: u32,
        z_min: i32,
        z_max: i32,
    ) -> RequestHandle {
        self.next_handle += 1;
        let handle = RequestHandle::from_raw(self.next_handle);
        let (z_min, z_max) = if z_min <= z_max { (z_min, z_max) } else { (z_max, z_min) };
        debug!("Request {} ({source:?}) at {center:?} r={radius} in {dimension}", handle.raw());
        self.requests.insert(
            handle,
            LoadRequest {
                source,
                dimension,
                center,
                radius,
                z_min,
                z_max,
            },
        );
        handle
    }

    /// Moves a window. Unknown handles are ignored.
    pub fn update_request(&mut self, handle: RequestHandle, new_center: ColumnPos) {
        if let Some(request) = self.requests.get_mut(&handle) {
            request.center = new_center;
        }
    }

    /// Removes a window; the effect is observed at the next update.
    pub fn release_load(&mut self, handle: RequestHandle) {
        if self.requests.remove(&handle).is_some() {
            debug!("Released request {}", handle.raw());
        }
    }

    /// Returns the request behind `handle`.
    #[must_use]
    pub fn request(&self, handle: RequestHandle) -> Option<&LoadRequest> {
        self.requests.get(&handle)
    }

    /// Returns the number of active requests.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Returns the desired set as of the last update.
    #[must_use]
    pub const fn desired(&self) -> &BTreeSet<DesiredKey> {
        &self.prev_desired
    }

    /// Checks if any active window covers `pos`.
    #[must_use]
    pub fn is_requested(&self, dimension: &DimensionId, pos: ChunkPos) -> bool {
        self.requests.values().any(|r| r.covers(dimension, pos))
    }

    /// Checks if a reality bubble window covers `pos`.
    #[must_use]
    pub fn is_properly_requested(&self, dimension: &DimensionId, pos: ChunkPos) -> bool {
        self.requests
            .values()
            .any(|r| r.source == LoadSource::RealityBubble && r.covers(dimension, pos))
    }

    /// Checks if a window of any source other than `source` covers `pos`.
    #[must_use]
    pub fn is_requested_by_other_than(
        &self,
        dimension: &DimensionId,
        pos: ChunkPos,
        source: LoadSource,
    ) -> bool {
        self.requests
            .values()
            .any(|r| r.source != source && r.covers(dimension, pos))
    }

    /// Forgets the previous desired set without any notification, so the next
    /// update treats every desired position as new.
    pub fn flush_prev_desired(&mut self) {
        self.prev_desired.clear();
    }

    fn compute_desired(&self) -> BTreeSet<DesiredKey> {
        self.requests
            .values()
            .flat_map(|r| r.positions().map(|pos| DesiredKey::new(r.dimension.clone(), pos)))
            .collect()
    }

    /// Recomputes the desired set and applies the difference.
    ///
    /// Newly desired positions are loaded (blocking until resident) and
    /// announced to every listener. A position that still is not resident is
    /// retried on the next update. Positions no longer desired are announced
    /// next, then every quad without a desired member is saved and evicted.
    /// Only worker failures are returned as errors; a failed eviction is
    /// logged and the quad stays resident.
    pub fn update(
        &mut self,
        registry: &StoreRegistry,
        loader: &mut AsyncLoader,
        listeners: &mut [&mut dyn SubmapListener],
    ) -> StreamResult<UpdateReport> {
        let mut new_desired = self.compute_desired();
        let added: Vec<DesiredKey> = new_desired.difference(&self.prev_desired).cloned().collect();
        let removed: Vec<DesiredKey> = self.prev_desired.difference(&new_desired).cloned().collect();
        let mut report = UpdateReport::default();

        for key in &added {
            loader.request_load(&key.dimension, key.pos);
        }
        loader.drain_completed(&added)?;

        let mut unresolved = Vec::new();
        for key in added {
            if !registry.get(&key.dimension).is_resident(key.pos) {
                warn!("Desired chunk {} of {} did not become resident", key.pos, key.dimension);
                unresolved.push(key);
                continue;
            }
            for listener in listeners.iter_mut() {
                listener.on_submap_loaded(key.pos, &key.dimension);
            }
            report.loaded.push(key);
        }

        for key in &removed {
            for listener in listeners.iter_mut() {
                listener.on_submap_unloaded(key.pos, &key.dimension);
            }
        }

        let candidates: BTreeSet<(DimensionId, QuadAnchor)> = removed
            .iter()
            .map(|key| (key.dimension.clone(), key.pos.quad_anchor()))
            .collect();
        let mut flushed = false;
        for (dimension, anchor) in candidates {
            let still_desired = anchor
                .members()
                .into_iter()
                .any(|pos| new_desired.contains(&DesiredKey::new(dimension.clone(), pos)));
            if still_desired {
                continue;
            }
            if !flushed {
                loader.flush_all()?;
                flushed = true;
            }
            match registry.get(&dimension).unload_quad(anchor) {
                Ok(_) => report.evicted_quads.push((dimension, anchor)),
                Err(e) => {
                    warn!("Failed to evict {anchor} of {dimension}: {e}");
                    report.failed_evictions += 1;
                },
            }
        }

        // Left out so the next update requests them again.
        for key in &unresolved {
            new_desired.remove(key);
        }
        report.unloaded = removed;
        self.prev_desired = new_desired;

        if !report.loaded.is_empty() || !report.unloaded.is_empty() {
            info!(
                "Desired set: +{} -{} ({} quads evicted, {} total)",
                report.loaded.len(),
                report.unloaded.len(),
                report.evicted_quads.len(),
                self.prev_desired.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{terrain, Chunk};
    use crate::generation::QuadGenerator;
    use crate::thread_pool::ThreadPool;
    use crate::quad_file;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FlatGenerator;

    /// Produces nothing on its first call.
    #[derive(Default)]
    struct LateGenerator {
        calls: AtomicUsize,
    }

    impl QuadGenerator for LateGenerator {
        fn generate_quad(&self, dimension: &DimensionId, anchor: QuadAnchor, turn: u64) -> Vec<Chunk> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Vec::new();
            }
            FlatGenerator.generate_quad(dimension, anchor, turn)
        }
    }

    impl QuadGenerator for FlatGenerator {
        fn generate_quad(&self, _dimension: &DimensionId, anchor: QuadAnchor, _turn: u64) -> Vec<Chunk> {
            anchor
                .members()
                .into_iter()
                .map(|pos| Chunk::filled(pos, terrain::GRASS))
                .collect()
        }
    }

    #[derive(Default)]
    struct Recorder {
        loaded: Vec<ChunkPos>,
        unloaded: Vec<ChunkPos>,
    }

    impl SubmapListener for Recorder {
        fn on_submap_loaded(&mut self, pos: ChunkPos, _dimension: &DimensionId) {
            self.loaded.push(pos);
        }

        fn on_submap_unloaded(&mut self, pos: ChunkPos, _dimension: &DimensionId) {
            self.unloaded.push(pos);
        }
    }

    struct Fixture {
        _dir: TempDir,
        registry: Arc<StoreRegistry>,
        loader: AsyncLoader,
        manager: LoadRequestManager,
    }

    impl Fixture {
        fn new(workers: usize) -> Self {
            Self::with_generator(workers, Arc::new(FlatGenerator))
        }

        fn with_generator(workers: usize, generator: Arc<dyn QuadGenerator>) -> Self {
            let dir = TempDir::new().expect("Failed to create temp dir");
            let registry = Arc::new(StoreRegistry::new(dir.path()));
            let loader = AsyncLoader::new(
                Arc::new(ThreadPool::new(workers)),
                Arc::clone(&registry),
                generator,
            );
            Self {
                _dir: dir,
                registry,
                loader,
                manager: LoadRequestManager::new(),
            }
        }

        fn update(&mut self, recorder: &mut Recorder) -> UpdateReport {
            self.manager
                .update(&self.registry, &mut self.loader, &mut [recorder])
                .expect("update failed")
        }
    }

    fn primary() -> DimensionId {
        DimensionId::primary()
    }

    #[test]
    fn test_handles_increase() {
        let mut manager = LoadRequestManager::new();
        let a = manager.request_load(LoadSource::Script, primary(), ColumnPos::new(0, 0), 0, 0, 0);
        let b = manager.request_load(LoadSource::Script, primary(), ColumnPos::new(0, 0), 0, 0, 0);
        assert!(b > a);
        manager.release_load(a);
        let c = manager.request_load(LoadSource::Script, primary(), ColumnPos::new(0, 0), 0, 0, 0);
        assert!(c > b);
        assert_eq!(manager.request_count(), 2);
    }

    #[test]
    fn test_unknown_handles_ignored() {
        let mut manager = LoadRequestManager::new();
        let bogus = RequestHandle::from_raw(99);
        manager.update_request(bogus, ColumnPos::new(5, 5));
        manager.release_load(bogus);
        assert_eq!(manager.request_count(), 0);
    }

    #[test]
    fn test_window_covers() {
        let request = LoadRequest {
            source: LoadSource::Script,
            dimension: primary(),
            center: ColumnPos::new(2, -3),
            radius: 2,
            z_min: -1,
            z_max: 1,
        };
        assert!(request.covers(&primary(), ChunkPos::new(4, -1, 1)));
        assert!(!request.covers(&primary(), ChunkPos::new(5, -3, 0)));
        assert!(!request.covers(&primary(), ChunkPos::new(2, -3, 2)));
        assert!(!request.covers(&DimensionId::new("lab"), ChunkPos::new(2, -3, 0)));
        assert_eq!(request.positions().count(), 5 * 5 * 3);
    }

    #[test]
    fn test_properly_requested_only_for_bubble() {
        let mut manager = LoadRequestManager::new();
        let pos = ChunkPos::new(0, 0, 0);
        manager.request_load(LoadSource::PersistentBase, primary(), ColumnPos::new(0, 0), 1, 0, 0);
        assert!(manager.is_requested(&primary(), pos));
        assert!(!manager.is_properly_requested(&primary(), pos));
        assert!(!manager.is_requested_by_other_than(&primary(), pos, LoadSource::PersistentBase));
        assert!(manager.is_requested_by_other_than(&primary(), pos, LoadSource::Script));

        let bubble =
            manager.request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 0, 0, 0);
        assert!(manager.is_properly_requested(&primary(), pos));
        assert!(!manager.is_properly_requested(&primary(), ChunkPos::new(1, 0, 0)));
        manager.release_load(bubble);
        assert!(!manager.is_properly_requested(&primary(), pos));
    }

    #[test]
    fn test_bubble_at_origin() {
        let mut fx = Fixture::new(2);
        let mut recorder = Recorder::default();
        fx.manager
            .request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 1, 0, 0);

        let report = fx.update(&mut recorder);
        assert_eq!(report.loaded.len(), 9);
        assert_eq!(recorder.loaded.len(), 9);
        assert!(report.evicted_quads.is_empty());
        let store = fx.registry.primary();
        for key in fx.manager.desired() {
            assert!(store.is_resident(key.pos));
        }
        // Four quads around the origin.
        assert_eq!(store.len(), 16);

        // A second update without changes is silent.
        let report = fx.update(&mut recorder);
        assert_eq!(report, UpdateReport::default());
        assert_eq!(recorder.loaded.len(), 9);
    }

    #[test]
    fn test_moving_bubble_evicts_quads_outside() {
        let mut fx = Fixture::new(2);
        let mut recorder = Recorder::default();
        let handle = fx
            .manager
            .request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 1, 0, 0);
        fx.update(&mut recorder);

        fx.manager.update_request(handle, ColumnPos::new(5, 0));
        let report = fx.update(&mut recorder);
        assert_eq!(recorder.unloaded.len(), 9);
        assert_eq!(report.evicted_quads.len(), 4);
        let store = fx.registry.primary();
        assert!(!store.is_resident(ChunkPos::new(0, 0, 0)));
        assert!(!store.is_resident(ChunkPos::new(-1, -1, 0)));
        assert!(store.is_resident(ChunkPos::new(5, 0, 0)));
    }

    #[test]
    fn test_straddling_quad_stays_resident() {
        let mut fx = Fixture::new(0);
        let mut recorder = Recorder::default();
        let handle = fx
            .manager
            .request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 1, 0, 0);
        fx.update(&mut recorder);

        fx.manager.update_request(handle, ColumnPos::new(2, 0));
        let report = fx.update(&mut recorder);

        // Columns x = -1 and x = 0 left the window; x = 1 is still desired.
        assert_eq!(report.unloaded.len(), 6);
        let evicted: Vec<_> = report.evicted_quads.iter().map(|(_, a)| a.pos()).collect();
        assert_eq!(evicted, vec![ChunkPos::new(-2, -2, 0), ChunkPos::new(-2, 0, 0)]);
        let store = fx.registry.primary();
        assert!(store.is_resident(ChunkPos::new(0, 0, 0)));
        assert!(store.is_resident(ChunkPos::new(0, -1, 0)));
        assert!(!store.is_resident(ChunkPos::new(-1, 0, 0)));
    }

    #[test]
    fn test_unload_notified_before_eviction() {
        struct ResidencyCheck {
            registry: Arc<StoreRegistry>,
            resident_on_unload: Vec<bool>,
        }

        impl SubmapListener for ResidencyCheck {
            fn on_submap_loaded(&mut self, _pos: ChunkPos, _dimension: &DimensionId) {}

            fn on_submap_unloaded(&mut self, pos: ChunkPos, dimension: &DimensionId) {
                let resident = self.registry.get(dimension).is_resident(pos);
                self.resident_on_unload.push(resident);
            }
        }

        let mut fx = Fixture::new(1);
        let mut check = ResidencyCheck {
            registry: Arc::clone(&fx.registry),
            resident_on_unload: Vec::new(),
        };
        let handle = fx
            .manager
            .request_load(LoadSource::Script, primary(), ColumnPos::new(0, 0), 0, 0, 0);
        fx.manager
            .update(&fx.registry, &mut fx.loader, &mut [&mut check])
            .expect("update failed");
        fx.manager.release_load(handle);
        let report = fx
            .manager
            .update(&fx.registry, &mut fx.loader, &mut [&mut check])
            .expect("update failed");

        assert_eq!(report.evicted_quads.len(), 1);
        assert_eq!(check.resident_on_unload, vec![true]);
        assert!(fx.registry.primary().is_empty());
    }

    #[test]
    fn test_flush_prev_desired_reannounces() {
        let mut fx = Fixture::new(0);
        let mut recorder = Recorder::default();
        fx.manager
            .request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 0, 0, 1);
        fx.update(&mut recorder);
        assert_eq!(recorder.loaded.len(), 2);

        fx.manager.flush_prev_desired();
        assert!(fx.manager.desired().is_empty());
        let report = fx.update(&mut recorder);
        assert_eq!(report.loaded.len(), 2);
        assert!(report.unloaded.is_empty());
        assert!(report.evicted_quads.is_empty());
    }

    #[test]
    fn test_overlapping_requests_union() {
        let mut fx = Fixture::new(0);
        let mut recorder = Recorder::default();
        let a = fx
            .manager
            .request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 1, 0, 0);
        fx.manager
            .request_load(LoadSource::Script, primary(), ColumnPos::new(1, 0), 1, 0, 0);
        fx.update(&mut recorder);
        assert_eq!(fx.manager.desired().len(), 12);

        fx.manager.release_load(a);
        let report = fx.update(&mut recorder);
        // Only column x = -1 is no longer covered.
        assert_eq!(report.unloaded.len(), 3);
    }

    #[test]
    fn test_unresolved_chunk_retried_next_update() {
        let mut fx = Fixture::with_generator(0, Arc::new(LateGenerator::default()));
        let mut recorder = Recorder::default();
        let pos = ChunkPos::new(0, 0, 0);
        fx.manager
            .request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 0, 0, 0);

        let report = fx.update(&mut recorder);
        assert!(report.loaded.is_empty());
        assert!(fx.manager.desired().is_empty());

        let report = fx.update(&mut recorder);
        assert_eq!(report.loaded, vec![DesiredKey::new(primary(), pos)]);
        assert_eq!(recorder.loaded, vec![pos]);
        assert!(fx.registry.primary().is_resident(pos));
    }

    #[test]
    fn test_corrupt_quad_file_does_not_stall_updates() {
        let mut fx = Fixture::new(1);
        let mut recorder = Recorder::default();
        let pos = ChunkPos::new(0, 0, 0);
        let path = quad_file::quad_path(fx.registry.root(), pos.quad_anchor());
        std::fs::create_dir_all(path.parent().expect("no parent")).expect("mkdir failed");
        std::fs::write(&path, b"garbage!").expect("write failed");

        fx.manager
            .request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 0, 0, 0);
        let report = fx.update(&mut recorder);
        assert_eq!(report.loaded.len(), 1);
        assert!(fx.registry.primary().is_resident(pos));
        assert!(quad_file::corrupt_path(&path).exists());

        // Later updates are unaffected.
        assert_eq!(fx.update(&mut recorder), UpdateReport::default());
    }

    fn window_strategy() -> impl Strategy<Value = (LoadSource, i32, i32, u32, i32, i32)> {
        (
            prop_oneof![
                Just(LoadSource::RealityBubble),
                Just(LoadSource::PersistentBase),
                Just(LoadSource::Script),
                Just(LoadSource::Opportunistic),
            ],
            -6i32..6,
            -6i32..6,
            0u32..3,
            -1i32..1,
            0i32..2,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn desired_set_is_union_of_windows(windows in prop::collection::vec(window_strategy(), 1..4)) {
            let mut fx = Fixture::new(0);
            let mut recorder = Recorder::default();
            let mut expected = BTreeSet::new();
            for (source, x, y, radius, z_min, z_max) in windows {
                let handle = fx.manager.request_load(source, primary(), ColumnPos::new(x, y), radius, z_min, z_max);
                let request = fx.manager.request(handle).expect("request missing").clone();
                expected.extend(request.positions().map(|pos| DesiredKey::new(primary(), pos)));
            }
            fx.update(&mut recorder);
            prop_assert_eq!(fx.manager.desired(), &expected);
            prop_assert_eq!(recorder.loaded.len(), expected.len());
        }

        #[test]
        fn quads_with_desired_members_stay_resident(moves in prop::collection::vec((-5i32..5, -5i32..5), 1..6)) {
            let mut fx = Fixture::new(0);
            let mut recorder = Recorder::default();
            let handle = fx.manager.request_load(LoadSource::RealityBubble, primary(), ColumnPos::new(0, 0), 1, 0, 0);
            fx.update(&mut recorder);

            for (x, y) in moves {
                fx.manager.update_request(handle, ColumnPos::new(x, y));
                let report = fx.update(&mut recorder);
                let store = fx.registry.primary();
                for key in fx.manager.desired() {
                    prop_assert!(store.is_resident(key.pos));
                }
                for (_, anchor) in &report.evicted_quads {
                    for member in anchor.members() {
                        prop_assert!(!fx.manager.desired().contains(&DesiredKey::new(primary(), member)));
                    }
                }
                for pos in store.positions() {
                    let has_desired = pos
                        .quad_anchor()
                        .members()
                        .into_iter()
                        .any(|member| fx.manager.desired().contains(&DesiredKey::new(primary(), member)));
                    prop_assert!(has_desired);
                }
            }
        }
    }
}
