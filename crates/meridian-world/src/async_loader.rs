//! Asynchronous chunk loading.
//!
//! Load requests are deduplicated per `(dimension, position)` and resolved on
//! the worker pool: already resident, then disk, then procedural generation.
//! Workers only return positions; chunk references are resolved on the
//! coordinating thread when results are drained.

use std::collections::HashSet;
use std::sync::Arc;

use meridian_common::{ChunkPos, DimensionId, StreamResult};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::generation::QuadGenerator;
use crate::load_request::DesiredKey;
use crate::registry::StoreRegistry;
use crate::store::ChunkRef;
use crate::thread_pool::{TaskHandle, ThreadPool};

/// A load submitted to the pool and not yet drained.
struct PendingLoad {
    /// What is being loaded
    key: DesiredKey,
    /// Resolves to the loaded position
    task: TaskHandle<StreamResult<ChunkPos>>,
}

/// A finished load, resolved to its resident chunk.
#[derive(Clone)]
pub struct LoadedSubmap {
    /// Dimension of the chunk
    pub dimension: DimensionId,
    /// Position of the chunk
    pub pos: ChunkPos,
    /// The resident chunk
    pub chunk: ChunkRef,
}

impl std::fmt::Debug for LoadedSubmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedSubmap")
            .field("dimension", &self.dimension)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

/// Deduplicating asynchronous loader.
pub struct AsyncLoader {
    /// Worker pool
    pool: Arc<ThreadPool>,
    /// Stores loads resolve into
    registry: Arc<StoreRegistry>,
    /// Generator for quads that were never persisted
    generator: Arc<dyn QuadGenerator>,
    /// Serializes the disk-or-generate step across workers
    generation_lock: Arc<Mutex<()>>,
    /// Submitted loads, in submission order
    pending: Vec<PendingLoad>,
    /// Keys of `pending`
    in_flight: HashSet<DesiredKey>,
    /// Turn stamped on generated chunks
    turn: u64,
}

impl AsyncLoader {
    /// Creates a loader.
    #[must_use]
    pub fn new(
        pool: Arc<ThreadPool>,
        registry: Arc<StoreRegistry>,
        generator: Arc<dyn QuadGenerator>,
    ) -> Self {
        Self {
            pool,
            registry,
            generator,
            generation_lock: Arc::new(Mutex::new(())),
            pending: Vec::new(),
            in_flight: HashSet::new(),
            turn: 0,
        }
    }

    /// Sets the turn stamped on chunks generated from now on.
    pub fn set_turn(&mut self, turn: u64) {
        self.turn = turn;
    }

    /// Returns the current generation turn.
    #[must_use]
    pub const fn turn(&self) -> u64 {
        self.turn
    }

    /// Returns the number of loads not yet drained.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Checks if a load for `(dimension, pos)` is in flight.
    #[must_use]
    pub fn is_pending(&self, dimension: &DimensionId, pos: ChunkPos) -> bool {
        self.in_flight.contains(&DesiredKey::new(dimension.clone(), pos))
    }

    /// Requests that `pos` become resident. Never blocks.
    ///
    /// Returns `false` if a load for the same position is already in flight.
    pub fn request_load(&mut self, dimension: &DimensionId, pos: ChunkPos) -> bool {
        let key = DesiredKey::new(dimension.clone(), pos);
        if self.in_flight.contains(&key) {
            trace!("Load of {pos} in {dimension} already in flight");
            return false;
        }

        let registry = Arc::clone(&self.registry);
        let generator = Arc::clone(&self.generator);
        let lock = Arc::clone(&self.generation_lock);
        let dimension = dimension.clone();
        let turn = self.turn;

        let task = self.pool.submit(move || -> StreamResult<ChunkPos> {
            let store = registry.get(&dimension);
            if store.is_resident(pos) {
                return Ok(pos);
            }

            let _guard = lock.lock();
            // Another worker may have loaded the quad while we waited.
            if store.is_resident(pos) {
                return Ok(pos);
            }
            if store.load(pos)?.is_some() {
                return Ok(pos);
            }

            let anchor = pos.quad_anchor();
            let inserted = store.insert_generated(generator.generate_quad(&dimension, anchor, turn));
            debug!("Generated {anchor} of {dimension} ({inserted} new chunks)");
            Ok(pos)
        });

        self.in_flight.insert(key.clone());
        self.pending.push(PendingLoad { key, task });
        true
    }

    /// Blocks on every pending load listed in `must_have`, then merges every
    /// other load that has already finished.
    ///
    /// Every finished task is merged even when one fails; the first failure
    /// is then returned.
    pub fn drain_completed(&mut self, must_have: &[DesiredKey]) -> StreamResult<Vec<LoadedSubmap>> {
        let wanted: HashSet<&DesiredKey> = must_have.iter().collect();
        let (blocking, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|load| wanted.contains(&load.key));

        let mut finished = blocking;
        for mut load in rest {
            if load.task.is_ready() {
                finished.push(load);
            } else {
                self.pending.push(load);
            }
        }
        self.merge(finished)
    }

    /// Blocks on every pending load.
    ///
    /// Must be called before any structural mutation of a store from the
    /// coordinating thread.
    pub fn flush_all(&mut self) -> StreamResult<Vec<LoadedSubmap>> {
        let all = std::mem::take(&mut self.pending);
        self.merge(all)
    }

    fn merge(&mut self, loads: Vec<PendingLoad>) -> StreamResult<Vec<LoadedSubmap>> {
        let mut loaded = Vec::with_capacity(loads.len());
        let mut first_error = None;

        for load in loads {
            self.in_flight.remove(&load.key);
            let DesiredKey { dimension, pos } = load.key;
            match load.task.join().and_then(|result| result) {
                Ok(pos) => match self.registry.get(&dimension).lookup_in_memory(pos) {
                    Some(chunk) => loaded.push(LoadedSubmap {
                        dimension,
                        pos,
                        chunk,
                    }),
                    None => warn!("Load of {pos} in {dimension} finished but chunk is not resident"),
                },
                Err(e) => {
                    warn!("Load of {pos} in {dimension} failed: {e}");
                    first_error.get_or_insert(e);
                },
            }
        }

        first_error.map_or(Ok(loaded), Err)
    }
}
