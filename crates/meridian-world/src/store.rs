//! Per-dimension submap store.
//!
//! A store owns every resident chunk of one dimension, keyed by absolute
//! position. Chunks are persisted in quads: [`SubmapStore::unload_quad`] and
//! [`SubmapStore::save`] always write all four members of a quad at once.
//!
//! The resident map is a concurrent map, but structural changes made by the
//! coordinating thread (eviction, save with deletion) must not overlap with
//! async loads; callers flush the async loader first.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use meridian_common::{ChunkPos, DimensionId, QuadAnchor, StreamResult};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkRecord};
use crate::listener::SubmapListener;
use crate::quad_file;

/// Shared handle to a resident chunk.
pub type ChunkRef = Arc<RwLock<Chunk>>;

/// Options for [`SubmapStore::save`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Evict saved chunks that the caller does not ask to keep
    pub delete_after_save: bool,
    /// Log progress while saving
    pub show_progress: bool,
}

/// Outcome of saving one quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuadSaveOutcome {
    /// The quad file was written
    Written,
    /// Every member is uniform; nothing was written
    Uniform,
    /// No member is resident
    NotResident,
}

/// Summary of a [`SubmapStore::save`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Quad files written
    pub quads_written: usize,
    /// Quads skipped because every member is uniform
    pub quads_uniform: usize,
    /// Quads whose write failed; they stay resident
    pub quads_failed: usize,
    /// Chunks evicted after saving
    pub evicted: Vec<ChunkPos>,
}

/// Resident chunks of one dimension.
pub struct SubmapStore {
    /// Dimension this store belongs to
    dimension: DimensionId,
    /// Directory holding this dimension's quad files
    root: PathBuf,
    /// Resident chunks
    chunks: DashMap<ChunkPos, ChunkRef, RandomState>,
}

impl SubmapStore {
    /// Creates an empty store persisting under `root`.
    #[must_use]
    pub fn new(dimension: DimensionId, root: PathBuf) -> Self {
        Self {
            dimension,
            root,
            chunks: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Returns the dimension of this store.
    #[must_use]
    pub fn dimension(&self) -> &DimensionId {
        &self.dimension
    }

    /// Returns the directory this store persists to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the number of resident chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns whether no chunk is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Returns the positions of all resident chunks, sorted.
    #[must_use]
    pub fn positions(&self) -> Vec<ChunkPos> {
        let mut positions: Vec<_> = self.chunks.iter().map(|e| *e.key()).collect();
        positions.sort_unstable();
        positions
    }

    /// Returns the resident chunk at `pos` without touching disk.
    #[must_use]
    pub fn lookup_in_memory(&self, pos: ChunkPos) -> Option<ChunkRef> {
        self.chunks.get(&pos).map(|e| Arc::clone(e.value()))
    }

    /// Checks if a chunk is resident.
    #[must_use]
    pub fn is_resident(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    /// Returns the resident chunk at `pos`, reading its quad from disk if
    /// needed. `Ok(None)` means the chunk must be generated.
    pub fn lookup(&self, pos: ChunkPos) -> StreamResult<Option<ChunkRef>> {
        if let Some(chunk) = self.lookup_in_memory(pos) {
            return Ok(Some(chunk));
        }
        self.load(pos)
    }

    /// Reads the quad owning `pos` from disk and makes its members resident.
    ///
    /// Members that are already resident keep their in-memory state.
    pub fn load(&self, pos: ChunkPos) -> StreamResult<Option<ChunkRef>> {
        let anchor = pos.quad_anchor();
        let path = quad_file::quad_path(&self.root, anchor);
        let Some(records) = self.read_quad(&path)? else {
            return Ok(None);
        };

        let mut found = BTreeSet::new();
        for record in records {
            let record_pos = record.pos();
            if !anchor.contains(record_pos) {
                warn!(
                    "Quad file {} holds foreign chunk {record_pos}; ignoring it",
                    path.display()
                );
                continue;
            }
            found.insert(record_pos);
            if !self.insert(Chunk::from_record(record)) {
                warn!(
                    "Chunk {record_pos} of {} already loaded; keeping resident copy",
                    self.dimension
                );
            }
        }

        for member in anchor.members() {
            if !found.contains(&member) {
                warn!(
                    "Quad file {} is missing chunk {member}",
                    path.display()
                );
            }
        }

        debug!("Loaded {anchor} of {} from disk", self.dimension);
        Ok(self.lookup_in_memory(pos))
    }

    /// Reads a quad file. A file that does not decode is moved aside and
    /// treated as absent, so its chunks are regenerated; I/O failures are
    /// returned.
    fn read_quad(&self, path: &Path) -> StreamResult<Option<Vec<ChunkRecord>>> {
        match quad_file::read(path) {
            Err(e) if e.is_corruption() => {
                let aside = quad_file::corrupt_path(path);
                warn!(
                    "Unreadable quad file in {} ({e}); moving it to {}",
                    self.dimension,
                    aside.display()
                );
                if let Err(rename_err) = std::fs::rename(path, &aside) {
                    warn!("Failed to move {} aside: {rename_err}", path.display());
                }
                Ok(None)
            },
            result => result,
        }
    }

    /// Inserts a chunk unless one is already resident at its position.
    ///
    /// Returns `false` and drops `chunk` if the position was occupied.
    pub fn insert(&self, chunk: Chunk) -> bool {
        match self.chunks.entry(chunk.pos()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(RwLock::new(chunk)));
                true
            },
        }
    }

    /// Inserts freshly generated chunks, skipping resident positions.
    pub fn insert_generated(&self, chunks: Vec<Chunk>) -> usize {
        chunks
            .into_iter()
            .filter(|chunk| {
                let pos = chunk.pos();
                let resident = self.is_resident(pos);
                if resident {
                    debug!("Generated chunk {pos} already resident; discarding");
                }
                !resident
            })
            .map(|chunk| usize::from(self.insert(chunk)))
            .sum()
    }

    /// Writes the quad at `anchor` to disk.
    ///
    /// Members that are not resident are carried over from the existing file
    /// so a partially resident quad never truncates its file. A quad whose
    /// resident members are all uniform is not written, and any stale file is
    /// removed.
    pub fn save_quad(&self, anchor: QuadAnchor) -> StreamResult<QuadSaveOutcome> {
        let resident: Vec<ChunkRecord> = anchor
            .members()
            .into_iter()
            .filter_map(|pos| self.lookup_in_memory(pos))
            .map(|chunk| chunk.read().to_record())
            .collect();
        if resident.is_empty() {
            return Ok(QuadSaveOutcome::NotResident);
        }

        let path = quad_file::quad_path(&self.root, anchor);
        let mut records = resident;
        if records.len() < 4 {
            if let Some(previous) = self.read_quad(&path)? {
                records.extend(
                    previous
                        .into_iter()
                        .filter(|old| !self.is_resident(old.pos())),
                );
            }
        }

        if records.iter().all(|record| record.body.is_uniform()) {
            quad_file::remove(&path)?;
            return Ok(QuadSaveOutcome::Uniform);
        }

        records.sort_by_key(ChunkRecord::pos);
        quad_file::write(&path, anchor, &records)?;
        Ok(QuadSaveOutcome::Written)
    }

    /// Saves the owning quad and evicts the single chunk at `pos`.
    ///
    /// This leaves the rest of the quad resident; eviction of whole quads
    /// goes through [`SubmapStore::unload_quad`].
    pub fn unload(&self, pos: ChunkPos) -> StreamResult<bool> {
        if !self.is_resident(pos) {
            return Ok(false);
        }
        self.save_quad(pos.quad_anchor())?;
        Ok(self.chunks.remove(&pos).is_some())
    }

    /// Saves and evicts all four members of a quad. Returns how many chunks
    /// were evicted. On a failed write nothing is evicted.
    pub fn unload_quad(&self, anchor: QuadAnchor) -> StreamResult<usize> {
        self.save_quad(anchor)?;
        let evicted = anchor
            .members()
            .into_iter()
            .filter(|pos| self.chunks.remove(pos).is_some())
            .count();
        debug!("Evicted {evicted} chunks of {anchor} from {}", self.dimension);
        Ok(evicted)
    }

    /// Saves every resident quad.
    ///
    /// With `delete_after_save`, chunks of successfully saved quads are
    /// evicted unless `keep` returns true for them; `listener` is told about
    /// each eviction before it happens. Individual quad failures are logged
    /// and counted; those quads stay resident.
    pub fn save(
        &self,
        options: SaveOptions,
        keep: impl Fn(ChunkPos) -> bool,
        mut listener: Option<&mut dyn SubmapListener>,
    ) -> StreamResult<SaveReport> {
        let quads: BTreeSet<QuadAnchor> = self
            .chunks
            .iter()
            .map(|e| e.key().quad_anchor())
            .collect();
        let total = quads.len();
        let progress_step = (total / 10).max(1);
        let mut report = SaveReport::default();

        for (index, anchor) in quads.into_iter().enumerate() {
            match self.save_quad(anchor) {
                Ok(QuadSaveOutcome::Written) => report.quads_written += 1,
                Ok(QuadSaveOutcome::Uniform) => report.quads_uniform += 1,
                Ok(QuadSaveOutcome::NotResident) => continue,
                Err(e) => {
                    warn!("Failed to save {anchor} of {}: {e}", self.dimension);
                    report.quads_failed += 1;
                    continue;
                },
            }

            if options.delete_after_save {
                for pos in anchor.members() {
                    if !self.is_resident(pos) || keep(pos) {
                        continue;
                    }
                    if let Some(listener) = listener.as_deref_mut() {
                        listener.on_submap_unloaded(pos, &self.dimension);
                    }
                    self.chunks.remove(&pos);
                    report.evicted.push(pos);
                }
            }

            if options.show_progress && (index + 1) % progress_step == 0 {
                info!(
                    "Saving {}: {}/{} quads",
                    self.dimension,
                    index + 1,
                    total
                );
            }
        }

        info!(
            "Saved {} ({} quads written, {} uniform, {} failed, {} evicted)",
            self.dimension,
            report.quads_written,
            report.quads_uniform,
            report.quads_failed,
            report.evicted.len()
        );
        Ok(report)
    }

    /// Moves every resident chunk into `other`.
    ///
    /// On a collision the destination keeps its chunk and the source copy is
    /// dropped. Returns how many chunks were moved.
    pub fn transfer_all_to(&self, other: &SubmapStore) -> usize {
        let mut moved = 0;
        for pos in self.positions() {
            let Some((_, chunk)) = self.chunks.remove(&pos) else {
                continue;
            };
            match other.chunks.entry(pos) {
                Entry::Occupied(_) => warn!(
                    "Chunk {pos} already present in {}; dropping copy from {}",
                    other.dimension, self.dimension
                ),
                Entry::Vacant(entry) => {
                    entry.insert(chunk);
                    moved += 1;
                },
            }
        }
        moved
    }

    /// Drops every resident chunk without saving.
    pub fn clear(&self) {
        self.chunks.clear();
    }
}
