//! Load/unload notification interface.

use meridian_common::{ChunkPos, DimensionId};

/// Receives residency transitions of desired chunks.
///
/// Notifications are delivered on the coordinating thread. An unload
/// notification always arrives before the chunk is evicted, so listeners can
/// still read it from its store.
pub trait SubmapListener {
    /// Called once when `pos` enters the desired set and is resident.
    fn on_submap_loaded(&mut self, pos: ChunkPos, dimension: &DimensionId);

    /// Called once when `pos` leaves the desired set, before eviction.
    fn on_submap_unloaded(&mut self, pos: ChunkPos, dimension: &DimensionId);
}
