//! # Meridian World
//!
//! World streaming for Project Meridian.
//!
//! This crate handles:
//! - Per-dimension submap stores with quad-granular persistence
//! - Load requests and the desired set of resident chunks
//! - Asynchronous loading and procedural generation on a worker pool
//! - Distribution clusters derived from resident grid content
//! - Opportunistic loading for spreading fire

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod async_loader;
pub mod chunk;
pub mod config;
pub mod distribution;
pub mod fire;
pub mod generation;
pub mod listener;
pub mod load_request;
pub mod quad_file;
pub mod registry;
pub mod store;
pub mod streamer;
pub mod thread_pool;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::async_loader::*;
    pub use crate::chunk::*;
    pub use crate::config::*;
    pub use crate::distribution::*;
    pub use crate::fire::*;
    pub use crate::generation::*;
    pub use crate::listener::*;
    pub use crate::load_request::*;
    pub use crate::registry::*;
    pub use crate::store::*;
    pub use crate::streamer::*;
    pub use crate::thread_pool::*;
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::{ChunkPos, ColumnPos, DimensionId, LocalPos};
    use tempfile::TempDir;

    #[test]
    fn test_chunk_creation() {
        let pos = ChunkPos::new(0, 0, 0);
        let chunk = Chunk::new(pos);
        assert_eq!(chunk.pos(), pos);
        assert_eq!(chunk.terrain_at(LocalPos::new(0, 0)), Some(terrain::OPEN_AIR));
        assert!(!chunk.is_uniform());
    }

    #[test]
    fn test_streamer_walk() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut streamer = WorldStreamer::new(StreamingConfig {
            save_dir: dir.path().to_path_buf(),
            worker_threads: Some(1),
            bubble_radius: 2,
            z_min: -1,
            z_max: 1,
            generator: GeneratorConfig {
                fire_chance: 0.0,
                ..Default::default()
            },
            ..Default::default()
        });

        for step in 0..6 {
            streamer.center_bubble(ColumnPos::new(step * 2, 0));
            streamer.tick(&mut []).expect("tick failed");
            let store = streamer.registry().get(&DimensionId::primary());
            for key in streamer.manager().desired() {
                assert!(store.is_resident(key.pos));
            }
            assert_eq!(streamer.tracker().tracked_count(), 5 * 5 * 3);
        }
        streamer.save_all().expect("save failed");
    }
}
