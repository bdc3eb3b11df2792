//! Procedural world generation.

use meridian_common::{CardinalMask, ChunkPos, Direction, DimensionId, LocalPos, QuadAnchor};
use noise::{NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use crate::chunk::{terrain, Chunk, FieldKind, GridNode, GridNodeKind, TerrainId, TILES_PER_CHUNK};

/// Produces the chunks of a quad that has never been persisted.
///
/// Implementations run on worker threads and must be deterministic for a
/// given dimension, anchor and turn.
pub trait QuadGenerator: Send + Sync {
    /// Generates the four members of the quad at `anchor`.
    fn generate_quad(&self, dimension: &DimensionId, anchor: QuadAnchor, turn: u64) -> Vec<Chunk>;
}

/// World generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// World seed
    pub seed: u32,
    /// Terrain scale in tiles (larger = smoother)
    pub terrain_scale: f64,
    /// Probability that a ground chunk hosts distribution grid equipment
    pub grid_chance: f64,
    /// Probability that a ground chunk starts with a fire
    pub fire_chance: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: 12345,
            terrain_scale: 40.0,
            grid_chance: 0.15,
            fire_chance: 0.02,
        }
    }
}

/// Procedural world generator.
///
/// Levels above ground are uniform open air, levels below are uniform rock,
/// and ground level gets noise terrain plus scattered grid equipment and fires.
pub struct WorldGenerator {
    /// Configuration
    config: GeneratorConfig,
    /// Terrain noise
    terrain_noise: Perlin,
    /// Detail noise
    detail_noise: Perlin,
}

impl WorldGenerator {
    /// Creates a new generator with the given config.
    #[must_use]
    pub fn new(config: GeneratorConfig) -> Self {
        let terrain_noise = Perlin::new(config.seed);
        let detail_noise = Perlin::new(config.seed.wrapping_add(1));

        Self {
            config,
            terrain_noise,
            detail_noise,
        }
    }

    /// Creates a generator with default config.
    #[must_use]
    pub fn with_seed(seed: u32) -> Self {
        Self::new(GeneratorConfig {
            seed,
            ..Default::default()
        })
    }

    /// Returns the generator configuration.
    #[must_use]
    pub const fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Generates a single chunk.
    #[must_use]
    pub fn generate_chunk(&self, dimension: &DimensionId, pos: ChunkPos, turn: u64) -> Chunk {
        let mut chunk = match pos.z {
            z if z > 0 => Chunk::uniform(pos, terrain::OPEN_AIR),
            z if z < 0 => Chunk::uniform(pos, terrain::ROCK),
            _ => self.generate_ground(dimension, pos),
        };
        chunk.touch(turn);
        chunk
    }

    fn generate_ground(&self, dimension: &DimensionId, pos: ChunkPos) -> Chunk {
        let mut chunk = Chunk::new(pos);
        let size = meridian_common::SUBMAP_SIZE as f64;
        let offset = dimension_offset(dimension);

        for index in 0..TILES_PER_CHUNK {
            let tile = LocalPos::from_index(index);
            let wx = (f64::from(pos.x) * size + f64::from(tile.x) + offset) / self.config.terrain_scale;
            let wy = (f64::from(pos.y) * size + f64::from(tile.y) + offset) / self.config.terrain_scale;

            let height = self.terrain_noise.get([wx, wy]);
            let detail = self.detail_noise.get([wx * 4.0, wy * 4.0]) * 0.1;
            let combined = (height + detail + 1.0) / 2.0;
            chunk.set_terrain(tile, Self::height_to_terrain(combined));
        }

        let mut rng = fastrand::Rng::with_seed(self.chunk_seed(dimension, pos));
        if rng.f64() < self.config.grid_chance {
            Self::place_grid(&mut chunk, &mut rng);
        }
        if rng.f64() < self.config.fire_chance {
            let tile = LocalPos::from_index(rng.usize(..TILES_PER_CHUNK));
            chunk.add_field(tile, FieldKind::Fire, rng.u8(1..=3));
        }
        chunk
    }

    fn place_grid(chunk: &mut Chunk, rng: &mut fastrand::Rng) {
        let links: CardinalMask = Direction::ALL
            .into_iter()
            .filter(|_| rng.bool())
            .collect();
        let tile = LocalPos::from_index(rng.usize(..TILES_PER_CHUNK));
        let kind = match rng.u8(0..3) {
            0 => {
                let capacity = rng.i64(100..=1000);
                GridNodeKind::Battery {
                    capacity,
                    charge: rng.i64(0..=capacity),
                }
            },
            1 => GridNodeKind::Source {
                rate: rng.i64(1..=10),
            },
            _ => GridNodeKind::Sink {
                rate: rng.i64(1..=10),
            },
        };
        let grid = chunk.grid_mut();
        grid.links = links;
        grid.nodes.push(GridNode { tile, kind });
    }

    /// Converts a normalized height (0-1) to a terrain id.
    fn height_to_terrain(height: f64) -> TerrainId {
        match height {
            h if h < 0.3 => terrain::WATER,
            h if h < 0.35 => terrain::SAND,
            h if h < 0.6 => terrain::GRASS,
            h if h < 0.8 => terrain::DIRT,
            _ => terrain::ROCK,
        }
    }

    fn chunk_seed(&self, dimension: &DimensionId, pos: ChunkPos) -> u64 {
        let seed = pos
            .as_bytes()
            .iter()
            .fold(u64::from(self.config.seed) ^ 0xCBF2_9CE4_8422_2325, |acc, b| {
                (acc ^ u64::from(*b)).wrapping_mul(0x0100_0000_01B3)
            });
        seed ^ (dimension_offset(dimension) as u64)
    }
}

impl QuadGenerator for WorldGenerator {
    fn generate_quad(&self, dimension: &DimensionId, anchor: QuadAnchor, turn: u64) -> Vec<Chunk> {
        anchor
            .members()
            .into_iter()
            .map(|pos| self.generate_chunk(dimension, pos, turn))
            .collect()
    }
}

/// Noise-space offset distinguishing dimensions that share one seed.
fn dimension_offset(dimension: &DimensionId) -> f64 {
    let hash = dimension
        .as_str()
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    f64::from(hash % 100_000) * 7.0
}
