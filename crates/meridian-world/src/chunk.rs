//! Chunk (submap) data structure.

use meridian_common::{CardinalMask, ChunkPos, LocalPos, SchemaVersion, SUBMAP_SIZE};
use serde::{Deserialize, Serialize};

/// Terrain type identifier stored per tile.
pub type TerrainId = u16;

/// Built-in terrain ids.
pub mod terrain {
    use super::TerrainId;

    /// Empty sky
    pub const OPEN_AIR: TerrainId = 0;
    /// Solid rock
    pub const ROCK: TerrainId = 1;
    /// Water
    pub const WATER: TerrainId = 2;
    /// Sand
    pub const SAND: TerrainId = 3;
    /// Grass
    pub const GRASS: TerrainId = 4;
    /// Dirt
    pub const DIRT: TerrainId = 5;
}

/// Number of tiles in a chunk.
pub const TILES_PER_CHUNK: usize = (SUBMAP_SIZE * SUBMAP_SIZE) as usize;

/// Kind of a field occupying a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Burning fire; spreads across chunk borders
    Fire,
    /// Smoke left behind by fire
    Smoke,
}

/// A field instance on one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEntry {
    /// Tile the field occupies
    pub tile: LocalPos,
    /// Field kind
    pub kind: FieldKind,
    /// Intensity (0 = extinguished)
    pub intensity: u8,
}

/// Kind of a distribution grid node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridNodeKind {
    /// Stores charge up to `capacity`
    Battery {
        /// Maximum charge
        capacity: i64,
        /// Current charge
        charge: i64,
    },
    /// Produces `rate` charge per turn
    Source {
        /// Charge per turn
        rate: i64,
    },
    /// Consumes `rate` charge per turn
    Sink {
        /// Charge per turn
        rate: i64,
    },
    /// Cuts its chunk's grid links when the cluster flow exceeds `limit`
    Breaker {
        /// Maximum absolute flow per turn
        limit: i64,
    },
}

/// A distribution grid node placed on a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridNode {
    /// Tile the node occupies
    pub tile: LocalPos,
    /// Node kind
    pub kind: GridNodeKind,
}

/// Distribution grid content of a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridData {
    /// Directions in which this chunk's grid connects to neighboring regions
    pub links: CardinalMask,
    /// Nodes placed in this chunk
    pub nodes: Vec<GridNode>,
}

impl GridData {
    /// Returns whether the chunk takes part in any distribution grid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.nodes.is_empty()
    }
}

/// Serializable content of a chunk, everything except its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBody {
    /// Terrain per tile, row-major
    pub terrain: Vec<TerrainId>,
    /// Fields present in the chunk
    pub fields: Vec<FieldEntry>,
    /// Distribution grid content
    pub grid: GridData,
    /// Turn at which the chunk was last simulated or generated
    pub last_touched: u64,
    /// Set by the generator when regenerating reproduces this content;
    /// cleared by any edit
    pub uniform: bool,
}

impl ChunkBody {
    /// Returns whether the chunk can be regenerated instead of persisted.
    #[must_use]
    pub const fn is_uniform(&self) -> bool {
        self.uniform
    }
}

/// Versioned on-disk record of one chunk, tagged with its absolute position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Record schema version
    pub version: SchemaVersion,
    /// Absolute x
    pub x: i32,
    /// Absolute y
    pub y: i32,
    /// Absolute z
    pub z: i32,
    /// Chunk content
    pub body: ChunkBody,
}

impl ChunkRecord {
    /// Returns the absolute position of the record.
    #[must_use]
    pub const fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.y, self.z)
    }
}

/// A chunk of the world: a `SUBMAP_SIZE` x `SUBMAP_SIZE` tile grid plus its
/// fields and grid content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Absolute chunk position
    pos: ChunkPos,
    /// Chunk content
    body: ChunkBody,
}

impl Chunk {
    /// Creates a chunk filled with a single terrain type.
    #[must_use]
    pub fn filled(pos: ChunkPos, terrain: TerrainId) -> Self {
        Self {
            pos,
            body: ChunkBody {
                terrain: vec![terrain; TILES_PER_CHUNK],
                fields: Vec::new(),
                grid: GridData::default(),
                last_touched: 0,
                uniform: false,
            },
        }
    }

    /// Creates a filled chunk flagged as uniform. Only generators should
    /// use this, for content they reproduce exactly.
    #[must_use]
    pub fn uniform(pos: ChunkPos, terrain: TerrainId) -> Self {
        let mut chunk = Self::filled(pos, terrain);
        chunk.body.uniform = true;
        chunk
    }

    /// Creates an empty (open air) chunk.
    #[must_use]
    pub fn new(pos: ChunkPos) -> Self {
        Self::filled(pos, terrain::OPEN_AIR)
    }

    /// Returns the chunk position.
    #[must_use]
    pub const fn pos(&self) -> ChunkPos {
        self.pos
    }

    /// Gets the terrain at a tile.
    #[must_use]
    pub fn terrain_at(&self, tile: LocalPos) -> Option<TerrainId> {
        self.body.terrain.get(tile.to_index()).copied()
    }

    /// Sets the terrain at a tile.
    pub fn set_terrain(&mut self, tile: LocalPos, terrain: TerrainId) -> bool {
        if let Some(slot) = self.body.terrain.get_mut(tile.to_index()) {
            *slot = terrain;
            self.body.uniform = false;
            return true;
        }
        false
    }

    /// Returns all terrain, row-major.
    #[must_use]
    pub fn terrain(&self) -> &[TerrainId] {
        &self.body.terrain
    }

    /// Returns the fields in this chunk.
    #[must_use]
    pub fn fields(&self) -> &[FieldEntry] {
        &self.body.fields
    }

    /// Places a field, replacing any field of the same kind on that tile.
    pub fn add_field(&mut self, tile: LocalPos, kind: FieldKind, intensity: u8) {
        self.body.uniform = false;
        self.body
            .fields
            .retain(|f| !(f.tile == tile && f.kind == kind));
        if intensity > 0 {
            self.body.fields.push(FieldEntry {
                tile,
                kind,
                intensity,
            });
        }
    }

    /// Removes every field of `kind` from the chunk.
    pub fn clear_fields(&mut self, kind: FieldKind) {
        self.body.uniform = false;
        self.body.fields.retain(|f| f.kind != kind);
    }

    /// Returns whether any live field of `kind` is present.
    #[must_use]
    pub fn has_field(&self, kind: FieldKind) -> bool {
        self.body
            .fields
            .iter()
            .any(|f| f.kind == kind && f.intensity > 0)
    }

    /// Returns the edges on which a live field of `kind` touches the border.
    #[must_use]
    pub fn field_edges(&self, kind: FieldKind) -> CardinalMask {
        self.body
            .fields
            .iter()
            .filter(|f| f.kind == kind && f.intensity > 0)
            .flat_map(|f| {
                meridian_common::Direction::ALL
                    .into_iter()
                    .filter(move |dir| f.tile.is_on_edge(*dir))
            })
            .collect()
    }

    /// Returns the grid content.
    #[must_use]
    pub const fn grid(&self) -> &GridData {
        &self.body.grid
    }

    /// Returns the grid content mutably.
    pub fn grid_mut(&mut self) -> &mut GridData {
        self.body.uniform = false;
        &mut self.body.grid
    }

    /// Returns the turn the chunk was last touched.
    #[must_use]
    pub const fn last_touched(&self) -> u64 {
        self.body.last_touched
    }

    /// Records that the chunk was simulated at `turn`.
    pub fn touch(&mut self, turn: u64) {
        self.body.last_touched = turn;
    }

    /// Returns whether the chunk is still exactly as generated uniform, so it
    /// can be regenerated instead of persisted.
    #[must_use]
    pub const fn is_uniform(&self) -> bool {
        self.body.is_uniform()
    }

    /// Converts the chunk to its on-disk record.
    #[must_use]
    pub fn to_record(&self) -> ChunkRecord {
        ChunkRecord {
            version: SchemaVersion::CHUNK_RECORD,
            x: self.pos.x,
            y: self.pos.y,
            z: self.pos.z,
            body: self.body.clone(),
        }
    }

    /// Rebuilds a chunk from its on-disk record.
    #[must_use]
    pub fn from_record(record: ChunkRecord) -> Self {
        let pos = record.pos();
        let mut body = record.body;
        body.terrain.resize(TILES_PER_CHUNK, terrain::OPEN_AIR);
        Self { pos, body }
    }
}
