//! Coordinate types for chunks, quads, regions and tiles.
//!
//! Addressing hierarchy, finest to coarsest:
//! - [`LocalPos`]: a tile inside one chunk
//! - [`ChunkPos`]: a chunk (submap), the unit of residency
//! - [`QuadAnchor`]: the 2x2 group of chunks persisted together
//! - [`RegionPos`]: the coarse cell a quad covers, used by derived caches

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Width and height of a chunk in tiles.
pub const SUBMAP_SIZE: u32 = 12;

/// Number of chunks along one side of a quad.
pub const QUAD_SIZE: i32 = 2;

/// Number of regions along one side of a save segment directory.
pub const SEGMENT_SIZE: i32 = 32;

/// One of the four cardinal directions.
///
/// North points towards negative y, matching screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Towards negative y
    North,
    /// Towards positive x
    East,
    /// Towards positive y
    South,
    /// Towards negative x
    West,
}

impl Direction {
    /// All cardinal directions in clockwise order.
    pub const ALL: [Self; 4] = [Self::North, Self::East, Self::South, Self::West];

    /// Returns the (dx, dy) offset of one step in this direction.
    #[must_use]
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Self::North => (0, -1),
            Self::East => (1, 0),
            Self::South => (0, 1),
            Self::West => (-1, 0),
        }
    }

    /// Returns the opposite direction.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::North => Self::South,
            Self::East => Self::West,
            Self::South => Self::North,
            Self::West => Self::East,
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Self::North => 0b0001,
            Self::East => 0b0010,
            Self::South => 0b0100,
            Self::West => 0b1000,
        }
    }
}

/// Set of cardinal directions packed into one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CardinalMask(u8);

impl CardinalMask {
    /// No directions.
    pub const NONE: Self = Self(0);

    /// Every direction.
    pub const ALL: Self = Self(0b1111);

    /// Creates a mask containing a single direction.
    #[must_use]
    pub const fn single(dir: Direction) -> Self {
        Self(dir.bit())
    }

    /// Returns whether the mask contains `dir`.
    #[must_use]
    pub const fn contains(self, dir: Direction) -> bool {
        self.0 & dir.bit() != 0
    }

    /// Adds `dir` to the mask.
    pub fn insert(&mut self, dir: Direction) {
        self.0 |= dir.bit();
    }

    /// Returns the union of two masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns whether no direction is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl FromIterator<Direction> for CardinalMask {
    fn from_iter<I: IntoIterator<Item = Direction>>(iter: I) -> Self {
        let mut mask = Self::NONE;
        for dir in iter {
            mask.insert(dir);
        }
        mask
    }
}

/// Absolute chunk coordinate.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Pod,
    Zeroable,
)]
#[repr(C)]
pub struct ChunkPos {
    /// X coordinate in chunk space
    pub x: i32,
    /// Y coordinate in chunk space
    pub y: i32,
    /// Vertical level
    pub z: i32,
}

impl ChunkPos {
    /// Creates a new chunk coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns the raw in-memory bytes of this position, used for hashing
    /// seeds.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Returns this position shifted horizontally.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z)
    }

    /// Returns the adjacent chunk in `dir`.
    #[must_use]
    pub const fn neighbor(self, dir: Direction) -> Self {
        let (dx, dy) = dir.offset();
        self.offset(dx, dy)
    }

    /// Returns the four cardinal neighbors.
    #[must_use]
    pub fn cardinal_neighbors(self) -> [Self; 4] {
        Direction::ALL.map(|dir| self.neighbor(dir))
    }

    /// Returns the horizontal column of this chunk.
    #[must_use]
    pub const fn column(self) -> ColumnPos {
        ColumnPos::new(self.x, self.y)
    }

    /// Returns the anchor of the quad owning this chunk.
    #[must_use]
    pub const fn quad_anchor(self) -> QuadAnchor {
        QuadAnchor::containing(self)
    }

    /// Returns the region this chunk lies in.
    #[must_use]
    pub const fn region(self) -> RegionPos {
        RegionPos::new(
            self.x.div_euclid(QUAD_SIZE),
            self.y.div_euclid(QUAD_SIZE),
            self.z,
        )
    }
}

impl std::fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Horizontal chunk coordinate, used as the center of load windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ColumnPos {
    /// X coordinate in chunk space
    pub x: i32,
    /// Y coordinate in chunk space
    pub y: i32,
}

impl ColumnPos {
    /// Creates a new column coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns the chunk at level `z` of this column.
    #[must_use]
    pub const fn at(self, z: i32) -> ChunkPos {
        ChunkPos::new(self.x, self.y, z)
    }

    /// Returns this column shifted by (dx, dy).
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

/// Anchor (minimum corner) of a 2x2 quad of chunks.
///
/// A quad is the atomic unit of persistence: its members are always written,
/// read and evicted together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuadAnchor(ChunkPos);

impl QuadAnchor {
    /// Returns the anchor of the quad containing `pos`.
    #[must_use]
    pub const fn containing(pos: ChunkPos) -> Self {
        Self(ChunkPos::new(
            pos.x.div_euclid(QUAD_SIZE) * QUAD_SIZE,
            pos.y.div_euclid(QUAD_SIZE) * QUAD_SIZE,
            pos.z,
        ))
    }

    /// Returns the anchor chunk position.
    #[must_use]
    pub const fn pos(self) -> ChunkPos {
        self.0
    }

    /// Returns the four member positions in row-major order.
    #[must_use]
    pub const fn members(self) -> [ChunkPos; 4] {
        let a = self.0;
        [a, a.offset(1, 0), a.offset(0, 1), a.offset(1, 1)]
    }

    /// Returns whether `pos` belongs to this quad.
    #[must_use]
    pub const fn contains(self, pos: ChunkPos) -> bool {
        let a = Self::containing(pos);
        a.0.x == self.0.x && a.0.y == self.0.y && a.0.z == self.0.z
    }

    /// Returns the region covered by this quad.
    #[must_use]
    pub const fn region(self) -> RegionPos {
        self.0.region()
    }
}

impl std::fmt::Display for QuadAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "quad{}", self.0)
    }
}

/// Region coordinate: one region per quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionPos {
    /// X coordinate in region space
    pub x: i32,
    /// Y coordinate in region space
    pub y: i32,
    /// Vertical level
    pub z: i32,
}

impl RegionPos {
    /// Creates a new region coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns the adjacent region in `dir`.
    #[must_use]
    pub const fn neighbor(self, dir: Direction) -> Self {
        let (dx, dy) = dir.offset();
        Self::new(self.x + dx, self.y + dy, self.z)
    }

    /// Returns this region followed by its four cardinal neighbors.
    #[must_use]
    pub fn neighborhood(self) -> [Self; 5] {
        [
            self,
            self.neighbor(Direction::North),
            self.neighbor(Direction::East),
            self.neighbor(Direction::South),
            self.neighbor(Direction::West),
        ]
    }

    /// Returns the quad covering this region.
    #[must_use]
    pub const fn quad_anchor(self) -> QuadAnchor {
        QuadAnchor::containing(ChunkPos::new(
            self.x * QUAD_SIZE,
            self.y * QUAD_SIZE,
            self.z,
        ))
    }

    /// Returns the chunks of this region.
    #[must_use]
    pub const fn chunks(self) -> [ChunkPos; 4] {
        self.quad_anchor().members()
    }

    /// Returns the save segment (directory bucket) of this region.
    #[must_use]
    pub const fn segment(self) -> (i32, i32) {
        (
            self.x.div_euclid(SEGMENT_SIZE),
            self.y.div_euclid(SEGMENT_SIZE),
        )
    }
}

/// Tile coordinate inside a chunk (0 to SUBMAP_SIZE-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalPos {
    /// X coordinate within the chunk
    pub x: u8,
    /// Y coordinate within the chunk
    pub y: u8,
}

impl LocalPos {
    /// Creates a new local coordinate.
    #[must_use]
    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    /// Converts to a linear index for tile arrays.
    #[must_use]
    pub const fn to_index(self) -> usize {
        (self.y as usize) * (SUBMAP_SIZE as usize) + (self.x as usize)
    }

    /// Creates from a linear index.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        let size = SUBMAP_SIZE as usize;
        Self {
            x: (index % size) as u8,
            y: (index / size) as u8,
        }
    }

    /// Returns whether this tile lies on the chunk edge facing `dir`.
    #[must_use]
    pub const fn is_on_edge(self, dir: Direction) -> bool {
        let last = (SUBMAP_SIZE - 1) as u8;
        match dir {
            Direction::North => self.y == 0,
            Direction::East => self.x == last,
            Direction::South => self.y == last,
            Direction::West => self.x == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_pos_bytes() {
        let pos = ChunkPos::new(1, -1, 2);
        let bytes = pos.as_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytemuck::pod_read_unaligned::<ChunkPos>(bytes), pos);
        assert_ne!(bytes, ChunkPos::new(-1, 1, 2).as_bytes());
    }

    #[test]
    fn test_quad_anchor_rounds_down() {
        assert_eq!(
            ChunkPos::new(3, 5, 0).quad_anchor().pos(),
            ChunkPos::new(2, 4, 0)
        );
        assert_eq!(
            ChunkPos::new(-1, -3, 1).quad_anchor().pos(),
            ChunkPos::new(-2, -4, 1)
        );
        assert_eq!(
            ChunkPos::new(0, 0, -2).quad_anchor().pos(),
            ChunkPos::new(0, 0, -2)
        );
    }

    #[test]
    fn test_quad_members() {
        let anchor = ChunkPos::new(-1, 0, 0).quad_anchor();
        let members = anchor.members();
        assert_eq!(members[0], ChunkPos::new(-2, 0, 0));
        assert_eq!(members[3], ChunkPos::new(-1, 1, 0));
        for member in members {
            assert_eq!(member.quad_anchor(), anchor);
            assert!(anchor.contains(member));
        }
        assert!(!anchor.contains(ChunkPos::new(0, 0, 0)));
    }

    #[test]
    fn test_region_round_trip() {
        let pos = ChunkPos::new(-3, 7, 2);
        let region = pos.region();
        assert_eq!(region, RegionPos::new(-2, 3, 2));
        assert_eq!(region.quad_anchor(), pos.quad_anchor());
        assert!(region.chunks().contains(&pos));
    }

    #[test]
    fn test_region_segment() {
        assert_eq!(RegionPos::new(0, 31, 0).segment(), (0, 0));
        assert_eq!(RegionPos::new(32, -1, 0).segment(), (1, -1));
    }

    #[test]
    fn test_direction_opposites() {
        for dir in Direction::ALL {
            assert_eq!(dir.opposite().opposite(), dir);
            let (dx, dy) = dir.offset();
            let (ox, oy) = dir.opposite().offset();
            assert_eq!((dx + ox, dy + oy), (0, 0));
        }
    }

    #[test]
    fn test_cardinal_mask() {
        let mask: CardinalMask = [Direction::North, Direction::West].into_iter().collect();
        assert!(mask.contains(Direction::North));
        assert!(mask.contains(Direction::West));
        assert!(!mask.contains(Direction::East));
        assert!(CardinalMask::NONE.is_empty());
        assert_eq!(mask.union(CardinalMask::ALL), CardinalMask::ALL);
    }

    #[test]
    fn test_local_pos_edges() {
        let corner = LocalPos::new(0, 0);
        assert!(corner.is_on_edge(Direction::North));
        assert!(corner.is_on_edge(Direction::West));
        assert!(!corner.is_on_edge(Direction::East));

        let last = (SUBMAP_SIZE - 1) as u8;
        let far = LocalPos::new(last, last);
        assert!(far.is_on_edge(Direction::South));
        assert_eq!(LocalPos::from_index(far.to_index()), far);
    }
}
