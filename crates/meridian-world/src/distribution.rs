//! Resource distribution tracking.
//!
//! Grid content of tracked chunks is aggregated per region, and regions whose
//! grid links reach each other (both sides must link) form a cluster. Clusters
//! are derived state: every load or unload event rebuilds the clusters touching
//! the five-region neighborhood of the event, so no cluster ever refers to an
//! untracked chunk.
//!
//! Structural grid edits raised while iterating clusters are queued and
//! applied afterwards in FIFO order.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use meridian_common::{CardinalMask, ChunkPos, ClusterId, DimensionId, Direction, LocalPos, RegionPos};
use tracing::{debug, info, trace};

use crate::chunk::{GridNode, GridNodeKind};
use crate::listener::SubmapListener;
use crate::registry::StoreRegistry;
use crate::store::SubmapStore;

/// A structural grid edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridChange {
    /// Replace the chunk's link mask
    SetLinks(CardinalMask),
    /// Place a node, replacing any node on the same tile
    PlaceNode(GridNode),
    /// Remove the node on a tile
    RemoveNodeAt(LocalPos),
}

/// A queued grid edit targeting one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridTransform {
    /// Chunk to edit
    pub chunk: ChunkPos,
    /// Edit to apply
    pub change: GridChange,
}

/// Where a node lives, plus its kind when the cluster was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeLocation {
    chunk: ChunkPos,
    tile: LocalPos,
    kind: GridNodeKind,
}

/// Grid content of one region.
struct RegionGrid {
    links: CardinalMask,
    nodes: Vec<NodeLocation>,
}

/// A set of connected regions sharing resources.
#[derive(Debug, Clone)]
pub struct DistributionCluster {
    /// Cluster id
    id: ClusterId,
    /// Member regions
    regions: BTreeSet<RegionPos>,
    /// Grid nodes of every member region
    nodes: Vec<NodeLocation>,
}

impl DistributionCluster {
    fn new(id: ClusterId, members: BTreeMap<RegionPos, RegionGrid>) -> Self {
        let regions = members.keys().copied().collect();
        let nodes = members.into_values().flat_map(|grid| grid.nodes).collect();
        Self { id, regions, nodes }
    }

    /// Returns the cluster id.
    #[must_use]
    pub const fn id(&self) -> ClusterId {
        self.id
    }

    /// Returns the member regions.
    #[must_use]
    pub const fn regions(&self) -> &BTreeSet<RegionPos> {
        &self.regions
    }

    /// Returns the number of grid nodes in the cluster.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the combined battery capacity.
    #[must_use]
    pub fn total_capacity(&self) -> i64 {
        self.nodes
            .iter()
            .map(|node| match node.kind {
                GridNodeKind::Battery { capacity, .. } => capacity,
                _ => 0,
            })
            .sum()
    }

    /// Returns the net charge produced per turn (sources minus sinks).
    #[must_use]
    pub fn net_flow(&self) -> i64 {
        self.nodes
            .iter()
            .map(|node| match node.kind {
                GridNodeKind::Source { rate } => rate,
                GridNodeKind::Sink { rate } => -rate,
                _ => 0,
            })
            .sum()
    }

    fn batteries(&self) -> impl Iterator<Item = &NodeLocation> {
        self.nodes
            .iter()
            .filter(|node| matches!(node.kind, GridNodeKind::Battery { .. }))
    }

    fn breakers(&self) -> impl Iterator<Item = (&NodeLocation, i64)> {
        self.nodes.iter().filter_map(|node| match node.kind {
            GridNodeKind::Breaker { limit } => Some((node, limit)),
            _ => None,
        })
    }
}

/// Outcome of [`DistributionTracker::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridUpdateReport {
    /// Clusters simulated
    pub clusters: usize,
    /// Breakers that tripped
    pub breakers_tripped: usize,
    /// Queued transforms applied after the pass
    pub transforms_applied: usize,
}

/// Derived distribution clusters of one dimension.
pub struct DistributionTracker {
    /// Stores chunk content is read from
    registry: Arc<StoreRegistry>,
    /// Dimension being tracked
    dimension: DimensionId,
    /// Loaded chunks of the dimension
    tracked: HashSet<ChunkPos>,
    /// Cluster of every clustered region
    region_cluster: BTreeMap<RegionPos, ClusterId>,
    /// Live clusters
    clusters: BTreeMap<ClusterId, DistributionCluster>,
    /// Next cluster id
    next_cluster: u64,
    /// Deferred grid edits
    queue: VecDeque<GridTransform>,
}

impl DistributionTracker {
    /// Creates a tracker for `dimension`.
    #[must_use]
    pub fn new(registry: Arc<StoreRegistry>, dimension: DimensionId) -> Self {
        Self {
            registry,
            dimension,
            tracked: HashSet::new(),
            region_cluster: BTreeMap::new(),
            clusters: BTreeMap::new(),
            next_cluster: 0,
            queue: VecDeque::new(),
        }
    }

    /// Returns the tracked dimension.
    #[must_use]
    pub const fn dimension(&self) -> &DimensionId {
        &self.dimension
    }

    /// Retargets the tracker, dropping every cluster and queued edit.
    pub fn set_dimension(&mut self, dimension: DimensionId) {
        if dimension == self.dimension {
            return;
        }
        debug!("Distribution tracker moving from {} to {dimension}", self.dimension);
        self.tracked.clear();
        self.region_cluster.clear();
        self.clusters.clear();
        self.queue.clear();
        self.dimension = dimension;
    }

    /// Returns the number of tracked chunks.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Checks if `pos` is tracked.
    #[must_use]
    pub fn is_tracked(&self, pos: ChunkPos) -> bool {
        self.tracked.contains(&pos)
    }

    /// Returns the number of live clusters.
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Returns every live cluster.
    pub fn clusters(&self) -> impl Iterator<Item = &DistributionCluster> {
        self.clusters.values()
    }

    /// Returns the cluster covering the region of `pos`.
    #[must_use]
    pub fn cluster_at(&self, pos: ChunkPos) -> Option<&DistributionCluster> {
        self.region_cluster
            .get(&pos.region())
            .and_then(|id| self.clusters.get(id))
    }

    /// Returns the charge stored in the cluster covering `pos`.
    #[must_use]
    pub fn total_charge(&self, pos: ChunkPos) -> Option<i64> {
        let cluster = self.cluster_at(pos)?;
        let store = self.store();
        Some(
            cluster
                .batteries()
                .filter_map(|loc| {
                    let chunk = store.lookup_in_memory(loc.chunk)?;
                    let guard = chunk.read();
                    let charge = guard.grid().nodes.iter().find_map(|node| match node.kind {
                        GridNodeKind::Battery { charge, .. } if node.tile == loc.tile => Some(charge),
                        _ => None,
                    });
                    charge
                })
                .sum(),
        )
    }

    /// Returns the battery capacity of the cluster covering `pos`.
    #[must_use]
    pub fn total_capacity(&self, pos: ChunkPos) -> Option<i64> {
        self.cluster_at(pos).map(DistributionCluster::total_capacity)
    }

    /// Deposits (positive) or withdraws (negative) `amount` of charge in the
    /// cluster covering `pos`. Returns the part that did not fit or was not
    /// available.
    pub fn mod_resource(&mut self, pos: ChunkPos, amount: i64) -> i64 {
        match self.region_cluster.get(&pos.region()).copied() {
            Some(id) => self.transfer(id, amount),
            None => amount,
        }
    }

    fn transfer(&self, id: ClusterId, amount: i64) -> i64 {
        let Some(cluster) = self.clusters.get(&id) else {
            return amount;
        };
        let store = self.store();
        let mut remaining = amount;

        for loc in cluster.batteries() {
            if remaining == 0 {
                break;
            }
            let Some(chunk) = store.lookup_in_memory(loc.chunk) else {
                continue;
            };
            let mut guard = chunk.write();
            let battery = guard
                .grid_mut()
                .nodes
                .iter_mut()
                .find(|node| node.tile == loc.tile);
            if let Some(GridNode {
                kind: GridNodeKind::Battery { capacity, charge },
                ..
            }) = battery
            {
                let delta = if remaining > 0 {
                    remaining.min((*capacity - *charge).max(0))
                } else {
                    remaining.max(-(*charge).max(0))
                };
                *charge += delta;
                remaining -= delta;
            }
        }
        remaining
    }

    /// Queues a grid edit for the next [`Self::apply_queued_transforms`].
    pub fn queue_transform(&mut self, transform: GridTransform) {
        self.queue.push_back(transform);
    }

    /// Returns the number of queued edits.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Applies queued edits in FIFO order and rebuilds the affected clusters.
    pub fn apply_queued_transforms(&mut self) -> usize {
        let store = self.store();
        let mut affected = BTreeSet::new();
        let mut applied = 0;

        while let Some(transform) = self.queue.pop_front() {
            let Some(chunk) = store.lookup_in_memory(transform.chunk) else {
                debug!("Dropping grid edit for non-resident chunk {}", transform.chunk);
                continue;
            };
            {
                let mut guard = chunk.write();
                let grid = guard.grid_mut();
                match transform.change {
                    GridChange::SetLinks(links) => grid.links = links,
                    GridChange::PlaceNode(node) => {
                        grid.nodes.retain(|n| n.tile != node.tile);
                        grid.nodes.push(node);
                    },
                    GridChange::RemoveNodeAt(tile) => grid.nodes.retain(|n| n.tile != tile),
                }
            }
            applied += 1;
            if self.tracked.contains(&transform.chunk) {
                affected.insert(transform.chunk.region());
            }
        }

        if !affected.is_empty() {
            self.rebuild_around(affected);
        }
        applied
    }

    /// Runs one turn of flow: every cluster's net production is moved into
    /// (or drawn from) its batteries. A breaker whose limit is below the
    /// absolute flow of its cluster trips instead, cutting its chunk's links;
    /// the cut is applied after the pass.
    pub fn update(&mut self, turn: u64) -> GridUpdateReport {
        let mut report = GridUpdateReport {
            clusters: self.clusters.len(),
            ..Default::default()
        };
        let mut trips = Vec::new();
        let mut flows = Vec::new();

        for cluster in self.clusters.values() {
            let flow = cluster.net_flow();
            let tripped: Vec<ChunkPos> = cluster
                .breakers()
                .filter(|(_, limit)| flow.abs() > *limit)
                .map(|(loc, _)| loc.chunk)
                .collect();
            if tripped.is_empty() {
                if flow != 0 {
                    flows.push((cluster.id(), flow));
                }
            } else {
                trips.extend(tripped);
            }
        }

        for (id, flow) in flows {
            let leftover = self.transfer(id, flow);
            if leftover != 0 {
                trace!("Cluster {} could not absorb {leftover} at turn {turn}", id.raw());
            }
        }

        report.breakers_tripped = trips.len();
        for chunk in trips {
            info!("Breaker in {chunk} tripped at turn {turn}");
            self.queue_transform(GridTransform {
                chunk,
                change: GridChange::SetLinks(CardinalMask::NONE),
            });
        }
        report.transforms_applied = self.apply_queued_transforms();
        report
    }

    fn store(&self) -> Arc<SubmapStore> {
        self.registry.get(&self.dimension)
    }

    fn region_grid(&self, store: &SubmapStore, region: RegionPos) -> Option<RegionGrid> {
        let mut links = CardinalMask::NONE;
        let mut nodes = Vec::new();
        let mut any = false;

        for pos in region.chunks() {
            if !self.tracked.contains(&pos) {
                continue;
            }
            let Some(chunk) = store.lookup_in_memory(pos) else {
                continue;
            };
            let guard = chunk.read();
            let grid = guard.grid();
            if grid.is_empty() {
                continue;
            }
            any = true;
            links = links.union(grid.links);
            nodes.extend(grid.nodes.iter().map(|node| NodeLocation {
                chunk: pos,
                tile: node.tile,
                kind: node.kind,
            }));
        }
        any.then_some(RegionGrid { links, nodes })
    }

    fn dissolve(&mut self, id: ClusterId, seeds: &mut BTreeSet<RegionPos>) {
        if let Some(cluster) = self.clusters.remove(&id) {
            for region in cluster.regions {
                self.region_cluster.remove(&region);
                seeds.insert(region);
            }
        }
    }

    /// Dissolves every cluster touching the neighborhoods of `centers` and
    /// rebuilds clusters from their regions.
    fn rebuild_around(&mut self, centers: impl IntoIterator<Item = RegionPos>) {
        let store = self.store();
        let mut seeds: BTreeSet<RegionPos> = centers
            .into_iter()
            .flat_map(RegionPos::neighborhood)
            .collect();
        let touched: BTreeSet<ClusterId> = seeds
            .iter()
            .filter_map(|region| self.region_cluster.get(region).copied())
            .collect();
        for id in touched {
            self.dissolve(id, &mut seeds);
        }

        while let Some(seed) = seeds.pop_first() {
            if self.region_cluster.contains_key(&seed) {
                continue;
            }
            let Some(grid) = self.region_grid(&store, seed) else {
                continue;
            };

            let mut members = BTreeMap::from([(seed, grid)]);
            let mut frontier = VecDeque::from([seed]);
            while let Some(region) = frontier.pop_front() {
                let links = members
                    .get(&region)
                    .map_or(CardinalMask::NONE, |grid| grid.links);
                for dir in Direction::ALL {
                    let next = region.neighbor(dir);
                    if !links.contains(dir) || members.contains_key(&next) {
                        continue;
                    }
                    let Some(next_grid) = self.region_grid(&store, next) else {
                        continue;
                    };
                    if !next_grid.links.contains(dir.opposite()) {
                        continue;
                    }
                    if let Some(old) = self.region_cluster.get(&next).copied() {
                        self.dissolve(old, &mut seeds);
                    }
                    members.insert(next, next_grid);
                    frontier.push_back(next);
                }
            }

            let id = ClusterId::from_raw(self.next_cluster);
            self.next_cluster += 1;
            let cluster = DistributionCluster::new(id, members);
            for region in cluster.regions() {
                self.region_cluster.insert(*region, id);
            }
            trace!(
                "Built cluster {} with {} regions",
                id.raw(),
                cluster.regions().len()
            );
            self.clusters.insert(id, cluster);
        }
    }
}

impl SubmapListener for DistributionTracker {
    fn on_submap_loaded(&mut self, pos: ChunkPos, dimension: &DimensionId) {
        if dimension == &self.dimension && self.tracked.insert(pos) {
            self.rebuild_around([pos.region()]);
        }
    }

    fn on_submap_unloaded(&mut self, pos: ChunkPos, dimension: &DimensionId) {
        if dimension == &self.dimension && self.tracked.remove(&pos) {
            self.rebuild_around([pos.region()]);
        }
    }
}
