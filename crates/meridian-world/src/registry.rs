//! Registry of per-dimension submap stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use meridian_common::{DimensionId, StreamResult};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::store::{SaveOptions, SaveReport, SubmapStore};
use crate::thread_pool::ThreadPool;

/// Directory under the save root holding non-primary dimensions.
const DIMENSIONS_DIR: &str = "dimensions";

/// Keyed collection of stores, one per dimension.
///
/// Stores are created on first access; the primary dimension exists from
/// construction on and is never removed.
pub struct StoreRegistry {
    /// Save root
    root: PathBuf,
    /// Store of the primary dimension
    primary: Arc<SubmapStore>,
    /// Stores of every other dimension
    stores: RwLock<HashMap<DimensionId, Arc<SubmapStore>>>,
}

impl StoreRegistry {
    /// Creates a registry persisting under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let primary = Arc::new(SubmapStore::new(DimensionId::primary(), root.clone()));
        Self {
            root,
            primary,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the save root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding the quad files of `dimension`.
    ///
    /// The directory always lies below the save root, whatever the name.
    #[must_use]
    pub fn dimension_root(&self, dimension: &DimensionId) -> PathBuf {
        if dimension.is_primary() {
            self.root.clone()
        } else {
            self.root.join(DIMENSIONS_DIR).join(dir_name(dimension))
        }
    }

    /// Returns the primary store.
    #[must_use]
    pub fn primary(&self) -> Arc<SubmapStore> {
        Arc::clone(&self.primary)
    }

    /// Returns the store of `dimension`, creating it if absent.
    pub fn get(&self, dimension: &DimensionId) -> Arc<SubmapStore> {
        if dimension.is_primary() {
            return self.primary();
        }
        if let Some(store) = self.stores.read().get(dimension) {
            return Arc::clone(store);
        }

        let mut stores = self.stores.write();
        let store = stores.entry(dimension.clone()).or_insert_with(|| {
            debug!("Creating store for dimension {dimension}");
            Arc::new(SubmapStore::new(
                dimension.clone(),
                self.dimension_root(dimension),
            ))
        });
        Arc::clone(store)
    }

    /// Checks if a store exists for `dimension`.
    #[must_use]
    pub fn contains(&self, dimension: &DimensionId) -> bool {
        dimension.is_primary() || self.stores.read().contains_key(dimension)
    }

    /// Returns every registered dimension, primary first, the rest sorted.
    #[must_use]
    pub fn dimensions(&self) -> Vec<DimensionId> {
        let mut others: Vec<_> = self.stores.read().keys().cloned().collect();
        others.sort();
        std::iter::once(DimensionId::primary()).chain(others).collect()
    }

    /// Calls `f` for every store, primary first.
    pub fn for_each(&self, mut f: impl FnMut(&SubmapStore)) {
        f(self.primary.as_ref());
        for store in self.snapshot_others() {
            f(store.as_ref());
        }
    }

    /// Returns whether `dimension` has any resident chunk.
    #[must_use]
    pub fn has_any_loaded(&self, dimension: &DimensionId) -> bool {
        if dimension.is_primary() {
            return !self.primary.is_empty();
        }
        self.stores
            .read()
            .get(dimension)
            .is_some_and(|store| !store.is_empty())
    }

    /// Saves and evicts every chunk of `dimension`, then drops its store
    /// unless it is the primary one.
    pub fn unload_dimension(&self, dimension: &DimensionId) -> StreamResult<SaveReport> {
        if !self.contains(dimension) {
            return Ok(SaveReport::default());
        }
        let store = self.get(dimension);
        let report = store.save(
            SaveOptions {
                delete_after_save: true,
                show_progress: true,
            },
            |_| false,
            None,
        )?;
        if !dimension.is_primary() && report.quads_failed == 0 {
            self.stores.write().remove(dimension);
        }
        info!("Unloaded dimension {dimension}");
        Ok(report)
    }

    /// Saves every dimension, one pool task per store, and waits for all of
    /// them. Every task is joined; the first failure is returned.
    pub fn save_all(&self, pool: &ThreadPool) -> StreamResult<Vec<(DimensionId, SaveReport)>> {
        let stores: Vec<Arc<SubmapStore>> = std::iter::once(self.primary())
            .chain(self.snapshot_others())
            .collect();

        let handles: Vec<_> = stores
            .into_iter()
            .map(|store| {
                let dimension = store.dimension().clone();
                let handle = pool.submit(move || {
                    store.save(
                        SaveOptions {
                            delete_after_save: false,
                            show_progress: false,
                        },
                        |_| true,
                        None,
                    )
                });
                (dimension, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for (dimension, handle) in handles {
            match handle.join().and_then(|result| result) {
                Ok(report) => reports.push((dimension, report)),
                Err(e) => {
                    first_error.get_or_insert(e);
                },
            }
        }
        first_error.map_or(Ok(reports), Err)
    }

    fn snapshot_others(&self) -> Vec<Arc<SubmapStore>> {
        let stores = self.stores.read();
        let mut others: Vec<_> = stores.values().map(Arc::clone).collect();
        others.sort_by(|a, b| a.dimension().cmp(b.dimension()));
        others
    }
}

/// Directory name of a non-primary dimension. Bytes outside
/// `[A-Za-z0-9_-]` are written as `%XX`, so distinct names never share a
/// directory and no name can leave the dimensions directory.
fn dir_name(dimension: &DimensionId) -> String {
    use std::fmt::Write;

    dimension.as_str().bytes().fold(String::new(), |mut name, b| {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            name.push(char::from(b));
        } else {
            let _ = write!(name, "%{b:02X}");
        }
        name
    })
}
