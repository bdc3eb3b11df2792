//! ID types for dimensions, load requests and derived clusters.

use serde::{Deserialize, Serialize};

/// Name of an independently streamed world or sub-world.
///
/// The empty name is the primary dimension, which always exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct DimensionId(String);

impl DimensionId {
    /// Creates a dimension id from a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the primary dimension id.
    #[must_use]
    pub const fn primary() -> Self {
        Self(String::new())
    }

    /// Checks if this is the primary dimension.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the dimension name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DimensionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_primary() {
            f.write_str("<primary>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for DimensionId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Opaque handle to a registered load request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestHandle(u64);

impl RequestHandle {
    /// Creates a handle from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Identifier of a distribution cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(u64);

impl ClusterId {
    /// Creates a cluster id from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}
