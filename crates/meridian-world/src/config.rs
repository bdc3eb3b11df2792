//! Streaming configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::fire::DEFAULT_FIRE_REQUEST_CAP;
use crate::generation::GeneratorConfig;

/// Largest accepted reality bubble radius, in chunks.
const MAX_BUBBLE_RADIUS: u32 = 32;

/// Deepest and highest accepted z levels.
const Z_LIMIT: i32 = 16;

/// Largest accepted worker count.
const MAX_WORKER_THREADS: usize = 64;

/// Configuration of the streaming layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    // === Persistence ===
    /// Directory quad files are saved under
    pub save_dir: PathBuf,

    // === Workers ===
    /// Worker thread count (None = hardware threads minus one, 0 = inline)
    pub worker_threads: Option<usize>,

    // === Reality Bubble ===
    /// Bubble radius in chunks
    pub bubble_radius: u32,
    /// Lowest z level kept resident around the player
    pub z_min: i32,
    /// Highest z level kept resident around the player
    pub z_max: i32,

    // === Fire Spread ===
    /// Maximum number of opportunistic fire requests
    pub fire_request_cap: usize,

    // === Generation ===
    /// World generator settings
    pub generator: GeneratorConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("save"),
            worker_threads: None,
            bubble_radius: 5,
            z_min: -1,
            z_max: 1,
            fire_request_cap: DEFAULT_FIRE_REQUEST_CAP,
            generator: GeneratorConfig::default(),
        }
    }
}

impl StreamingConfig {
    /// Validate and clamp values to sensible ranges.
    pub fn validate(&mut self) {
        self.bubble_radius = self.bubble_radius.min(MAX_BUBBLE_RADIUS);
        if self.z_min > self.z_max {
            std::mem::swap(&mut self.z_min, &mut self.z_max);
        }
        self.z_min = self.z_min.clamp(-Z_LIMIT, Z_LIMIT);
        self.z_max = self.z_max.clamp(-Z_LIMIT, Z_LIMIT);
        self.worker_threads = self.worker_threads.map(|n| n.min(MAX_WORKER_THREADS));

        let generator = &mut self.generator;
        generator.terrain_scale = generator.terrain_scale.clamp(1.0, 10_000.0);
        generator.grid_chance = generator.grid_chance.clamp(0.0, 1.0);
        generator.fire_chance = generator.fire_chance.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamingConfig::default();
        assert_eq!(config.bubble_radius, 5);
        assert!(config.z_min <= config.z_max);
        assert!(config.worker_threads.is_none());
        assert_eq!(config.fire_request_cap, DEFAULT_FIRE_REQUEST_CAP);
    }

    #[test]
    fn test_config_validation() {
        let mut config = StreamingConfig {
            bubble_radius: 500,
            z_min: 40,
            z_max: -3,
            worker_threads: Some(1000),
            ..Default::default()
        };
        config.generator.fire_chance = 3.0;

        config.validate();

        assert_eq!(config.bubble_radius, MAX_BUBBLE_RADIUS);
        assert_eq!((config.z_min, config.z_max), (-3, Z_LIMIT));
        assert_eq!(config.worker_threads, Some(MAX_WORKER_THREADS));
        assert!((config.generator.fire_chance - 1.0).abs() < f64::EPSILON);
    }
}
