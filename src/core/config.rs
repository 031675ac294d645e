//! Paging configuration, loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::{Result, UVec3};

/// Default ghost voxels per axis (split evenly between both sides).
pub const DEFAULT_GHOST_WIDTH: u32 = 4;

/// Default number of distinct misses the feedback buffer keeps per subframe.
pub const DEFAULT_FEEDBACK_CAPACITY: u32 = 4096;

/// Default number of read attempts before a brick is poisoned.
pub const DEFAULT_MAX_READ_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Enumerated settings
// ---------------------------------------------------------------------------

/// How the pool's capacity is expressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolCapacity {
    /// A byte budget, divided into slots of the largest brick footprint.
    Bytes(u64),
    /// An explicit 3D grid of slots (atlas layout).
    SlotGrid([u32; 3]),
}

impl PoolCapacity {
    /// Resolve to a slot grid for a given slot size in bytes.
    pub fn slot_grid(&self, slot_bytes: u64) -> Result<UVec3> {
        match *self {
            PoolCapacity::Bytes(bytes) => {
                if slot_bytes == 0 {
                    return Err(Error::config("brick slot size is zero"));
                }
                let slots = bytes / slot_bytes;
                if slots == 0 {
                    return Err(Error::config(format!(
                        "pool budget of {} bytes cannot hold a single {} byte brick",
                        bytes, slot_bytes
                    )));
                }
                let slots = u32::try_from(slots)
                    .map_err(|_| Error::config(format!("pool slot count {} overflows u32", slots)))?;
                Ok(UVec3::new(slots, 1, 1))
            }
            PoolCapacity::SlotGrid(grid) => {
                if grid.contains(&0) {
                    return Err(Error::config(format!("pool slot grid {:?} has an empty axis", grid)));
                }
                Ok(UVec3::from_array(grid))
            }
        }
    }
}

impl Default for PoolCapacity {
    fn default() -> Self {
        PoolCapacity::Bytes(256 * 1024 * 1024)
    }
}

/// How aggressively the traversal falls back to coarser ancestors when the
/// ideal brick is not resident, and which bricks it asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingBrickStrategy {
    /// Request only the brick the traversal wanted.
    #[default]
    RequestExact,
    /// Request the wanted brick and every missing ancestor down from the resident one.
    RequestAllAncestors,
    /// Request the parent of the wanted brick first when it is missing.
    SkipOneLevel,
    /// Request the grandparent first, then the parent, then the brick.
    SkipTwoLevels,
}

impl MissingBrickStrategy {
    /// Number of coarser levels requested ahead of the wanted brick.
    pub fn skip_levels(&self) -> u32 {
        match self {
            MissingBrickStrategy::SkipOneLevel => 1,
            MissingBrickStrategy::SkipTwoLevels => 2,
            _ => 0,
        }
    }
}

/// Where a rebricked dataset gets its per-brick value ranges from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinMaxMode {
    /// Reuse the enclosing source brick's range (conservative, free).
    #[default]
    Source,
    /// Read every new brick once and compute exact ranges.
    Precompute,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Process-wide paging settings, fixed at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Rebrick target size in voxels, ghost excluded.
    pub target_brick_size: [u32; 3],
    /// Ghost voxels per axis, half on each side.
    pub ghost_width: u32,
    /// Pool capacity.
    pub pool: PoolCapacity,
    /// Fallback/request policy for missing bricks.
    pub missing_brick_strategy: MissingBrickStrategy,
    /// Maximum distinct misses read back per subframe.
    pub feedback_capacity: u32,
    /// Read attempts per brick before it is poisoned.
    pub max_read_retries: u32,
    /// Value range source for rebricked bricks.
    pub min_max_mode: MinMaxMode,
    /// Timestep rendered by the paging loop.
    pub timestep: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            target_brick_size: [64, 64, 64],
            ghost_width: DEFAULT_GHOST_WIDTH,
            pool: PoolCapacity::default(),
            missing_brick_strategy: MissingBrickStrategy::default(),
            feedback_capacity: DEFAULT_FEEDBACK_CAPACITY,
            max_read_retries: DEFAULT_MAX_READ_RETRIES,
            min_max_mode: MinMaxMode::default(),
            timestep: 0,
        }
    }
}

impl PagingConfig {
    /// Target brick size as a vector.
    pub fn target_brick_size(&self) -> UVec3 {
        UVec3::from_array(self.target_brick_size)
    }

    /// Check the values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.target_brick_size.contains(&0) {
            return Err(Error::config(format!(
                "target brick size {:?} must be positive on every axis",
                self.target_brick_size
            )));
        }
        if self.ghost_width % 2 != 0 {
            return Err(Error::config(format!(
                "ghost width {} must be even",
                self.ghost_width
            )));
        }
        if self.feedback_capacity == 0 {
            return Err(Error::config("feedback capacity must be positive"));
        }
        match self.pool {
            PoolCapacity::Bytes(0) => Err(Error::config("pool byte budget must be positive")),
            PoolCapacity::SlotGrid(grid) if grid.contains(&0) => {
                Err(Error::config(format!("pool slot grid {:?} has an empty axis", grid)))
            }
            _ => Ok(()),
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PagingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&data)?;
        log::info!("Loaded paging config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
