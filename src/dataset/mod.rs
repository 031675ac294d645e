//! Bricked volume sources
//!
//! A [`SourceDataset`] is anything that exposes a bricked, multiresolution
//! volume: file readers, procedural generators, or the [`Rebricker`] view
//! that re-partitions another source.

pub mod memory;
pub mod rebrick;

pub use memory::MemoryDataset;
pub use rebrick::Rebricker;

use glam::{UVec3, Vec3};

use crate::brick::addressing;
use crate::brick::{BrickData, BrickKey, BrickStats, VoxelFormat};
use crate::core::types::Result;

/// Capability interface of a bricked volume.
///
/// Brick sizes reported here include ghost voxels. Reads are synchronous;
/// I/O failures are reported as [`crate::core::Error::Io`].
pub trait SourceDataset {
    /// Voxel domain at a LOD level (0 = full resolution).
    fn domain_size(&self, lod: u32, timestep: u32) -> UVec3;

    /// Number of LOD levels.
    fn lod_level_count(&self) -> u32;

    /// Number of timesteps.
    fn timestep_count(&self) -> u32 {
        1
    }

    /// Largest brick actually used, ghost voxels included.
    fn max_used_brick_size(&self) -> UVec3;

    /// Ghost voxels per axis (half on each side).
    fn ghost_width(&self) -> u32;

    /// Voxel element type and component count.
    fn format(&self) -> VoxelFormat;

    /// Relative world-space size of one voxel per axis.
    fn scale(&self) -> Vec3 {
        Vec3::ONE
    }

    /// Read and decompress one brick.
    fn get_brick(&self, key: &BrickKey) -> Result<BrickData>;

    /// Precomputed value statistics of a brick, if the source has them.
    fn brick_stats(&self, key: &BrickKey) -> Option<BrickStats>;

    /// Brick size without ghost voxels.
    fn inner_brick_size(&self) -> UVec3 {
        self.max_used_brick_size() - UVec3::splat(self.ghost_width())
    }

    /// Bricks per axis at a LOD.
    fn brick_layout(&self, lod: u32, timestep: u32) -> UVec3 {
        addressing::layout(self.domain_size(lod, timestep), self.inner_brick_size())
    }

    /// Number of bricks at a LOD.
    fn brick_count(&self, lod: u32, timestep: u32) -> u64 {
        addressing::brick_count(self.brick_layout(lod, timestep))
    }
}

impl<D: SourceDataset + ?Sized> SourceDataset for &D {
    fn domain_size(&self, lod: u32, timestep: u32) -> UVec3 {
        (**self).domain_size(lod, timestep)
    }

    fn lod_level_count(&self) -> u32 {
        (**self).lod_level_count()
    }

    fn timestep_count(&self) -> u32 {
        (**self).timestep_count()
    }

    fn max_used_brick_size(&self) -> UVec3 {
        (**self).max_used_brick_size()
    }

    fn ghost_width(&self) -> u32 {
        (**self).ghost_width()
    }

    fn format(&self) -> VoxelFormat {
        (**self).format()
    }

    fn scale(&self) -> Vec3 {
        (**self).scale()
    }

    fn get_brick(&self, key: &BrickKey) -> Result<BrickData> {
        (**self).get_brick(key)
    }

    fn brick_stats(&self, key: &BrickKey) -> Option<BrickStats> {
        (**self).brick_stats(key)
    }
}

impl<D: SourceDataset + ?Sized> SourceDataset for std::sync::Arc<D> {
    fn domain_size(&self, lod: u32, timestep: u32) -> UVec3 {
        (**self).domain_size(lod, timestep)
    }

    fn lod_level_count(&self) -> u32 {
        (**self).lod_level_count()
    }

    fn timestep_count(&self) -> u32 {
        (**self).timestep_count()
    }

    fn max_used_brick_size(&self) -> UVec3 {
        (**self).max_used_brick_size()
    }

    fn ghost_width(&self) -> u32 {
        (**self).ghost_width()
    }

    fn format(&self) -> VoxelFormat {
        (**self).format()
    }

    fn scale(&self) -> Vec3 {
        (**self).scale()
    }

    fn get_brick(&self, key: &BrickKey) -> Result<BrickData> {
        (**self).get_brick(key)
    }

    fn brick_stats(&self, key: &BrickKey) -> Option<BrickStats> {
        (**self).brick_stats(key)
    }
}
