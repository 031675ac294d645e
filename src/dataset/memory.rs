//! In-memory bricked volume
//!
//! Holds a full-resolution voxel array per timestep, builds its own LOD
//! pyramid by 2x point sampling, and cuts bricks on demand with clamped
//! ghost voxels. Used as the reference source for tests and benches and for
//! volumes small enough to keep in host memory.

use std::collections::HashSet;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::{IVec3, UVec3, Vec3};

use crate::brick::addressing;
use crate::brick::{BrickData, BrickHierarchy, BrickKey, BrickStats, Scalar, VoxelFormat};
use crate::core::error::Error;
use crate::core::types::Result;
use crate::dataset::SourceDataset;

/// One pyramid level: a dense volume per timestep.
struct Level {
    domain: UVec3,
    volumes: Vec<Vec<u8>>,
}

/// Volume held entirely in host memory.
pub struct MemoryDataset {
    format: VoxelFormat,
    levels: Vec<Level>,
    brick_size: UVec3,
    ghost_width: u32,
    scale: Vec3,
    hierarchy: BrickHierarchy,
    stats: Vec<BrickStats>,
    failing: Mutex<HashSet<BrickKey>>,
    reads: AtomicU64,
}

impl MemoryDataset {
    /// Create from raw per-timestep volumes.
    ///
    /// `brick_size` is the full brick size including `ghost_width` ghost
    /// voxels per axis.
    pub fn new(
        format: VoxelFormat,
        domain: UVec3,
        brick_size: UVec3,
        ghost_width: u32,
        timesteps: Vec<Vec<u8>>,
    ) -> Result<Self> {
        if ghost_width % 2 != 0 {
            return Err(Error::config(format!("ghost width {} must be even", ghost_width)));
        }
        if brick_size.cmple(UVec3::splat(ghost_width)).any() {
            return Err(Error::config(format!(
                "brick size {} leaves no voxels beside a ghost width of {}",
                brick_size, ghost_width
            )));
        }
        if domain.min_element() == 0 || timesteps.is_empty() {
            return Err(Error::config("volume must have voxels and at least one timestep"));
        }
        let expected = domain.x as usize * domain.y as usize * domain.z as usize * format.voxel_bytes();
        if let Some(bad) = timesteps.iter().find(|v| v.len() != expected) {
            return Err(Error::PayloadSize { expected, actual: bad.len() });
        }

        let inner = brick_size - UVec3::splat(ghost_width);
        let mut levels = vec![Level { domain, volumes: timesteps }];
        while addressing::layout(levels[levels.len() - 1].domain, inner) != UVec3::ONE {
            let next = downsample(&levels[levels.len() - 1], format.voxel_bytes());
            levels.push(next);
        }

        let domains: Vec<UVec3> = levels.iter().map(|l| l.domain).collect();
        let timestep_count = levels[0].volumes.len() as u32;
        let hierarchy = BrickHierarchy::new(
            &domains,
            inner.min(domain),
            ghost_width,
            timestep_count,
            Vec3::ONE,
        )?;

        let mut dataset = Self {
            format,
            levels,
            brick_size,
            ghost_width,
            scale: Vec3::ONE,
            hierarchy,
            stats: Vec::new(),
            failing: Mutex::new(HashSet::new()),
            reads: AtomicU64::new(0),
        };

        let mut stats = Vec::with_capacity(dataset.hierarchy.total_bricks() as usize);
        for id in 0..dataset.hierarchy.total_bricks() {
            if let Some(key) = dataset.hierarchy.key_for_global(id) {
                stats.push(dataset.cut_brick(&key)?.stats());
            }
        }
        dataset.stats = stats;

        log::info!(
            "MemoryDataset: {} {} voxels, {} LODs, {} bricks per timestep",
            domain,
            format.element,
            dataset.levels.len(),
            dataset.hierarchy.bricks_per_timestep()
        );
        Ok(dataset)
    }

    /// Create a single-timestep volume from typed values.
    pub fn from_values<T: Scalar>(
        domain: UVec3,
        brick_size: UVec3,
        ghost_width: u32,
        values: &[T],
    ) -> Result<Self> {
        let format = VoxelFormat::scalar(T::ELEMENT);
        let bytes = bytemuck::cast_slice(values).to_vec();
        Self::new(format, domain, brick_size, ghost_width, vec![bytes])
    }

    /// Create a single-timestep volume by evaluating `f` at every voxel.
    pub fn from_fn<T: Scalar>(
        domain: UVec3,
        brick_size: UVec3,
        ghost_width: u32,
        f: impl Fn(UVec3) -> T,
    ) -> Result<Self> {
        let mut values = Vec::with_capacity(domain.x as usize * domain.y as usize * domain.z as usize);
        for z in 0..domain.z {
            for y in 0..domain.y {
                for x in 0..domain.x {
                    values.push(f(UVec3::new(x, y, z)));
                }
            }
        }
        Self::from_values(domain, brick_size, ghost_width, &values)
    }

    /// Set the per-axis voxel aspect.
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Configured full brick size (ghost included).
    pub fn brick_size(&self) -> UVec3 {
        self.brick_size
    }

    /// Make every read of `key` fail with an I/O error.
    pub fn fail_reads_for(&self, key: BrickKey) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(key);
        }
    }

    /// Stop injecting read failures.
    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    /// Number of `get_brick` calls served or failed so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn cut_brick(&self, key: &BrickKey) -> Result<BrickData> {
        let meta = self.hierarchy.metadata(key);
        let half = IVec3::splat((self.ghost_width / 2) as i32);
        let start = meta.voxel_origin.as_ivec3() - half;
        let level = &self.levels[key.lod as usize];
        let bytes = gather_clamped(
            &level.volumes[key.timestep as usize],
            level.domain,
            start,
            meta.voxel_extent,
            self.format.voxel_bytes(),
        );
        BrickData::new(self.format, meta.voxel_extent, bytes)
    }
}

impl SourceDataset for MemoryDataset {
    fn domain_size(&self, lod: u32, _timestep: u32) -> UVec3 {
        self.levels[lod as usize].domain
    }

    fn lod_level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    fn timestep_count(&self) -> u32 {
        self.hierarchy.timesteps()
    }

    fn max_used_brick_size(&self) -> UVec3 {
        self.hierarchy.max_brick_extent()
    }

    fn ghost_width(&self) -> u32 {
        self.ghost_width
    }

    fn format(&self) -> VoxelFormat {
        self.format
    }

    fn scale(&self) -> Vec3 {
        self.scale
    }

    fn get_brick(&self, key: &BrickKey) -> Result<BrickData> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.hierarchy.validate(key)?;
        let failing = self.failing.lock().map(|f| f.contains(key)).unwrap_or(false);
        if failing {
            return Err(Error::Io(io::Error::other(format!("simulated read failure for {}", key))));
        }
        self.cut_brick(key)
    }

    fn brick_stats(&self, key: &BrickKey) -> Option<BrickStats> {
        self.hierarchy.validate(key).ok()?;
        self.stats.get(self.hierarchy.global_id(key) as usize).copied()
    }
}

/// Halve a level by taking every second voxel (floor, min 1 per axis).
fn downsample(level: &Level, voxel_bytes: usize) -> Level {
    let src = level.domain;
    let dst = addressing::halve(src);
    let volumes = level
        .volumes
        .iter()
        .map(|volume| {
            let mut out = Vec::with_capacity(dst.x as usize * dst.y as usize * dst.z as usize * voxel_bytes);
            for z in 0..dst.z {
                let sz = (z * 2).min(src.z - 1) as usize;
                for y in 0..dst.y {
                    let sy = (y * 2).min(src.y - 1) as usize;
                    for x in 0..dst.x {
                        let sx = (x * 2).min(src.x - 1) as usize;
                        let i = ((sz * src.y as usize + sy) * src.x as usize + sx) * voxel_bytes;
                        out.extend_from_slice(&volume[i..i + voxel_bytes]);
                    }
                }
            }
            out
        })
        .collect();
    Level { domain: dst, volumes }
}

/// Copy a box that may stick out of the volume, replicating edge voxels.
fn gather_clamped(volume: &[u8], domain: UVec3, start: IVec3, extent: UVec3, voxel_bytes: usize) -> Vec<u8> {
    let max = domain.as_ivec3() - IVec3::ONE;
    let (dx, dy) = (domain.x as usize, domain.y as usize);
    let mut out = Vec::with_capacity(extent.x as usize * extent.y as usize * extent.z as usize * voxel_bytes);

    // Split each scanline into clamped head, in-domain run and clamped tail.
    let x_end = start.x + extent.x as i32;
    let run_lo = start.x.clamp(0, domain.x as i32);
    let run_hi = x_end.clamp(0, domain.x as i32).max(run_lo);
    let head = (run_lo - start.x).clamp(0, extent.x as i32) as usize;
    let tail = extent.x as usize - head - (run_hi - run_lo) as usize;

    for z in 0..extent.z as i32 {
        let sz = (start.z + z).clamp(0, max.z) as usize;
        for y in 0..extent.y as i32 {
            let sy = (start.y + y).clamp(0, max.y) as usize;
            let row = (sz * dy + sy) * dx;
            let voxel = |x: usize| &volume[(row + x) * voxel_bytes..(row + x + 1) * voxel_bytes];

            let first = (run_lo.min(max.x)) as usize;
            for _ in 0..head {
                out.extend_from_slice(voxel(first));
            }
            if run_hi > run_lo {
                out.extend_from_slice(
                    &volume[(row + run_lo as usize) * voxel_bytes..(row + run_hi as usize) * voxel_bytes],
                );
            }
            let last = ((run_hi - 1).clamp(0, max.x)) as usize;
            for _ in 0..tail {
                out.extend_from_slice(voxel(last));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brick::ValueRange;

    fn ramp(domain: UVec3) -> MemoryDataset {
        MemoryDataset::from_fn(domain, UVec3::splat(12), 4, |p| {
            (p.x + 100 * p.y + 10_000 * p.z) as u32
        })
        .unwrap()
    }

    #[test]
    fn test_builds_pyramid_until_single_brick() {
        let ds = ramp(UVec3::new(40, 16, 8));
        // inner 8: layouts (5,2,1) -> (3,1,1) -> (2,1,1) -> (1,1,1)
        assert_eq!(ds.lod_level_count(), 4);
        assert_eq!(ds.domain_size(1, 0), UVec3::new(20, 8, 4));
        assert_eq!(ds.brick_layout(3, 0), UVec3::ONE);
        assert_eq!(ds.max_used_brick_size(), UVec3::splat(12));
        assert_eq!(ds.inner_brick_size(), UVec3::splat(8));
    }

    #[test]
    fn test_small_domain_reports_used_brick_size() {
        let ds = MemoryDataset::from_values(UVec3::new(8, 8, 1), UVec3::splat(16), 4, &[0u8; 64]).unwrap();
        assert_eq!(ds.lod_level_count(), 1);
        assert_eq!(ds.max_used_brick_size(), UVec3::new(12, 12, 5));
    }

    #[test]
    fn test_brick_has_clamped_ghost_voxels() {
        let ds = ramp(UVec3::new(16, 8, 8));
        let brick = ds.get_brick(&BrickKey::new(0, 0, 1)).unwrap();
        assert_eq!(brick.extent(), UVec3::new(12, 12, 12));

        let values = brick.values::<u32>().unwrap();
        // Payload voxel (0,0,0) is domain voxel (6,-2,-2) clamped to (6,0,0).
        assert_eq!(values[0], 6);
        // Payload voxel (11,0,0) is domain voxel (17,..) clamped to x = 15.
        assert_eq!(values[11], 15);
        // Payload voxel (2,2,2) is the brick's first owned voxel (8,0,0).
        assert_eq!(values[(2 * 12 + 2) * 12 + 2], 8);
    }

    #[test]
    fn test_downsample_point_samples() {
        let ds = ramp(UVec3::new(16, 16, 16));
        let brick = ds.get_brick(&BrickKey::new(0, 1, 0)).unwrap();
        let values = brick.values::<u32>().unwrap();
        // LOD 1 voxel (1,0,0) is LOD 0 voxel (2,0,0).
        assert_eq!(values[(2 * 12 + 2) * 12 + 3], 2);
    }

    #[test]
    fn test_stats_cover_payload() {
        let ds = ramp(UVec3::new(16, 8, 8));
        let stats = ds.brick_stats(&BrickKey::new(0, 0, 0)).unwrap();
        assert_eq!(stats.value, ValueRange::new(0.0, 9.0 + 700.0 + 70_000.0));
        assert!(ds.brick_stats(&BrickKey::new(0, 0, 99)).is_none());
    }

    #[test]
    fn test_injected_failure_is_io_error() {
        let ds = ramp(UVec3::new(16, 8, 8));
        let key = BrickKey::new(0, 0, 0);
        ds.fail_reads_for(key);
        assert!(ds.get_brick(&key).unwrap_err().is_io());

        ds.clear_failures();
        assert!(ds.get_brick(&key).is_ok());
        assert_eq!(ds.reads(), 2);
    }

    #[test]
    fn test_rejects_bad_construction() {
        assert!(MemoryDataset::from_values(UVec3::splat(4), UVec3::splat(4), 4, &[0u8; 64]).is_err());
        assert!(MemoryDataset::from_values(UVec3::splat(4), UVec3::splat(8), 3, &[0u8; 64]).is_err());
        assert!(matches!(
            MemoryDataset::from_values(UVec3::splat(4), UVec3::splat(8), 4, &[0u8; 63]),
            Err(Error::PayloadSize { .. })
        ));
    }
}
