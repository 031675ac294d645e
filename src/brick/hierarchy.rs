//! Brick hierarchy: per-LOD layouts, parent/child links and global ids.
//!
//! LOD 0 is full resolution. Brick `c` at LOD `l` has parent
//! `min(c / 2, layout(l + 1) - 1)` per axis; the clamp folds the odd
//! trailing column of a level into the last parent.

use glam::{UVec3, Vec3};

use crate::brick::addressing;
use crate::brick::key::{BrickKey, BrickMetadata};
use crate::core::error::Error;
use crate::core::types::Result;
use crate::dataset::SourceDataset;

/// One level of the pyramid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LodLevel {
    /// Voxel domain at this level.
    pub domain: UVec3,
    /// Bricks per axis.
    pub layout: UVec3,
    /// Total bricks in the level.
    pub brick_count: u64,
    /// Global id of the level's first brick within a timestep.
    pub offset: u64,
}

/// Layout of every brick of a dataset across LODs and timesteps.
#[derive(Clone, Debug)]
pub struct BrickHierarchy {
    levels: Vec<LodLevel>,
    inner_brick_size: UVec3,
    ghost_width: u32,
    timesteps: u32,
    world_extent: Vec3,
    bricks_per_timestep: u64,
}

impl BrickHierarchy {
    /// Build from explicit per-LOD domains (finest first).
    pub fn new(
        domains: &[UVec3],
        inner_brick_size: UVec3,
        ghost_width: u32,
        timesteps: u32,
        scale: Vec3,
    ) -> Result<Self> {
        if domains.is_empty() {
            return Err(Error::config("brick hierarchy needs at least one LOD"));
        }
        if inner_brick_size.min_element() == 0 {
            return Err(Error::config(format!("brick size {} has an empty axis", inner_brick_size)));
        }
        if domains.iter().any(|d| d.min_element() == 0) {
            return Err(Error::config("LOD domains must be non-empty"));
        }

        let mut levels = Vec::with_capacity(domains.len());
        let mut offset = 0u64;
        for &domain in domains {
            let layout = addressing::layout(domain, inner_brick_size);
            let brick_count = addressing::brick_count(layout);
            levels.push(LodLevel { domain, layout, brick_count, offset });
            offset += brick_count;
        }

        let world = domains[0].as_vec3() * scale;
        let world_extent = world / world.max_element();

        Ok(Self {
            levels,
            inner_brick_size,
            ghost_width,
            timesteps: timesteps.max(1),
            world_extent,
            bricks_per_timestep: offset,
        })
    }

    /// Capture the layout a dataset exposes.
    pub fn from_dataset(dataset: &dyn SourceDataset) -> Result<Self> {
        let domains: Vec<UVec3> = (0..dataset.lod_level_count())
            .map(|lod| dataset.domain_size(lod, 0))
            .collect();
        Self::new(
            &domains,
            dataset.inner_brick_size(),
            dataset.ghost_width(),
            dataset.timestep_count(),
            dataset.scale(),
        )
    }

    pub fn lod_count(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Index of the coarsest level.
    pub fn coarsest_lod(&self) -> u32 {
        self.lod_count() - 1
    }

    pub fn level(&self, lod: u32) -> Option<&LodLevel> {
        self.levels.get(lod as usize)
    }

    pub fn levels(&self) -> &[LodLevel] {
        &self.levels
    }

    pub fn layout(&self, lod: u32) -> UVec3 {
        self.levels[lod as usize].layout
    }

    pub fn domain(&self, lod: u32) -> UVec3 {
        self.levels[lod as usize].domain
    }

    pub fn brick_count(&self, lod: u32) -> u64 {
        self.levels[lod as usize].brick_count
    }

    pub fn inner_brick_size(&self) -> UVec3 {
        self.inner_brick_size
    }

    pub fn ghost_width(&self) -> u32 {
        self.ghost_width
    }

    pub fn timesteps(&self) -> u32 {
        self.timesteps
    }

    pub fn bricks_per_timestep(&self) -> u64 {
        self.bricks_per_timestep
    }

    /// Number of global ids across all timesteps.
    pub fn total_bricks(&self) -> u64 {
        self.bricks_per_timestep * self.timesteps as u64
    }

    /// Check the key addresses an existing brick.
    pub fn validate(&self, key: &BrickKey) -> Result<()> {
        let valid = key.timestep < self.timesteps
            && self
                .level(key.lod)
                .is_some_and(|level| key.index < level.brick_count);
        if valid { Ok(()) } else { Err(Error::InvalidBrickKey(*key)) }
    }

    /// Dense id over every brick of every timestep.
    pub fn global_id(&self, key: &BrickKey) -> u64 {
        key.timestep as u64 * self.bricks_per_timestep
            + self.levels[key.lod as usize].offset
            + key.index
    }

    /// Inverse of [`BrickHierarchy::global_id`].
    pub fn key_for_global(&self, id: u64) -> Option<BrickKey> {
        if id >= self.total_bricks() {
            return None;
        }
        let timestep = (id / self.bricks_per_timestep) as u32;
        let local = id % self.bricks_per_timestep;
        let lod = self
            .levels
            .iter()
            .rposition(|level| level.offset <= local)?;
        Some(BrickKey::new(timestep, lod as u32, local - self.levels[lod].offset))
    }

    /// 3D brick coordinate of a key.
    pub fn coord(&self, key: &BrickKey) -> UVec3 {
        addressing::to3d(key.index, self.layout(key.lod))
    }

    /// Key of the brick at `coord`, if inside the level's layout.
    pub fn key_at(&self, timestep: u32, lod: u32, coord: UVec3) -> Option<BrickKey> {
        let level = self.level(lod)?;
        let index = addressing::try_to1d(coord, level.layout)?;
        Some(BrickKey::new(timestep, lod, index))
    }

    /// Brick one level coarser covering this brick.
    pub fn parent(&self, key: &BrickKey) -> Option<BrickKey> {
        let parent_lod = key.lod + 1;
        let parent_layout = self.level(parent_lod)?.layout;
        let coord = (self.coord(key) / 2).min(parent_layout - UVec3::ONE);
        self.key_at(key.timestep, parent_lod, coord)
    }

    /// Bricks one level finer whose parent is this brick.
    pub fn children(&self, key: &BrickKey) -> Vec<BrickKey> {
        if key.lod == 0 {
            return Vec::new();
        }
        let child_lod = key.lod - 1;
        let child_layout = self.layout(child_lod);
        let parent_layout = self.layout(key.lod);
        let p = self.coord(key);

        let lo = p * 2;
        let mut hi = (lo + UVec3::splat(2)).min(child_layout);
        // The last parent on an axis also owns any trailing columns.
        for axis in 0..3 {
            if p[axis] + 1 == parent_layout[axis] {
                hi[axis] = child_layout[axis];
            }
        }

        let mut children = Vec::new();
        for z in lo.z..hi.z {
            for y in lo.y..hi.y {
                for x in lo.x..hi.x {
                    let index = addressing::to1d(UVec3::new(x, y, z), child_layout);
                    children.push(BrickKey::new(key.timestep, child_lod, index));
                }
            }
        }
        children
    }

    /// Every brick of the coarsest level for a timestep.
    pub fn coarsest_keys(&self, timestep: u32) -> Vec<BrickKey> {
        let lod = self.coarsest_lod();
        (0..self.brick_count(lod))
            .map(|index| BrickKey::new(timestep, lod, index))
            .collect()
    }

    /// Voxel and world-space geometry of a brick.
    pub fn metadata(&self, key: &BrickKey) -> BrickMetadata {
        let domain = self.domain(key.lod);
        let coord = self.coord(key);
        let origin = addressing::voxel_origin(coord, self.inner_brick_size);
        let inner = addressing::voxel_extent(coord, self.inner_brick_size, domain);

        let domain_f = domain.as_vec3();
        let center = ((origin.as_vec3() + inner.as_vec3() * 0.5) / domain_f - Vec3::splat(0.5))
            * self.world_extent;
        let extent = inner.as_vec3() / domain_f * self.world_extent;

        BrickMetadata {
            voxel_extent: inner + UVec3::splat(self.ghost_width),
            inner_extent: inner,
            voxel_origin: origin,
            center,
            extent,
        }
    }

    /// World-space size of the whole volume (largest axis is 1.0).
    pub fn world_extent(&self) -> Vec3 {
        self.world_extent
    }

    /// Largest payload extent of any brick, ghost included.
    pub fn max_brick_extent(&self) -> UVec3 {
        self.levels
            .iter()
            .map(|level| self.inner_brick_size.min(level.domain))
            .fold(UVec3::ZERO, UVec3::max)
            + UVec3::splat(self.ghost_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pyramid(domain0: UVec3, inner: UVec3) -> BrickHierarchy {
        let mut domains = vec![domain0];
        while addressing::layout(*domains.last().unwrap(), inner) != UVec3::ONE {
            let next = addressing::halve(*domains.last().unwrap());
            domains.push(next);
        }
        BrickHierarchy::new(&domains, inner, 4, 1, Vec3::ONE).unwrap()
    }

    #[test]
    fn test_ghost_extents_on_single_slice_domain() {
        // Full brick (6,16,16) with ghost 4 leaves a (2,12,12) inner size.
        let h = BrickHierarchy::new(
            &[UVec3::new(8, 8, 1)],
            UVec3::new(2, 12, 12),
            4,
            1,
            Vec3::ONE,
        )
        .unwrap();

        assert_eq!(h.layout(0), UVec3::new(4, 1, 1));
        let first = h.metadata(&BrickKey::new(0, 0, 0));
        assert_eq!(first.voxel_extent, UVec3::new(6, 12, 5));

        let second = h.metadata(&BrickKey::new(0, 0, 1));
        assert_eq!(second.voxel_origin, UVec3::new(2, 0, 0));
        assert_eq!(second.inner_extent, UVec3::new(2, 8, 1));

        let covered: u32 = (0..4)
            .map(|i| h.metadata(&BrickKey::new(0, 0, i)).inner_extent.x)
            .sum();
        assert_eq!(covered, 8);
    }

    #[test]
    fn test_global_ids_roundtrip_across_timesteps() {
        let domains = [UVec3::new(64, 64, 32), UVec3::new(32, 32, 16)];
        let h = BrickHierarchy::new(&domains, UVec3::splat(16), 4, 3, Vec3::ONE).unwrap();
        assert_eq!(h.bricks_per_timestep(), 32 + 4);

        for id in 0..h.total_bricks() {
            let key = h.key_for_global(id).unwrap();
            assert!(h.validate(&key).is_ok());
            assert_eq!(h.global_id(&key), id);
        }
        assert!(h.key_for_global(h.total_bricks()).is_none());
    }

    #[test]
    fn test_validate_rejects_bad_keys() {
        let h = pyramid(UVec3::splat(64), UVec3::splat(16));
        assert!(h.validate(&BrickKey::new(0, 0, 63)).is_ok());
        assert!(matches!(
            h.validate(&BrickKey::new(0, 0, 64)),
            Err(Error::InvalidBrickKey(_))
        ));
        assert!(h.validate(&BrickKey::new(0, 9, 0)).is_err());
        assert!(h.validate(&BrickKey::new(1, 0, 0)).is_err());
    }

    #[test]
    fn test_parent_and_children_are_inverse() {
        // 5 bricks along x at LOD 0 fold into 2 parents.
        let h = pyramid(UVec3::new(80, 16, 16), UVec3::splat(16));
        assert_eq!(h.layout(0), UVec3::new(5, 1, 1));
        assert_eq!(h.layout(1), UVec3::new(3, 1, 1));

        for lod in 0..h.coarsest_lod() {
            for index in 0..h.brick_count(lod) {
                let key = BrickKey::new(0, lod, index);
                let parent = h.parent(&key).unwrap();
                assert!(h.children(&parent).contains(&key), "{key} not a child of {parent}");
            }
        }

        let root = h.coarsest_keys(0);
        assert_eq!(root.len(), 1);
        assert!(h.parent(&root[0]).is_none());
    }

    #[test]
    fn test_world_metadata_centers_volume() {
        let h = BrickHierarchy::new(&[UVec3::new(32, 16, 16)], UVec3::splat(16), 0, 1, Vec3::ONE)
            .unwrap();
        assert_eq!(h.world_extent(), Vec3::new(1.0, 0.5, 0.5));

        let left = h.metadata(&BrickKey::new(0, 0, 0));
        assert_eq!(left.center, Vec3::new(-0.25, 0.0, 0.0));
        assert_eq!(left.extent, Vec3::new(0.5, 0.5, 0.5));
    }

    #[test]
    fn test_max_brick_extent_clamps_to_domain() {
        let h = BrickHierarchy::new(&[UVec3::new(8, 8, 1)], UVec3::splat(16), 4, 1, Vec3::ONE)
            .unwrap();
        assert_eq!(h.max_brick_extent(), UVec3::new(12, 12, 5));
    }
}
