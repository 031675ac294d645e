//! Rebricker - re-partitions a bricked source into a smaller brick size
//!
//! The source's usable brick size (ghost excluded) must be an exact
//! multiple of the target size on every axis, so each target brick lies
//! inside exactly one source brick. A request reads that source brick and
//! copies the target's footprint out of it.
//!
//! The rebricker never synthesizes LOD levels the source does not have:
//! when a small target size would need more levels to reach a single
//! brick, the coarsest level simply keeps several bricks.

use glam::{UVec3, Vec3};

use crate::brick::addressing;
use crate::brick::{BrickData, BrickHierarchy, BrickKey, BrickMetadata, BrickStats, VoxelFormat};
use crate::core::config::{MinMaxMode, PagingConfig};
use crate::core::error::Error;
use crate::core::types::Result;
use crate::dataset::SourceDataset;

/// A [`SourceDataset`] view of another source with a different brick size.
pub struct Rebricker<S: SourceDataset> {
    source: S,
    target: UVec3,
    /// Source brick size without ghost voxels.
    source_inner: UVec3,
    hierarchy: BrickHierarchy,
    /// Timestep-0 bricks with their geometry, in global id order.
    bricks: Vec<(BrickKey, BrickMetadata)>,
    min_max: MinMaxMode,
    /// Exact timestep-0 stats when precomputed.
    stats: Vec<BrickStats>,
}

impl<S: SourceDataset> Rebricker<S> {
    /// Wrap `source` with bricks of `target` voxels per axis (ghost excluded).
    pub fn new(source: S, target: UVec3, min_max: MinMaxMode) -> Result<Self> {
        let ghost = source.ghost_width();
        let max_used = source.max_used_brick_size();
        if max_used.cmple(UVec3::splat(ghost)).any() {
            return Err(Error::config(format!(
                "source brick size {} has no voxels beside ghost width {}",
                max_used, ghost
            )));
        }
        let source_inner = max_used - UVec3::splat(ghost);
        validate_target(target, source_inner)?;

        // Walk the source's levels until one fits a single target brick.
        let source_lods = source.lod_level_count();
        let mut domains = Vec::new();
        let mut running_total = 0u64;
        for lod in 0..source_lods {
            let domain = source.domain_size(lod, 0);
            let layout = addressing::layout(domain, target);
            domains.push(domain);
            running_total += addressing::brick_count(layout);
            if layout == UVec3::ONE {
                break;
            }
        }
        let last = *domains.last().ok_or_else(|| Error::config("source has no LOD levels"))?;
        if addressing::layout(last, target) != UVec3::ONE {
            log::info!(
                "Rebricker: coarsest LOD {} keeps {} bricks; levels past the source's {} are not synthesized",
                domains.len() - 1,
                addressing::brick_count(addressing::layout(last, target)),
                source_lods
            );
        }

        let hierarchy = BrickHierarchy::new(
            &domains,
            target,
            ghost,
            source.timestep_count(),
            source.scale(),
        )?;
        debug_assert_eq!(running_total, hierarchy.bricks_per_timestep());

        let bricks: Vec<(BrickKey, BrickMetadata)> = (0..hierarchy.bricks_per_timestep())
            .filter_map(|id| hierarchy.key_for_global(id))
            .map(|key| (key, hierarchy.metadata(&key)))
            .collect();

        let mut rebricker = Self {
            source,
            target,
            source_inner,
            hierarchy,
            bricks,
            min_max,
            stats: Vec::new(),
        };

        if min_max == MinMaxMode::Precompute {
            let mut stats = Vec::with_capacity(rebricker.bricks.len());
            for (key, _) in &rebricker.bricks {
                stats.push(rebricker.get_brick(key)?.stats());
            }
            rebricker.stats = stats;
        }

        log::info!(
            "Rebricker: {} -> {} voxel bricks, {} LODs, {} bricks",
            source_inner,
            target,
            rebricker.hierarchy.lod_count(),
            rebricker.bricks.len()
        );
        Ok(rebricker)
    }

    /// Wrap `source` with the target size and stats mode of a paging config.
    ///
    /// The config's ghost width must match the source's: ghost voxels come
    /// from the source bricks and cannot be widened or narrowed here.
    pub fn from_config(source: S, config: &PagingConfig) -> Result<Self> {
        config.validate()?;
        if config.ghost_width != source.ghost_width() {
            return Err(Error::config(format!(
                "configured ghost width {} does not match the source's {}",
                config.ghost_width,
                source.ghost_width()
            )));
        }
        Self::new(source, config.target_brick_size(), config.min_max_mode)
    }

    /// The wrapped source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Unwrap the source.
    pub fn into_inner(self) -> S {
        self.source
    }

    /// Target brick size, ghost excluded.
    pub fn target_brick_size(&self) -> UVec3 {
        self.target
    }

    /// Layout of the rebricked volume.
    pub fn hierarchy(&self) -> &BrickHierarchy {
        &self.hierarchy
    }

    /// Every timestep-0 brick with its geometry.
    pub fn bricks(&self) -> &[(BrickKey, BrickMetadata)] {
        &self.bricks
    }

    /// Source brick that contains a target brick.
    pub fn source_key(&self, key: &BrickKey) -> Result<BrickKey> {
        self.hierarchy.validate(key)?;
        let ratio = self.source_inner / self.target;
        let source_coord = self.hierarchy.coord(key) / ratio;
        let source_layout = self.source.brick_layout(key.lod, key.timestep);
        addressing::try_to1d(source_coord, source_layout)
            .map(|index| BrickKey::new(key.timestep, key.lod, index))
            .ok_or_else(|| {
                Error::Streaming(format!(
                    "brick {} maps to source coordinate {} outside layout {}",
                    key, source_coord, source_layout
                ))
            })
    }
}

/// Target must fit in, and evenly divide, the usable source brick size.
fn validate_target(target: UVec3, source_inner: UVec3) -> Result<()> {
    if target.min_element() == 0 {
        return Err(Error::config(format!("target brick size {} has an empty axis", target)));
    }
    if target.cmpgt(source_inner).any() {
        return Err(Error::config(format!(
            "target brick size {} exceeds the usable source brick size {}",
            target, source_inner
        )));
    }
    if (source_inner % target) != UVec3::ZERO {
        return Err(Error::config(format!(
            "target brick size {} does not evenly divide the usable source brick size {}",
            target, source_inner
        )));
    }
    Ok(())
}

impl<S: SourceDataset> SourceDataset for Rebricker<S> {
    fn domain_size(&self, lod: u32, timestep: u32) -> UVec3 {
        self.source.domain_size(lod, timestep)
    }

    fn lod_level_count(&self) -> u32 {
        self.hierarchy.lod_count()
    }

    fn timestep_count(&self) -> u32 {
        self.source.timestep_count()
    }

    fn max_used_brick_size(&self) -> UVec3 {
        self.hierarchy.max_brick_extent()
    }

    fn ghost_width(&self) -> u32 {
        self.source.ghost_width()
    }

    fn format(&self) -> VoxelFormat {
        self.source.format()
    }

    fn scale(&self) -> Vec3 {
        self.source.scale()
    }

    fn get_brick(&self, key: &BrickKey) -> Result<BrickData> {
        let source_key = self.source_key(key)?;
        let source_brick = self.source.get_brick(&source_key)?;

        // Both bricks start g/2 voxels before their first owned voxel, so
        // the ghost offsets cancel.
        let source_coord = addressing::to3d(source_key.index, self.source.brick_layout(key.lod, key.timestep));
        let offset = self.hierarchy.coord(key) * self.target - source_coord * self.source_inner;
        let extent = self.hierarchy.metadata(key).voxel_extent;

        source_brick.extract(offset, extent)
    }

    fn brick_stats(&self, key: &BrickKey) -> Option<BrickStats> {
        if key.timestep == 0 && self.min_max == MinMaxMode::Precompute {
            self.hierarchy.validate(key).ok()?;
            return self.stats.get(self.hierarchy.global_id(key) as usize).copied();
        }
        let source_key = self.source_key(key).ok()?;
        self.source.brick_stats(&source_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemoryDataset;

    fn ramp(domain: UVec3, brick_size: u32) -> MemoryDataset {
        MemoryDataset::from_fn(domain, UVec3::splat(brick_size), 4, |p| {
            (p.x + 1000 * p.y + 1_000_000 * p.z) as u32
        })
        .unwrap()
    }

    fn slab_8x8x1() -> MemoryDataset {
        MemoryDataset::from_fn(UVec3::new(8, 8, 1), UVec3::splat(16), 4, |p| (p.x + 8 * p.y) as u16)
            .unwrap()
    }

    #[test]
    fn test_valid_divisors_construct() {
        let ds = ramp(UVec3::splat(64), 20); // usable 16
        for t in [2, 4, 8, 16] {
            assert!(
                Rebricker::new(&ds, UVec3::splat(t), MinMaxMode::Source).is_ok(),
                "target {} should be accepted",
                t
            );
        }
    }

    #[test]
    fn test_invalid_targets_are_configuration_errors() {
        let ds = ramp(UVec3::splat(64), 20);
        for t in [UVec3::splat(3), UVec3::splat(32), UVec3::new(16, 16, 0), UVec3::new(8, 6, 8)] {
            assert!(
                matches!(Rebricker::new(&ds, t, MinMaxMode::Source), Err(Error::Configuration(_))),
                "target {} should be rejected",
                t
            );
        }
    }

    #[test]
    fn test_slab_rejects_non_divisor() {
        let ds = slab_8x8x1();
        assert_eq!(ds.max_used_brick_size(), UVec3::new(12, 12, 5));
        assert!(matches!(
            Rebricker::new(&ds, UVec3::new(9, 16, 16), MinMaxMode::Source),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Rebricker::new(&ds, UVec3::new(3, 8, 1), MinMaxMode::Source),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_slab_rebrick_extents() {
        // Full target bricks of (6,16,16) with ghost 4 are clipped by the
        // 8x8x1 domain to (2,8,1) owned voxels, which is the target the
        // slab's usable (8,8,1) bricks accept. The unclipped (2,12,12)
        // exceeds them.
        let ds = slab_8x8x1();
        assert!(matches!(
            Rebricker::new(&ds, UVec3::new(2, 12, 12), MinMaxMode::Source),
            Err(Error::Configuration(_))
        ));
        let rb = Rebricker::new(&ds, UVec3::new(2, 8, 1), MinMaxMode::Source).unwrap();
        assert_eq!(rb.hierarchy().layout(0), UVec3::new(4, 1, 1));

        let (_, first) = rb.bricks()[0];
        assert_eq!(first.voxel_extent, UVec3::new(6, 12, 5));
        let (_, second) = rb.bricks()[1];
        assert_eq!(second.voxel_origin.x, 2);

        let covered: u32 = rb.bricks().iter().map(|(_, m)| m.inner_extent.x).sum();
        assert_eq!(covered, 8);

        // Brick 1's first owned voxel is domain voxel (2,0,0).
        let data = rb.get_brick(&BrickKey::new(0, 0, 1)).unwrap();
        assert_eq!(data.extent(), UVec3::new(6, 12, 5));
        let values = data.values::<u16>().unwrap();
        assert_eq!(values[(2 * 12 + 2) * 6 + 2], 2);
    }

    #[test]
    fn test_identity_rebrick_matches_source() {
        let ds = ramp(UVec3::new(40, 24, 16), 12); // usable 8, x layout 5 -> 3 -> 2 -> 1
        let rb = Rebricker::new(&ds, ds.inner_brick_size(), MinMaxMode::Source).unwrap();

        assert_eq!(rb.lod_level_count(), ds.lod_level_count());
        let source_total: u64 = (0..ds.lod_level_count()).map(|l| ds.brick_count(l, 0)).sum();
        assert_eq!(rb.bricks().len() as u64, source_total);

        for (key, _) in rb.bricks() {
            assert_eq!(rb.get_brick(key).unwrap(), ds.get_brick(key).unwrap(), "brick {}", key);
        }
    }

    #[test]
    fn test_sub_bricks_match_direct_bricking() {
        // Rebricking 16 -> 4 must produce the same payloads as bricking at 4.
        let source = ramp(UVec3::new(32, 32, 16), 20);
        let direct = ramp(UVec3::new(32, 32, 16), 8);
        let rb = Rebricker::new(&source, UVec3::splat(4), MinMaxMode::Source).unwrap();

        for (key, _) in rb.bricks().iter().filter(|(k, _)| k.lod == 0) {
            assert_eq!(rb.get_brick(key).unwrap(), direct.get_brick(key).unwrap(), "brick {}", key);
        }
    }

    #[test]
    fn test_source_key_uses_divisor_ratio() {
        let ds = ramp(UVec3::splat(64), 20); // source layout 4^3
        let rb = Rebricker::new(&ds, UVec3::splat(4), MinMaxMode::Source).unwrap();
        let key = rb.hierarchy().key_at(0, 0, UVec3::new(7, 4, 15)).unwrap();
        let src = rb.source_key(&key).unwrap();
        assert_eq!(addressing::to3d(src.index, ds.brick_layout(0, 0)), UVec3::new(1, 1, 3));
    }

    #[test]
    fn test_lod_levels_are_capped_at_source() {
        let ds = ramp(UVec3::splat(32), 20); // usable 16: two source LODs
        assert_eq!(ds.lod_level_count(), 2);

        let rb = Rebricker::new(&ds, UVec3::splat(4), MinMaxMode::Source).unwrap();
        assert_eq!(rb.lod_level_count(), 2);
        assert_eq!(rb.hierarchy().brick_count(1), 64);
        assert!(rb.get_brick(&BrickKey::new(0, 2, 0)).is_err());
    }

    #[test]
    fn test_from_config() {
        let ds = ramp(UVec3::splat(32), 20);
        let config = PagingConfig {
            target_brick_size: [8, 8, 8],
            min_max_mode: MinMaxMode::Precompute,
            ..Default::default()
        };
        let rb = Rebricker::from_config(&ds, &config).unwrap();
        assert_eq!(rb.target_brick_size(), UVec3::splat(8));
        assert_eq!(rb.hierarchy().layout(0), UVec3::splat(4));
        let key = BrickKey::new(0, 0, 0);
        assert_eq!(rb.brick_stats(&key), Some(rb.get_brick(&key).unwrap().stats()));

        let narrow = PagingConfig { ghost_width: 2, ..config.clone() };
        assert!(matches!(Rebricker::from_config(&ds, &narrow), Err(Error::Configuration(_))));

        // The default 64^3 target does not divide the usable 16^3.
        assert!(matches!(
            Rebricker::from_config(&ds, &PagingConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_stats_modes() {
        let ds = ramp(UVec3::splat(32), 20);
        let key = BrickKey::new(0, 0, 0);

        let conservative = Rebricker::new(&ds, UVec3::splat(8), MinMaxMode::Source).unwrap();
        let exact = Rebricker::new(&ds, UVec3::splat(8), MinMaxMode::Precompute).unwrap();

        let wide = conservative.brick_stats(&key).unwrap().value;
        let tight = exact.brick_stats(&key).unwrap().value;
        assert_eq!(wide, ds.brick_stats(&key).unwrap().value);
        assert!(tight.min >= wide.min && tight.max <= wide.max);
        assert!(tight.max < wide.max);
    }

    #[test]
    fn test_read_failure_propagates() {
        let ds = ramp(UVec3::splat(32), 20);
        let rb = Rebricker::new(&ds, UVec3::splat(8), MinMaxMode::Source).unwrap();
        let key = BrickKey::new(0, 0, 0);
        ds.fail_reads_for(rb.source_key(&key).unwrap());
        assert!(rb.get_brick(&key).unwrap_err().is_io());
    }

    #[test]
    fn test_precompute_surfaces_read_failure() {
        let ds = ramp(UVec3::splat(32), 20);
        ds.fail_reads_for(BrickKey::new(0, 0, 0));
        let result = Rebricker::new(&ds, UVec3::splat(8), MinMaxMode::Precompute);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_every_element_type_rebricks() {
        fn check<T: crate::brick::Scalar + std::fmt::Debug>(make: impl Fn(u32) -> T) {
            let ds = MemoryDataset::from_fn(UVec3::new(16, 8, 8), UVec3::splat(12), 4, |p| make(p.x + 16 * p.y))
                .unwrap();
            let rb = Rebricker::new(&ds, UVec3::splat(4), MinMaxMode::Source).unwrap();
            let key = rb.hierarchy().key_at(0, 0, UVec3::new(1, 0, 0)).unwrap();
            let values = rb.get_brick(&key).unwrap().values::<T>().unwrap();
            // First owned voxel is (4,0,0).
            assert_eq!(values[(2 * 8 + 2) * 8 + 2], make(4));
        }
        check(|v| v as u8);
        check(|v| v as i8);
        check(|v| v as u16);
        check(|v| v as i16);
        check(|v| v);
        check(|v| v as i32);
        check(|v| v as u64);
        check(|v| v as i64);
        check(|v| v as f32);
        check(|v| v as f64);
    }
}
