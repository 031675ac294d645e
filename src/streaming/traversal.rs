//! Render traversal seam
//!
//! The renderer walks the brick hierarchy through a [`TraversalContext`],
//! which answers residency and visibility from the pool's residency table,
//! substitutes the nearest resident ancestor for missing bricks, and
//! records what has to be paged in.

use std::collections::HashSet;

use glam::Vec3;

use crate::brick::{BrickHierarchy, BrickKey};
use crate::core::config::MissingBrickStrategy;
use crate::core::types::Result;
use crate::streaming::brick_pool::{BrickMetaEntry, BrickPool};
use crate::streaming::feedback::{FeedbackBuffer, MissingBrickRequest};
use crate::streaming::pool_storage::PoolStorage;

/// A renderer pass driven by the paging loop.
pub trait RenderTraversal {
    /// Forget per-view state; called when a new view starts.
    fn reset(&mut self);

    /// Trace one subframe.
    fn trace(&mut self, ctx: &mut TraversalContext<'_>) -> Result<()>;
}

/// Read-only pool view handed to a traversal for one subframe.
pub struct TraversalContext<'a> {
    hierarchy: &'a BrickHierarchy,
    table: &'a [BrickMetaEntry],
    timestep: u32,
    strategy: MissingBrickStrategy,
    feedback: &'a mut FeedbackBuffer,
    /// Keys whose misses are not recorded
    excluded: Vec<&'a HashSet<BrickKey>>,
    used: Vec<BrickKey>,
    used_set: HashSet<BrickKey>,
    samples: u64,
    substitutions: u64,
}

impl<'a> TraversalContext<'a> {
    pub fn new<P: PoolStorage>(
        pool: &'a BrickPool<P>,
        strategy: MissingBrickStrategy,
        feedback: &'a mut FeedbackBuffer,
    ) -> Self {
        Self {
            hierarchy: pool.hierarchy(),
            table: pool.residency_table(),
            timestep: pool.timestep(),
            strategy,
            feedback,
            excluded: Vec::new(),
            used: Vec::new(),
            used_set: HashSet::new(),
            samples: 0,
            substitutions: 0,
        }
    }

    /// Never record misses for `keys` during this subframe.
    pub fn exclude(mut self, keys: &'a HashSet<BrickKey>) -> Self {
        self.excluded.push(keys);
        self
    }

    pub fn hierarchy(&self) -> &BrickHierarchy {
        self.hierarchy
    }

    pub fn timestep(&self) -> u32 {
        self.timestep
    }

    /// Roots of the traversal.
    pub fn coarsest_keys(&self) -> Vec<BrickKey> {
        self.hierarchy.coarsest_keys(self.timestep)
    }

    fn entry(&self, key: &BrickKey) -> Option<&BrickMetaEntry> {
        if key.timestep != self.timestep || self.hierarchy.validate(key).is_err() {
            return None;
        }
        self.table
            .get(self.hierarchy.global_id(&BrickKey { timestep: 0, ..*key }) as usize)
    }

    pub fn is_resident(&self, key: &BrickKey) -> bool {
        self.entry(key).is_some_and(BrickMetaEntry::is_resident)
    }

    pub fn is_visible(&self, key: &BrickKey) -> bool {
        self.entry(key).is_some_and(BrickMetaEntry::is_visible)
    }

    /// Pool slot of a resident brick.
    pub fn slot(&self, key: &BrickKey) -> Option<u32> {
        self.entry(key).filter(|e| e.is_resident()).map(|e| e.slot)
    }

    /// Brick to sample in place of `ideal`.
    ///
    /// Returns `None` for invisible bricks. Otherwise returns `ideal` when
    /// resident, else its nearest resident ancestor, and records the misses
    /// the configured strategy asks for.
    pub fn resolve(&mut self, ideal: BrickKey) -> Option<BrickKey> {
        if !self.is_visible(&ideal) {
            return None;
        }
        self.samples += 1;
        if self.is_resident(&ideal) {
            self.mark_used(ideal);
            return Some(ideal);
        }

        // Non-resident ancestors, parent first, up to the resident one.
        let mut missing = Vec::new();
        let mut found = None;
        let mut current = ideal;
        while let Some(parent) = self.hierarchy.parent(&current) {
            if self.is_resident(&parent) {
                found = Some(parent);
                break;
            }
            missing.push(parent);
            current = parent;
        }

        match self.strategy {
            MissingBrickStrategy::RequestExact => {
                self.request(&ideal);
            }
            MissingBrickStrategy::RequestAllAncestors => {
                self.request(&ideal);
                for ancestor in &missing {
                    self.request(ancestor);
                }
            }
            MissingBrickStrategy::SkipOneLevel | MissingBrickStrategy::SkipTwoLevels => {
                // Coarsest allowed ancestor first, then finer, then the brick itself.
                let skip = self.strategy.skip_levels() as usize;
                let target = (1..=skip)
                    .rev()
                    .filter_map(|level| missing.get(level - 1).copied())
                    .chain(std::iter::once(ideal))
                    .find(|key| self.is_requestable(key));
                if let Some(target) = target {
                    self.request(&target);
                }
            }
        }

        let found = found?;
        self.substitutions += 1;
        self.mark_used(found);
        Some(found)
    }

    /// Whether a miss for `key` would be recorded.
    pub fn is_requestable(&self, key: &BrickKey) -> bool {
        !self.excluded.iter().any(|keys| keys.contains(key))
    }

    /// Record a miss directly. Returns false if excluded, a duplicate or
    /// dropped by a full feedback buffer.
    pub fn request(&mut self, key: &BrickKey) -> bool {
        if !self.is_requestable(key) {
            return false;
        }
        self.feedback.record(MissingBrickRequest::from_key(key, self.hierarchy))
    }

    fn mark_used(&mut self, key: BrickKey) {
        if self.used_set.insert(key) {
            self.used.push(key);
        }
    }

    /// Bricks sampled this subframe, in first-use order.
    pub fn used(&self) -> &[BrickKey] {
        &self.used
    }

    pub fn into_used(self) -> Vec<BrickKey> {
        self.used
    }

    /// Resolved samples this subframe.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Samples served by an ancestor instead of the wanted brick.
    pub fn substitutions(&self) -> u64 {
        self.substitutions
    }
}

/// Counters of the last [`LodTraversal`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraversalStats {
    pub samples: u64,
    pub substitutions: u64,
    /// Bricks the pass selected for sampling.
    pub selected: u64,
}

/// Camera-distance LOD selection over the whole volume.
///
/// Descends from the coarsest bricks, skipping invisible subtrees, and
/// refines while a brick is closer than its LOD's distance band. The band
/// of LOD `l` ends at `lod_distance * 2^l` in world units (the volume's
/// largest axis is 1.0).
pub struct LodTraversal {
    camera: Vec3,
    lod_distance: f32,
    last_pass: TraversalStats,
}

impl LodTraversal {
    pub fn new(camera: Vec3, lod_distance: f32) -> Self {
        Self { camera, lod_distance, last_pass: TraversalStats::default() }
    }

    pub fn set_camera(&mut self, camera: Vec3) {
        self.camera = camera;
    }

    pub fn camera(&self) -> Vec3 {
        self.camera
    }

    /// LOD wanted at `distance` from the camera.
    pub fn lod_for_distance(&self, distance: f32, max_lod: u32) -> u32 {
        let mut threshold = self.lod_distance;
        let mut lod = 0;
        while distance >= threshold && lod < max_lod {
            threshold *= 2.0;
            lod += 1;
        }
        lod
    }

    pub fn last_pass(&self) -> TraversalStats {
        self.last_pass
    }
}

impl RenderTraversal for LodTraversal {
    fn reset(&mut self) {
        self.last_pass = TraversalStats::default();
    }

    fn trace(&mut self, ctx: &mut TraversalContext<'_>) -> Result<()> {
        let max_lod = ctx.hierarchy().coarsest_lod();
        let mut stack = ctx.coarsest_keys();
        let mut selected = 0;

        while let Some(key) = stack.pop() {
            if !ctx.is_visible(&key) {
                continue;
            }
            let meta = ctx.hierarchy().metadata(&key);
            // Distance to the nearest point of the brick's box.
            let gap = ((meta.center - self.camera).abs() - meta.extent * 0.5).max(Vec3::ZERO);
            let wanted = self.lod_for_distance(gap.length(), max_lod);

            if key.lod > wanted {
                stack.extend(ctx.hierarchy().children(&key));
            } else {
                selected += 1;
                ctx.resolve(key);
            }
        }

        self.last_pass = TraversalStats {
            samples: ctx.samples(),
            substitutions: ctx.substitutions(),
            selected,
        };
        log::trace!("LOD traversal: {:?}", self.last_pass);
        Ok(())
    }
}
