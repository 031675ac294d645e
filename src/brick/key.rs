//! Brick identity and per-brick metadata.

use std::fmt;

use glam::{UVec3, Vec3};

/// Unique identifier for a brick: timestep, LOD level and linear index
/// within that level's layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrickKey {
    pub timestep: u32,
    pub lod: u32,
    pub index: u64,
}

impl BrickKey {
    pub fn new(timestep: u32, lod: u32, index: u64) -> Self {
        Self { timestep, lod, index }
    }
}

impl fmt::Display for BrickKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(t{}, lod {}, #{})", self.timestep, self.lod, self.index)
    }
}

/// Inclusive scalar range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Range that absorbs nothing; use with [`ValueRange::include`].
    pub fn empty() -> Self {
        Self { min: f64::INFINITY, max: f64::NEG_INFINITY }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn include(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn union(&self, other: &ValueRange) -> ValueRange {
        ValueRange::new(self.min.min(other.min), self.max.max(other.max))
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn overlaps(&self, other: &ValueRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

/// Precomputed value statistics of one brick, used for visibility.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BrickStats {
    /// Scalar min/max over the brick's voxels (ghost included).
    pub value: ValueRange,
    /// Gradient magnitude min/max, when the source provides it.
    pub gradient: Option<ValueRange>,
}

impl BrickStats {
    pub fn new(value: ValueRange) -> Self {
        Self { value, gradient: None }
    }

    pub fn with_gradient(mut self, gradient: ValueRange) -> Self {
        self.gradient = Some(gradient);
        self
    }
}

/// Geometry of one brick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BrickMetadata {
    /// Voxels stored in the payload, ghost voxels included.
    pub voxel_extent: UVec3,
    /// Voxels owned by this brick, ghost excluded.
    pub inner_extent: UVec3,
    /// First owned voxel in LOD-level voxel coordinates.
    pub voxel_origin: UVec3,
    /// World-space center of the owned region.
    pub center: Vec3,
    /// World-space size of the owned region.
    pub extent: Vec3,
}

impl BrickMetadata {
    /// Number of voxels in the payload.
    pub fn voxel_count(&self) -> u64 {
        self.voxel_extent.x as u64 * self.voxel_extent.y as u64 * self.voxel_extent.z as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_is_timestep_lod_index() {
        let a = BrickKey::new(0, 1, 5);
        let b = BrickKey::new(0, 2, 0);
        let c = BrickKey::new(1, 0, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_value_range_overlap() {
        let r = ValueRange::new(10.0, 20.0);
        assert!(r.overlaps(&ValueRange::new(20.0, 30.0)));
        assert!(!r.overlaps(&ValueRange::new(20.5, 30.0)));
        assert!(r.contains(10.0));

        let mut acc = ValueRange::empty();
        assert!(acc.is_empty());
        acc.include(3.0);
        acc.include(-1.0);
        assert_eq!(acc, ValueRange::new(-1.0, 3.0));
    }
}
