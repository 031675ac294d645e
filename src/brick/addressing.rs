//! Brick addressing: linear/3D brick indices and voxel extents
//!
//! Pure index arithmetic shared by the rebricker, the hierarchy and the
//! pool. Linear indices are row-major with x fastest, then y, then z.

use glam::UVec3;

/// Number of bricks per axis needed to cover `domain` (ceiling division)
pub fn layout(domain: UVec3, brick_size: UVec3) -> UVec3 {
    debug_assert!(brick_size.min_element() > 0, "brick size must be positive");
    UVec3::new(
        domain.x.div_ceil(brick_size.x),
        domain.y.div_ceil(brick_size.y),
        domain.z.div_ceil(brick_size.z),
    )
}

/// Total number of bricks in a layout
pub fn brick_count(layout: UVec3) -> u64 {
    layout.x as u64 * layout.y as u64 * layout.z as u64
}

/// Halve a size per axis (floor), never dropping below 1
pub fn halve(size: UVec3) -> UVec3 {
    (size / 2).max(UVec3::ONE)
}

/// Convert a 3D brick coordinate to its linear index
pub fn to1d(coord: UVec3, layout: UVec3) -> u64 {
    debug_assert!(coord.cmplt(layout).all(), "{coord} outside layout {layout}");
    coord.x as u64 + layout.x as u64 * (coord.y as u64 + layout.y as u64 * coord.z as u64)
}

/// Convert a linear index back to a 3D brick coordinate
pub fn to3d(index: u64, layout: UVec3) -> UVec3 {
    debug_assert!(index < brick_count(layout), "index {index} outside layout {layout}");
    let x = index % layout.x as u64;
    let rest = index / layout.x as u64;
    let y = rest % layout.y as u64;
    let z = rest / layout.y as u64;
    UVec3::new(x as u32, y as u32, z as u32)
}

/// Checked [`to1d`]: `None` when the coordinate lies outside the layout
pub fn try_to1d(coord: UVec3, layout: UVec3) -> Option<u64> {
    coord.cmplt(layout).all().then(|| to1d(coord, layout))
}

/// Checked [`to3d`]: `None` when the index lies outside the layout
pub fn try_to3d(index: u64, layout: UVec3) -> Option<UVec3> {
    (index < brick_count(layout)).then(|| to3d(index, layout))
}

/// Voxels covered by the brick at `coord`, ghost excluded.
///
/// The full brick size, except on the far edge of an axis where it is
/// clamped to the voxels that remain in the domain.
pub fn voxel_extent(coord: UVec3, brick_size: UVec3, domain: UVec3) -> UVec3 {
    let start = coord * brick_size;
    debug_assert!(start.cmplt(domain).all(), "brick {coord} starts outside domain {domain}");
    brick_size.min(domain - start)
}

/// First voxel (ghost excluded) of the brick at `coord`
pub fn voxel_origin(coord: UVec3, brick_size: UVec3) -> UVec3 {
    coord * brick_size
}
