//! Bricks: addressing, identity, payloads and the LOD hierarchy

pub mod addressing;
pub mod key;
pub mod element;
pub mod hierarchy;

pub use key::{BrickKey, BrickMetadata, BrickStats, ValueRange};
pub use element::{BrickData, ElementType, Scalar, VoxelFormat};
pub use hierarchy::{BrickHierarchy, LodLevel};
