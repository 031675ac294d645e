//! Voxel element types and brick payloads
//!
//! Payloads are raw little-endian bytes tagged with a [`VoxelFormat`].
//! Copies work on bytes with the format's voxel stride, so every element
//! type goes through the same code; typed access is a single generic
//! operation over [`Scalar`] that refuses mismatched types.

use std::fmt;

use bytemuck::Pod;
use glam::UVec3;

use crate::brick::key::{BrickStats, ValueRange};
use crate::core::error::Error;
use crate::core::types::Result;

/// Numeric type of one voxel component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// Build from a (bit width, signed, floating point) descriptor as found
    /// in dataset headers.
    pub fn from_parts(bits: u32, signed: bool, float: bool) -> Result<Self> {
        let element = match (bits, signed, float) {
            (8, false, false) => ElementType::U8,
            (8, true, false) => ElementType::I8,
            (16, false, false) => ElementType::U16,
            (16, true, false) => ElementType::I16,
            (32, false, false) => ElementType::U32,
            (32, true, false) => ElementType::I32,
            (64, false, false) => ElementType::U64,
            (64, true, false) => ElementType::I64,
            (32, _, true) => ElementType::F32,
            (64, _, true) => ElementType::F64,
            _ => {
                return Err(Error::UnsupportedType(format!(
                    "{}-bit {}{}",
                    bits,
                    if signed { "signed " } else { "unsigned " },
                    if float { "float" } else { "integer" }
                )))
            }
        };
        Ok(element)
    }

    /// Size of one component in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    pub fn is_signed(&self) -> bool {
        !matches!(
            self,
            ElementType::U8 | ElementType::U16 | ElementType::U32 | ElementType::U64
        )
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::I8 => "i8",
            ElementType::U16 => "u16",
            ElementType::I16 => "i16",
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::U64 => "u64",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Rust types that can back a voxel component.
pub trait Scalar: Pod + PartialOrd + Send + Sync + 'static {
    const ELEMENT: ElementType;

    fn to_f64(self) -> f64;
}

macro_rules! impl_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const ELEMENT: ElementType = ElementType::$variant;

                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_scalar!(
    u8 => U8, i8 => I8, u16 => U16, i16 => I16, u32 => U32,
    i32 => I32, u64 => U64, i64 => I64, f32 => F32, f64 => F64,
);

/// Element type plus component count of a voxel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VoxelFormat {
    pub element: ElementType,
    pub components: u32,
}

impl VoxelFormat {
    pub fn new(element: ElementType, components: u32) -> Self {
        Self { element, components }
    }

    /// Single-component format.
    pub fn scalar(element: ElementType) -> Self {
        Self::new(element, 1)
    }

    /// Bytes per voxel.
    pub fn voxel_bytes(&self) -> usize {
        self.element.size_bytes() * self.components as usize
    }
}

fn voxel_count(extent: UVec3) -> usize {
    extent.x as usize * extent.y as usize * extent.z as usize
}

/// Decompressed voxels of one brick, x fastest, then y, then z.
#[derive(Clone, PartialEq)]
pub struct BrickData {
    format: VoxelFormat,
    extent: UVec3,
    bytes: Vec<u8>,
}

impl fmt::Debug for BrickData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrickData")
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl BrickData {
    /// Wrap raw bytes; the length must match `extent` and `format` exactly.
    pub fn new(format: VoxelFormat, extent: UVec3, bytes: Vec<u8>) -> Result<Self> {
        let expected = voxel_count(extent) * format.voxel_bytes();
        if bytes.len() != expected {
            return Err(Error::PayloadSize { expected, actual: bytes.len() });
        }
        Ok(Self { format, extent, bytes })
    }

    /// All-zero payload.
    pub fn zeroed(format: VoxelFormat, extent: UVec3) -> Self {
        let bytes = vec![0u8; voxel_count(extent) * format.voxel_bytes()];
        Self { format, extent, bytes }
    }

    /// Build from typed component values.
    pub fn from_values<T: Scalar>(extent: UVec3, components: u32, values: &[T]) -> Result<Self> {
        let format = VoxelFormat::new(T::ELEMENT, components);
        Self::new(format, extent, bytemuck::cast_slice(values).to_vec())
    }

    pub fn format(&self) -> VoxelFormat {
        self.format
    }

    pub fn extent(&self) -> UVec3 {
        self.extent
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn voxel_count(&self) -> usize {
        voxel_count(self.extent)
    }

    /// Typed copy of the component values.
    pub fn values<T: Scalar>(&self) -> Result<Vec<T>> {
        if T::ELEMENT != self.format.element {
            return Err(Error::UnsupportedType(format!(
                "requested {} from a {} payload",
                T::ELEMENT,
                self.format.element
            )));
        }
        // The byte buffer carries no alignment guarantee.
        Ok(bytemuck::pod_collect_to_vec(&self.bytes))
    }

    /// Copy the sub-box starting at `offset` with size `extent` into a new
    /// payload, one x-scanline at a time.
    pub fn extract(&self, offset: UVec3, extent: UVec3) -> Result<BrickData> {
        let end = offset + extent;
        if end.cmpgt(self.extent).any() {
            return Err(Error::Streaming(format!(
                "region {}..{} exceeds brick extent {}",
                offset, end, self.extent
            )));
        }

        let vb = self.format.voxel_bytes();
        let row_bytes = extent.x as usize * vb;
        let src_row = self.extent.x as usize;
        let src_slice = src_row * self.extent.y as usize;
        let mut out = Vec::with_capacity(voxel_count(extent) * vb);

        for z in 0..extent.z as usize {
            for y in 0..extent.y as usize {
                let start = ((offset.z as usize + z) * src_slice
                    + (offset.y as usize + y) * src_row
                    + offset.x as usize)
                    * vb;
                out.extend_from_slice(&self.bytes[start..start + row_bytes]);
            }
        }

        Ok(BrickData { format: self.format, extent, bytes: out })
    }

    /// Value range and, for single-component payloads, gradient magnitude
    /// range (central differences, clamped at the brick border).
    pub fn stats(&self) -> BrickStats {
        match self.format.element {
            ElementType::U8 => self.stats_of::<u8>(),
            ElementType::I8 => self.stats_of::<i8>(),
            ElementType::U16 => self.stats_of::<u16>(),
            ElementType::I16 => self.stats_of::<i16>(),
            ElementType::U32 => self.stats_of::<u32>(),
            ElementType::I32 => self.stats_of::<i32>(),
            ElementType::U64 => self.stats_of::<u64>(),
            ElementType::I64 => self.stats_of::<i64>(),
            ElementType::F32 => self.stats_of::<f32>(),
            ElementType::F64 => self.stats_of::<f64>(),
        }
    }

    fn stats_of<T: Scalar>(&self) -> BrickStats {
        let values: Vec<f64> = bytemuck::pod_collect_to_vec::<u8, T>(&self.bytes)
            .into_iter()
            .map(T::to_f64)
            .collect();

        let mut value = ValueRange::empty();
        for v in &values {
            value.include(*v);
        }
        let stats = BrickStats::new(value);

        if self.format.components != 1 || values.is_empty() {
            return stats;
        }
        stats.with_gradient(gradient_range(&values, self.extent))
    }
}

fn gradient_range(values: &[f64], extent: UVec3) -> ValueRange {
    let (sx, sy, sz) = (extent.x as usize, extent.y as usize, extent.z as usize);
    let at = |x: usize, y: usize, z: usize| values[(z * sy + y) * sx + x];
    let mut range = ValueRange::empty();

    for z in 0..sz {
        for y in 0..sy {
            for x in 0..sx {
                let gx = at((x + 1).min(sx - 1), y, z) - at(x.saturating_sub(1), y, z);
                let gy = at(x, (y + 1).min(sy - 1), z) - at(x, y.saturating_sub(1), z);
                let gz = at(x, y, (z + 1).min(sz - 1)) - at(x, y, z.saturating_sub(1));
                range.include(0.5 * (gx * gx + gy * gy + gz * gz).sqrt());
            }
        }
    }
    range
}
