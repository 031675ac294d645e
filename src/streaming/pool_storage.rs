//! Backing storage for brick pool slots
//!
//! The pool only does bookkeeping; payload bytes and the residency table
//! go to a [`PoolStorage`]. [`HostPoolStorage`] keeps them in CPU memory,
//! [`GpuPoolStorage`] in `wgpu` storage buffers.

use glam::UVec3;

use crate::brick::BrickData;
use crate::core::config::PoolCapacity;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::brick_pool::BrickMetaEntry;

/// Where resident brick payloads live.
pub trait PoolStorage {
    /// Reserve slots of `slot_bytes` each and return the slot grid.
    fn allocate(&mut self, slot_bytes: u64) -> Result<UVec3>;

    /// Copy a payload into a slot.
    fn upload(&mut self, slot: u32, brick: &BrickData) -> Result<()>;

    /// Publish the residency table.
    fn upload_metadata(&mut self, table: &[BrickMetaEntry]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Slots in CPU memory (software renderers, tests).
pub struct HostPoolStorage {
    capacity: PoolCapacity,
    slot_bytes: usize,
    data: Vec<u8>,
    metadata: Vec<BrickMetaEntry>,
    uploads: u64,
}

impl HostPoolStorage {
    pub fn new(capacity: PoolCapacity) -> Self {
        Self {
            capacity,
            slot_bytes: 0,
            data: Vec::new(),
            metadata: Vec::new(),
            uploads: 0,
        }
    }

    /// Bytes of one slot (payloads smaller than a slot are zero padded).
    pub fn slot(&self, slot: u32) -> &[u8] {
        let start = slot as usize * self.slot_bytes;
        &self.data[start..start + self.slot_bytes]
    }

    /// Last published residency table.
    pub fn metadata(&self) -> &[BrickMetaEntry] {
        &self.metadata
    }

    /// Number of payload uploads so far.
    pub fn uploads(&self) -> u64 {
        self.uploads
    }
}

impl PoolStorage for HostPoolStorage {
    fn allocate(&mut self, slot_bytes: u64) -> Result<UVec3> {
        let grid = self.capacity.slot_grid(slot_bytes)?;
        let slots = grid.x as usize * grid.y as usize * grid.z as usize;
        self.slot_bytes = slot_bytes as usize;
        self.data = vec![0; slots * self.slot_bytes];
        Ok(grid)
    }

    fn upload(&mut self, slot: u32, brick: &BrickData) -> Result<()> {
        let bytes = brick.bytes();
        if bytes.len() > self.slot_bytes {
            return Err(Error::PayloadSize { expected: self.slot_bytes, actual: bytes.len() });
        }
        let start = slot as usize * self.slot_bytes;
        let dst = self
            .data
            .get_mut(start..start + self.slot_bytes)
            .ok_or_else(|| Error::Streaming(format!("slot {} outside host pool", slot)))?;
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()..].fill(0);
        self.uploads += 1;
        Ok(())
    }

    fn upload_metadata(&mut self, table: &[BrickMetaEntry]) -> Result<()> {
        self.metadata.clear();
        self.metadata.extend_from_slice(table);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GPU
// ---------------------------------------------------------------------------

/// Slots in a `wgpu` storage buffer, written through the queue.
///
/// The slot count is clamped so the buffer fits the device's buffer and
/// storage binding limits. Buffers are released when the storage drops.
pub struct GpuPoolStorage {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capacity: PoolCapacity,
    /// Slot size rounded up to the copy alignment.
    slot_stride: u64,
    buffer: Option<wgpu::Buffer>,
    metadata: Option<wgpu::Buffer>,
}

impl GpuPoolStorage {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, capacity: PoolCapacity) -> Self {
        Self {
            device: device.clone(),
            queue: queue.clone(),
            capacity,
            slot_stride: 0,
            buffer: None,
            metadata: None,
        }
    }

    /// Brick payload buffer, once allocated.
    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffer.as_ref()
    }

    /// Residency table buffer, once published.
    pub fn metadata_buffer(&self) -> Option<&wgpu::Buffer> {
        self.metadata.as_ref()
    }

    /// Byte offset between consecutive slots.
    pub fn slot_stride(&self) -> u64 {
        self.slot_stride
    }
}

impl PoolStorage for GpuPoolStorage {
    fn allocate(&mut self, slot_bytes: u64) -> Result<UVec3> {
        let stride = slot_bytes.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let mut grid = self.capacity.slot_grid(stride)?;

        let limits = self.device.limits();
        let max_bytes = limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64);
        let wanted = grid.x as u64 * grid.y as u64 * grid.z as u64;
        if wanted * stride > max_bytes {
            let slots = (max_bytes / stride).min(u32::MAX as u64) as u32;
            if slots == 0 {
                return Err(Error::Gpu(format!(
                    "a {} byte brick exceeds the device buffer limit of {} bytes",
                    stride, max_bytes
                )));
            }
            log::warn!(
                "Brick pool of {} slots exceeds GPU limit, reducing to {} slots ({}MB)",
                wanted,
                slots,
                slots as u64 * stride / 1024 / 1024
            );
            grid = UVec3::new(slots, 1, 1);
        }

        let size = grid.x as u64 * grid.y as u64 * grid.z as u64 * stride;
        self.buffer = Some(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("brick_pool"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
        self.slot_stride = stride;

        log::info!("Created GPU brick pool: {} slots, {}MB", grid, size / 1024 / 1024);
        Ok(grid)
    }

    fn upload(&mut self, slot: u32, brick: &BrickData) -> Result<()> {
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| Error::Gpu("brick pool buffer not allocated".into()))?;
        let bytes = brick.bytes();
        if bytes.len() as u64 > self.slot_stride {
            return Err(Error::PayloadSize { expected: self.slot_stride as usize, actual: bytes.len() });
        }
        let offset = slot as u64 * self.slot_stride;

        // write_buffer needs a 4-byte multiple
        if bytes.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(buffer, offset, bytes);
        } else {
            let mut padded = bytes.to_vec();
            padded.resize((bytes.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
            self.queue.write_buffer(buffer, offset, &padded);
        }
        Ok(())
    }

    fn upload_metadata(&mut self, table: &[BrickMetaEntry]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(table);
        let size = (bytes.len() as u64).max(wgpu::COPY_BUFFER_ALIGNMENT);
        let stale = self.metadata.as_ref().is_none_or(|b| b.size() != size);
        if stale {
            self.metadata = Some(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("brick_pool_metadata"),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        if let Some(buffer) = &self.metadata {
            if !bytes.is_empty() {
                self.queue.write_buffer(buffer, 0, bytes);
            }
        }
        Ok(())
    }
}

/// Create a device without a surface for offline paging.
pub fn request_headless_device() -> Result<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::default(),
        force_fallback_adapter: false,
        compatible_surface: None,
    }))
    .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;

    let limits = adapter.limits();
    pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("volbrick_device"),
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits {
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
            max_buffer_size: limits.max_buffer_size,
            ..wgpu::Limits::downlevel_defaults()
        },
        memory_hints: wgpu::MemoryHints::MemoryUsage,
        experimental_features: Default::default(),
        trace: Default::default(),
    }))
    .map_err(|e| Error::Gpu(e.to_string()))
}
