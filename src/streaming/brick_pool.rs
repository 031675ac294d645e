//! Brick Pool - fixed number of slots for resident bricks
//!
//! Based on the GigaVoxels brick pool concept:
//! - Fixed capacity sized from the largest brick
//! - LRU eviction when the pool is full, finer bricks first on ties
//! - Coarsest LOD pinned so every ray can always sample something
//! - Residency table mirrored to the storage backend for the renderer

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::UVec3;

use crate::brick::addressing;
use crate::brick::{BrickData, BrickHierarchy, BrickKey, BrickStats};
use crate::core::error::Error;
use crate::core::types::Result;
use crate::dataset::SourceDataset;
use crate::streaming::pool_storage::PoolStorage;
use crate::streaming::visibility::{VisibilityParams, compute_visibility};

/// Sentinel slot value for a brick that is not in the pool.
pub const BRICK_NOT_RESIDENT: u32 = u32::MAX;

/// Residency table flag: the brick occupies a slot.
pub const FLAG_RESIDENT: u32 = 1;
/// Residency table flag: the brick can contribute to the image.
pub const FLAG_VISIBLE: u32 = 1 << 1;
/// Residency table flag: the brick is never evicted.
pub const FLAG_PINNED: u32 = 1 << 2;

/// One residency table entry, laid out for GPU upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BrickMetaEntry {
    /// Slot index or [`BRICK_NOT_RESIDENT`].
    pub slot: u32,
    pub flags: u32,
}

impl BrickMetaEntry {
    pub fn is_resident(&self) -> bool {
        self.flags & FLAG_RESIDENT != 0
    }

    pub fn is_visible(&self) -> bool {
        self.flags & FLAG_VISIBLE != 0
    }

    pub fn is_pinned(&self) -> bool {
        self.flags & FLAG_PINNED != 0
    }
}

impl Default for BrickMetaEntry {
    fn default() -> Self {
        Self { slot: BRICK_NOT_RESIDENT, flags: 0 }
    }
}

/// A slot in the brick pool
#[derive(Clone, Copy, Debug, Default)]
struct BrickSlot {
    /// Brick in this slot, if any
    key: Option<BrickKey>,
    /// Frame number when last accessed (for LRU)
    last_access_frame: u64,
    pinned: bool,
}

/// Outcome of [`BrickPool::admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    pub slot: u32,
    /// Brick that had to leave the pool to make room.
    pub evicted: Option<BrickKey>,
    /// The brick was already resident and only touched.
    pub already_resident: bool,
}

/// Brick pool for one timestep of a dataset.
pub struct BrickPool<P: PoolStorage> {
    storage: P,
    hierarchy: BrickHierarchy,
    timestep: u32,
    slot_grid: UVec3,
    slot_bytes: u64,
    slots: Vec<BrickSlot>,
    brick_to_slot: HashMap<BrickKey, u32>,
    /// Free slot indices, lowest on top
    free_slots: Vec<u32>,
    /// Indexed by brick id within the timestep
    table: Vec<BrickMetaEntry>,
    stats: Vec<Option<BrickStats>>,
    visibility: VisibilityParams,
    current_frame: u64,
    pinned_count: u32,
    table_dirty: bool,
}

impl<P: PoolStorage> BrickPool<P> {
    /// Create a pool for timestep 0 and pin its coarsest bricks.
    pub fn new(source: &dyn SourceDataset, storage: P) -> Result<Self> {
        Self::for_timestep(source, storage, 0)
    }

    /// Create a pool for one timestep and pin its coarsest bricks.
    pub fn for_timestep(source: &dyn SourceDataset, mut storage: P, timestep: u32) -> Result<Self> {
        let hierarchy = BrickHierarchy::from_dataset(source)?;
        if timestep >= hierarchy.timesteps() {
            return Err(Error::config(format!(
                "timestep {} out of range, dataset has {}",
                timestep,
                hierarchy.timesteps()
            )));
        }

        let max_brick = source.max_used_brick_size();
        let slot_bytes = addressing::brick_count(max_brick) * source.format().voxel_bytes() as u64;
        let slot_grid = storage.allocate(slot_bytes)?;
        let capacity = addressing::brick_count(slot_grid);

        let pinned = hierarchy.brick_count(hierarchy.coarsest_lod());
        if capacity < pinned + 1 {
            return Err(Error::config(format!(
                "pool of {} slots cannot hold the {} coarsest bricks plus one evictable slot",
                capacity, pinned
            )));
        }
        let capacity = u32::try_from(capacity)
            .map_err(|_| Error::config(format!("pool slot count {} overflows u32", capacity)))?;

        let stats = (0..hierarchy.bricks_per_timestep())
            .filter_map(|id| hierarchy.key_for_global(id))
            .map(|key| source.brick_stats(&BrickKey { timestep, ..key }))
            .collect();

        let mut pool = Self {
            storage,
            table: vec![BrickMetaEntry::default(); hierarchy.bricks_per_timestep() as usize],
            hierarchy,
            timestep,
            slot_grid,
            slot_bytes,
            slots: vec![BrickSlot::default(); capacity as usize],
            brick_to_slot: HashMap::new(),
            free_slots: (0..capacity).rev().collect(),
            stats,
            visibility: VisibilityParams::default(),
            current_frame: 0,
            pinned_count: 0,
            table_dirty: true,
        };
        pool.apply_visibility();

        for key in pool.hierarchy.coarsest_keys(timestep) {
            let data = source.get_brick(&key)?;
            pool.pin(key, &data)?;
        }

        log::info!(
            "Created brick pool: {} slots ({} grid) of {}KB, {} pinned",
            capacity,
            slot_grid,
            slot_bytes / 1024,
            pool.pinned_count
        );
        Ok(pool)
    }

    /// Start a new frame (for LRU tracking)
    pub fn begin_frame(&mut self) {
        self.current_frame += 1;
    }

    /// Residency table index of a key of this pool's timestep.
    fn table_index(&self, key: &BrickKey) -> Option<usize> {
        if key.timestep != self.timestep || self.hierarchy.validate(key).is_err() {
            return None;
        }
        Some(self.hierarchy.global_id(&BrickKey { timestep: 0, ..*key }) as usize)
    }

    pub fn is_resident(&self, key: &BrickKey) -> bool {
        self.brick_to_slot.contains_key(key)
    }

    /// Visibility under the current parameters; unknown keys are invisible.
    pub fn is_visible(&self, key: &BrickKey) -> bool {
        self.table_index(key).is_some_and(|i| self.table[i].is_visible())
    }

    pub fn is_pinned(&self, key: &BrickKey) -> bool {
        self.table_index(key).is_some_and(|i| self.table[i].is_pinned())
    }

    /// Slot of a resident brick, without touching it.
    pub fn lookup(&self, key: &BrickKey) -> Option<u32> {
        self.brick_to_slot.get(key).copied()
    }

    /// Mark a resident brick as used this frame.
    pub fn touch(&mut self, key: &BrickKey) -> bool {
        match self.brick_to_slot.get(key) {
            Some(&slot) => {
                self.slots[slot as usize].last_access_frame = self.current_frame;
                true
            }
            None => false,
        }
    }

    /// Put a brick into the pool, evicting the least valuable one if full.
    pub fn admit(&mut self, key: BrickKey, data: &BrickData) -> Result<Admission> {
        let index = self.table_index(&key).ok_or(Error::InvalidBrickKey(key))?;

        if let Some(&existing) = self.brick_to_slot.get(&key) {
            self.slots[existing as usize].last_access_frame = self.current_frame;
            return Ok(Admission { slot: existing, evicted: None, already_resident: true });
        }

        if data.len_bytes() as u64 > self.slot_bytes {
            return Err(Error::PayloadSize { expected: self.slot_bytes as usize, actual: data.len_bytes() });
        }

        let (slot, evicted) = match self.free_slots.pop() {
            Some(free) => (free, None),
            None => {
                let Some((slot, old)) = self.evict_lru() else {
                    debug_assert!(false, "pool has no evictable slot");
                    return Err(Error::Streaming("brick pool has no evictable slot".into()));
                };
                (slot, Some(old))
            }
        };

        if let Err(e) = self.storage.upload(slot, data) {
            self.free_slots.push(slot);
            return Err(e);
        }

        self.slots[slot as usize] = BrickSlot {
            key: Some(key),
            last_access_frame: self.current_frame,
            pinned: false,
        };
        self.brick_to_slot.insert(key, slot);
        self.table[index].slot = slot;
        self.table[index].flags |= FLAG_RESIDENT;
        self.table_dirty = true;

        log::trace!("Admitted brick {} into slot {}", key, slot);
        Ok(Admission { slot, evicted, already_resident: false })
    }

    /// Slots that can take a brick without evicting one used this frame:
    /// free slots plus unpinned bricks last touched in an earlier frame.
    pub fn reclaimable_slots(&self) -> usize {
        let stale = self
            .slots
            .iter()
            .filter(|slot| !slot.pinned && slot.key.is_some() && slot.last_access_frame < self.current_frame)
            .count();
        self.free_slots.len() + stale
    }

    /// Admit a brick and exclude it from eviction.
    pub fn pin(&mut self, key: BrickKey, data: &BrickData) -> Result<u32> {
        let admission = self.admit(key, data)?;
        let slot = &mut self.slots[admission.slot as usize];
        if !slot.pinned {
            slot.pinned = true;
            self.pinned_count += 1;
        }
        if let Some(index) = self.table_index(&key) {
            self.table[index].flags |= FLAG_PINNED;
        }
        Ok(admission.slot)
    }

    /// Evict the oldest non-pinned brick; ties go to the finer LOD, then the
    /// lower slot.
    fn evict_lru(&mut self) -> Option<(u32, BrickKey)> {
        let (idx, key) = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.pinned)
            .filter_map(|(idx, slot)| slot.key.map(|key| (idx, key, slot.last_access_frame)))
            .min_by_key(|&(idx, key, frame)| (frame, key.lod, idx))
            .map(|(idx, key, _)| (idx as u32, key))?;

        self.release(idx, key);
        log::debug!("Evicted brick {} from slot {}", key, idx);
        Some((idx, key))
    }

    fn release(&mut self, slot: u32, key: BrickKey) {
        self.brick_to_slot.remove(&key);
        self.slots[slot as usize] = BrickSlot::default();
        if let Some(index) = self.table_index(&key) {
            self.table[index].slot = BRICK_NOT_RESIDENT;
            self.table[index].flags &= !(FLAG_RESIDENT | FLAG_PINNED);
        }
        self.table_dirty = true;
    }

    /// Drop every non-pinned brick. Returns how many were dropped.
    pub fn clear_unpinned(&mut self) -> usize {
        let victims: Vec<(u32, BrickKey)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.pinned)
            .filter_map(|(idx, slot)| slot.key.map(|key| (idx as u32, key)))
            .collect();
        for &(slot, key) in &victims {
            self.release(slot, key);
        }
        self.free_slots = (0..self.capacity())
            .rev()
            .filter(|&slot| self.slots[slot as usize].key.is_none())
            .collect();
        victims.len()
    }

    /// Reclassify every brick against new visibility parameters.
    pub fn update_visibility(&mut self, params: &VisibilityParams) {
        self.visibility = *params;
        self.apply_visibility();
    }

    fn apply_visibility(&mut self) {
        let visible = compute_visibility(&self.hierarchy, &self.stats, &self.visibility);
        for (entry, visible) in self.table.iter_mut().zip(visible) {
            if visible {
                entry.flags |= FLAG_VISIBLE;
            } else {
                entry.flags &= !FLAG_VISIBLE;
            }
        }
        self.table_dirty = true;
    }

    /// Push the residency table to storage if it changed.
    pub fn flush_metadata(&mut self) -> Result<()> {
        if self.table_dirty {
            self.storage.upload_metadata(&self.table)?;
            self.table_dirty = false;
        }
        Ok(())
    }

    /// Position of a slot in the slot grid (atlas coordinates).
    pub fn pool_location(&self, slot: u32) -> UVec3 {
        addressing::to3d(slot as u64, self.slot_grid)
    }

    /// Residency table, one entry per brick of the timestep.
    pub fn residency_table(&self) -> &[BrickMetaEntry] {
        &self.table
    }

    /// Bricks currently resident, with their slots.
    pub fn resident_keys(&self) -> impl Iterator<Item = (BrickKey, u32)> + '_ {
        self.brick_to_slot.iter().map(|(k, s)| (*k, *s))
    }

    pub fn hierarchy(&self) -> &BrickHierarchy {
        &self.hierarchy
    }

    pub fn storage(&self) -> &P {
        &self.storage
    }

    pub fn timestep(&self) -> u32 {
        self.timestep
    }

    pub fn visibility(&self) -> &VisibilityParams {
        &self.visibility
    }

    pub fn slot_grid(&self) -> UVec3 {
        self.slot_grid
    }

    pub fn slot_bytes(&self) -> u64 {
        self.slot_bytes
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Capacity in bricks
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn resident_count(&self) -> u32 {
        self.brick_to_slot.len() as u32
    }

    pub fn pinned_count(&self) -> u32 {
        self.pinned_count
    }

    /// Pool utilization percentage
    pub fn utilization(&self) -> f32 {
        self.resident_count() as f32 / self.capacity() as f32 * 100.0
    }
}
