//! Missing-brick feedback for demand-driven paging.
//!
//! During traversal the renderer records every brick it wanted but could
//! not sample. The CPU reads these back to decide which bricks to page in
//! before the next subframe.

use std::collections::HashSet;

use glam::UVec3;

use crate::brick::{BrickHierarchy, BrickKey};
use crate::core::config::DEFAULT_FEEDBACK_CAPACITY;

/// Words per request in the raw readback format.
const RAW_STRIDE: usize = 4;

/// A brick the renderer needed but found non-resident.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MissingBrickRequest {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub lod: u32,
    pub timestep: u32,
}

impl MissingBrickRequest {
    pub fn new(coord: UVec3, lod: u32, timestep: u32) -> Self {
        Self { x: coord.x, y: coord.y, z: coord.z, lod, timestep }
    }

    /// Request for a brick key.
    pub fn from_key(key: &BrickKey, hierarchy: &BrickHierarchy) -> Self {
        Self::new(hierarchy.coord(key), key.lod, key.timestep)
    }

    pub fn coord(&self) -> UVec3 {
        UVec3::new(self.x, self.y, self.z)
    }

    /// Key of the requested brick, if it exists in the hierarchy.
    pub fn to_key(&self, hierarchy: &BrickHierarchy) -> Option<BrickKey> {
        let key = hierarchy.key_at(self.timestep, self.lod, self.coord())?;
        hierarchy.validate(&key).ok()?;
        Some(key)
    }
}

/// CPU-side view of the feedback buffer: bounded and deduplicated.
pub struct FeedbackBuffer {
    /// Maximum distinct requests per subframe
    max_requests: u32,
    /// Requests in arrival order
    requests: Vec<MissingBrickRequest>,
    unique_requests: HashSet<MissingBrickRequest>,
    /// Timestep the raw readback refers to
    timestep: u32,
    frame: u32,
    overflowed: bool,
}

impl FeedbackBuffer {
    pub fn new(max_requests: u32) -> Self {
        Self {
            max_requests,
            requests: Vec::with_capacity(max_requests as usize),
            unique_requests: HashSet::new(),
            timestep: 0,
            frame: 0,
            overflowed: false,
        }
    }

    /// Create with default settings.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_FEEDBACK_CAPACITY)
    }

    /// Set the timestep stamped on raw readback requests.
    pub fn set_timestep(&mut self, timestep: u32) {
        self.timestep = timestep;
    }

    /// Begin a new subframe (clear previous requests).
    pub fn begin_frame(&mut self) {
        self.frame += 1;
        self.requests.clear();
        self.unique_requests.clear();
        self.overflowed = false;
    }

    /// Record a miss. Returns false for duplicates and once full.
    pub fn record(&mut self, request: MissingBrickRequest) -> bool {
        if self.unique_requests.contains(&request) {
            return false;
        }
        if self.requests.len() >= self.max_requests as usize {
            self.overflowed = true;
            return false;
        }
        self.unique_requests.insert(request);
        self.requests.push(request);
        true
    }

    /// Process raw feedback read back from the GPU.
    ///
    /// The format is `[count, x0, y0, z0, lod0, x1, ...]`.
    pub fn process_raw_feedback(&mut self, data: &[u32]) {
        let Some((&count, body)) = data.split_first() else {
            return;
        };
        let available = body.len() / RAW_STRIDE;
        if count as usize > available {
            log::warn!("Feedback readback claims {} requests but holds {}", count, available);
        }
        for quad in body.chunks_exact(RAW_STRIDE).take(count as usize) {
            let coord = UVec3::new(quad[0], quad[1], quad[2]);
            self.record(MissingBrickRequest::new(coord, quad[3], self.timestep));
        }
    }

    /// Encode requests in the raw readback format.
    pub fn encode_raw(requests: &[MissingBrickRequest]) -> Vec<u32> {
        let mut data = Vec::with_capacity(1 + requests.len() * RAW_STRIDE);
        data.push(requests.len() as u32);
        for r in requests {
            data.extend_from_slice(&[r.x, r.y, r.z, r.lod]);
        }
        data
    }

    /// Requests of this subframe in arrival order.
    pub fn requests(&self) -> &[MissingBrickRequest] {
        &self.requests
    }

    /// Number of distinct requests.
    pub fn unique_count(&self) -> usize {
        self.unique_requests.len()
    }

    /// Whether distinct misses were dropped because the buffer was full.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}

impl Default for FeedbackBuffer {
    fn default() -> Self {
        Self::with_defaults()
    }
}
