//! Volbrick - bricked multiresolution volumes with feedback-driven paging
//!
//! - [`brick`]: brick addressing, payloads and the LOD hierarchy
//! - [`dataset`]: bricked volume sources and the rebricking view
//! - [`streaming`]: brick pool, missing-brick feedback and the paging loop

pub mod core;
pub mod brick;
pub mod dataset;
pub mod streaming;
