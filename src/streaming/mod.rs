//! Brick paging driven by missing-brick feedback
//!
//! Key concepts:
//! - Brick Pool: fixed number of slots holding resident bricks, LRU eviction
//! - Feedback: the traversal reports bricks it wanted but could not sample
//! - Paging Loop: trace, read back, fetch, admit until the view converges
//! - Async Fetch: optional background reads on tokio's blocking pool

pub mod visibility;
pub mod pool_storage;
pub mod brick_pool;
pub mod feedback;
pub mod traversal;
pub mod paging;
pub mod async_fetch;

pub use visibility::{VisibilityMode, VisibilityParams};
pub use pool_storage::{GpuPoolStorage, HostPoolStorage, PoolStorage};
pub use brick_pool::{Admission, BrickMetaEntry, BrickPool, BRICK_NOT_RESIDENT};
pub use feedback::{FeedbackBuffer, MissingBrickRequest};
pub use traversal::{LodTraversal, RenderTraversal, TraversalContext, TraversalStats};
pub use paging::{FrameReport, Invalidation, PagingLoop, PagingState};
pub use async_fetch::{AsyncBrickFetcher, FetchedBrick};
