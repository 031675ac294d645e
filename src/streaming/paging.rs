//! Paging loop - drives trace, feedback and admission per subframe
//!
//! Each call to [`PagingLoop::frame`] runs one subframe: the traversal
//! samples what is resident and reports misses, the loop reads the missing
//! bricks from the source and admits them. Once a subframe reports nothing
//! new the view has converged and frames stop tracing until something is
//! invalidated.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use crate::brick::{BrickData, BrickHierarchy, BrickKey};
use crate::core::config::{MissingBrickStrategy, PagingConfig};
use crate::core::error::Error;
use crate::core::types::Result;
use crate::dataset::SourceDataset;
use crate::streaming::async_fetch::AsyncBrickFetcher;
use crate::streaming::brick_pool::BrickPool;
use crate::streaming::feedback::FeedbackBuffer;
use crate::streaming::pool_storage::PoolStorage;
use crate::streaming::traversal::{RenderTraversal, TraversalContext};
use crate::streaming::visibility::VisibilityParams;

/// Where the loop is within the current view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PagingState {
    /// Something changed; the next frame starts over.
    #[default]
    NewView,
    /// Subframes are still paging bricks in.
    Tracing,
    /// Nothing left to page for this view.
    Converged,
}

/// What changed since the last frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Invalidation {
    Camera,
    TransferFunction(VisibilityParams),
    /// Source contents changed; drops unpinned bricks and poison markers.
    Dataset,
}

/// Summary of one [`PagingLoop::frame`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// State after the call.
    pub state: PagingState,
    /// Distinct misses read back.
    pub requests: usize,
    pub admitted: usize,
    pub evicted: usize,
    /// Reads that failed this subframe.
    pub failed: usize,
    /// Misses left for a later subframe because the pool had no room.
    pub deferred: usize,
    /// Background reads still outstanding.
    pub in_flight: usize,
    /// Misses were dropped because the feedback buffer was full.
    pub overflow: bool,
    /// Converged with misses left: every slot holds a brick sampled this subframe.
    pub saturated: bool,
    /// Subframe index within the view (1-based, 0 before the first trace).
    pub subframe: u32,
}

/// Orchestrates paging of one dataset into one pool.
pub struct PagingLoop<S: SourceDataset + Sync, P: PoolStorage> {
    source: S,
    pool: BrickPool<P>,
    feedback: FeedbackBuffer,
    strategy: MissingBrickStrategy,
    max_read_retries: u32,
    state: PagingState,
    subframe: u32,
    /// Bricks admitted during the current view
    attempted: HashSet<BrickKey>,
    /// Failed reads per brick since the last dataset invalidation
    failures: HashMap<BrickKey, u32>,
    poisoned: HashSet<BrickKey>,
}

impl<S: SourceDataset + Sync, P: PoolStorage> PagingLoop<S, P> {
    pub fn new(source: S, pool: BrickPool<P>, config: &PagingConfig) -> Result<Self> {
        config.validate()?;
        if pool.timestep() != config.timestep {
            return Err(Error::config(format!(
                "pool holds timestep {} but the loop renders timestep {}",
                pool.timestep(),
                config.timestep
            )));
        }
        if pool.hierarchy().bricks_per_timestep() != BrickHierarchy::from_dataset(&source)?.bricks_per_timestep() {
            return Err(Error::config("pool was built for a different brick layout"));
        }

        let mut feedback = FeedbackBuffer::new(config.feedback_capacity);
        feedback.set_timestep(config.timestep);

        log::info!(
            "PagingLoop: {} LODs, pool of {} slots, strategy {:?}",
            source.lod_level_count(),
            pool.capacity(),
            config.missing_brick_strategy
        );

        Ok(Self {
            source,
            pool,
            feedback,
            strategy: config.missing_brick_strategy,
            max_read_retries: config.max_read_retries,
            state: PagingState::NewView,
            subframe: 0,
            attempted: HashSet::new(),
            failures: HashMap::new(),
            poisoned: HashSet::new(),
        })
    }

    /// Record a change; the next frame starts a new view.
    pub fn invalidate(&mut self, invalidation: Invalidation) {
        match invalidation {
            Invalidation::Camera => {}
            Invalidation::TransferFunction(params) => self.pool.update_visibility(&params),
            Invalidation::Dataset => {
                let dropped = self.pool.clear_unpinned();
                self.failures.clear();
                self.poisoned.clear();
                log::debug!("Dataset invalidated, dropped {} bricks", dropped);
            }
        }
        self.state = PagingState::NewView;
    }

    /// Run one subframe, reading misses synchronously.
    pub fn frame(&mut self, traversal: &mut dyn RenderTraversal) -> Result<FrameReport> {
        if self.state == PagingState::Converged {
            return Ok(self.report());
        }
        self.enter_subframe(traversal);

        let (mut report, mut pending) = self.trace(traversal, None)?;
        if pending.is_empty() {
            self.settle(&mut report)?;
            return Ok(report);
        }

        let room = self.pool.reclaimable_slots();
        if room == 0 {
            report.deferred = pending.len();
            self.saturate(&mut report)?;
            return Ok(report);
        }
        if pending.len() > room {
            report.deferred = pending.len() - room;
            pending.truncate(room);
        }

        let source = &self.source;
        let reads: Vec<(BrickKey, Result<BrickData>)> = pending
            .par_iter()
            .map(|key| (*key, source.get_brick(key)))
            .collect();

        for (key, read) in reads {
            self.admit_read(key, read, &mut report);
        }
        self.pool.flush_metadata()?;
        self.log_subframe(&report);
        Ok(report)
    }

    /// Run one subframe, reading misses in the background.
    ///
    /// Reads that finished since the last call are admitted after the trace
    /// and show up in the next subframe. A new view cancels the reads of the
    /// previous one. The view converges once a trace misses nothing and no
    /// read is outstanding.
    pub fn frame_async<F>(
        &mut self,
        traversal: &mut dyn RenderTraversal,
        fetcher: &mut AsyncBrickFetcher<F>,
    ) -> Result<FrameReport>
    where
        F: SourceDataset + Send + Sync + 'static,
    {
        if self.state == PagingState::Converged {
            return Ok(self.report());
        }
        if self.enter_subframe(traversal) {
            fetcher.cancel_all();
        }

        let in_flight = fetcher.in_flight_keys();
        let (mut report, pending) = self.trace(traversal, Some(&in_flight))?;

        // Anything not pending here has its result queued for the drain below.
        let outstanding = fetcher.pending_count();
        for fetched in fetcher.drain_completed() {
            if self.poisoned.contains(&fetched.key) || self.pool.is_resident(&fetched.key) {
                continue;
            }
            if fetched.result.is_ok() && self.pool.reclaimable_slots() == 0 {
                // Not marked as tried; the next trace asks for it again.
                report.deferred += 1;
                continue;
            }
            self.admit_read(fetched.key, fetched.result, &mut report);
        }

        let pending: Vec<BrickKey> = pending.into_iter().filter(|key| !self.pool.is_resident(key)).collect();
        let room = self.pool.reclaimable_slots().saturating_sub(fetcher.pending_count());
        let mut requested = 0;
        for key in pending.iter().take(room) {
            if fetcher.request(*key) {
                requested += 1;
            }
        }
        report.deferred += pending.len().saturating_sub(room);
        report.in_flight = fetcher.pending_count();

        if report.admitted == 0 && report.failed == 0 && outstanding == 0 && report.in_flight == 0 {
            if pending.is_empty() {
                self.settle(&mut report)?;
                return Ok(report);
            }
            if requested == 0 {
                self.saturate(&mut report)?;
                return Ok(report);
            }
        }
        self.pool.flush_metadata()?;
        self.log_subframe(&report);
        Ok(report)
    }

    /// Start a subframe. Returns true when it opens a new view.
    fn enter_subframe(&mut self, traversal: &mut dyn RenderTraversal) -> bool {
        let new_view = self.state == PagingState::NewView;
        if new_view {
            traversal.reset();
            self.attempted.clear();
            self.subframe = 0;
            self.state = PagingState::Tracing;
        }
        self.subframe += 1;
        self.pool.begin_frame();
        self.feedback.begin_frame();
        new_view
    }

    /// Trace, touch what was sampled and collect the misses worth reading.
    fn trace(
        &mut self,
        traversal: &mut dyn RenderTraversal,
        in_flight: Option<&HashSet<BrickKey>>,
    ) -> Result<(FrameReport, Vec<BrickKey>)> {
        let used = {
            let mut ctx = TraversalContext::new(&self.pool, self.strategy, &mut self.feedback)
                .exclude(&self.attempted)
                .exclude(&self.poisoned);
            if let Some(keys) = in_flight {
                ctx = ctx.exclude(keys);
            }
            traversal.trace(&mut ctx)?;
            ctx.into_used()
        };
        for key in &used {
            self.pool.touch(key);
        }

        let mut report = self.report();
        report.requests = self.feedback.unique_count();
        report.overflow = self.feedback.overflowed();

        let pending: Vec<BrickKey> = self
            .feedback
            .requests()
            .iter()
            .filter_map(|r| r.to_key(self.pool.hierarchy()))
            .filter(|key| {
                !self.attempted.contains(key) && !self.poisoned.contains(key) && !self.pool.is_resident(key)
            })
            .collect();
        Ok((report, pending))
    }

    /// Nothing left to read: converge unless misses were dropped.
    fn settle(&mut self, report: &mut FrameReport) -> Result<()> {
        self.pool.flush_metadata()?;
        if report.overflow {
            log::warn!("Subframe {} overflowed feedback without new misses; tracing again", self.subframe);
            return Ok(());
        }
        self.state = PagingState::Converged;
        report.state = self.state;
        log::debug!("View converged after {} subframes", self.subframe);
        Ok(())
    }

    /// Every unpinned slot holds a brick sampled this subframe: the view
    /// cannot get any finer with this pool.
    fn saturate(&mut self, report: &mut FrameReport) -> Result<()> {
        self.pool.flush_metadata()?;
        self.state = PagingState::Converged;
        report.state = self.state;
        report.saturated = true;
        log::debug!(
            "View converged at pool capacity after {} subframes, {} misses left",
            self.subframe,
            report.deferred
        );
        Ok(())
    }

    fn admit_read(&mut self, key: BrickKey, read: Result<BrickData>, report: &mut FrameReport) {
        match read.and_then(|data| self.pool.admit(key, &data)) {
            Ok(admission) => {
                self.attempted.insert(key);
                report.admitted += 1;
                if admission.evicted.is_some() {
                    report.evicted += 1;
                }
            }
            Err(e) => {
                report.failed += 1;
                self.record_failure(key, &e);
            }
        }
    }

    fn log_subframe(&self, report: &FrameReport) {
        log::debug!(
            "Subframe {}: {} requests, {} admitted, {} evicted, {} failed, {} deferred{}",
            self.subframe,
            report.requests,
            report.admitted,
            report.evicted,
            report.failed,
            report.deferred,
            if report.overflow { ", feedback overflow" } else { "" }
        );
    }

    fn record_failure(&mut self, key: BrickKey, error: &Error) {
        let count = self.failures.entry(key).or_insert(0);
        *count += 1;
        log::warn!("Failed to page in brick {} (attempt {}): {}", key, count, error);

        // Admission errors mean the brick can never fit; don't retry them.
        if *count > self.max_read_retries || !error.is_io() {
            self.poisoned.insert(key);
            log::warn!("Brick {} poisoned until the dataset is invalidated", key);
        }
    }

    /// Trace until converged, at most `max_subframes` times.
    pub fn converge(&mut self, traversal: &mut dyn RenderTraversal, max_subframes: u32) -> Result<Vec<FrameReport>> {
        let mut reports = Vec::new();
        for _ in 0..max_subframes {
            let report = self.frame(traversal)?;
            reports.push(report);
            if report.state == PagingState::Converged {
                return Ok(reports);
            }
        }
        Err(Error::Streaming(format!("view did not converge within {} subframes", max_subframes)))
    }

    fn report(&self) -> FrameReport {
        FrameReport {
            state: self.state,
            subframe: self.subframe,
            ..Default::default()
        }
    }

    pub fn state(&self) -> PagingState {
        self.state
    }

    pub fn subframe(&self) -> u32 {
        self.subframe
    }

    pub fn pool(&self) -> &BrickPool<P> {
        &self.pool
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_poisoned(&self, key: &BrickKey) -> bool {
        self.poisoned.contains(key)
    }

    pub fn poisoned_count(&self) -> usize {
        self.poisoned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{UVec3, Vec3};

    use std::sync::Arc;
    use std::time::Duration;

    use tokio::runtime::Handle;

    use crate::brick::ValueRange;
    use crate::core::config::PoolCapacity;
    use crate::core::logging;
    use crate::dataset::MemoryDataset;
    use crate::streaming::pool_storage::HostPoolStorage;
    use crate::streaming::traversal::LodTraversal;

    /// 64 leaf bricks, 8 at LOD 1, one root. Values grow with x.
    fn dataset() -> MemoryDataset {
        MemoryDataset::from_fn(UVec3::splat(32), UVec3::splat(12), 4, |p| p.x as u8).unwrap()
    }

    fn paging<'a>(
        ds: &'a MemoryDataset,
        slots: u32,
        config: PagingConfig,
    ) -> PagingLoop<&'a MemoryDataset, HostPoolStorage> {
        logging::init_for_tests();
        let pool = BrickPool::new(ds, HostPoolStorage::new(PoolCapacity::SlotGrid([slots, 1, 1]))).unwrap();
        PagingLoop::new(ds, pool, &config).unwrap()
    }

    /// Wants every leaf brick.
    fn close_up() -> LodTraversal {
        LodTraversal::new(Vec3::ZERO, 10.0)
    }

    /// Counts calls made by the loop.
    struct Counting {
        inner: LodTraversal,
        resets: u32,
        traces: u32,
    }

    impl RenderTraversal for Counting {
        fn reset(&mut self) {
            self.resets += 1;
            self.inner.reset();
        }

        fn trace(&mut self, ctx: &mut TraversalContext<'_>) -> Result<()> {
            self.traces += 1;
            self.inner.trace(ctx)
        }
    }

    #[test]
    fn test_converges_once_everything_is_resident() {
        let ds = dataset();
        let mut paging = paging(&ds, 128, PagingConfig::default());
        let mut traversal = close_up();

        let reports = paging.converge(&mut traversal, 10).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].state, PagingState::Tracing);
        assert_eq!(reports[0].requests, 64);
        assert_eq!(reports[0].admitted, 64);
        assert_eq!(reports[0].evicted, 0);
        assert_eq!(reports[1].state, PagingState::Converged);
        assert_eq!(reports[1].subframe, 2);
        assert_eq!(paging.pool().resident_count(), 65);
        assert_eq!(traversal.last_pass().substitutions, 0);
    }

    #[test]
    fn test_converged_frames_do_not_trace() {
        let ds = dataset();
        let mut paging = paging(&ds, 128, PagingConfig::default());
        let mut traversal = Counting { inner: close_up(), resets: 0, traces: 0 };

        paging.converge(&mut traversal, 10).unwrap();
        let traces = traversal.traces;
        for _ in 0..3 {
            let report = paging.frame(&mut traversal).unwrap();
            assert_eq!(report.state, PagingState::Converged);
            assert_eq!(report.admitted, 0);
        }
        assert_eq!(traversal.traces, traces);
        assert_eq!(traversal.resets, 1);

        paging.invalidate(Invalidation::Camera);
        assert_eq!(paging.state(), PagingState::NewView);
        let report = paging.frame(&mut traversal).unwrap();
        assert_eq!(traversal.resets, 2);
        assert_eq!(report.subframe, 1);
        assert_eq!(report.state, PagingState::Converged);
    }

    #[test]
    fn test_small_pool_stops_at_capacity_without_thrashing() {
        let ds = dataset();
        let mut paging = paging(&ds, 10, PagingConfig::default());
        let mut traversal = close_up();

        let reports = paging.converge(&mut traversal, 10).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].admitted, 9);
        assert_eq!(reports[0].deferred, 64 - 9);
        // Every brick sampled in the second subframe is needed: nothing is admitted.
        assert_eq!(reports[1].admitted, 0);
        assert!(reports[1].saturated);
        assert_eq!(reports[1].state, PagingState::Converged);

        assert!(reports.iter().all(|r| r.evicted == 0));
        assert_eq!(paging.pool().storage().uploads(), 10);
        assert_eq!(paging.pool().resident_count(), 10);
        assert!(paging.pool().is_resident(&BrickKey::new(0, 2, 0)));
    }

    #[test]
    fn test_small_feedback_and_pool_request_only_new_misses() {
        let ds = dataset();
        let config = PagingConfig { feedback_capacity: 10, ..Default::default() };
        let mut paging = paging(&ds, 40, config);
        let mut traversal = close_up();

        let reports = paging.converge(&mut traversal, 20).unwrap();
        let admitted: Vec<usize> = reports.iter().map(|r| r.admitted).collect();
        assert_eq!(admitted, vec![10, 10, 10, 9, 0]);
        assert!(reports.iter().all(|r| r.requests == 10 && r.overflow));
        assert!(reports.iter().all(|r| r.evicted == 0));

        let last = reports[reports.len() - 1];
        assert!(last.saturated);
        assert_eq!(last.deferred, 10);
        assert_eq!(paging.pool().resident_count(), 40);
    }

    #[test]
    fn test_poisoned_bricks_do_not_crowd_out_feedback() {
        let ds = dataset();
        for index in (0..64).step_by(2) {
            ds.fail_reads_for(BrickKey::new(0, 0, index));
        }
        let config = PagingConfig { feedback_capacity: 4, max_read_retries: 0, ..Default::default() };
        let mut paging = paging(&ds, 128, config);
        let mut traversal = close_up();

        let reports = paging.converge(&mut traversal, 40).unwrap();
        let last = reports[reports.len() - 1];
        assert!(!last.overflow && !last.saturated);
        assert_eq!(paging.poisoned_count(), 32);
        assert_eq!(paging.pool().resident_count(), 1 + 32);
        for index in 0..64 {
            let key = BrickKey::new(0, 0, index);
            assert_ne!(paging.pool().is_resident(&key), paging.is_poisoned(&key), "brick {}", key);
        }
    }

    #[test]
    fn test_request_all_ancestors_pages_every_level_at_once() {
        let ds = dataset();
        let config = PagingConfig {
            missing_brick_strategy: MissingBrickStrategy::RequestAllAncestors,
            ..Default::default()
        };
        let mut paging = paging(&ds, 128, config);
        let mut traversal = close_up();

        let reports = paging.converge(&mut traversal, 10).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].admitted, 64 + 8);
        assert_eq!(paging.pool().resident_count(), 1 + 8 + 64);
    }

    #[test]
    fn test_skip_two_levels_pages_coarsest_missing_first() {
        // LOD 0: 8x8x8 bricks, then 4x4x4, 2x2x2 and the root.
        let ds = MemoryDataset::from_fn(UVec3::splat(64), UVec3::splat(12), 4, |p| p.z as u8).unwrap();
        let config = PagingConfig {
            missing_brick_strategy: MissingBrickStrategy::SkipTwoLevels,
            ..Default::default()
        };
        let mut paging = paging(&ds, 1024, config);
        let mut traversal = close_up();

        let reports = paging.converge(&mut traversal, 10).unwrap();
        let admitted: Vec<usize> = reports.iter().map(|r| r.admitted).collect();
        assert_eq!(admitted, vec![8, 64, 512, 0]);
        assert_eq!(paging.pool().resident_count(), 1 + 8 + 64 + 512);
    }

    #[test]
    fn test_skip_one_level_pages_coarse_first() {
        let ds = dataset();
        let config = PagingConfig {
            missing_brick_strategy: MissingBrickStrategy::SkipOneLevel,
            ..Default::default()
        };
        let mut paging = paging(&ds, 128, config);
        let mut traversal = close_up();

        let reports = paging.converge(&mut traversal, 10).unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].admitted, 8);
        assert_eq!(reports[1].admitted, 64);
    }

    #[test]
    fn test_failed_reads_retry_then_poison() {
        let ds = dataset();
        let bad = BrickKey::new(0, 0, 5);
        ds.fail_reads_for(bad);
        let config = PagingConfig { max_read_retries: 2, ..Default::default() };
        let mut paging = paging(&ds, 128, config);
        let mut traversal = close_up();

        let reports = paging.converge(&mut traversal, 10).unwrap();
        let failed: Vec<usize> = reports.iter().map(|r| r.failed).collect();
        assert_eq!(failed, vec![1, 1, 1, 0]);
        assert!(paging.is_poisoned(&bad));
        assert!(!paging.pool().is_resident(&bad));

        // Poisoned bricks are not requested again for a new view.
        paging.invalidate(Invalidation::Camera);
        let report = paging.frame(&mut traversal).unwrap();
        assert_eq!(report.state, PagingState::Converged);

        ds.clear_failures();
        paging.invalidate(Invalidation::Dataset);
        assert_eq!(paging.poisoned_count(), 0);
        assert_eq!(paging.pool().resident_count(), 1);
        paging.converge(&mut traversal, 10).unwrap();
        assert!(paging.pool().is_resident(&bad));
    }

    #[test]
    fn test_transfer_function_limits_paging() {
        let ds = dataset();
        let mut paging = paging(&ds, 128, PagingConfig::default());
        let mut traversal = close_up();

        // Only the last column of bricks (x >= 24, ghost reaching 22) is visible.
        paging.invalidate(Invalidation::TransferFunction(VisibilityParams::transfer_function(
            ValueRange::new(28.0, 40.0),
        )));
        let reports = paging.converge(&mut traversal, 10).unwrap();
        assert_eq!(reports[0].admitted, 16);
        assert_eq!(paging.pool().storage().metadata(), paging.pool().residency_table());
    }

    #[test]
    fn test_feedback_overflow_is_reported() {
        let ds = dataset();
        let config = PagingConfig { feedback_capacity: 10, ..Default::default() };
        let mut paging = paging(&ds, 128, config);
        let mut traversal = close_up();

        let first = paging.frame(&mut traversal).unwrap();
        assert!(first.overflow);
        assert_eq!(first.admitted, 10);
        let reports = paging.converge(&mut traversal, 20).unwrap();
        assert_eq!(reports.last().map(|r| r.state), Some(PagingState::Converged));
        assert_eq!(paging.pool().resident_count(), 65);
    }

    #[test]
    fn test_rejects_mismatched_timestep() {
        let ds = dataset();
        let pool = BrickPool::new(&ds, HostPoolStorage::new(PoolCapacity::SlotGrid([16, 1, 1]))).unwrap();
        let config = PagingConfig { timestep: 1, ..Default::default() };
        assert!(matches!(PagingLoop::new(&ds, pool, &config), Err(Error::Configuration(_))));
    }

    async fn run_in_background(
        paging: &mut PagingLoop<Arc<MemoryDataset>, HostPoolStorage>,
        fetcher: &mut AsyncBrickFetcher<MemoryDataset>,
        traversal: &mut LodTraversal,
    ) -> FrameReport {
        for _ in 0..2000 {
            let report = paging.frame_async(traversal, fetcher).unwrap();
            if report.state == PagingState::Converged {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("background paging did not converge");
    }

    fn background(ds: &Arc<MemoryDataset>) -> (PagingLoop<Arc<MemoryDataset>, HostPoolStorage>, AsyncBrickFetcher<MemoryDataset>) {
        let pool =
            BrickPool::new(ds.as_ref(), HostPoolStorage::new(PoolCapacity::SlotGrid([128, 1, 1]))).unwrap();
        let paging = PagingLoop::new(Arc::clone(ds), pool, &PagingConfig::default()).unwrap();
        let fetcher = AsyncBrickFetcher::new(Handle::current(), Arc::clone(ds));
        (paging, fetcher)
    }

    #[tokio::test]
    async fn test_background_reads_converge() {
        let ds = Arc::new(dataset());
        let (mut paging, mut fetcher) = background(&ds);
        let mut traversal = close_up();

        let last = run_in_background(&mut paging, &mut fetcher, &mut traversal).await;
        assert!(!last.saturated);
        assert_eq!(last.in_flight, 0);
        assert_eq!(paging.pool().resident_count(), 65);
        assert_eq!(traversal.last_pass().substitutions, 0);
    }

    #[tokio::test]
    async fn test_new_view_cancels_background_reads() {
        let ds = Arc::new(dataset());
        let (mut paging, mut fetcher) = background(&ds);
        let mut traversal = close_up();

        let first = paging.frame_async(&mut traversal, &mut fetcher).unwrap();
        assert_eq!(first.state, PagingState::Tracing);
        assert_eq!(fetcher.epoch(), 1);

        paging.invalidate(Invalidation::Camera);
        paging.frame_async(&mut traversal, &mut fetcher).unwrap();
        assert_eq!(fetcher.epoch(), 2);

        run_in_background(&mut paging, &mut fetcher, &mut traversal).await;
        assert_eq!(paging.pool().resident_count(), 65);
    }

    #[tokio::test]
    async fn test_background_read_failures_poison() {
        let ds = Arc::new(dataset());
        let bad = BrickKey::new(0, 0, 9);
        ds.fail_reads_for(bad);
        let (mut paging, mut fetcher) = background(&ds);
        let mut traversal = close_up();

        run_in_background(&mut paging, &mut fetcher, &mut traversal).await;
        assert!(paging.is_poisoned(&bad));
        assert_eq!(paging.pool().resident_count(), 64);
    }
}
