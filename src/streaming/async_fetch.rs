//! Background brick reads on tokio's blocking pool.
//!
//! Reads run off the render thread; results are picked up with
//! [`AsyncBrickFetcher::drain_completed`] and admitted by the caller. Every
//! new view bumps an epoch so reads requested for an abandoned view are
//! dropped instead of admitted. [`PagingLoop::frame_async`] drives a fetcher
//! and cancels it whenever the loop starts a new view.
//!
//! [`PagingLoop::frame_async`]: crate::streaming::paging::PagingLoop::frame_async

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::brick::{BrickData, BrickKey};
use crate::core::types::Result;
use crate::dataset::SourceDataset;

/// A finished background read.
#[derive(Debug)]
pub struct FetchedBrick {
    pub key: BrickKey,
    pub result: Result<BrickData>,
    /// Read time in milliseconds
    pub load_time_ms: f32,
}

struct Completion {
    epoch: u64,
    brick: FetchedBrick,
}

/// In-flight reads keyed by brick, with the epoch they were requested in.
type InFlight = Arc<Mutex<HashMap<BrickKey, u64>>>;

/// Deduplicating background reader for one source.
pub struct AsyncBrickFetcher<S: SourceDataset + Send + Sync + 'static> {
    handle: Handle,
    source: Arc<S>,
    epoch: Arc<AtomicU64>,
    in_flight: InFlight,
    result_tx: mpsc::UnboundedSender<Completion>,
    result_rx: mpsc::UnboundedReceiver<Completion>,
}

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashMap<BrickKey, u64>> {
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: SourceDataset + Send + Sync + 'static> AsyncBrickFetcher<S> {
    pub fn new(handle: Handle, source: Arc<S>) -> Self {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            handle,
            source,
            epoch: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            result_tx,
            result_rx,
        }
    }

    /// Start reading a brick. Returns false if it is already in flight.
    pub fn request(&self, key: BrickKey) -> bool {
        let epoch = self.epoch.load(Ordering::Acquire);
        {
            let mut in_flight = lock(&self.in_flight);
            if in_flight.get(&key) == Some(&epoch) {
                return false;
            }
            in_flight.insert(key, epoch);
        }

        let source = Arc::clone(&self.source);
        let in_flight = Arc::clone(&self.in_flight);
        let result_tx = self.result_tx.clone();
        self.handle.spawn_blocking(move || {
            let start = Instant::now();
            let result = source.get_brick(&key);
            let load_time_ms = start.elapsed().as_secs_f32() * 1000.0;

            // Send before leaving the in-flight map: once a key is no longer
            // pending its result is already queued.
            // The receiver only goes away with the fetcher.
            let _ = result_tx.send(Completion {
                epoch,
                brick: FetchedBrick { key, result, load_time_ms },
            });
            let mut in_flight = lock(&in_flight);
            if in_flight.get(&key) == Some(&epoch) {
                in_flight.remove(&key);
            }
        });
        true
    }

    /// Abandon every outstanding read; their results will be discarded.
    pub fn cancel_all(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        lock(&self.in_flight).clear();
        log::debug!("Brick fetcher moved to epoch {}", epoch);
    }

    /// Results of the current epoch that finished since the last call.
    pub fn drain_completed(&mut self) -> Vec<FetchedBrick> {
        let epoch = self.epoch();
        let mut done = Vec::new();
        while let Ok(completion) = self.result_rx.try_recv() {
            if completion.epoch == epoch {
                done.push(completion.brick);
            } else {
                log::trace!("Dropped stale read of brick {}", completion.brick.key);
            }
        }
        done
    }

    /// Wait for the next result of the current epoch.
    pub async fn next_completed(&mut self) -> Option<FetchedBrick> {
        while let Some(completion) = self.result_rx.recv().await {
            if completion.epoch == self.epoch() {
                return Some(completion.brick);
            }
            log::trace!("Dropped stale read of brick {}", completion.brick.key);
        }
        None
    }

    pub fn is_pending(&self, key: &BrickKey) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    /// Snapshot of the keys currently being read.
    pub fn in_flight_keys(&self) -> HashSet<BrickKey> {
        lock(&self.in_flight).keys().copied().collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Current view epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}
