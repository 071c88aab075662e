//! Request coalescing: concurrent fetches for nearby coordinates collapse
//! into one upstream call.
//!
//! The coalescer is resource-type agnostic. It is handed a single "perform
//! one fetch for a centroid" function at construction, so the same
//! mechanism serves primary weather, air quality, and alerts, each with its
//! own pending queue and tolerance. It never retries; that belongs to the
//! orchestrator one layer up.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::error::FetchError;
use crate::types::Coordinate;

/// Boxed future produced by the upstream fetch function.
pub type FetchFuture<T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send>>;

/// The pluggable "perform one fetch" function. The bool is the forced-refresh
/// flag; a cluster is forced when any merged request was forced.
pub type FetchFn<T> = Arc<dyn Fn(Coordinate, bool) -> FetchFuture<T> + Send + Sync>;

/// Per-resource coalescer tuning.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Requests within this many degrees on both axes merge into one entry.
    pub tolerance_deg: f64,
    /// How long a pending batch waits for more requests before dispatch.
    pub window: Duration,
    /// Pending-entry count that triggers an immediate flush.
    pub max_batch: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self { tolerance_deg: 0.05, window: Duration::from_secs(2), max_batch: 5 }
    }
}

type Waiter<T> = oneshot::Sender<Result<T, FetchError>>;

/// One pending entry: the running centroid of every request merged into it,
/// plus the waiters to fan the eventual result out to.
struct PendingEntry<T> {
    centroid: Coordinate,
    count: usize,
    forced: bool,
    waiters: Vec<Waiter<T>>,
}

impl<T> PendingEntry<T> {
    fn new(coordinate: Coordinate, forced: bool, waiter: Waiter<T>) -> Self {
        Self { centroid: coordinate, count: 1, forced, waiters: vec![waiter] }
    }

    fn absorb(&mut self, coordinate: Coordinate, forced: bool, waiter: Waiter<T>) {
        let n = self.count as f64;
        self.centroid = Coordinate::new(
            (self.centroid.latitude * n + coordinate.latitude) / (n + 1.0),
            (self.centroid.longitude * n + coordinate.longitude) / (n + 1.0),
        );
        self.count += 1;
        self.forced |= forced;
        self.waiters.push(waiter);
    }
}

struct PendingState<T> {
    entries: Vec<PendingEntry<T>>,
    window_armed: bool,
    /// Bumped on every flush so a stale window timer cannot re-flush a
    /// batch that the size trigger already dispatched.
    generation: u64,
}

impl<T> PendingState<T> {
    fn take_batch(&mut self) -> Vec<PendingEntry<T>> {
        self.generation += 1;
        self.window_armed = false;
        std::mem::take(&mut self.entries)
    }
}

/// Groups concurrent requests for nearby coordinates into single upstream
/// fetches and fans each result out to every waiter.
pub struct RequestCoalescer<T> {
    config: CoalescerConfig,
    fetch: FetchFn<T>,
    state: Arc<Mutex<PendingState<T>>>,
}

impl<T> Clone for RequestCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            fetch: Arc::clone(&self.fetch),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> RequestCoalescer<T> {
    pub fn new<F, Fut>(config: CoalescerConfig, fetch: F) -> Self
    where
        F: Fn(Coordinate, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let fetch: FetchFn<T> = Arc::new(move |coordinate, forced| {
            Box::pin(fetch(coordinate, forced)) as FetchFuture<T>
        });
        Self {
            config,
            fetch,
            state: Arc::new(Mutex::new(PendingState {
                entries: Vec::new(),
                window_armed: false,
                generation: 0,
            })),
        }
    }

    /// Request a fetch for `coordinate`, merging with pending requests for
    /// nearby coordinates. Resolves exactly once, with the shared result of
    /// whichever cluster this request ends up in.
    ///
    /// # Errors
    /// Propagates the upstream fetch error shared by the whole cluster.
    pub async fn request(&self, coordinate: Coordinate, forced: bool) -> Result<T, FetchError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(coordinate, forced, tx).await;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Unknown("coalesced fetch was dropped".into())),
        }
    }

    async fn enqueue(&self, coordinate: Coordinate, forced: bool, waiter: Waiter<T>) {
        let batch = {
            let mut state = self.state.lock().await;
            let tolerance = self.config.tolerance_deg;
            if let Some(entry) =
                state.entries.iter_mut().find(|e| e.centroid.is_near(&coordinate, tolerance))
            {
                tracing::debug!("Merged request for ({}) into a pending cluster", coordinate);
                entry.absorb(coordinate, forced, waiter);
                return;
            }

            state.entries.push(PendingEntry::new(coordinate, forced, waiter));
            if state.entries.len() >= self.config.max_batch {
                Some(state.take_batch())
            } else {
                if !state.window_armed {
                    state.window_armed = true;
                    let generation = state.generation;
                    let coalescer = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(coalescer.config.window).await;
                        coalescer.flush_generation(generation).await;
                    });
                }
                None
            }
        };

        // Dispatch outside the lock so new requests start a fresh batch
        // instead of racing this one.
        if let Some(batch) = batch {
            self.dispatch(batch);
        }
    }

    async fn flush_generation(&self, generation: u64) {
        let batch = {
            let mut state = self.state.lock().await;
            if state.generation != generation || state.entries.is_empty() {
                return;
            }
            state.take_batch()
        };
        self.dispatch(batch);
    }

    /// Partition a flushed batch into spatial clusters and issue exactly one
    /// upstream fetch per cluster.
    fn dispatch(&self, batch: Vec<PendingEntry<T>>) {
        let clusters = cluster_entries(batch, self.config.tolerance_deg);
        tracing::debug!("Dispatching {} coalesced cluster(s)", clusters.len());
        for group in clusters {
            let centroid = weighted_centroid(&group);
            let forced = group.iter().any(|e| e.forced);
            let waiters: Vec<Waiter<T>> = group.into_iter().flat_map(|e| e.waiters).collect();
            let fetch = Arc::clone(&self.fetch);
            tokio::spawn(async move {
                let result = fetch(centroid, forced).await;
                for waiter in waiters {
                    // A waiter may have gone away; the rest still resolve.
                    let _ = waiter.send(result.clone());
                }
            });
        }
    }
}

/// Greedy clustering: the first entry seeds a cluster that absorbs every
/// remaining entry within tolerance of the seed, then repeat on the rest.
fn cluster_entries<T>(mut entries: Vec<PendingEntry<T>>, tolerance: f64) -> Vec<Vec<PendingEntry<T>>> {
    let mut clusters = Vec::new();
    while !entries.is_empty() {
        let seed = entries.remove(0);
        let seed_centroid = seed.centroid;
        let mut group = vec![seed];
        let mut i = 0;
        while i < entries.len() {
            if entries[i].centroid.is_near(&seed_centroid, tolerance) {
                group.push(entries.remove(i));
            } else {
                i += 1;
            }
        }
        clusters.push(group);
    }
    clusters
}

fn weighted_centroid<T>(group: &[PendingEntry<T>]) -> Coordinate {
    let total: usize = group.iter().map(|e| e.count).sum();
    let n = total.max(1) as f64;
    let lat = group.iter().map(|e| e.centroid.latitude * e.count as f64).sum::<f64>() / n;
    let lon = group.iter().map(|e| e.centroid.longitude * e.count as f64).sum::<f64>() / n;
    Coordinate::new(lat, lon)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(window_ms: u64, max_batch: usize) -> CoalescerConfig {
        CoalescerConfig {
            tolerance_deg: 0.05,
            window: Duration::from_millis(window_ms),
            max_batch,
        }
    }

    /// Coalescer whose upstream echoes the centroid it was asked for and
    /// counts calls.
    fn echo_coalescer(
        config: CoalescerConfig,
        calls: Arc<AtomicUsize>,
    ) -> RequestCoalescer<Coordinate> {
        RequestCoalescer::new(config, move |centroid, _forced| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(centroid)
            }
        })
    }

    #[tokio::test]
    async fn test_nearby_requests_share_one_upstream_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coalescer = echo_coalescer(test_config(50, 10), Arc::clone(&calls));

        let (a, b, c) = tokio::join!(
            coalescer.request(Coordinate::new(0.0, 0.0), false),
            coalescer.request(Coordinate::new(0.01, 0.01), false),
            coalescer.request(Coordinate::new(5.0, 5.0), false),
        );

        // One cluster of two, one singleton.
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let merged = a.unwrap();
        assert_eq!(merged, b.unwrap());
        assert!(merged.is_near(&Coordinate::new(0.005, 0.005), 1e-9));
        assert!(c.unwrap().is_near(&Coordinate::new(5.0, 5.0), 1e-9));
    }

    #[tokio::test]
    async fn test_batch_size_triggers_immediate_flush() {
        let calls = Arc::new(AtomicUsize::new(0));
        // Window long enough that only the size trigger can flush in time.
        let coalescer = echo_coalescer(test_config(10_000, 2), Arc::clone(&calls));

        let (a, b) = tokio::join!(
            coalescer.request(Coordinate::new(0.0, 0.0), false),
            coalescer.request(Coordinate::new(5.0, 5.0), false),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_failure_fans_out_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let coalescer: RequestCoalescer<Coordinate> =
            RequestCoalescer::new(test_config(50, 10), move |_, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::ServerError { status: 503 })
                }
            });

        let (a, b) = tokio::join!(
            coalescer.request(Coordinate::new(0.0, 0.0), false),
            coalescer.request(Coordinate::new(0.02, 0.0), false),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap_err(), FetchError::ServerError { status: 503 });
        assert_eq!(b.unwrap_err(), FetchError::ServerError { status: 503 });
    }

    #[tokio::test]
    async fn test_requests_after_flush_start_fresh_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coalescer = echo_coalescer(test_config(20, 10), Arc::clone(&calls));

        coalescer.request(Coordinate::new(0.0, 0.0), false).await.unwrap();
        coalescer.request(Coordinate::new(0.0, 0.0), false).await.unwrap();

        // Same coordinate, but the windows never overlapped.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forced_flag_propagates_to_cluster() {
        let forced_seen = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&forced_seen);
        let coalescer: RequestCoalescer<()> =
            RequestCoalescer::new(test_config(50, 10), move |_, forced| {
                let flag = Arc::clone(&flag);
                async move {
                    if forced {
                        flag.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            });

        let (a, b) = tokio::join!(
            coalescer.request(Coordinate::new(0.0, 0.0), false),
            coalescer.request(Coordinate::new(0.01, 0.01), true),
        );
        a.unwrap();
        b.unwrap();

        // One merged cluster, marked forced because one member was.
        assert_eq!(forced_seen.load(Ordering::SeqCst), 1);
    }
}
