//! Fetch orchestration: the single entry point for "give me weather here".
//!
//! Balances freshness against politeness to the upstream API: a request is
//! only promoted to a network fetch after passing the debounce check and the
//! in-flight dedup table, and even then it goes through the coalescer so
//! nearby concurrent requests share one upstream call. Results are published
//! through a watch channel; callers observe rather than await.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cache::SnapshotCache;
use crate::coalesce::{CoalescerConfig, RequestCoalescer};
use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::provider::WeatherProvider;
use crate::retry::with_retry;
use crate::types::{AirQuality, CacheRecord, Coordinate, WeatherAlert, WeatherSnapshot};

/// Where the orchestrator currently is, from an observer's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FetchPhase {
    /// No fetch running; the published snapshot (if any) is the best known.
    #[default]
    Idle,
    /// A fetch is in progress.
    Loading,
    /// No usable data anywhere; carries a recovery suggestion.
    Error(String),
}

/// The observable state: current best snapshot, phase, and a non-fatal
/// warning when a refresh failed but cached data still covers the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservedState {
    pub snapshot: Option<WeatherSnapshot>,
    pub phase: FetchPhase,
    pub warning: Option<String>,
}

struct InFlight {
    id: u64,
    coordinate: Coordinate,
    done_rx: watch::Receiver<bool>,
}

/// Top-level fetch orchestrator. One instance per process; cheap to share
/// behind an [`Arc`].
pub struct FetchOrchestrator {
    cache: SnapshotCache,
    config: FetchConfig,
    state_tx: watch::Sender<ObservedState>,
    /// Debounce clock; reset on every successful primary fetch.
    last_success: Mutex<Option<Instant>>,
    in_flight: Mutex<Vec<InFlight>>,
    next_flight_id: AtomicU64,
    /// False until the first request has consulted the disk cache.
    primed: AtomicBool,
    primary: RequestCoalescer<WeatherSnapshot>,
    air_quality: RequestCoalescer<AirQuality>,
    alerts: RequestCoalescer<Vec<WeatherAlert>>,
}

impl FetchOrchestrator {
    /// Wire up an orchestrator from its injected collaborators.
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        cache: SnapshotCache,
        config: FetchConfig,
    ) -> Arc<Self> {
        let point_config = CoalescerConfig {
            tolerance_deg: config.coalesce_tolerance_deg,
            window: config.coalesce_window,
            max_batch: config.max_batch_size,
        };
        let alert_config =
            CoalescerConfig { tolerance_deg: config.alert_tolerance_deg, ..point_config.clone() };

        let retry = config.retry.clone();
        let primary_provider = Arc::clone(&provider);
        let primary = RequestCoalescer::new(point_config.clone(), move |centroid, forced| {
            let provider = Arc::clone(&primary_provider);
            let retry = retry.clone();
            async move { with_retry(&retry, || provider.fetch_primary(centroid, forced)).await }
        });

        let air_provider = Arc::clone(&provider);
        let air_quality = RequestCoalescer::new(point_config, move |centroid, forced| {
            let provider = Arc::clone(&air_provider);
            async move { provider.fetch_air_quality(centroid, forced).await }
        });

        let alerts = RequestCoalescer::new(alert_config, move |centroid, forced| {
            let provider = Arc::clone(&provider);
            async move { provider.fetch_alerts(centroid, forced).await }
        });

        let (state_tx, _) = watch::channel(ObservedState::default());
        Arc::new(Self {
            cache,
            config,
            state_tx,
            last_success: Mutex::new(None),
            in_flight: Mutex::new(Vec::new()),
            next_flight_id: AtomicU64::new(0),
            primed: AtomicBool::new(false),
            primary,
            air_quality,
            alerts,
        })
    }

    /// Request weather for `coordinate`. Fire-and-observe: results arrive
    /// through [`FetchOrchestrator::subscribe`], not a return value.
    ///
    /// The first request ever also loads the disk cache synchronously and
    /// publishes it for instant display, then refreshes unconditionally.
    /// Forced requests bypass the debounce interval, the in-flight
    /// short-circuit, and any HTTP-level cache.
    pub fn request(self: &Arc<Self>, coordinate: Coordinate, label: Option<String>, forced: bool) {
        let cold_start = !self.primed.swap(true, Ordering::SeqCst);
        if cold_start {
            if let Some(record) = self.cache.load() {
                tracing::info!("Publishing cached snapshot for instant load");
                self.state_tx.send_modify(|state| {
                    state.snapshot = Some(record.snapshot);
                    state.phase = FetchPhase::Idle;
                });
            }
        }

        if !forced && !cold_start {
            let last = *self.last_success.lock();
            if let Some(at) = last {
                if at.elapsed() < self.config.minimum_fetch_interval {
                    tracing::debug!("Debounced request for ({})", coordinate);
                    return;
                }
            }
        }

        if let Some(active) = self.find_in_flight(coordinate) {
            if !forced {
                tracing::debug!(
                    "Dropping request for ({}); an equivalent fetch is in flight",
                    coordinate
                );
                return;
            }
            // A forced refresh never cancels the active fetch and never
            // races it: wait for it to resolve, then run our own.
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                let mut done_rx = active;
                while !*done_rx.borrow() {
                    if done_rx.changed().await.is_err() {
                        break;
                    }
                }
                orchestrator.run_fetch(coordinate, label, true).await;
            });
            return;
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_fetch(coordinate, label, forced).await;
        });
    }

    /// Whatever is currently known: the latest fetch, or the cached
    /// snapshot published at cold start.
    pub fn current_snapshot(&self) -> Option<WeatherSnapshot> {
        self.state_tx.borrow().snapshot.clone()
    }

    /// Subscribe to snapshot / loading / error updates.
    pub fn subscribe(&self) -> watch::Receiver<ObservedState> {
        self.state_tx.subscribe()
    }

    fn find_in_flight(&self, coordinate: Coordinate) -> Option<watch::Receiver<bool>> {
        let table = self.in_flight.lock();
        table
            .iter()
            .find(|flight| {
                flight.coordinate.is_near(&coordinate, self.config.in_flight_tolerance_deg)
            })
            .map(|flight| flight.done_rx.clone())
    }

    async fn run_fetch(&self, coordinate: Coordinate, label: Option<String>, forced: bool) {
        let (done_tx, done_rx) = watch::channel(false);
        let flight_id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().push(InFlight { id: flight_id, coordinate, done_rx });
        self.state_tx.send_modify(|state| state.phase = FetchPhase::Loading);

        // Primary is retried; air quality and alerts are best-effort and
        // must never delay or fail the primary result's publication.
        let (primary, air_quality, alerts) = tokio::join!(
            self.primary.request(coordinate, forced),
            self.air_quality.request(coordinate, forced),
            self.alerts.request(coordinate, forced),
        );

        match primary {
            Ok(snapshot) => self.publish_success(snapshot, label, air_quality, alerts).await,
            Err(error) => self.publish_failure(coordinate, error),
        }

        self.in_flight.lock().retain(|flight| flight.id != flight_id);
        let _ = done_tx.send(true);
    }

    async fn publish_success(
        &self,
        mut snapshot: WeatherSnapshot,
        label: Option<String>,
        air_quality: Result<AirQuality, FetchError>,
        alerts: Result<Vec<WeatherAlert>, FetchError>,
    ) {
        match air_quality {
            Ok(reading) => snapshot.air_quality = Some(reading),
            Err(error) => {
                tracing::warn!("Air quality fetch failed (best-effort): {}", error);
                // Carry the previous reading forward rather than dropping it.
                let previous = self
                    .state_tx
                    .borrow()
                    .snapshot
                    .as_ref()
                    .and_then(|s| s.air_quality.clone());
                snapshot.air_quality = previous;
            }
        }
        match alerts {
            Ok(list) => snapshot.alerts = list,
            Err(error) => tracing::warn!("Alerts fetch failed (best-effort): {}", error),
        }

        *self.last_success.lock() = Some(Instant::now());
        self.state_tx.send_modify(|state| {
            state.snapshot = Some(snapshot.clone());
            state.phase = FetchPhase::Idle;
            state.warning = None;
        });

        let record = CacheRecord { snapshot, location_label: label };
        if let Err(error) = self.cache.save(&record).await {
            tracing::warn!("Failed to persist snapshot: {:#}", error);
        }
    }

    /// Network path exhausted. Fall back to cached data before surfacing
    /// anything; only a true cold start with no cache becomes an error.
    fn publish_failure(&self, coordinate: Coordinate, error: FetchError) {
        let in_memory = self.state_tx.borrow().snapshot.is_some();
        let from_disk =
            if in_memory { None } else { self.cache.load().map(|record| record.snapshot) };

        if in_memory || from_disk.is_some() {
            tracing::warn!("Fetch for ({}) failed; showing cached data: {}", coordinate, error);
            self.state_tx.send_modify(|state| {
                if let Some(snapshot) = from_disk {
                    state.snapshot = Some(snapshot);
                }
                state.phase = FetchPhase::Idle;
                state.warning =
                    Some(format!("Showing cached data. {}", error.recovery_suggestion()));
            });
        } else {
            tracing::error!(
                "Fetch for ({}) failed with no cached fallback: {}",
                coordinate,
                error
            );
            self.state_tx.send_modify(|state| {
                state.phase = FetchPhase::Error(error.recovery_suggestion().to_string());
                state.warning = None;
            });
        }
    }
}
