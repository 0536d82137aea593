//! Simulated location backend.
//!
//! Produces fixes for a receiver moving in a straight line from a start
//! position at constant speed and heading. Used by the daemon when no
//! platform location service is wired in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::backend::{
    AvailabilityListener, FetchResult, LocationBackend, SettingsStatus, WatchHandle, WatchSink,
};
use super::types::{AccuracyTier, LocationSample, UpdateParams, epoch_millis};

const METERS_PER_DEGREE: f64 = 111_320.0;

/// Motion model and initial device state.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f32,
    /// Ground speed in m/s. Zero keeps the receiver still.
    pub speed: f32,
    pub heading: f32,
    pub location_mode: bool,
    /// When false, the one-shot primitive has no known location.
    pub has_fix: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            accuracy: 5.0,
            speed: 0.0,
            heading: 0.0,
            location_mode: true,
            has_fix: true,
        }
    }
}

/// Straight-line track shared by every watch task.
#[derive(Debug, Clone)]
struct Track {
    config: SimConfig,
    origin: Instant,
}

impl Track {
    fn fix_at(&self, at: Instant, accuracy: f32) -> LocationSample {
        let elapsed = at.saturating_duration_since(self.origin).as_secs_f64();
        let distance = f64::from(self.config.speed) * elapsed;
        let heading = f64::from(self.config.heading).to_radians();
        let lat = self.config.latitude + distance * heading.cos() / METERS_PER_DEGREE;
        let lon_scale = METERS_PER_DEGREE * self.config.latitude.to_radians().cos().max(1e-6);
        let lon = self.config.longitude + distance * heading.sin() / lon_scale;

        // Offset the wall clock by how far `at` lies in the past.
        let lag = Instant::now().saturating_duration_since(at).as_millis() as u64;
        LocationSample {
            timestamp: epoch_millis().saturating_sub(lag),
            latitude: lat,
            longitude: wrap_longitude(lon),
            altitude: self.config.altitude,
            accuracy,
            heading: self.config.heading,
            velocity: self.config.speed,
        }
    }
}

/// Simulated backend. See the module docs.
#[derive(Debug)]
pub struct SimulatedBackend {
    track: Track,
    location_mode: Arc<AtomicBool>,
    listener: Arc<Mutex<Option<AvailabilityListener>>>,
    tasks: HashMap<WatchHandle, JoinHandle<()>>,
}

/// Control handle for toggling device state from outside the registry.
#[derive(Debug, Clone)]
pub struct SimControl {
    location_mode: Arc<AtomicBool>,
    listener: Arc<Mutex<Option<AvailabilityListener>>>,
}

impl SimControl {
    /// Flip the location-mode switch. Watches learn about it through an
    /// availability change.
    pub fn set_location_mode(&self, enabled: bool) {
        let previous = self.location_mode.swap(enabled, Ordering::SeqCst);
        if previous == enabled {
            return;
        }
        tracing::info!(enabled, "simulated location mode changed");
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener.notify(enabled);
        }
    }
}

impl SimulatedBackend {
    pub fn new(config: SimConfig) -> Self {
        let location_mode = Arc::new(AtomicBool::new(config.location_mode));
        Self {
            track: Track {
                config,
                origin: Instant::now(),
            },
            location_mode,
            listener: Arc::new(Mutex::new(None)),
            tasks: HashMap::new(),
        }
    }

    pub fn control(&self) -> SimControl {
        SimControl {
            location_mode: Arc::clone(&self.location_mode),
            listener: Arc::clone(&self.listener),
        }
    }

    /// Number of live watch tasks.
    #[cfg(test)]
    pub fn active_watches(&self) -> usize {
        self.tasks.len()
    }
}

impl LocationBackend for SimulatedBackend {
    fn location_mode_enabled(&self) -> bool {
        self.location_mode.load(Ordering::SeqCst)
    }

    fn check_settings(&mut self, tiers: &[AccuracyTier]) -> BoxFuture<'static, SettingsStatus> {
        let needs_gps = tiers.contains(&AccuracyTier::High);
        let status = if needs_gps && !self.location_mode_enabled() {
            SettingsStatus::ResolvableViaDialog
        } else {
            SettingsStatus::Satisfied
        };
        futures::future::ready(status).boxed()
    }

    fn last_location(&mut self) -> BoxFuture<'static, FetchResult> {
        let result = if self.track.config.has_fix {
            Ok(Some(self.track.fix_at(Instant::now(), self.track.config.accuracy)))
        } else {
            Ok(None)
        };
        futures::future::ready(result).boxed()
    }

    fn start_updates(
        &mut self,
        watch_id: &str,
        params: UpdateParams,
        sink: WatchSink,
    ) -> WatchHandle {
        let handle = WatchHandle::new();
        let track = self.track.clone();
        let accuracy = if params.min_displacement_m > 0.0 {
            // Balanced power: network-grade accuracy.
            self.track.config.accuracy * 4.0
        } else {
            self.track.config.accuracy
        };
        let task = tokio::spawn(run_watch(track, params, accuracy, sink));
        self.tasks.insert(handle, task);
        tracing::debug!(watch_id, ?handle, interval_ms = params.interval_ms, "sim watch started");
        handle
    }

    fn stop_updates(&mut self, handle: WatchHandle) {
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
            tracing::debug!(?handle, "sim watch stopped");
        }
    }

    fn set_availability_listener(&mut self, listener: AvailabilityListener) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// Delivery loop for one watch.
///
/// Wakes every `interval_ms`. When it wakes late, it emits one fix per
/// elapsed interval in a single batch, capped at `max_update_count`.
async fn run_watch(track: Track, params: UpdateParams, accuracy: f32, sink: WatchSink) {
    let interval = Duration::from_millis(params.interval_ms.max(1));
    let cap = params.max_update_count.map_or(usize::MAX, |n| n.max(1) as usize);
    let mut last_tick = Instant::now();
    let mut last_delivered: Option<LocationSample> = None;

    loop {
        tokio::time::sleep_until(last_tick + interval).await;
        let now = Instant::now();
        let due = (now.saturating_duration_since(last_tick).as_nanos() / interval.as_nanos())
            .max(1) as usize;
        last_tick += interval * due as u32;

        let batch: Vec<LocationSample> = (0..due.min(cap))
            .rev()
            .map(|back| track.fix_at(last_tick - interval * back as u32, accuracy))
            .filter(|fix| match &last_delivered {
                Some(prev) => distance_m(prev, fix) >= f64::from(params.min_displacement_m),
                None => true,
            })
            .collect();

        if let Some(newest) = batch.last() {
            last_delivered = Some(*newest);
        }
        if !sink.deliver_batch(&batch) {
            tracing::debug!(watch_id = sink.watch_id(), "watch receiver gone");
            return;
        }
    }
}

/// Equirectangular distance; adequate at watch-update scales.
fn distance_m(a: &LocationSample, b: &LocationSample) -> f64 {
    let mean_lat = ((a.latitude + b.latitude) / 2.0).to_radians();
    let dx = (b.longitude - a.longitude) * METERS_PER_DEGREE * mean_lat.cos();
    let dy = (b.latitude - a.latitude) * METERS_PER_DEGREE;
    (dx * dx + dy * dy).sqrt()
}

fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        return lon;
    }
    (lon + 180.0).rem_euclid(360.0) - 180.0
}
