//! Platform location backend seam.
//!
//! A backend wraps whatever produces fixes on the host (a fused-location
//! SDK, a GNSS daemon, the simulator in [`super::sim`]). The registry
//! drives it through [`LocationBackend`]: registration calls are
//! fire-and-forget, the settings check and the one-shot fetch return
//! futures whose results re-enter the registry as events.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::registry::RegistryEvent;
use super::types::{AccuracyTier, LocationError, LocationSample, UpdateParams};

/// Outcome of checking device location settings against the requested
/// accuracy profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsStatus {
    Satisfied,
    /// The host can show a dialog that fixes the settings. The registry
    /// waits for `on_settings_resolved` before replaying subscriptions.
    ResolvableViaDialog,
    /// Not fixable by the user. Treated as satisfied.
    Unresolvable,
}

/// Backend failure with a platform message passed to callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// Result of the most-recent-location primitive.
pub type FetchResult = Result<Option<LocationSample>, BackendError>;

/// Opaque handle for one backend registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(u64);

impl WatchHandle {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An item on a watch stream. Errors are non-fatal: the watch stays
/// registered until cleared.
pub type WatchEvent = Result<LocationSample, LocationError>;

/// Delivery endpoint handed to the backend for one watch.
#[derive(Debug, Clone)]
pub struct WatchSink {
    watch_id: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl WatchSink {
    pub(crate) fn new(watch_id: String, tx: mpsc::UnboundedSender<WatchEvent>) -> Self {
        Self { watch_id, tx }
    }

    pub fn watch_id(&self) -> &str {
        &self.watch_id
    }

    /// Deliver a batch of fixes. Only the newest one reaches the caller;
    /// an empty batch is ignored.
    ///
    /// Returns `false` once the caller has dropped the stream.
    pub fn deliver_batch(&self, batch: &[LocationSample]) -> bool {
        match batch.last() {
            Some(sample) => self.deliver(*sample),
            None => !self.is_closed(),
        }
    }

    pub fn deliver(&self, sample: LocationSample) -> bool {
        self.tx.send(Ok(sample)).is_ok()
    }

    /// Report that location is temporarily unavailable.
    pub fn unavailable(&self) -> bool {
        self.fail(LocationError::PositionUnavailable)
    }

    pub fn fail(&self, error: LocationError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Channel through which a backend reports location availability changes.
#[derive(Debug, Clone)]
pub struct AvailabilityListener {
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl AvailabilityListener {
    pub(crate) fn new(events: mpsc::UnboundedSender<RegistryEvent>) -> Self {
        Self { events }
    }

    pub fn notify(&self, available: bool) {
        if self
            .events
            .send(RegistryEvent::AvailabilityChanged { available })
            .is_err()
        {
            tracing::debug!(available, "availability change dropped, registry gone");
        }
    }
}

/// Platform location backend.
pub trait LocationBackend: Send {
    /// Whether the high-accuracy provider (GPS) is switched on.
    fn location_mode_enabled(&self) -> bool;

    /// Check device settings against the merged set of `tiers`.
    fn check_settings(&mut self, tiers: &[AccuracyTier]) -> BoxFuture<'static, SettingsStatus>;

    /// Fetch the most recent known location. Never starts periodic
    /// updates.
    fn last_location(&mut self) -> BoxFuture<'static, FetchResult>;

    /// Start continuous delivery into `sink`.
    fn start_updates(&mut self, watch_id: &str, params: UpdateParams, sink: WatchSink)
    -> WatchHandle;

    /// Stop a registration. Unknown handles are ignored.
    fn stop_updates(&mut self, handle: WatchHandle);

    /// Install the listener for availability changes. Called once by the
    /// registry at construction.
    fn set_availability_listener(&mut self, listener: AvailabilityListener);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64) -> LocationSample {
        LocationSample {
            timestamp: ts,
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            accuracy: 1.0,
            heading: 0.0,
            velocity: 0.0,
        }
    }

    #[test]
    fn batch_forwards_newest_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = WatchSink::new("w".into(), tx);
        assert!(sink.deliver_batch(&[sample(1), sample(2), sample(3)]));
        assert_eq!(rx.try_recv().unwrap().unwrap().timestamp, 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn empty_batch_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = WatchSink::new("w".into(), tx);
        assert!(sink.deliver_batch(&[]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unavailable_is_position_unavailable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = WatchSink::new("w".into(), tx);
        sink.unavailable();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LocationError::PositionUnavailable)
        );
    }

    #[test]
    fn closed_sink_reports_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = WatchSink::new("w".into(), tx);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.deliver(sample(1)));
    }

    #[test]
    fn handles_are_unique() {
        assert_ne!(WatchHandle::new(), WatchHandle::new());
    }
}
