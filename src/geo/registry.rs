//! Watch registry: subscriptions, pending one-shot requests, lifecycle.
//!
//! The registry is owned by a single driver loop. Every mutation happens
//! through `&mut self`; async work started here (permission prompt,
//! settings check, one-shot fetch) runs on spawned tasks and its result
//! comes back as a [`RegistryEvent`] that the driver feeds into
//! [`WatchRegistry::handle_event`]. Nothing assumes a continuation fires
//! inside the call that started it.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use super::backend::{
    AvailabilityListener, FetchResult, LocationBackend, SettingsStatus, WatchEvent, WatchHandle,
    WatchSink,
};
use super::permission::PermissionGate;
use super::types::{AccuracyTier, LocationError, LocationSample, UpdateParams};

/// Profiles checked together at startup. Both are requested because the
/// tiers of watches added later are not known yet.
const SETTINGS_PROFILES: [AccuracyTier; 2] = [AccuracyTier::High, AccuracyTier::Balanced];

/// Default bound on a one-shot fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Continuation of async work, delivered back to the registry.
#[derive(Debug)]
pub enum RegistryEvent {
    PermissionAnswered { granted: bool },
    SettingsChecked(SettingsStatus),
    FetchCompleted(Result<LocationSample, LocationError>),
    AvailabilityChanged { available: bool },
}

/// Something only the host runtime can do on the registry's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRequest {
    ShowPermissionPrompt,
    /// Show the location-settings dialog, then call
    /// [`WatchRegistry::on_settings_resolved`].
    ResolveSettings,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bound on a one-shot fetch. `None` waits forever.
    pub fetch_timeout: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
        }
    }
}

/// Registration state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Stored, waiting for permission (or for resume).
    Stored,
    Registered(WatchHandle),
    /// Torn down by a pause; restored on resume.
    Deregistered,
}

#[derive(Debug)]
struct WatchSubscription {
    tier: AccuracyTier,
    params: UpdateParams,
    sink: WatchSink,
    state: SubscriptionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermissionState {
    Unknown,
    Requesting,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingsState {
    Unchecked,
    Checking,
    AwaitingResolution,
    Ready,
}

/// Result handle for a one-shot request.
#[derive(Debug)]
pub struct LocationTicket {
    rx: oneshot::Receiver<Result<LocationSample, LocationError>>,
}

impl LocationTicket {
    fn resolved(result: Result<LocationSample, LocationError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Wait for the next fetch. A registry dropped before answering
    /// reports `PositionUnavailable`.
    pub async fn wait(self) -> Result<LocationSample, LocationError> {
        self.rx
            .await
            .unwrap_or(Err(LocationError::PositionUnavailable))
    }
}

/// Stream of fixes and non-fatal errors for one watch. Ends when the
/// watch is cleared or replaced.
#[derive(Debug)]
pub struct WatchStream {
    id: String,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// The registry. See the module docs for the driving model.
pub struct WatchRegistry<B: LocationBackend, P: PermissionGate> {
    backend: B,
    gate: P,
    config: RegistryConfig,
    watches: BTreeMap<String, WatchSubscription>,
    pending: Vec<oneshot::Sender<Result<LocationSample, LocationError>>>,
    permission: PermissionState,
    settings: SettingsState,
    paused: bool,
    fetch_in_flight: bool,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
    host_tx: mpsc::UnboundedSender<HostRequest>,
}

impl<B: LocationBackend, P: PermissionGate> WatchRegistry<B, P> {
    /// Create a registry and the receiver its driver must drain into
    /// [`WatchRegistry::handle_event`].
    pub fn new(
        mut backend: B,
        gate: P,
        config: RegistryConfig,
        host_tx: mpsc::UnboundedSender<HostRequest>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        backend.set_availability_listener(AvailabilityListener::new(events_tx.clone()));
        let registry = Self {
            backend,
            gate,
            config,
            watches: BTreeMap::new(),
            pending: Vec::new(),
            permission: PermissionState::Unknown,
            settings: SettingsState::Unchecked,
            paused: false,
            fetch_in_flight: false,
            events_tx,
            host_tx,
        };
        (registry, events_rx)
    }

    /// Startup: check settings if permission is already granted,
    /// otherwise prompt for it.
    pub fn initialize(&mut self) {
        if self.gate.has_permission() {
            tracing::debug!("permission present at startup");
            self.permission = PermissionState::Granted;
            self.check_settings();
        } else {
            tracing::debug!("permission missing at startup");
            self.request_permission();
        }
    }

    /// Prompt for permission. No-op while a prompt is outstanding.
    pub fn request_permission(&mut self) {
        if self.gate.has_permission() {
            if self.permission != PermissionState::Granted {
                self.on_permission_granted();
            }
            return;
        }
        if self.permission == PermissionState::Requesting {
            return;
        }
        self.permission = PermissionState::Requesting;

        let answer = self.gate.request_permission();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let granted = answer.await;
            let _ = events.send(RegistryEvent::PermissionAnswered { granted });
        });
    }

    /// Register a watch and return its event stream.
    ///
    /// An existing watch with the same id is deregistered and replaced;
    /// its stream ends.
    pub fn add_watch(
        &mut self,
        id: &str,
        enable_high_accuracy: bool,
    ) -> Result<WatchStream, LocationError> {
        let tier = AccuracyTier::from_high_accuracy(enable_high_accuracy);
        if tier == AccuracyTier::High && !self.backend.location_mode_enabled() {
            tracing::debug!(watch_id = id, "high accuracy watch refused, location mode off");
            return Err(LocationError::PositionUnavailable);
        }

        if let Some(previous) = self.watches.remove(id) {
            tracing::warn!(watch_id = id, "duplicate watch id, replacing");
            if let SubscriptionState::Registered(handle) = previous.state {
                self.backend.stop_updates(handle);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.watches.insert(
            id.to_string(),
            WatchSubscription {
                tier,
                params: tier.update_params(),
                sink: WatchSink::new(id.to_string(), tx),
                state: SubscriptionState::Stored,
            },
        );
        tracing::info!(watch_id = id, ?tier, "watch added");

        if self.permission == PermissionState::Unknown && !self.gate.has_permission() {
            self.request_permission();
        }
        self.register(id);

        Ok(WatchStream {
            id: id.to_string(),
            rx,
        })
    }

    /// Remove a watch. Idempotent; returns whether the id existed.
    pub fn clear_watch(&mut self, id: &str) -> bool {
        let Some(sub) = self.watches.remove(id) else {
            tracing::debug!(watch_id = id, "clear of unknown watch");
            return false;
        };
        if let SubscriptionState::Registered(handle) = sub.state {
            self.backend.stop_updates(handle);
        }
        tracing::info!(watch_id = id, "watch cleared");
        true
    }

    /// One-shot location request answered by the next fetch.
    ///
    /// `max_age_ms` is accepted for caller compatibility; every request
    /// is answered by a fresh fetch.
    pub fn get_location(&mut self, enable_high_accuracy: bool, max_age_ms: u64) -> LocationTicket {
        if enable_high_accuracy && !self.backend.location_mode_enabled() {
            tracing::debug!("high accuracy request refused, location mode off");
            return LocationTicket::resolved(Err(LocationError::PositionUnavailable));
        }
        let permitted = self.gate.has_permission();
        if !permitted && self.permission == PermissionState::Granted {
            tracing::warn!("location permission revoked");
            self.permission = PermissionState::Denied;
        }
        if !permitted && self.permission == PermissionState::Denied {
            return LocationTicket::resolved(Err(LocationError::PermissionDenied));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.push(tx);
        tracing::debug!(
            pending = self.pending.len(),
            max_age_ms,
            "location request queued"
        );

        if permitted {
            self.start_fetch();
        } else if self.permission == PermissionState::Unknown {
            self.request_permission();
        }
        LocationTicket { rx }
    }

    /// Tear down every backend registration. Subscriptions are kept.
    pub fn on_pause(&mut self) {
        self.paused = true;
        let mut stopped = 0usize;
        for sub in self.watches.values_mut() {
            if let SubscriptionState::Registered(handle) = sub.state {
                self.backend.stop_updates(handle);
                sub.state = SubscriptionState::Deregistered;
                stopped += 1;
            }
        }
        tracing::info!(stopped, "paused");
    }

    /// Restore the registrations torn down by [`Self::on_pause`], plus any
    /// watch stored while paused.
    pub fn on_resume(&mut self) {
        self.paused = false;
        self.register_all();
        tracing::info!(watches = self.watches.len(), "resumed");
    }

    /// The host finished the settings dialog (or gave up on it).
    pub fn on_settings_resolved(&mut self) {
        tracing::info!("settings resolved");
        self.settings = SettingsState::Ready;
        self.start_pending();
    }

    /// Feed back a continuation from the driver loop.
    pub fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::PermissionAnswered { granted: true } => self.on_permission_granted(),
            RegistryEvent::PermissionAnswered { granted: false } => self.on_permission_denied(),
            RegistryEvent::SettingsChecked(status) => self.on_settings_checked(status),
            RegistryEvent::FetchCompleted(result) => self.on_fetch_completed(result),
            RegistryEvent::AvailabilityChanged { available } => {
                self.on_availability_changed(available)
            }
        }
    }

    /// A backend reported availability. Loss is a non-fatal error on
    /// every registered watch.
    pub fn on_availability_changed(&mut self, available: bool) {
        tracing::debug!(available, "location availability changed");
        if available {
            return;
        }
        for sub in self.watches.values() {
            if matches!(sub.state, SubscriptionState::Registered(_)) {
                sub.sink.unavailable();
            }
        }
    }

    // -- Inspection --

    pub fn watch_ids(&self) -> impl Iterator<Item = &str> {
        self.watches.keys().map(String::as_str)
    }

    #[cfg(test)]
    pub fn contains_watch(&self, id: &str) -> bool {
        self.watches.contains_key(id)
    }

    #[cfg(test)]
    pub fn subscription_state(&self, id: &str) -> Option<SubscriptionState> {
        self.watches.get(id).map(|s| s.state)
    }

    #[cfg(test)]
    pub fn subscription_params(&self, id: &str) -> Option<(AccuracyTier, UpdateParams)> {
        self.watches.get(id).map(|s| (s.tier, s.params))
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // -- Internals --

    fn on_permission_granted(&mut self) {
        tracing::info!("location permission granted");
        self.permission = PermissionState::Granted;
        self.check_settings();
    }

    fn on_permission_denied(&mut self) {
        tracing::warn!(
            pending = self.pending.len(),
            watches = self.watches.len(),
            "location permission denied"
        );
        self.permission = PermissionState::Denied;
        self.broadcast(Err(LocationError::PermissionDenied));
        for sub in self.watches.values() {
            sub.sink.fail(LocationError::PermissionDenied);
        }
    }

    fn check_settings(&mut self) {
        if matches!(
            self.settings,
            SettingsState::Checking | SettingsState::AwaitingResolution
        ) {
            return;
        }
        self.settings = SettingsState::Checking;

        let check = self.backend.check_settings(&SETTINGS_PROFILES);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let status = check.await;
            let _ = events.send(RegistryEvent::SettingsChecked(status));
        });
    }

    fn on_settings_checked(&mut self, status: SettingsStatus) {
        tracing::debug!(?status, "settings checked");
        match status {
            SettingsStatus::Satisfied | SettingsStatus::Unresolvable => {
                self.settings = SettingsState::Ready;
                self.start_pending();
            }
            SettingsStatus::ResolvableViaDialog => {
                if self.host_tx.send(HostRequest::ResolveSettings).is_ok() {
                    self.settings = SettingsState::AwaitingResolution;
                } else {
                    // Nobody can show the dialog: proceed as if satisfied.
                    tracing::warn!("settings dialog unavailable, continuing");
                    self.settings = SettingsState::Ready;
                    self.start_pending();
                }
            }
        }
    }

    /// Register every stored watch and flush pending one-shots.
    ///
    /// Pending one-shots keep waiting while permission is absent.
    fn start_pending(&mut self) {
        self.register_all();
        if !self.pending.is_empty() && self.gate.has_permission() {
            self.start_fetch();
        }
    }

    fn register_all(&mut self) {
        let ids: Vec<String> = self.watches.keys().cloned().collect();
        for id in ids {
            self.register(&id);
        }
    }

    /// Register one watch with the backend if it is not already.
    fn register(&mut self, id: &str) {
        if self.paused {
            return;
        }
        let permitted = self.gate.has_permission();
        if permitted {
            self.permission = PermissionState::Granted;
        } else if self.permission == PermissionState::Granted {
            tracing::warn!("location permission revoked");
            self.permission = PermissionState::Denied;
        }

        let Some(sub) = self.watches.get_mut(id) else {
            return;
        };
        if matches!(sub.state, SubscriptionState::Registered(_)) {
            return;
        }
        if !permitted {
            if self.permission == PermissionState::Denied {
                sub.sink.fail(LocationError::PermissionDenied);
            }
            return;
        }

        let handle = self.backend.start_updates(id, sub.params, sub.sink.clone());
        sub.state = SubscriptionState::Registered(handle);
        tracing::debug!(watch_id = id, ?handle, "watch registered");
    }

    fn start_fetch(&mut self) {
        if self.fetch_in_flight {
            return;
        }
        self.fetch_in_flight = true;

        let fetch = self.backend.last_location();
        let timeout = self.config.fetch_timeout;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, fetch).await {
                    Ok(result) => fetch_outcome(result),
                    Err(_) => Err(LocationError::Timeout),
                },
                None => fetch_outcome(fetch.await),
            };
            let _ = events.send(RegistryEvent::FetchCompleted(result));
        });
    }

    fn on_fetch_completed(&mut self, result: Result<LocationSample, LocationError>) {
        self.fetch_in_flight = false;
        match &result {
            Ok(_) => tracing::debug!(waiters = self.pending.len(), "got last location"),
            Err(e) => tracing::warn!(error = %e, waiters = self.pending.len(), "location fetch failed"),
        }
        self.broadcast(result);
    }

    /// Answer every pending request with the same result.
    fn broadcast(&mut self, result: Result<LocationSample, LocationError>) {
        for waiter in self.pending.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

impl<B: LocationBackend, P: PermissionGate> Drop for WatchRegistry<B, P> {
    fn drop(&mut self) {
        for sub in self.watches.values() {
            if let SubscriptionState::Registered(handle) = sub.state {
                self.backend.stop_updates(handle);
            }
        }
    }
}

fn fetch_outcome(result: FetchResult) -> Result<LocationSample, LocationError> {
    match result {
        Ok(Some(sample)) => Ok(sample),
        Ok(None) => Err(LocationError::PositionUnavailable),
        Err(e) => Err(LocationError::Backend(e.0)),
    }
}
