//! Recording backend and gate for registry tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use super::backend::{
    AvailabilityListener, FetchResult, LocationBackend, SettingsStatus, WatchHandle, WatchSink,
};
use super::permission::PermissionGate;
use super::types::{AccuracyTier, LocationSample, UpdateParams};

pub fn sample(timestamp: u64) -> LocationSample {
    LocationSample {
        timestamp,
        latitude: 48.8566,
        longitude: 2.3522,
        altitude: 35.0,
        accuracy: 4.0,
        heading: 0.0,
        velocity: 0.0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CheckSettings,
    Fetch,
    Start {
        watch_id: String,
        params: UpdateParams,
        handle: WatchHandle,
    },
    Stop(WatchHandle),
}

#[derive(Debug)]
struct BackendInner {
    location_mode: bool,
    settings: SettingsStatus,
    calls: Vec<Call>,
    fetches: VecDeque<oneshot::Sender<FetchResult>>,
    active: HashMap<WatchHandle, (String, UpdateParams, WatchSink)>,
    listener: Option<AvailabilityListener>,
}

/// Backend that records every call. Fetches stay pending until
/// [`MockBackend::complete_fetch`].
#[derive(Debug, Clone)]
pub struct MockBackend {
    inner: Arc<Mutex<BackendInner>>,
}

impl MockBackend {
    pub fn new(location_mode: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BackendInner {
                location_mode,
                settings: SettingsStatus::Satisfied,
                calls: Vec::new(),
                fetches: VecDeque::new(),
                active: HashMap::new(),
                listener: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendInner> {
        self.inner.lock().unwrap()
    }

    pub fn set_location_mode(&self, enabled: bool) {
        self.lock().location_mode = enabled;
    }

    pub fn set_settings(&self, status: SettingsStatus) {
        self.lock().settings = status;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Fetch))
            .count()
    }

    pub fn start_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Start { .. }))
            .count()
    }

    pub fn stop_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Stop(_)))
            .count()
    }

    /// Currently registered watches, sorted by id.
    pub fn active(&self) -> Vec<(String, UpdateParams)> {
        let mut active: Vec<_> = self
            .lock()
            .active
            .values()
            .map(|(id, params, _)| (id.clone(), *params))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    pub fn sink_for(&self, watch_id: &str) -> Option<WatchSink> {
        self.lock()
            .active
            .values()
            .find(|(id, _, _)| id == watch_id)
            .map(|(_, _, sink)| sink.clone())
    }

    /// Complete the oldest outstanding fetch.
    pub fn complete_fetch(&self, result: FetchResult) -> bool {
        match self.lock().fetches.pop_front() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn report_availability(&self, available: bool) {
        if let Some(listener) = self.lock().listener.clone() {
            listener.notify(available);
        }
    }
}

impl LocationBackend for MockBackend {
    fn location_mode_enabled(&self) -> bool {
        self.lock().location_mode
    }

    fn check_settings(&mut self, tiers: &[AccuracyTier]) -> BoxFuture<'static, SettingsStatus> {
        assert!(tiers.contains(&AccuracyTier::High));
        assert!(tiers.contains(&AccuracyTier::Balanced));
        let mut inner = self.lock();
        inner.calls.push(Call::CheckSettings);
        futures::future::ready(inner.settings).boxed()
    }

    fn last_location(&mut self) -> BoxFuture<'static, FetchResult> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        inner.calls.push(Call::Fetch);
        inner.fetches.push_back(tx);
        rx.map(|r| r.unwrap_or(Ok(None))).boxed()
    }

    fn start_updates(
        &mut self,
        watch_id: &str,
        params: UpdateParams,
        sink: WatchSink,
    ) -> WatchHandle {
        let handle = WatchHandle::new();
        let mut inner = self.lock();
        inner.calls.push(Call::Start {
            watch_id: watch_id.to_string(),
            params,
            handle,
        });
        inner
            .active
            .insert(handle, (watch_id.to_string(), params, sink));
        handle
    }

    fn stop_updates(&mut self, handle: WatchHandle) {
        let mut inner = self.lock();
        inner.calls.push(Call::Stop(handle));
        inner.active.remove(&handle);
    }

    fn set_availability_listener(&mut self, listener: AvailabilityListener) {
        self.lock().listener = Some(listener);
    }
}

#[derive(Debug)]
struct GateInner {
    granted: bool,
    requests: usize,
    waiters: Vec<oneshot::Sender<bool>>,
}

/// Gate whose prompts are answered by the test.
#[derive(Debug, Clone)]
pub struct MockGate {
    inner: Arc<Mutex<GateInner>>,
}

impl MockGate {
    pub fn new(granted: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                granted,
                requests: 0,
                waiters: Vec::new(),
            })),
        }
    }

    pub fn set_granted(&self, granted: bool) {
        self.inner.lock().unwrap().granted = granted;
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().unwrap().requests
    }

    /// Answer every outstanding prompt.
    pub fn answer(&self, granted: bool) {
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.granted = granted;
            std::mem::take(&mut inner.waiters)
        };
        for w in waiters {
            let _ = w.send(granted);
        }
    }
}

impl PermissionGate for MockGate {
    fn has_permission(&self) -> bool {
        self.inner.lock().unwrap().granted
    }

    fn request_permission(&mut self) -> BoxFuture<'static, bool> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.requests += 1;
        inner.waiters.push(tx);
        rx.map(|r| r.unwrap_or(false)).boxed()
    }
}
