//! Location permission gate.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use super::registry::HostRequest;

/// Tracks and requests the location permission.
pub trait PermissionGate: Send {
    /// Current grant state. Checked before every hardware registration
    /// because the permission can be revoked outside the app.
    fn has_permission(&self) -> bool;

    /// Prompt the user. Resolves with `true` when granted.
    fn request_permission(&mut self) -> BoxFuture<'static, bool>;
}

/// Initial permission state of a [`HostPermissionGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PermissionMode {
    /// Already granted.
    Granted,
    /// Denied; prompts are refused without asking the host.
    Denied,
    /// Not yet granted; prompts are forwarded to the host.
    Prompt,
}

#[derive(Debug)]
struct GateInner {
    granted: bool,
    auto_deny: bool,
    waiters: Vec<oneshot::Sender<bool>>,
}

/// Permission gate answered by the host runtime over the bridge.
///
/// Prompts go out as [`HostRequest::ShowPermissionPrompt`]; the host's
/// answer comes back through [`HostPermissionGate::resolve`]. Clones share
/// state, so the bridge keeps one clone and the registry owns another.
#[derive(Debug, Clone)]
pub struct HostPermissionGate {
    inner: Arc<Mutex<GateInner>>,
    host_tx: mpsc::UnboundedSender<HostRequest>,
}

impl HostPermissionGate {
    pub fn new(mode: PermissionMode, host_tx: mpsc::UnboundedSender<HostRequest>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                granted: mode == PermissionMode::Granted,
                auto_deny: mode == PermissionMode::Denied,
                waiters: Vec::new(),
            })),
            host_tx,
        }
    }

    /// Record the user's answer and wake every outstanding prompt.
    pub fn resolve(&self, granted: bool) {
        let waiters = {
            let mut inner = self.lock();
            inner.granted = granted;
            inner.auto_deny = false;
            std::mem::take(&mut inner.waiters)
        };
        tracing::info!(granted, waiters = waiters.len(), "permission answered");
        for waiter in waiters {
            let _ = waiter.send(granted);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PermissionGate for HostPermissionGate {
    fn has_permission(&self) -> bool {
        self.lock().granted
    }

    fn request_permission(&mut self) -> BoxFuture<'static, bool> {
        let mut inner = self.lock();
        if inner.granted {
            return futures::future::ready(true).boxed();
        }
        if inner.auto_deny {
            return futures::future::ready(false).boxed();
        }

        let (tx, rx) = oneshot::channel();
        let first = inner.waiters.is_empty();
        inner.waiters.push(tx);
        drop(inner);

        // One prompt on screen at a time.
        if first && self.host_tx.send(HostRequest::ShowPermissionPrompt).is_err() {
            tracing::warn!("no host to prompt for permission");
        }
        rx.map(|answer| answer.unwrap_or(false)).boxed()
    }
}
