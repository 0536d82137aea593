//! Geolocation core: watch registry, permission gate, backends.
//!
//! [`registry::WatchRegistry`] owns every watch subscription and pending
//! one-shot request. It talks to the platform through two seams:
//! [`backend::LocationBackend`] for fixes and settings, and
//! [`permission::PermissionGate`] for the location permission. Host
//! lifecycle hooks (pause, resume, settings dialog finished) are explicit
//! method calls on the registry.

pub mod backend;
pub mod permission;
pub mod registry;
pub mod sim;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
