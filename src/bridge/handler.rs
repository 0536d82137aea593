//! Message dispatch and request handling.
//!
//! Each handler mutates [`BridgeState`] and answers on the requesting
//! connection's outbound channel. `get_location` answers later, from a
//! task waiting on the registry ticket; watch streams are forwarded the
//! same way as unsolicited messages.

use tokio::sync::mpsc;

use crate::geo::registry::WatchStream;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Role, Status};

use super::state::{BridgeState, ConnectionId};

/// Dispatch a request message to the appropriate handler.
///
/// Enforces:
/// - Host-only lifecycle messages are rejected from app connections
/// - Server-originated variants → `unknown_type`
pub fn handle_message(state: &mut BridgeState, request: Message, connection_id: ConnectionId) {
    let Some(outbound) = state.outbound(connection_id) else {
        tracing::debug!(?connection_id, "message from unknown connection");
        return;
    };

    let reply = match request {
        Message::Hello { id, version, role } => {
            let ack = handle_hello(state, id, version, role, connection_id);
            let accepted = matches!(
                ack,
                Message::HelloAck {
                    status: Status::Ok,
                    ..
                }
            );
            let _ = outbound.send(ack);
            if accepted && role == Role::Host {
                state.replay_prompt(connection_id);
            }
            None
        }
        // -- Location calls --
        Message::GetLocation {
            id,
            enable_high_accuracy,
            max_age,
        } => {
            handle_get_location(state, id, enable_high_accuracy, max_age, outbound.clone());
            None
        }
        Message::AddWatch {
            id,
            watch_id,
            enable_high_accuracy,
        } => Some(handle_add_watch(
            state,
            id,
            &watch_id,
            enable_high_accuracy,
            connection_id,
            outbound.clone(),
        )),
        Message::ClearWatch { id, watch_id } => Some(handle_clear_watch(state, id, &watch_id)),
        // -- Host-only --
        Message::Pause { id } => Some(host_only(state, id, connection_id, |s| {
            s.registry.on_pause()
        })),
        Message::Resume { id } => Some(host_only(state, id, connection_id, |s| {
            s.registry.on_resume()
        })),
        Message::SettingsResolved { id } => Some(host_only(state, id, connection_id, |s| {
            s.registry.on_settings_resolved()
        })),
        Message::PermissionResult { id, granted } => {
            Some(host_only(state, id, connection_id, |s| {
                s.resolve_permission(granted)
            }))
        }
        Message::RequestPermission { id } => Some(host_only(state, id, connection_id, |s| {
            s.registry.request_permission()
        })),
        Message::SetLocationMode { id, enabled } => {
            Some(host_only(state, id, connection_id, |s| {
                s.sim.set_location_mode(enabled)
            }))
        }
        // Server-originated messages should never be sent by clients.
        Message::HelloAck { id, .. }
        | Message::Response { id, .. }
        | Message::WatchPosition { id, .. }
        | Message::WatchError { id, .. }
        | Message::PermissionPrompt { id }
        | Message::ResolveSettings { id } => Some(Message::error(id, "unknown_type")),
    };

    if let Some(reply) = reply {
        let _ = outbound.send(reply);
    }
}

// -- Individual handlers --

fn handle_hello(
    state: &mut BridgeState,
    id: u32,
    version: u32,
    role: Role,
    connection_id: ConnectionId,
) -> Message {
    if id != 0 {
        return Message::HelloAck {
            id: 0,
            status: Status::Error,
            error: Some("invalid_hello_id".into()),
        };
    }
    if version != PROTOCOL_VERSION {
        return Message::HelloAck {
            id: 0,
            status: Status::Error,
            error: Some("version_mismatch".into()),
        };
    }
    state.set_role(connection_id, role);
    tracing::debug!(?connection_id, ?role, "handshake complete");
    Message::HelloAck {
        id: 0,
        status: Status::Ok,
        error: None,
    }
}

fn handle_get_location(
    state: &mut BridgeState,
    id: u32,
    enable_high_accuracy: bool,
    max_age: u64,
    outbound: mpsc::UnboundedSender<Message>,
) {
    let ticket = state.registry.get_location(enable_high_accuracy, max_age);
    tokio::spawn(async move {
        let result = ticket.wait().await;
        if outbound.send(Message::location(id, result)).is_err() {
            tracing::debug!(id, "location reply dropped, connection gone");
        }
    });
}

fn handle_add_watch(
    state: &mut BridgeState,
    id: u32,
    watch_id: &str,
    enable_high_accuracy: bool,
    connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
) -> Message {
    if watch_id.is_empty() {
        return Message::error(id, "invalid_watch_id");
    }
    match state.registry.add_watch(watch_id, enable_high_accuracy) {
        Ok(stream) => {
            state.claim_watch(watch_id, connection_id);
            forward_watch(stream, outbound);
            Message::ok(id)
        }
        Err(e) => Message::location_error(id, &e),
    }
}

fn handle_clear_watch(state: &mut BridgeState, id: u32, watch_id: &str) -> Message {
    state.registry.clear_watch(watch_id);
    state.release_watch(watch_id);
    Message::ok(id)
}

/// Run `action` if the connection is a host.
fn host_only(
    state: &mut BridgeState,
    id: u32,
    connection_id: ConnectionId,
    action: impl FnOnce(&mut BridgeState),
) -> Message {
    if state.connection_role(connection_id) != Some(Role::Host) {
        return Message::error(id, "unknown_type");
    }
    action(state);
    Message::ok(id)
}

/// Relay a watch stream to its connection until the watch ends or the
/// connection goes away.
fn forward_watch(mut stream: WatchStream, outbound: mpsc::UnboundedSender<Message>) {
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            if outbound
                .send(Message::watch_event(stream.id(), event))
                .is_err()
            {
                break;
            }
        }
        tracing::debug!(watch_id = stream.id(), "watch forwarding ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::geo::permission::PermissionMode;
    use crate::geo::registry::{HostRequest, RegistryEvent};
    use crate::geo::sim::SimConfig;

    struct Harness {
        state: BridgeState,
        events: mpsc::UnboundedReceiver<RegistryEvent>,
        host_requests: mpsc::UnboundedReceiver<HostRequest>,
    }

    impl Harness {
        fn new(permission: PermissionMode, sim: SimConfig) -> Self {
            let (state, events, host_requests) = BridgeState::new(BridgeConfig {
                permission,
                sim,
                ..BridgeConfig::default()
            });
            Self {
                state,
                events,
                host_requests,
            }
        }

        fn granted() -> Self {
            Self::new(PermissionMode::Granted, SimConfig::default())
        }

        fn connect(&mut self, role: Role) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
            let conn = ConnectionId::new();
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.state.add_connection(conn, tx);
            handle_message(&mut self.state, hello(role), conn);
            assert!(matches!(
                rx.try_recv().unwrap(),
                Message::HelloAck {
                    status: Status::Ok,
                    ..
                }
            ));
            (conn, rx)
        }

        fn send(&mut self, conn: ConnectionId, msg: Message) {
            handle_message(&mut self.state, msg, conn);
        }

        async fn pump(&mut self) {
            let event = self.events.recv().await.unwrap();
            self.state.registry.handle_event(event);
        }
    }

    fn hello(role: Role) -> Message {
        Message::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
            role,
        }
    }

    fn error_of(msg: Message) -> Option<String> {
        match msg {
            Message::Response { error, .. } => error,
            other => panic!("expected Response, got {other:?}"),
        }
    }

    // -- Hello --

    #[tokio::test]
    async fn hello_version_mismatch() {
        let mut h = Harness::granted();
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.state.add_connection(conn, tx);
        h.send(
            conn,
            Message::Hello {
                id: 0,
                version: 999,
                role: Role::App,
            },
        );
        match rx.try_recv().unwrap() {
            Message::HelloAck { id, status, error } => {
                assert_eq!(id, 0);
                assert_eq!(status, Status::Error);
                assert_eq!(error.as_deref(), Some("version_mismatch"));
            }
            other => panic!("expected HelloAck, got {other:?}"),
        }
        assert_eq!(h.state.connection_role(conn), None);
    }

    #[tokio::test]
    async fn hello_nonzero_id_rejected() {
        let mut h = Harness::granted();
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.state.add_connection(conn, tx);
        h.send(
            conn,
            Message::Hello {
                id: 5,
                version: PROTOCOL_VERSION,
                role: Role::Host,
            },
        );
        match rx.try_recv().unwrap() {
            Message::HelloAck { error, .. } => {
                assert_eq!(error.as_deref(), Some("invalid_hello_id"))
            }
            other => panic!("expected HelloAck, got {other:?}"),
        }
    }

    // -- Roles --

    #[tokio::test]
    async fn lifecycle_rejected_from_app() {
        let mut h = Harness::granted();
        let (app, mut rx) = h.connect(Role::App);
        h.send(app, Message::Pause { id: 3 });
        assert_eq!(error_of(rx.try_recv().unwrap()).as_deref(), Some("unknown_type"));
        assert!(!h.state.registry.is_paused());
    }

    #[tokio::test]
    async fn lifecycle_accepted_from_host() {
        let mut h = Harness::granted();
        let (host, mut rx) = h.connect(Role::Host);
        h.send(host, Message::Pause { id: 3 });
        assert_eq!(rx.try_recv().unwrap(), Message::ok(3));
        assert!(h.state.registry.is_paused());

        h.send(host, Message::Resume { id: 4 });
        assert_eq!(rx.try_recv().unwrap(), Message::ok(4));
        assert!(!h.state.registry.is_paused());
    }

    #[tokio::test]
    async fn server_originated_type_rejected() {
        let mut h = Harness::granted();
        let (app, mut rx) = h.connect(Role::App);
        h.send(app, Message::ResolveSettings { id: 8 });
        assert_eq!(error_of(rx.try_recv().unwrap()).as_deref(), Some("unknown_type"));
    }

    // -- Watches --

    #[tokio::test]
    async fn add_watch_streams_positions() {
        let mut h = Harness::granted();
        let (app, mut rx) = h.connect(Role::App);
        h.send(
            app,
            Message::AddWatch {
                id: 1,
                watch_id: "w1".into(),
                enable_high_accuracy: true,
            },
        );
        assert_eq!(rx.recv().await.unwrap(), Message::ok(1));
        assert_eq!(h.state.watch_owner("w1"), Some(app));

        match rx.recv().await.unwrap() {
            Message::WatchPosition { id, watch_id, .. } => {
                assert_eq!(id, 0);
                assert_eq!(watch_id, "w1");
            }
            other => panic!("expected WatchPosition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn high_accuracy_watch_refused_when_location_mode_off() {
        let mut h = Harness::new(
            PermissionMode::Granted,
            SimConfig {
                location_mode: false,
                ..SimConfig::default()
            },
        );
        let (app, mut rx) = h.connect(Role::App);
        h.send(
            app,
            Message::AddWatch {
                id: 2,
                watch_id: "a".into(),
                enable_high_accuracy: true,
            },
        );
        match rx.try_recv().unwrap() {
            Message::Response { status, code, .. } => {
                assert_eq!(status, Status::Error);
                assert_eq!(code, Some(2));
            }
            other => panic!("expected Response, got {other:?}"),
        }
        assert!(!h.state.registry.contains_watch("a"));
        assert_eq!(h.state.watch_owner("a"), None);
    }

    #[tokio::test]
    async fn empty_watch_id_rejected() {
        let mut h = Harness::granted();
        let (app, mut rx) = h.connect(Role::App);
        h.send(
            app,
            Message::AddWatch {
                id: 2,
                watch_id: String::new(),
                enable_high_accuracy: false,
            },
        );
        assert_eq!(
            error_of(rx.try_recv().unwrap()).as_deref(),
            Some("invalid_watch_id")
        );
    }

    #[tokio::test]
    async fn clear_unknown_watch_is_ok() {
        let mut h = Harness::granted();
        let (app, mut rx) = h.connect(Role::App);
        h.send(
            app,
            Message::ClearWatch {
                id: 6,
                watch_id: "nonexistent".into(),
            },
        );
        assert_eq!(rx.try_recv().unwrap(), Message::ok(6));
    }

    // -- One-shot --

    #[tokio::test]
    async fn get_location_replies_after_fetch() {
        let mut h = Harness::new(
            PermissionMode::Granted,
            SimConfig {
                latitude: 45.0,
                longitude: 7.5,
                ..SimConfig::default()
            },
        );
        let (app, mut rx) = h.connect(Role::App);
        h.send(
            app,
            Message::GetLocation {
                id: 11,
                enable_high_accuracy: false,
                max_age: 0,
            },
        );
        assert!(rx.try_recv().is_err(), "reply is deferred");

        h.pump().await;
        match rx.recv().await.unwrap() {
            Message::Response {
                id,
                status,
                position,
                ..
            } => {
                assert_eq!(id, 11);
                assert_eq!(status, Status::Ok);
                let position = position.unwrap();
                assert_eq!(position.latitude, 45.0);
                assert_eq!(position.longitude, 7.5);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_location_without_fix_reports_code_2() {
        let mut h = Harness::new(
            PermissionMode::Granted,
            SimConfig {
                has_fix: false,
                ..SimConfig::default()
            },
        );
        let (app, mut rx) = h.connect(Role::App);
        h.send(
            app,
            Message::GetLocation {
                id: 12,
                enable_high_accuracy: false,
                max_age: 0,
            },
        );
        h.pump().await;
        match rx.recv().await.unwrap() {
            Message::Response { id, code, .. } => {
                assert_eq!(id, 12);
                assert_eq!(code, Some(2));
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    // -- Permission flow --

    #[tokio::test]
    async fn permission_answer_from_host_releases_requests() {
        let mut h = Harness::new(PermissionMode::Prompt, SimConfig::default());
        let (host, mut host_rx) = h.connect(Role::Host);
        let (app, mut app_rx) = h.connect(Role::App);

        h.state.registry.initialize();
        let request = h.host_requests.recv().await.unwrap();
        h.state.dispatch_host_request(request);
        assert_eq!(
            host_rx.try_recv().unwrap(),
            Message::PermissionPrompt { id: 0 }
        );

        h.send(
            app,
            Message::GetLocation {
                id: 20,
                enable_high_accuracy: false,
                max_age: 0,
            },
        );
        h.send(
            host,
            Message::PermissionResult {
                id: 1,
                granted: true,
            },
        );
        assert_eq!(host_rx.try_recv().unwrap(), Message::ok(1));

        h.pump().await; // permission answered
        h.pump().await; // settings checked
        h.pump().await; // fetch completed
        match app_rx.recv().await.unwrap() {
            Message::Response { id, status, .. } => {
                assert_eq!(id, 20);
                assert_eq!(status, Status::Ok);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn set_location_mode_notifies_watches() {
        let mut h = Harness::granted();
        let (host, mut host_rx) = h.connect(Role::Host);
        let (app, mut app_rx) = h.connect(Role::App);
        h.send(
            app,
            Message::AddWatch {
                id: 1,
                watch_id: "w".into(),
                enable_high_accuracy: false,
            },
        );
        assert_eq!(app_rx.recv().await.unwrap(), Message::ok(1));

        h.send(
            host,
            Message::SetLocationMode {
                id: 2,
                enabled: false,
            },
        );
        assert_eq!(host_rx.try_recv().unwrap(), Message::ok(2));
        h.pump().await;

        loop {
            match app_rx.recv().await.unwrap() {
                Message::WatchPosition { .. } => continue,
                Message::WatchError { watch_id, code, .. } => {
                    assert_eq!(watch_id, "w");
                    assert_eq!(code, Some(2));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
