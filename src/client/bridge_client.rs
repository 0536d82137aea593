//! Bridge client for the CLI client.
//!
//! Connects to the bridge daemon as an app or a host, performs the
//! handshake, and provides one method per operation.

use std::collections::VecDeque;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::bridge::resolve_socket_path;
use crate::geo::types::{LocationError, LocationSample};
use crate::ipc::codec::LengthPrefixedCodec;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Role, Status};

use super::ClientError;

/// Bridge client for CLI commands.
///
/// Replies are matched by request id. Unsolicited messages (watch
/// events, host prompts) that arrive while a reply is awaited are kept
/// for [`BridgeClient::next_event`].
pub struct BridgeClient {
    framed: Framed<UnixStream, LengthPrefixedCodec>,
    next_id: u32,
    backlog: VecDeque<Message>,
}

impl BridgeClient {
    /// Connect to the bridge and perform the handshake.
    pub async fn connect(role: Role) -> Result<Self, ClientError> {
        let socket_path =
            resolve_socket_path().map_err(|e| ClientError::Bridge(e.to_string()))?;

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| ClientError::Bridge(format!("connect failed: {e}")))?;
        let mut framed = Framed::new(stream, LengthPrefixedCodec::new());

        framed
            .send(Message::Hello {
                id: 0,
                version: PROTOCOL_VERSION,
                role,
            })
            .await
            .map_err(|e| ClientError::Bridge(format!("send hello: {e}")))?;

        match framed.next().await {
            Some(Ok(Message::HelloAck {
                status: Status::Ok, ..
            })) => {}
            Some(Ok(Message::HelloAck {
                status: Status::Error,
                error,
                ..
            })) => {
                return Err(ClientError::Bridge(format!(
                    "handshake rejected: {}",
                    error.unwrap_or_default()
                )));
            }
            other => {
                return Err(ClientError::Bridge(format!(
                    "unexpected handshake response: {other:?}"
                )));
            }
        }

        Ok(Self {
            framed,
            next_id: 1, // 0 = Hello
            backlog: VecDeque::new(),
        })
    }

    /// One-shot location fix.
    pub async fn get_location(
        &mut self,
        enable_high_accuracy: bool,
        max_age: u64,
    ) -> Result<LocationSample, ClientError> {
        let id = self.take_id();
        let reply = self
            .request(
                Message::GetLocation {
                    id,
                    enable_high_accuracy,
                    max_age,
                },
                "get_location",
            )
            .await?;
        match reply {
            Message::Response {
                status: Status::Ok,
                position: Some(position),
                ..
            } => Ok(position),
            Message::Response {
                status: Status::Ok, ..
            } => Err(ClientError::Bridge("get_location: reply without position".into())),
            Message::Response { error, code, .. } => {
                Err(ClientError::Location(wire_error(code, error)))
            }
            other => Err(unexpected("get_location", &other)),
        }
    }

    pub async fn add_watch(
        &mut self,
        watch_id: &str,
        enable_high_accuracy: bool,
    ) -> Result<(), ClientError> {
        let id = self.take_id();
        self.call(
            Message::AddWatch {
                id,
                watch_id: watch_id.to_string(),
                enable_high_accuracy,
            },
            "add_watch",
        )
        .await
    }

    pub async fn clear_watch(&mut self, watch_id: &str) -> Result<(), ClientError> {
        let id = self.take_id();
        self.call(
            Message::ClearWatch {
                id,
                watch_id: watch_id.to_string(),
            },
            "clear_watch",
        )
        .await
    }

    // -- Host operations --

    pub async fn pause(&mut self) -> Result<(), ClientError> {
        let id = self.take_id();
        self.call(Message::Pause { id }, "pause").await
    }

    pub async fn resume(&mut self) -> Result<(), ClientError> {
        let id = self.take_id();
        self.call(Message::Resume { id }, "resume").await
    }

    pub async fn settings_resolved(&mut self) -> Result<(), ClientError> {
        let id = self.take_id();
        self.call(Message::SettingsResolved { id }, "settings_resolved")
            .await
    }

    pub async fn permission_result(&mut self, granted: bool) -> Result<(), ClientError> {
        let id = self.take_id();
        self.call(Message::PermissionResult { id, granted }, "permission_result")
            .await
    }

    pub async fn request_permission(&mut self) -> Result<(), ClientError> {
        let id = self.take_id();
        self.call(Message::RequestPermission { id }, "request_permission")
            .await
    }

    pub async fn set_location_mode(&mut self, enabled: bool) -> Result<(), ClientError> {
        let id = self.take_id();
        self.call(Message::SetLocationMode { id, enabled }, "set_location_mode")
            .await
    }

    /// Next unsolicited message from the bridge.
    pub async fn next_event(&mut self) -> Result<Message, ClientError> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(msg);
        }
        self.recv().await
    }

    // -- Internals --

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Send a request whose success reply carries nothing.
    async fn call(&mut self, msg: Message, op: &str) -> Result<(), ClientError> {
        match self.request(msg, op).await? {
            Message::Response {
                status: Status::Ok, ..
            } => Ok(()),
            Message::Response {
                error: Some(error),
                code: None,
                ..
            } => Err(ClientError::Bridge(format!("{op} failed: {error}"))),
            Message::Response { error, code, .. } => {
                Err(ClientError::Location(wire_error(code, error)))
            }
            other => Err(unexpected(op, &other)),
        }
    }

    /// Send `msg` and wait for the response carrying its id.
    async fn request(&mut self, msg: Message, op: &str) -> Result<Message, ClientError> {
        let id = request_id(&msg);
        self.framed
            .send(msg)
            .await
            .map_err(|e| ClientError::Bridge(format!("send {op}: {e}")))?;

        loop {
            match self.recv().await? {
                reply @ Message::Response { id: reply_id, .. } if reply_id == id => {
                    return Ok(reply);
                }
                Message::Response { id: other, .. } => {
                    tracing::debug!(expected = id, got = other, "stray response dropped");
                }
                unsolicited => self.backlog.push_back(unsolicited),
            }
        }
    }

    async fn recv(&mut self) -> Result<Message, ClientError> {
        match self.framed.next().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => Err(ClientError::Bridge(format!("receive failed: {e}"))),
            None => Err(ClientError::Bridge("connection closed by bridge".into())),
        }
    }
}

fn request_id(msg: &Message) -> u32 {
    match msg {
        Message::GetLocation { id, .. }
        | Message::AddWatch { id, .. }
        | Message::ClearWatch { id, .. }
        | Message::Pause { id }
        | Message::Resume { id }
        | Message::SettingsResolved { id }
        | Message::PermissionResult { id, .. }
        | Message::RequestPermission { id }
        | Message::SetLocationMode { id, .. }
        | Message::Hello { id, .. }
        | Message::HelloAck { id, .. }
        | Message::Response { id, .. }
        | Message::WatchPosition { id, .. }
        | Message::WatchError { id, .. }
        | Message::PermissionPrompt { id }
        | Message::ResolveSettings { id } => *id,
    }
}

/// Rebuild a location error from its wire form.
pub fn wire_error(code: Option<u8>, message: Option<String>) -> LocationError {
    match code {
        Some(1) => LocationError::PermissionDenied,
        Some(2) => LocationError::PositionUnavailable,
        Some(3) => LocationError::Timeout,
        _ => LocationError::Backend(message.unwrap_or_default()),
    }
}

fn unexpected(op: &str, msg: &Message) -> ClientError {
    ClientError::Bridge(format!("unexpected {op} response: {msg:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_map_back() {
        assert_eq!(wire_error(Some(1), None), LocationError::PermissionDenied);
        assert_eq!(wire_error(Some(2), None), LocationError::PositionUnavailable);
        assert_eq!(wire_error(Some(3), None), LocationError::Timeout);
    }

    #[test]
    fn missing_code_keeps_backend_message() {
        assert_eq!(
            wire_error(None, Some("api unavailable".into())),
            LocationError::Backend("api unavailable".into())
        );
    }

    #[test]
    fn request_id_reads_any_variant() {
        assert_eq!(request_id(&Message::Pause { id: 9 }), 9);
        assert_eq!(
            request_id(&Message::ClearWatch {
                id: 4,
                watch_id: "w".into()
            }),
            4
        );
    }
}
