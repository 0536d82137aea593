//! Per-connection task: framed I/O, handshake, command forwarding.
//!
//! Each client connection spawns a tokio task that:
//! 1. Wraps the socket in a length-prefixed MessagePack codec.
//! 2. Reads the first message (must be `Hello`) and forwards it to
//!    the bridge loop for handshake validation.
//! 3. Enters a select loop: forward requests to the bridge loop, write
//!    everything queued on the outbound channel (replies, deferred
//!    location answers, watch events, host prompts).
//! 4. On disconnect, notifies the bridge loop for cleanup.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::ipc::codec::{CodecError, DecodeResult, FrameCodec, decode_frame};
use crate::ipc::protocol::{Message, Status};

use super::state::ConnectionId;

/// Command sent from a connection task to the bridge loop. Replies come
/// back on the connection's outbound channel.
#[derive(Debug)]
pub struct BridgeCommand {
    pub request: Message,
    pub connection_id: ConnectionId,
}

/// Notification sent when a connection closes.
#[derive(Debug)]
pub struct DisconnectNotice {
    pub connection_id: ConnectionId,
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("unexpected EOF during handshake")]
    HandshakeEof,
    #[error("first message must be Hello")]
    NotHello,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("bridge loop closed")]
    BridgeGone,
}

/// Spawn a connection handler task.
///
/// The task runs until the client disconnects or a protocol error
/// occurs. On exit, a [`DisconnectNotice`] is sent to the bridge loop.
pub fn spawn_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<BridgeCommand>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    disconnect_tx: mpsc::UnboundedSender<DisconnectNotice>,
) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, conn_id, cmd_tx, outbound_rx).await {
            tracing::debug!(?conn_id, error = %e, "connection closed");
        }
        let _ = disconnect_tx.send(DisconnectNotice {
            connection_id: conn_id,
        });
    });
}

async fn handle_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<BridgeCommand>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Handshake: first message must be Hello --
    let first_frame = framed
        .next()
        .await
        .ok_or(ConnectionError::HandshakeEof)??;

    let hello = match decode_frame(&first_frame) {
        DecodeResult::Ok(msg @ Message::Hello { .. }) => msg,
        DecodeResult::Ok(_) | DecodeResult::UnknownType(_) => {
            return Err(ConnectionError::NotHello);
        }
        DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
    };

    forward(&cmd_tx, hello, conn_id)?;
    let ack = outbound_rx.recv().await.ok_or(ConnectionError::BridgeGone)?;
    let rejected = matches!(
        ack,
        Message::HelloAck {
            status: Status::Error,
            ..
        }
    );
    framed.send(ack).await?;
    if rejected {
        return Ok(());
    }

    // -- Main loop: requests + outbound delivery --
    loop {
        tokio::select! {
            frame = framed.next() => {
                let raw = match frame {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => return Err(ConnectionError::Codec(e)),
                    None => return Ok(()),
                };
                match decode_frame(&raw) {
                    DecodeResult::Ok(msg) => forward(&cmd_tx, msg, conn_id)?,
                    DecodeResult::UnknownType(envelope) => {
                        tracing::debug!(?conn_id, msg_type = %envelope.msg_type, "unknown message type");
                        framed.send(Message::error(envelope.id, "unknown_type")).await?;
                    }
                    DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => framed.send(msg).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

fn forward(
    cmd_tx: &mpsc::UnboundedSender<BridgeCommand>,
    request: Message,
    conn_id: ConnectionId,
) -> Result<(), ConnectionError> {
    cmd_tx
        .send(BridgeCommand {
            request,
            connection_id: conn_id,
        })
        .map_err(|_| ConnectionError::BridgeGone)
}
