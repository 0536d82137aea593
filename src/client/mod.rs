//! CLI client for bridge operations.
//!
//! App commands (`locate`, `watch`, `clear-watch`) connect with the app
//! role; lifecycle and permission commands connect as a host. Each
//! command performs its request, prints the result, and exits. `watch`
//! and `listen` stream until a count is reached or Ctrl-C.

mod bridge_client;
mod format;

use crate::cli::{ClientAction, Decision, Switch};
use crate::geo::types::LocationError;
use crate::ipc::protocol::Role;
use bridge_client::BridgeClient;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("bridge: {0}")]
    Bridge(String),
    #[error("location: {0}")]
    Location(#[from] LocationError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the client command.
///
/// Called from `main.rs` for `Command::Client`.
pub async fn run(action: ClientAction) -> Result<(), ClientError> {
    let mut bridge = BridgeClient::connect(role_for(&action)).await?;

    match action {
        ClientAction::Locate {
            high_accuracy,
            max_age,
        } => {
            let position = bridge.get_location(high_accuracy, max_age).await?;
            format::print_position(&position);
        }
        ClientAction::Watch {
            id,
            high_accuracy,
            count,
        } => {
            let watch_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            bridge.add_watch(&watch_id, high_accuracy).await?;
            format::print_watch_header(&watch_id);
            let streamed = stream_watch(&mut bridge, count).await;
            let cleared = bridge.clear_watch(&watch_id).await;
            streamed?;
            cleared?;
        }
        ClientAction::ClearWatch { watch_id } => {
            bridge.clear_watch(&watch_id).await?;
            format::print_ok("clear_watch");
        }
        ClientAction::Pause => {
            bridge.pause().await?;
            format::print_ok("pause");
        }
        ClientAction::Resume => {
            bridge.resume().await?;
            format::print_ok("resume");
        }
        ClientAction::SettingsResolved => {
            bridge.settings_resolved().await?;
            format::print_ok("settings_resolved");
        }
        ClientAction::Permission { decision } => {
            bridge
                .permission_result(decision == Decision::Grant)
                .await?;
            format::print_ok("permission_result");
        }
        ClientAction::RequestPermission => {
            bridge.request_permission().await?;
            format::print_ok("request_permission");
        }
        ClientAction::LocationMode { state } => {
            bridge.set_location_mode(state == Switch::On).await?;
            format::print_ok("set_location_mode");
        }
        ClientAction::Listen { count } => listen(&mut bridge, count).await?,
    }

    Ok(())
}

fn role_for(action: &ClientAction) -> Role {
    match action {
        ClientAction::Locate { .. }
        | ClientAction::Watch { .. }
        | ClientAction::ClearWatch { .. } => Role::App,
        _ => Role::Host,
    }
}

/// Print watch fixes until `count` fixes arrived or Ctrl-C.
async fn stream_watch(bridge: &mut BridgeClient, count: Option<u32>) -> Result<(), ClientError> {
    let mut received = 0u32;
    while count.is_none_or(|limit| received < limit) {
        tokio::select! {
            msg = bridge.next_event() => {
                if format::print_watch_event(&msg?) {
                    received += 1;
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }
    Ok(())
}

/// Print host notices until `count` arrived or Ctrl-C.
async fn listen(bridge: &mut BridgeClient, count: Option<u32>) -> Result<(), ClientError> {
    let mut received = 0u32;
    while count.is_none_or(|limit| received < limit) {
        tokio::select! {
            msg = bridge.next_event() => {
                if format::print_host_notice(&msg?) {
                    received += 1;
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }
    Ok(())
}
