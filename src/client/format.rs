//! Output formatting for CLI client commands.
//!
//! Positions are printed one per line so a watch can be piped into
//! line-oriented tools (`geolocd client watch | cut -f2,3`).

use crate::geo::types::LocationSample;
use crate::ipc::protocol::Message;

use super::bridge_client::wire_error;

/// Print a one-shot fix as labelled fields.
pub fn print_position(sample: &LocationSample) {
    println!("Timestamp: {}", sample.timestamp);
    println!("Latitude:  {:.6}", sample.latitude);
    println!("Longitude: {:.6}", sample.longitude);
    println!("Altitude:  {:.1} m", sample.altitude);
    println!("Accuracy:  {:.1} m", sample.accuracy);
    println!("Heading:   {:.1}°", sample.heading);
    println!("Velocity:  {:.2} m/s", sample.velocity);
}

pub fn print_watch_header(watch_id: &str) {
    eprintln!("Watching {watch_id} (Ctrl-C to stop)");
    println!("TIMESTAMP\tLATITUDE\tLONGITUDE\tACCURACY");
}

/// Print one unsolicited watch message. Returns whether it was a fix.
pub fn print_watch_event(msg: &Message) -> bool {
    match msg {
        Message::WatchPosition { position, .. } => {
            println!("{}", watch_line(position));
            true
        }
        Message::WatchError { code, message, .. } => {
            eprintln!("watch error: {}", wire_error(*code, message.clone()));
            false
        }
        other => {
            tracing::debug!(msg = ?other, "ignored message during watch");
            false
        }
    }
}

/// Print a host-side notice. Returns whether it was one.
pub fn print_host_notice(msg: &Message) -> bool {
    match msg {
        Message::PermissionPrompt { .. } => {
            println!("permission_prompt: answer with `geolocd client permission grant|deny`");
            true
        }
        Message::ResolveSettings { .. } => {
            println!("resolve_settings: answer with `geolocd client settings-resolved`");
            true
        }
        _ => false,
    }
}

pub fn print_ok(op: &str) {
    println!("{op}: ok");
}

fn watch_line(sample: &LocationSample) -> String {
    format!(
        "{}\t{:.6}\t{:.6}\t{:.1}",
        sample.timestamp, sample.latitude, sample.longitude, sample.accuracy
    )
}
