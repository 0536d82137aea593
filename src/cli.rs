use clap::{Parser, Subcommand, ValueEnum};

use crate::geo::permission::PermissionMode;

#[derive(Parser)]
#[command(name = "geolocd", about = "Geolocation bridge daemon and client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the bridge daemon
    Serve {
        /// Initial location permission state
        #[arg(long, value_enum, default_value_t = PermissionMode::Prompt)]
        permission: PermissionMode,

        /// Start with the high-accuracy location mode switched off
        #[arg(long)]
        no_location_mode: bool,

        /// Simulated start latitude in degrees
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        lat: f64,

        /// Simulated start longitude in degrees
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        lon: f64,

        /// Simulated altitude in meters
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        altitude: f64,

        /// Simulated horizontal accuracy in meters
        #[arg(long, default_value_t = 5.0)]
        accuracy: f32,

        /// Simulated ground speed in m/s
        #[arg(long, default_value_t = 0.0)]
        speed: f32,

        /// Simulated heading in degrees clockwise from north
        #[arg(long, default_value_t = 0.0)]
        heading: f32,

        /// Report no last known location for one-shot requests
        #[arg(long)]
        no_fix: bool,

        /// One-shot fetch timeout in milliseconds (0 disables)
        #[arg(long, default_value_t = 30_000)]
        fetch_timeout_ms: u64,
    },

    /// One-shot commands against a running bridge
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
pub enum ClientAction {
    /// Request a single location fix
    Locate {
        /// Use the high-accuracy tier
        #[arg(long)]
        high_accuracy: bool,

        /// Maximum acceptable fix age in milliseconds (accepted, not honored)
        #[arg(long, default_value_t = 0)]
        max_age: u64,
    },

    /// Stream fixes from a watch; the watch is cleared on exit
    Watch {
        /// Watch id (random when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Use the high-accuracy tier
        #[arg(long)]
        high_accuracy: bool,

        /// Stop after this many fixes
        #[arg(long)]
        count: Option<u32>,
    },

    /// Clear a watch by id
    ClearWatch { watch_id: String },

    /// Host: the app went to the background
    Pause,

    /// Host: the app came back to the foreground
    Resume,

    /// Host: the location-settings dialog finished
    SettingsResolved,

    /// Host: answer the permission prompt
    Permission {
        #[arg(value_enum)]
        decision: Decision,
    },

    /// Host: prompt for the location permission again
    RequestPermission,

    /// Host: switch the high-accuracy location mode
    LocationMode {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Host: print permission prompts and settings requests as they arrive
    Listen {
        /// Stop after this many notices
        #[arg(long)]
        count: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Decision {
    Grant,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}
