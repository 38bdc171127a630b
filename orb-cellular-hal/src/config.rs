use crate::{
    profile::{DeleteInUsePolicy, ProfileType},
    session::IpPreference,
    telemetry::RatSet,
};
use std::time::Duration;

/// Timing and policy knobs of the orchestrator. Every field has a default, so
/// `Config::builder().build()` is a working configuration.
#[derive(Debug, Clone, bon::Builder)]
pub struct Config {
    /// Upper bound for any single transport command.
    #[builder(default = Duration::from_secs(30))]
    pub command_timeout: Duration,
    /// Network scans take minutes on most modems and are never retried.
    #[builder(default = Duration::from_secs(180))]
    pub scan_timeout: Duration,
    /// Attempts at opening the control interface before reporting failure.
    #[builder(default = 3)]
    pub open_attempts: u32,
    /// Initial backoff between open attempts, doubled after each failure.
    #[builder(default = Duration::from_secs(2))]
    pub open_backoff: Duration,
    /// Attempts for idempotent queries that timed out.
    #[builder(default = 3)]
    pub query_attempts: u32,
    #[builder(default = Duration::from_millis(500))]
    pub query_backoff: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub slot_refresh_interval: Duration,
    /// Interface health check and session recovery cadence.
    #[builder(default = Duration::from_secs(20))]
    pub health_interval: Duration,
    /// Restarts of a wanted session before giving up until the next explicit
    /// start.
    #[builder(default = 3)]
    pub session_restart_attempts: u32,
    /// Profile type whose default profile is used by `start_network(None)`.
    #[builder(default)]
    pub profile_type: ProfileType,
    #[builder(default)]
    pub delete_in_use: DeleteInUsePolicy,
    pub preferred_slot: Option<u32>,
    #[builder(default)]
    pub ip_preference: IpPreference,
    /// Applied once the device reaches `Ready`.
    pub preferred_rat: Option<RatSet>,
    #[builder(default = 1500)]
    pub default_mtu: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}
