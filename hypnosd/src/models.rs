//! Wire types exchanged on the HTTP control plane.

use serde::{Deserialize, Serialize};

use crate::state_machine::SleeperState;

/// Heartbeat body, sleeper to waker.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatIn {
    pub checksum: String,
}

/// Heartbeat acknowledgment, waker to sleeper. `waker_checksum` is only
/// present when the configs disagree.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub op: String,
    pub state: SleeperState,
    pub config_compatible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waker_checksum: Option<String>,
}

/// Locally tracked liveness, as reported by `GET /waker/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusOut {
    pub op: String,
    pub state: SleeperState,
    /// Simplified vocabulary for home-automation integrations that have
    /// no notion of "waking".
    pub homekit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_age_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_pending_for_seconds: Option<u64>,
}
