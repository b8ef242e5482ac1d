//! Config drift detection.
//!
//! Both hosts hash their three config sections and exchange the digest on
//! every heartbeat, so a forgotten edit on one side shows up in the logs
//! without ever putting the API key on the wire.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::config::AppConfig;

/// 16 lowercase hex chars over the canonical (key-sorted) JSON rendering
/// of the `common`/`waker`/`sleeper` sections.
///
/// `common.role` is excluded: pinning the role on one host is a local
/// deployment choice, not config drift.
pub fn compute_config_checksum(cfg: &AppConfig) -> Result<String> {
    let mut payload = serde_json::to_value(cfg).context("failed to serialize config")?;
    if let Some(common) = payload.get_mut("common").and_then(|v| v.as_object_mut()) {
        common.remove("role");
    }
    // serde_json maps are BTreeMaps, so this rendering is key-sorted.
    let canonical = serde_json::to_string(&payload).context("failed to render config")?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(&digest[..8]))
}
