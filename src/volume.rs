//! Deterministic session-to-volume binding.

use std::sync::Arc;

use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{ComputeProvider, VolumeRef};

/// Name of the volume owned by `session_id`.
///
/// The mapping is injective and stays within `[A-Za-z0-9_-]`: ASCII
/// alphanumerics and `-` pass through, `_` becomes `__` and every other
/// byte becomes `_` followed by two lowercase hex digits.
pub fn volume_name(session_id: &str) -> String {
    let mut name = String::with_capacity("volume-".len() + session_id.len());
    name.push_str("volume-");
    for byte in session_id.bytes() {
        match byte {
            b'_' => name.push_str("__"),
            b if b.is_ascii_alphanumeric() || b == b'-' => name.push(b as char),
            b => {
                name.push('_');
                name.push_str(&format!("{:02x}", b));
            }
        }
    }
    name
}

/// Binds sessions to their persistent volumes. Never deletes anything:
/// a volume outlives every sandbox that mounts it.
#[derive(Clone)]
pub struct VolumeStore {
    provider: Arc<dyn ComputeProvider>,
}

impl VolumeStore {
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self { provider }
    }

    /// Resolve the session's volume, creating it if missing. Idempotent.
    pub async fn ensure(&self, session_id: &str) -> Result<VolumeRef, ProviderError> {
        let name = volume_name(session_id);
        let volume = self.provider.ensure_volume(&name).await?;
        debug!(session_id, volume = %volume.name, volume_id = %volume.id, "volume ready");
        Ok(volume)
    }
}
