//! Stable per-device identifier.
//!
//! Pending transactions and sessions are attributed to the device that
//! produced them, so the identifier must survive restarts. It is generated
//! once and persisted as a plain file under the base directory.

use crate::{CoreResult, Paths};
use tracing::info;

/// Load the persisted device identifier, generating one on first run.
pub fn load_or_create_device_identifier(paths: &Paths) -> CoreResult<String> {
    let path = paths.device_id_file();

    if path.exists() {
        let id = std::fs::read_to_string(&path)?;
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    paths.ensure_dirs()?;
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id)?;
    info!(device_id = %id, "Generated new device identifier");
    Ok(id)
}
