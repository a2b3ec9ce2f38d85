//! The server catalogue: `servers.json`
//!
//! A JSON array of server profiles. Profiles without an id get a fresh
//! UUID assigned on load; the caller persists the catalogue back right
//! away so ids stay stable across restarts.

use std::path::Path;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::state::ServerProfile;

/// Catalogue file name inside the config directory
pub const CATALOGUE_FILE: &str = "servers.json";

/// Load the catalogue, backfilling missing ids.
///
/// Returns the profiles and whether any id was assigned (the caller
/// should save the catalogue back in that case). A missing file is an
/// empty catalogue.
///
/// # Errors
///
/// Returns `ConfigError` for unreadable files or malformed JSON.
pub fn load_catalogue(path: &Path) -> Result<(Vec<ServerProfile>, bool), ConfigError> {
    if !path.exists() {
        debug!(path = %path.display(), "No server catalogue, starting empty");
        return Ok((Vec::new(), false));
    }

    let contents = std::fs::read_to_string(path)?;
    let mut profiles: Vec<ServerProfile> = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::parse(format!("{}: {e}", path.display())))?;

    let mut assigned = false;
    for profile in &mut profiles {
        if profile.id.is_empty() {
            profile.id = Uuid::new_v4().to_string();
            assigned = true;
        }
    }

    info!(
        count = profiles.len(),
        ids_assigned = assigned,
        "Server catalogue loaded"
    );
    Ok((profiles, assigned))
}

/// Persist the catalogue as pretty-printed JSON.
///
/// # Errors
///
/// Returns `ConfigError` on serialization or write failures.
pub fn save_catalogue(path: &Path, profiles: &[ServerProfile]) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(profiles)
        .map_err(|e| ConfigError::parse(e.to_string()))?;
    std::fs::write(path, json)?;
    debug!(path = %path.display(), count = profiles.len(), "Server catalogue saved");
    Ok(())
}
