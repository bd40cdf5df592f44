//! Centralized path configuration for strata.
//!
//! All data paths should go through this module so the daemon and its tests
//! agree on where state lives.

use std::path::PathBuf;

/// Get the strata data directory.
///
/// Resolution order:
/// 1. `STRATA_DATA_DIR` environment variable
/// 2. `/var/lib/strata` if it exists (system install)
/// 3. `~/.strata` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STRATA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/strata");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".strata")).unwrap_or(system_dir)
}

/// Get the configuration directory (`~/.config/strata` or the data dir).
pub fn config_dir() -> PathBuf {
    dirs::config_dir().map(|c| c.join("strata")).unwrap_or_else(data_dir)
}

/// Get the database path.
pub fn db_path() -> PathBuf {
    data_dir().join("strata.db")
}

/// Get the root of the per-account volume directories.
pub fn volumes_dir() -> PathBuf {
    data_dir().join("volumes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_consistency() {
        let base = data_dir();
        assert!(db_path().starts_with(&base));
        assert!(volumes_dir().starts_with(&base));
    }
}
