//! Volume-mount allocation for stack services.
//!
//! A stack service's mount map goes from a host subpath (relative to the
//! account's volume directory) to a container path. Declared catalog mounts
//! the caller did not map get a fresh scratch directory under `AppData/`.

use crate::error::{Result, StrataError};
use crate::types::{VolumeMountSpec, DOCKER_MOUNT};
use std::collections::BTreeMap;

/// Parent of generated scratch directories.
pub const SCRATCH_DIR: &str = "AppData";

const MAX_SUFFIX_ATTEMPTS: usize = 16;

/// Complete `mapping` against the `declared` mounts.
///
/// - existing entries are kept as they are
/// - an entry with an empty host path is replaced by a generated one
/// - every declared container path left unmapped gets a generated host path
/// - two host paths targeting the same container path is a conflict
///
/// The `docker` mount is bound to the host socket at template time and is
/// never allocated here. Applying the result again adds nothing.
pub fn allocate(
    declared: &[VolumeMountSpec],
    mapping: &BTreeMap<String, String>,
    mut suffix: impl FnMut() -> String,
) -> Result<BTreeMap<String, String>> {
    let mut targets: BTreeMap<&str, usize> = BTreeMap::new();
    for container_path in mapping.values().filter(|p| !p.is_empty()) {
        let count = targets.entry(container_path.as_str()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Err(StrataError::VolumeMountConflict {
                container_path: container_path.clone(),
            });
        }
    }

    let mut allocated: BTreeMap<String, String> = mapping
        .iter()
        .filter(|(host, container)| !host.is_empty() && !container.is_empty())
        .map(|(host, container)| (host.clone(), container.clone()))
        .collect();

    let mut wanted: Vec<&str> = declared
        .iter()
        .filter(|mount| mount.name != DOCKER_MOUNT)
        .map(|mount| mount.mount_path.as_str())
        .collect();
    if let Some(container) = mapping.get("") {
        wanted.push(container.as_str());
    }

    for container_path in wanted {
        if container_path.is_empty() || allocated.values().any(|c| c == container_path) {
            continue;
        }
        let host = scratch_path(&allocated, &mut suffix)?;
        allocated.insert(host, container_path.to_string());
    }

    Ok(allocated)
}

fn scratch_path(
    taken: &BTreeMap<String, String>,
    suffix: &mut impl FnMut() -> String,
) -> Result<String> {
    for _ in 0..MAX_SUFFIX_ATTEMPTS {
        let candidate = format!("{}/{}", SCRATCH_DIR, suffix());
        if !taken.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    Err(StrataError::Internal("Could not generate a unique scratch path".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(name: &str, path: &str) -> VolumeMountSpec {
        VolumeMountSpec { name: name.to_string(), mount_path: path.to_string() }
    }

    fn counter() -> impl FnMut() -> String {
        let mut n = 0;
        move || {
            n += 1;
            format!("s{:04}", n)
        }
    }

    #[test]
    fn test_generates_missing_mount() {
        let declared = vec![mount("data", "/data")];
        let allocated = allocate(&declared, &BTreeMap::new(), counter()).unwrap();

        assert_eq!(allocated.len(), 1);
        let (host, container) = allocated.iter().next().unwrap();
        assert!(host.starts_with("AppData/"));
        assert_eq!(container, "/data");
    }

    #[test]
    fn test_preserves_existing_and_is_idempotent() {
        let declared = vec![mount("data", "/data"), mount("logs", "/var/log/app")];
        let supplied = BTreeMap::from([("projects/site".to_string(), "/data".to_string())]);

        let first = allocate(&declared, &supplied, counter()).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first["projects/site"], "/data");

        let second = allocate(&declared, &first, counter()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_shared_container_path() {
        let declared = vec![mount("data", "/data")];
        let supplied = BTreeMap::from([
            ("a".to_string(), "/data".to_string()),
            ("b".to_string(), "/data".to_string()),
        ]);

        let err = allocate(&declared, &supplied, counter()).unwrap_err();
        assert!(matches!(err, StrataError::VolumeMountConflict { ref container_path } if container_path == "/data"));
    }

    #[test]
    fn test_replaces_empty_host_path() {
        let declared = vec![mount("data", "/data")];
        let supplied = BTreeMap::from([(String::new(), "/data".to_string())]);

        let allocated = allocate(&declared, &supplied, counter()).unwrap();
        assert_eq!(allocated.len(), 1);
        assert!(!allocated.contains_key(""));
        assert!(allocated.values().all(|c| c == "/data"));
    }

    #[test]
    fn test_skips_docker_and_keeps_custom_mounts() {
        let declared = vec![mount(DOCKER_MOUNT, "/var/run/docker.sock")];
        let supplied = BTreeMap::from([("notebooks".to_string(), "/work".to_string())]);

        let allocated = allocate(&declared, &supplied, counter()).unwrap();
        assert_eq!(allocated, supplied);
    }

    #[test]
    fn test_suffix_collisions_retry() {
        let declared = vec![mount("data", "/data"), mount("cache", "/cache")];
        let mut calls = 0;
        let allocated = allocate(&declared, &BTreeMap::new(), || {
            calls += 1;
            // First two draws collide
            if calls <= 2 { "same".to_string() } else { format!("x{}", calls) }
        })
        .unwrap();
        assert_eq!(allocated.len(), 2);
    }
}
