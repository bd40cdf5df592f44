//! Seed the system catalog from a directory of JSON documents.
//!
//! Every `*.json` file below the root is a service spec, except files in a
//! directory named `vocab`, which hold vocabularies.

use super::validate_spec;
use crate::error::{Result, StrataError};
use crate::graph::DependencyGraph;
use crate::state::StackStore;
use crate::types::{CatalogScope, ServiceSpec, Vocabulary};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory holding vocabulary documents.
pub const VOCAB_DIR: &str = "vocab";

/// What a load pass wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub services: usize,
    pub vocabularies: usize,
    /// Files that could not be parsed or were rejected
    pub skipped: Vec<PathBuf>,
}

/// Load every spec and vocabulary under `dir` into the store.
///
/// Existing system entries with the same key are overwritten. Unparseable
/// files, invalid specs and specs closing a dependency cycle are skipped with
/// a warning; I/O errors abort the load.
pub async fn load_specs(store: &dyn StackStore, dir: &Path) -> Result<LoadSummary> {
    let mut summary = LoadSummary::default();
    let mut pending = vec![dir.to_path_buf()];
    let mut specs: Vec<(PathBuf, ServiceSpec)> = Vec::new();

    while let Some(current) = pending.pop() {
        let vocab = current.file_name().map_or(false, |name| name == VOCAB_DIR);
        for path in read_dir_sorted(&current).await? {
            if path.is_dir() {
                if !vocab {
                    pending.push(path);
                }
                continue;
            }
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| StrataError::IoError { path: path.clone(), source: e })?;

            if vocab {
                match serde_json::from_slice::<Vocabulary>(&data) {
                    Ok(mut vocabulary) => {
                        if vocabulary.name.is_empty() {
                            vocabulary.name = file_stem(&path);
                        }
                        debug!("Loading vocabulary {}", vocabulary.name);
                        store.put_vocabulary(&vocabulary).await?;
                        summary.vocabularies += 1;
                    }
                    Err(e) => {
                        warn!("Skipping vocabulary {}: {}", path.display(), e);
                        summary.skipped.push(path);
                    }
                }
            } else {
                match serde_json::from_slice::<ServiceSpec>(&data)
                    .map_err(|e| e.to_string())
                    .and_then(|spec| validate_spec(&spec).map(|_| spec).map_err(|e| e.to_string()))
                {
                    Ok(spec) => specs.push((path, spec)),
                    Err(e) => {
                        warn!("Skipping service spec {}: {}", path.display(), e);
                        summary.skipped.push(path);
                    }
                }
            }
        }
    }

    // Each spec is checked against the system catalog it lands in, minus the
    // entries this load replaces, plus the specs accepted before it.
    let mut accepted: Vec<ServiceSpec> = store
        .list_global_services()
        .await?
        .into_iter()
        .filter(|existing| !specs.iter().any(|(_, spec)| spec.key == existing.key))
        .collect();
    for (path, spec) in specs {
        accepted.push(spec);
        if let Err(e) = DependencyGraph::from_catalog(&accepted).validate() {
            accepted.pop();
            warn!("Skipping service spec {}: {}", path.display(), e);
            summary.skipped.push(path);
            continue;
        }
        if let Some(spec) = accepted.last() {
            debug!("Loading service spec {}", spec.key);
            store.put_service_spec(CatalogScope::System, "", spec).await?;
            summary.services += 1;
        }
    }

    info!(
        "Loaded {} service specs and {} vocabularies from {}",
        summary.services,
        summary.vocabularies,
        dir.display()
    );
    Ok(summary)
}

async fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let io_err = |e| StrataError::IoError { path: dir.to_path_buf(), source: e };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn file_stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateManager;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_specs_recursive_with_vocab() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("databases")).unwrap();
        std::fs::create_dir_all(root.join(VOCAB_DIR)).unwrap();

        std::fs::write(root.join("nginx.json"), r#"{"key": "nginx", "image": "nginx:1.25"}"#)
            .unwrap();
        std::fs::write(
            root.join("databases/postgres.json"),
            r#"{"key": "postgres", "image": "postgres:16"}"#,
        )
        .unwrap();
        std::fs::write(root.join("databases/README.md"), "not a spec").unwrap();
        std::fs::write(root.join("broken.json"), "{").unwrap();
        std::fs::write(
            root.join(VOCAB_DIR).join("licenses.json"),
            r#"{"terms": [{"id": "mit", "name": "MIT"}]}"#,
        )
        .unwrap();

        let store = StateManager::new_in_memory().await.unwrap();
        let summary = load_specs(&store, root).await.unwrap();

        assert_eq!(summary.services, 2);
        assert_eq!(summary.vocabularies, 1);
        assert_eq!(summary.skipped.len(), 1);

        let globals = store.list_global_services().await.unwrap();
        let keys: Vec<_> = globals.iter().map(|s| s.key.as_str()).collect();
        assert!(keys.contains(&"nginx"));
        assert!(keys.contains(&"postgres"));

        let vocabulary = store.get_vocabulary("licenses").await.unwrap().unwrap();
        assert_eq!(vocabulary.terms[0].id, "mit");
    }

    #[tokio::test]
    async fn test_invalid_and_cyclic_specs_are_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(
            root.join("a.json"),
            r#"{"key": "a", "image": "busybox", "dependencies": [{"key": "b", "required": true}]}"#,
        )
        .unwrap();
        std::fs::write(
            root.join("b.json"),
            r#"{"key": "b", "image": "busybox", "dependencies": [{"key": "a"}]}"#,
        )
        .unwrap();
        std::fs::write(root.join("c.json"), r#"{"key": "c/d", "image": "busybox"}"#).unwrap();

        let store = StateManager::new_in_memory().await.unwrap();
        let summary = load_specs(&store, root).await.unwrap();

        assert_eq!(summary.services, 1);
        assert_eq!(summary.skipped, vec![root.join("c.json"), root.join("b.json")]);

        let globals = store.list_global_services().await.unwrap();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].key, "a");
    }

    #[tokio::test]
    async fn test_missing_dir_is_io_error() {
        let store = StateManager::new_in_memory().await.unwrap();
        let err = load_specs(&store, Path::new("/nonexistent/strata-specs")).await.unwrap_err();
        assert!(matches!(err, StrataError::IoError { .. }));
    }
}
