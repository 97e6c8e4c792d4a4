//! Write-access checks for the directories the cache needs.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

/// Which directory is affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessArea {
    Config,
    Cache,
}

impl fmt::Display for AccessArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Config => "config",
            Self::Cache => "cache",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessProblem {
    pub area: AccessArea,
    /// The directory that was probed.
    pub path: PathBuf,
}

impl fmt::Display for AccessProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} directory `{}` is not writable", self.area, self.path.display())
    }
}

/// Probes each directory, or the nearest existing ancestor that would be
/// used to create it. The config dir may be created one level down; the
/// cache dir two.
pub async fn verify_access(config_dir: &Path, cache_dir: &Path) -> Vec<AccessProblem> {
    let mut problems = Vec::new();
    if let Some(path) = unwritable(config_dir, 1).await {
        problems.push(AccessProblem {
            area: AccessArea::Config,
            path,
        });
    }
    if let Some(path) = unwritable(cache_dir, 2).await {
        problems.push(AccessProblem {
            area: AccessArea::Cache,
            path,
        });
    }
    problems
}

async fn unwritable(dir: &Path, max_ancestors: usize) -> Option<PathBuf> {
    let mut candidate = dir;
    for _ in 0..max_ancestors {
        if is_dir(candidate).await {
            break;
        }
        match candidate.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => candidate = parent,
            _ => break,
        }
    }
    if is_dir(candidate).await && probe_write(candidate).await {
        None
    } else {
        Some(candidate.to_path_buf())
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
}

async fn probe_write(dir: &Path) -> bool {
    let probe = dir.join(format!(".sitecache-probe-{}", Uuid::new_v4().simple()));
    match fs::write(&probe, b"").await {
        Ok(()) => {
            let _ = fs::remove_file(&probe).await;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_writable_dirs_pass() {
        let dir = tempfile::tempdir().expect("tempdir");
        let problems = verify_access(dir.path(), dir.path()).await;
        assert!(problems.is_empty(), "{problems:?}");
    }

    #[tokio::test]
    async fn missing_dirs_fall_back_to_writable_ancestor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("config");
        let cache = dir.path().join("cache").join("pages");
        assert!(verify_access(&config, &cache).await.is_empty());
    }

    #[tokio::test]
    async fn too_deep_missing_dirs_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("a").join("b");
        let cache = dir.path().join("x").join("y").join("z");
        let problems = verify_access(&config, &cache).await;
        let areas: Vec<_> = problems.iter().map(|p| p.area).collect();
        assert_eq!(areas, [AccessArea::Config, AccessArea::Cache]);
    }
}
