use std::path::{Path, PathBuf};

use crate::cache::hasher;
use crate::core::JobSet;

/// Whether a cache's artifact is one file or a directory of files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactLayout {
    SingleFile,
    Directory,
}

/// Filesystem naming for one cache: maps a job set to the artifact path.
///
/// Naming only: this type never decides whether to (re)generate anything.
/// `path()` is pure: same inputs, same path, whether or not it exists yet.
/// Presence of the final path is itself the "fully cached" signal; there is
/// no separate manifest.
pub struct ArtifactStore {
    dir: PathBuf,
    cache_name: String,
    layout: ArtifactLayout,
}

impl ArtifactStore {
    pub fn open(dir: impl Into<PathBuf>, cache_name: &str, layout: ArtifactLayout) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            cache_name: cache_name.to_string(),
            layout,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn layout(&self) -> ArtifactLayout {
        self.layout
    }

    pub fn path(&self, jobs: &JobSet) -> PathBuf {
        self.dir
            .join(format!("{}-{}", self.cache_name, hasher::job_set_digest(jobs)))
    }

    /// staging 路径：scan 先写到这里，全覆盖时才 rename 到最终名字。
    pub fn staging_path(&self, jobs: &JobSet) -> PathBuf {
        let mut name = self.path(jobs).into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    pub fn exists(&self, jobs: &JobSet) -> bool {
        self.path(jobs).exists()
    }

    /// Artifact paths in reply order: the file itself, or the sorted
    /// contents of the artifact directory.
    pub fn artifact_files(&self, jobs: &JobSet) -> anyhow::Result<Vec<PathBuf>> {
        let path = self.path(jobs);
        if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&path)?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            files.sort();
            Ok(files)
        } else {
            Ok(vec![path])
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
