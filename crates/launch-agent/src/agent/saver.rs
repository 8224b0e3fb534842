//! Storage for files attached to failed run queue items.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// Persists a file for a run queue item and returns the paths to report.
#[async_trait]
pub trait FileSaver: Send + Sync {
    async fn save(&self, item_id: &str, file_name: &str, contents: &str) -> Result<Vec<String>>;
}

/// Writes files to `root/<item_id>/<file_name>` on local disk.
#[derive(Debug, Clone)]
pub struct LocalFileSaver {
    root: PathBuf,
}

impl LocalFileSaver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileSaver for LocalFileSaver {
    async fn save(&self, item_id: &str, file_name: &str, contents: &str) -> Result<Vec<String>> {
        let dir = self.root.join(sanitize(item_id));
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(sanitize(file_name));
        tokio::fs::write(&path, contents).await?;
        debug!(path = %path.display(), bytes = contents.len(), "Saved run queue item file");
        Ok(vec![path.display().to_string()])
    }
}

/// Keep path components to a single segment.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_under_item_directory() {
        let dir = tempfile::tempdir().unwrap();
        let saver = LocalFileSaver::new(dir.path());

        let paths = saver.save("rqi-1", "error.log", "boom").await.unwrap();

        let expected = dir.path().join("rqi-1").join("error.log");
        assert_eq!(paths, vec![expected.display().to_string()]);
        assert_eq!(std::fs::read_to_string(expected).unwrap(), "boom");
    }

    #[tokio::test]
    async fn path_separators_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let saver = LocalFileSaver::new(dir.path());

        let paths = saver.save("../../etc", "x/y.log", "data").await.unwrap();

        assert!(paths[0].starts_with(&dir.path().display().to_string()));
        assert!(dir.path().join("_.._etc").join("x_y.log").exists());
    }
}
