use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub exchanges_dirname: String,
    pub connections_dirname: String,
    pub contents_dirname: String,
}

impl Default for ArchiveLayout {
    fn default() -> Self {
        Self {
            exchanges_dirname: "exchanges".to_string(),
            connections_dirname: "connections".to_string(),
            contents_dirname: "contents".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePaths {
    pub root: PathBuf,
    pub exchanges_dir: PathBuf,
    pub connections_dir: PathBuf,
    pub contents_dir: PathBuf,
}

impl ArchivePaths {
    pub fn new(root: impl AsRef<Path>, layout: &ArchiveLayout) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            exchanges_dir: root.join(&layout.exchanges_dirname),
            connections_dir: root.join(&layout.connections_dirname),
            contents_dir: root.join(&layout.contents_dirname),
            root,
        }
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.exchanges_dir)?;
        std::fs::create_dir_all(&self.connections_dir)?;
        std::fs::create_dir_all(&self.contents_dir)
    }

    pub fn exchange_file(&self, id: u64) -> PathBuf {
        self.exchanges_dir.join(format!("ex-{id}.json"))
    }

    pub fn connection_file(&self, id: u64) -> PathBuf {
        self.connections_dir.join(format!("con-{id}.json"))
    }

    pub fn request_body_file(&self, id: u64) -> PathBuf {
        self.contents_dir.join(format!("req-{id}.data"))
    }

    pub fn response_body_file(&self, id: u64) -> PathBuf {
        self.contents_dir.join(format!("res-{id}.data"))
    }
}

#[cfg(test)]
mod tests {
    use super::{ArchiveLayout, ArchivePaths};
    use std::path::Path;

    #[test]
    fn archive_paths_join_layout_entries() {
        let paths = ArchivePaths::new("/tmp/tapwire", &ArchiveLayout::default());
        assert_eq!(paths.exchange_file(7), Path::new("/tmp/tapwire/exchanges/ex-7.json"));
        assert_eq!(
            paths.connection_file(3),
            Path::new("/tmp/tapwire/connections/con-3.json")
        );
        assert_eq!(
            paths.request_body_file(7),
            Path::new("/tmp/tapwire/contents/req-7.data")
        );
        assert_eq!(
            paths.response_body_file(7),
            Path::new("/tmp/tapwire/contents/res-7.data")
        );
    }

    #[test]
    fn create_dirs_builds_tree() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArchivePaths::new(dir.path().join("capture"), &ArchiveLayout::default());
        paths.create_dirs().unwrap();
        assert!(paths.exchanges_dir.is_dir());
        assert!(paths.connections_dir.is_dir());
        assert!(paths.contents_dir.is_dir());
    }
}
