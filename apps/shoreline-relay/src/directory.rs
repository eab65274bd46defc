use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read directory file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("directory backend unavailable: {0}")]
    Unavailable(String),
}

/// User directory consulted before routing a call.
///
/// The relay only needs a yes/no answer. A directory that is not
/// authoritative cannot tell "never heard of them" apart from "not
/// connected right now"; the relay then reports both as not-found.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn exists(&self, identity: &str) -> Result<bool, DirectoryError>;

    fn is_authoritative(&self) -> bool;
}

/// Treats every identity as known. Presence is the only source of truth.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl Directory for OpenDirectory {
    async fn exists(&self, _identity: &str) -> Result<bool, DirectoryError> {
        Ok(true)
    }

    fn is_authoritative(&self) -> bool {
        false
    }
}

/// Fixed set of known identities, typically loaded from a file with one
/// identity per line. Blank lines and `#` comments are ignored.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    identities: HashSet<String>,
}

impl StaticDirectory {
    pub fn from_identities<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identities: identities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn parse(contents: &str) -> Self {
        Self::from_identities(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    pub async fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DirectoryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::parse(&contents))
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn exists(&self, identity: &str) -> Result<bool, DirectoryError> {
        Ok(self.identities.contains(identity))
    }

    fn is_authoritative(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    async fn open_directory_knows_everyone() {
        let directory = OpenDirectory;
        assert!(directory.exists("anyone@x").await.expect("lookup"));
        assert!(!directory.is_authoritative());
    }

    #[test_timeout::timeout]
    async fn static_directory_parses_lines() {
        let directory = StaticDirectory::parse("# staff\na@x\n\n  b@x  \n");
        assert_eq!(directory.len(), 2);
        assert!(directory.exists("b@x").await.expect("lookup"));
        assert!(!directory.exists("# staff").await.expect("lookup"));
        assert!(directory.is_authoritative());
    }

    #[test_timeout::timeout]
    async fn missing_file_reports_path() {
        let err = StaticDirectory::from_file(Path::new("/nonexistent/shoreline/users.txt"))
            .await
            .expect_err("missing file");
        assert!(err.to_string().contains("users.txt"));
    }
}
