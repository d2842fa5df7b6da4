use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// First path component of the hidden subtree holding in-progress files.
pub const HIDDEN_DIR_NAME: &str = ".spate";

/// First path component of the administrative subtree (tracker-distributed
/// files). These travel the data plane like any other file but are not
/// user content.
pub const ADMIN_DIR_NAME: &str = "spate-admin";

#[derive(thiserror::Error, Debug)]
pub enum PathError {
    #[error("archive path is empty")]
    Empty,
    #[error("archive path {0:?} is absolute")]
    Absolute(String),
    #[error("archive path {0:?} contains an invalid component")]
    InvalidComponent(String),
    #[error("path {0:?} is not valid UTF-8")]
    NotUtf8(PathBuf),
    #[error("path {path:?} is not under root {root:?}")]
    NotUnderRoot { root: PathBuf, path: PathBuf },
}

/// A relative, forward-slash separated path identifying a file within the
/// archive. Total-ordered lexicographically on its string form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchivePath(String);

impl ArchivePath {
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_empty() {
            return Err(PathError::Empty);
        }
        if path.starts_with('/') {
            return Err(PathError::Absolute(path));
        }
        for component in path.split('/') {
            match component {
                "" | "." | ".." => return Err(PathError::InvalidComponent(path)),
                c if c.contains(['\\', '\0']) => {
                    return Err(PathError::InvalidComponent(path));
                }
                _ => {}
            }
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn first_component(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Whether this path lies inside the reserved hidden subtree.
    pub fn is_hidden(&self) -> bool {
        self.first_component() == HIDDEN_DIR_NAME
    }

    /// Whether this path lies inside the administrative subtree.
    pub fn is_admin(&self) -> bool {
        self.first_component() == ADMIN_DIR_NAME
    }

    pub fn starts_with(&self, prefix: &ArchivePath) -> bool {
        match self.0.strip_prefix(&prefix.0) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }

    /// Resolves against a filesystem root.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for component in self.components() {
            out.push(component);
        }
        out
    }

    /// Inverse of [`ArchivePath::to_fs_path`].
    pub fn from_fs_path(root: &Path, path: &Path) -> Result<Self, PathError> {
        let rel = path.strip_prefix(root).map_err(|_| PathError::NotUnderRoot {
            root: root.to_path_buf(),
            path: path.to_path_buf(),
        })?;
        let mut out = String::new();
        for component in rel.components() {
            let s = component
                .as_os_str()
                .to_str()
                .ok_or_else(|| PathError::NotUtf8(path.to_path_buf()))?;
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(s);
        }
        Self::new(out)
    }
}

impl TryFrom<String> for ArchivePath {
    type Error = PathError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ArchivePath> for String {
    fn from(value: ArchivePath) -> Self {
        value.0
    }
}

impl std::str::FromStr for ArchivePath {
    type Err = PathError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for ArchivePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        for p in ["a", "DATA/a", "DATA/sub/c", "spate-admin/h:1/Topology"] {
            assert!(ArchivePath::new(p).is_ok(), "{p}");
        }
    }

    #[test]
    fn test_invalid_paths() {
        for p in ["", "/abs", "a//b", "a/./b", "../a", "a/..", "a\\b"] {
            assert!(ArchivePath::new(p).is_err(), "{p}");
        }
    }

    #[test]
    fn test_reserved_subtrees() {
        assert!(ArchivePath::new(".spate/DATA/a").unwrap().is_hidden());
        assert!(ArchivePath::new("spate-admin/t/Topology").unwrap().is_admin());
        assert!(!ArchivePath::new("DATA/a").unwrap().is_hidden());
    }

    #[test]
    fn test_starts_with() {
        let sub = ArchivePath::new("DATA/sub/c").unwrap();
        assert!(sub.starts_with(&ArchivePath::new("DATA").unwrap()));
        assert!(sub.starts_with(&ArchivePath::new("DATA/sub").unwrap()));
        assert!(sub.starts_with(&ArchivePath::new("DATA/sub/c").unwrap()));
        assert!(!sub.starts_with(&ArchivePath::new("DATA/su").unwrap()));
        assert!(!sub.starts_with(&ArchivePath::new("OTHER").unwrap()));
    }

    #[test]
    fn test_fs_round_trip() {
        let root = Path::new("/tmp/archive");
        let p = ArchivePath::new("DATA/sub/c").unwrap();
        let fs = p.to_fs_path(root);
        assert_eq!(ArchivePath::from_fs_path(root, &fs).unwrap(), p);
    }
}
