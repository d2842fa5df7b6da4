use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ArchivePath, FileInfo, PieceSpec};

/// A predicate over archive paths, used both at the subscription boundary
/// (what a subscriber wants) and on the wire (what a peer still wants).
///
/// Three shapes: everything, a directory subtree, or one exact file. The
/// derived order (shape first, then path) makes filters usable as map keys.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, Default,
)]
pub enum Filter {
    /// Matches no path at all. The filter a pure source advertises.
    #[default]
    Nothing,
    /// Matches every path.
    Everything,
    /// Matches every path below the given directory.
    Subtree(ArchivePath),
    /// Matches exactly one path.
    File(ArchivePath),
}

#[derive(thiserror::Error, Debug)]
#[error("invalid filter expression {0:?}: {1}")]
pub struct FilterParseError(String, crate::archive_path::PathError);

impl Filter {
    pub fn matches(&self, path: &ArchivePath) -> bool {
        match self {
            Filter::Nothing => false,
            Filter::Everything => true,
            Filter::Subtree(prefix) => path.starts_with(prefix),
            Filter::File(exact) => path == exact,
        }
    }

    /// Whether this filter's match-set is a superset of `other`'s.
    pub fn includes(&self, other: &Filter) -> bool {
        match (self, other) {
            (_, Filter::Nothing) => true,
            (Filter::Nothing, _) => false,
            (Filter::Everything, _) => true,
            (_, Filter::Everything) => false,
            (Filter::Subtree(p), Filter::Subtree(q)) => q.starts_with(p),
            (Filter::Subtree(p), Filter::File(f)) => f.starts_with(p),
            (Filter::File(_), Filter::Subtree(_)) => false,
            (Filter::File(a), Filter::File(b)) => a == b,
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Nothing => f.write_str("!"),
            Filter::Everything => f.write_str("**"),
            Filter::Subtree(p) => write!(f, "{p}/"),
            Filter::File(p) => write!(f, "{p}"),
        }
    }
}

impl std::str::FromStr for Filter {
    type Err = FilterParseError;

    /// `**` is everything, `!` nothing, a trailing `/` selects a subtree,
    /// anything else an exact file.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "!" => return Ok(Filter::Nothing),
            "**" => return Ok(Filter::Everything),
            _ => {}
        }
        let parse =
            |p: &str| ArchivePath::new(p).map_err(|e| FilterParseError(s.to_string(), e));
        match s.strip_suffix('/') {
            Some(prefix) => Ok(Filter::Subtree(parse(prefix)?)),
            None => Ok(Filter::File(parse(s)?)),
        }
    }
}

/// What a subscriber still wants: a disjunction of filters.
///
/// Exact-file filters are dropped as their files arrive; the predicate
/// "matches nothing" once every desired file has been received.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct Predicate {
    filters: BTreeSet<Filter>,
}

impl Predicate {
    pub fn nothing() -> Self {
        Self::default()
    }

    pub fn everything() -> Self {
        Self::from_filters([Filter::Everything])
    }

    pub fn from_filters(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self {
            filters: filters
                .into_iter()
                .filter(|f| !matches!(f, Filter::Nothing))
                .collect(),
        }
    }

    pub fn filters(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter()
    }

    pub fn add(&mut self, filter: Filter) {
        if !matches!(filter, Filter::Nothing) {
            self.filters.insert(filter);
        }
    }

    pub fn matches_path(&self, path: &ArchivePath) -> bool {
        self.filters.iter().any(|f| f.matches(path))
    }

    pub fn matches_info(&self, info: &FileInfo) -> bool {
        self.matches_path(&info.id.path)
    }

    pub fn matches_spec(&self, spec: &PieceSpec) -> bool {
        self.matches_path(&spec.info.id.path)
    }

    /// Called when `info`'s file has been fully received; drops exact-file
    /// filters satisfied by it. Returns true if anything was removed.
    pub fn remove_if_possible(&mut self, info: &FileInfo) -> bool {
        let target = Filter::File(info.id.path.clone());
        self.filters.remove(&target)
    }

    pub fn matches_nothing(&self) -> bool {
        self.filters.is_empty()
    }

    /// One filter wide enough to cover the whole predicate, for contexts
    /// that carry a single filter (the peer handshake).
    pub fn covering_filter(&self) -> Filter {
        let mut iter = self.filters.iter();
        match (iter.next(), iter.next()) {
            (None, _) => Filter::Nothing,
            (Some(f), None) => f.clone(),
            (Some(_), Some(_)) => Filter::Everything,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ArchivePath {
        ArchivePath::new(s).unwrap()
    }

    fn filter(s: &str) -> Filter {
        s.parse().unwrap()
    }

    #[test]
    fn test_matches() {
        assert!(filter("**").matches(&path("a/b")));
        assert!(!filter("!").matches(&path("a/b")));
        assert!(filter("DATA/").matches(&path("DATA/sub/c")));
        assert!(!filter("DATA/").matches(&path("DATA2/c")));
        assert!(filter("DATA/a").matches(&path("DATA/a")));
        assert!(!filter("DATA/a").matches(&path("DATA/a/b")));
    }

    #[test]
    fn test_includes() {
        let all = filter("**");
        let tree = filter("DATA/");
        let sub = filter("DATA/sub/");
        let file = filter("DATA/sub/c");
        assert!(all.includes(&tree) && all.includes(&file) && all.includes(&all));
        assert!(tree.includes(&sub) && tree.includes(&file));
        assert!(!sub.includes(&tree));
        assert!(!file.includes(&tree));
        assert!(file.includes(&file));
        assert!(tree.includes(&filter("!")));
        assert!(!filter("!").includes(&file));
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["!", "**", "DATA/", "DATA/sub/c"] {
            assert_eq!(filter(s).to_string(), s);
        }
    }

    #[test]
    fn test_predicate_removal() {
        let mut p = Predicate::from_filters([filter("DATA/a"), filter("DATA/b")]);
        let info = FileInfo::new(
            crate::FileId {
                path: path("DATA/a"),
                time: crate::ArchiveTime::from_millis(1),
            },
            3,
            2,
            -1,
        )
        .unwrap();
        assert!(p.matches_info(&info));
        assert!(p.remove_if_possible(&info));
        assert!(!p.matches_info(&info));
        assert!(!p.remove_if_possible(&info));
        assert!(!p.matches_nothing());

        let info_b = FileInfo::new(
            crate::FileId {
                path: path("DATA/b"),
                time: crate::ArchiveTime::from_millis(1),
            },
            3,
            2,
            -1,
        )
        .unwrap();
        p.remove_if_possible(&info_b);
        assert!(p.matches_nothing());
    }

    #[test]
    fn test_predicate_subtree_never_drained() {
        let mut p = Predicate::from_filters([filter("DATA/")]);
        let info = FileInfo::new(
            crate::FileId {
                path: path("DATA/a"),
                time: crate::ArchiveTime::from_millis(1),
            },
            3,
            2,
            -1,
        )
        .unwrap();
        assert!(!p.remove_if_possible(&info));
        assert!(!p.matches_nothing());
    }
}
