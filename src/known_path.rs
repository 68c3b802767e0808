//! The reader's running record of every path accepted so far in one
//! streaming pass: used for symlink-attack detection, hardlink target
//! resolution, and the copy-symlinks resolver.

use hashbrown::HashMap;

/// What a previously-seen path turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownPathKind {
    Directory,
    Symlink(String),
    File { size: i64 },
    Other,
}

/// A mapping from normalized path string to [`KnownPathKind`], scoped to one
/// streaming pass over a tarball.
#[derive(Debug, Default)]
pub struct KnownPathMap {
    paths: HashMap<String, KnownPathKind>,
}

impl KnownPathMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            paths: HashMap::new(),
        }
    }

    pub fn insert(&mut self, path: String, kind: KnownPathKind) {
        self.paths.insert(path, kind);
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&KnownPathKind> {
        self.paths.get(path)
    }

    #[must_use]
    pub fn is_plain_file(&self, path: &str) -> Option<i64> {
        match self.paths.get(path) {
            Some(KnownPathKind::File { size }) => Some(*size),
            _ => None,
        }
    }

    /// Returns the first proper-prefix directory component of `path` that is
    /// recorded as a symlink, if any. Used to reject symlink-prefix attacks.
    #[must_use]
    pub fn symlink_prefix_of(&self, path: &str) -> Option<&str> {
        let mut end = 0usize;
        for (i, b) in path.bytes().enumerate() {
            if b == b'/' {
                let prefix = &path[..i];
                if let Some(KnownPathKind::Symlink(_)) = self.paths.get(prefix) {
                    return Some(prefix);
                }
                end = i;
            }
        }
        let _ = end;
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KnownPathKind)> {
        self.paths.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_symlink_prefix() {
        let mut map = KnownPathMap::new();
        map.insert("link".into(), KnownPathKind::Symlink("/tmp".into()));
        assert_eq!(map.symlink_prefix_of("link/attack"), Some("link"));
        assert_eq!(map.symlink_prefix_of("other/attack"), None);
    }

    #[test]
    fn plain_file_lookup() {
        let mut map = KnownPathMap::new();
        map.insert("a".into(), KnownPathKind::File { size: 1000 });
        assert_eq!(map.is_plain_file("a"), Some(1000));
        assert_eq!(map.is_plain_file("b"), None);
    }
}
