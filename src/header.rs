//! The public [`Header`] record, its entry-type taxonomy, and the structural
//! validator that runs after path normalization and hardlink resolution.

use hashbrown::HashMap;
use relative_path::RelativePathBuf;

use crate::error::ValidationError;
use crate::known_path::KnownPathMap;

/// The ustar/PAX/GNU type taxonomy this engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    HardLink,
    Symlink,
    CharDev,
    BlockDev,
    Directory,
    Fifo,
    Other(u8),
}

impl EntryType {
    #[must_use]
    pub fn from_typeflag(b: u8) -> Self {
        match b {
            b'\0' | b'0' => EntryType::File,
            b'1' => EntryType::HardLink,
            b'2' => EntryType::Symlink,
            b'3' => EntryType::CharDev,
            b'4' => EntryType::BlockDev,
            b'5' => EntryType::Directory,
            b'6' => EntryType::Fifo,
            other => EntryType::Other(other),
        }
    }

    #[must_use]
    pub fn to_typeflag(self) -> u8 {
        match self {
            EntryType::File => b'0',
            EntryType::HardLink => b'1',
            EntryType::Symlink => b'2',
            EntryType::CharDev => b'3',
            EntryType::BlockDev => b'4',
            EntryType::Directory => b'5',
            EntryType::Fifo => b'6',
            EntryType::Other(b) => b,
        }
    }

    /// The subset of types this engine can write and extract.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            EntryType::File | EntryType::HardLink | EntryType::Symlink | EntryType::Directory
        )
    }

    #[must_use]
    pub fn carries_link(self) -> bool {
        matches!(self, EntryType::HardLink | EntryType::Symlink)
    }

    #[must_use]
    pub fn is_directory(self) -> bool {
        matches!(self, EntryType::Directory)
    }
}

/// A logical, normalized tar entry. This is the public, wire-format-agnostic
/// record every operation in this crate consumes or produces.
#[derive(Debug, Clone)]
pub struct Header {
    pub path: RelativePathBuf,
    pub entry_type: EntryType,
    pub mode: u16,
    pub size: i64,
    pub link: Option<String>,
    /// PAX/GNU keys other than `path`/`linkpath`/`size`, kept for
    /// introspection (`list(raw=true)`) rather than silently dropped. Local
    /// records win over globals of the same key.
    pub unparsed_extended_attributes: HashMap<String, String>,
}

impl Header {
    #[must_use]
    pub fn new(path: RelativePathBuf, entry_type: EntryType, mode: u16) -> Self {
        Header {
            path,
            entry_type,
            mode,
            size: 0,
            link: None,
            unparsed_extended_attributes: HashMap::new(),
        }
    }
}

/// Removes `.` components and collapses repeated `/`, rejecting absolute
/// paths, embedded NULs, and `..` components. Used for both `Header::path`
/// and (separately, with `..` permitted) symlink target resolution.
pub fn normalize_path(raw: &str) -> Result<String, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    if raw.as_bytes().contains(&0) {
        return Err(ValidationError::PathHasNul);
    }
    if raw.starts_with('/') {
        return Err(ValidationError::PathIsAbsolute(raw.to_string()));
    }
    let mut out: Vec<&str> = Vec::new();
    for comp in raw.split('/') {
        if comp.is_empty() || comp == "." {
            continue;
        }
        if comp == ".." {
            return Err(ValidationError::PathEscapes(raw.to_string()));
        }
        out.push(comp);
    }
    if out.is_empty() {
        // Every component was "." or "/" - e.g. the implicit "." root entry.
        return Ok(".".to_string());
    }
    Ok(out.join("/"))
}

/// Like [`normalize_path`] but permits `..` components, keeping them
/// verbatim: a symlink target legitimately walks above its own directory,
/// and that escape is judged later by the copy-symlinks resolver and the
/// extractor's root check, not by the reader.
pub fn normalize_link(raw: &str) -> Result<String, ValidationError> {
    if raw.as_bytes().contains(&0) {
        return Err(ValidationError::LinkHasNul);
    }
    let absolute = raw.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for comp in raw.split('/') {
        if comp.is_empty() || comp == "." {
            continue;
        }
        out.push(comp);
    }
    let joined = out.join("/");
    Ok(if absolute { format!("/{joined}") } else { joined })
}

/// Runs the full set of structural checks from the data-model section,
/// accumulating every failure it finds and returning the first one (callers
/// that want the complete list can call the individual `check_*` helpers).
pub fn check_header(h: &Header, known_paths: &KnownPathMap) -> Result<(), ValidationError> {
    let path = h.path.as_str();

    if path.as_bytes().contains(&0) {
        return Err(ValidationError::PathHasNul);
    }
    if !h.entry_type.is_directory() {
        if path.ends_with('/') {
            return Err(ValidationError::TrailingSlash(path.to_string()));
        }
        if path == "." || path.ends_with("/.") {
            return Err(ValidationError::DotPath(path.to_string()));
        }
    }

    if h.size < 0 {
        return Err(ValidationError::NegativeSize(h.size));
    }
    if !matches!(h.entry_type, EntryType::File | EntryType::HardLink) && h.size != 0 {
        return Err(ValidationError::NonZeroSizeForType {
            entry_type: h.entry_type,
            size: h.size,
        });
    }

    match (h.entry_type.carries_link(), &h.link) {
        (true, None) => return Err(ValidationError::EmptyLink(h.entry_type)),
        (true, Some(link)) => {
            if link.is_empty() {
                return Err(ValidationError::EmptyLink(h.entry_type));
            }
            if link.as_bytes().contains(&0) {
                return Err(ValidationError::LinkHasNul);
            }
            if h.entry_type == EntryType::HardLink {
                if link.starts_with('/') {
                    return Err(ValidationError::HardlinkAbsolute(link.clone()));
                }
                if link.split('/').any(|c| c == "..") {
                    return Err(ValidationError::HardlinkEscapes(link.clone()));
                }
                if known_paths.is_plain_file(link).is_none() {
                    // Surfaced by the reader as HardlinkUnknownTarget; the
                    // validator only enforces the syntactic shape of `link`.
                }
            }
        }
        (false, Some(_)) => return Err(ValidationError::UnexpectedLink(h.entry_type)),
        (false, None) => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dot_and_slashes() {
        assert_eq!(normalize_path("./a//b/./c").unwrap(), "a/b/c");
    }

    #[test]
    fn rejects_dotdot() {
        assert!(normalize_path("a/../b").is_err());
    }

    #[test]
    fn rejects_absolute() {
        assert!(normalize_path("/a/b").is_err());
    }

    #[test]
    fn root_dot_normalizes_to_dot() {
        assert_eq!(normalize_path(".").unwrap(), ".");
    }

    #[test]
    fn validates_hardlink_shape() {
        let known = KnownPathMap::new();
        let mut h = Header::new(
            RelativePathBuf::from("b".to_string()),
            EntryType::HardLink,
            0o644,
        );
        h.link = Some("/abs".to_string());
        assert!(check_header(&h, &known).is_err());
    }
}
