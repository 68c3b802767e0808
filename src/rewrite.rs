//! The rewriter: reads an arbitrary tarball without touching the
//! filesystem and reemits it in this engine's own canonical form via
//! [`crate::writer`].
//!
//! Pass one streams the input once, recording each entry's header and
//! (for files) the byte offset of its data region, via
//! [`crate::reader::TarReader::position`] rather than `Seek`. Pass two,
//! once the reader has been dropped and the source is free again, walks
//! the captured tree in canonical order and seeks to each recorded
//! offset to stream the body through the writer.

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, Write};

use relative_path::RelativePathBuf;

use crate::error::{ExtractError, TarError};
use crate::header::{EntryType, Header};
use crate::reader::TarReader;
use crate::writer;

#[derive(Clone, Copy)]
struct FileLocation {
    offset: u64,
    size: u64,
    mode: u16,
}

enum RwNode {
    Dir(BTreeMap<String, RwNode>, Option<Header>),
    Leaf(Header, Option<u64>),
}

fn ensure_dir_chain<'a>(root: &'a mut RwNode, components: &[&str]) -> &'a mut BTreeMap<String, RwNode> {
    let mut current = match root {
        RwNode::Dir(m, _) => m,
        RwNode::Leaf(..) => unreachable!("root is always a directory"),
    };
    for comp in components {
        let entry = current
            .entry((*comp).to_string())
            .or_insert_with(|| RwNode::Dir(BTreeMap::new(), None));
        if !matches!(entry, RwNode::Dir(..)) {
            *entry = RwNode::Dir(BTreeMap::new(), None);
        }
        current = match entry {
            RwNode::Dir(m, _) => m,
            RwNode::Leaf(..) => unreachable!(),
        };
    }
    current
}

fn insert_directory(root: &mut RwNode, path: &str, header: Header) {
    if path == "." {
        if let RwNode::Dir(_, h) = root {
            *h = Some(header);
        }
        return;
    }
    let parts: Vec<&str> = path.split('/').collect();
    let (last, dirs) = parts.split_last().expect("path is non-empty");
    let map = ensure_dir_chain(root, dirs);
    let entry = map
        .entry((*last).to_string())
        .or_insert_with(|| RwNode::Dir(BTreeMap::new(), None));
    if !matches!(entry, RwNode::Dir(..)) {
        *entry = RwNode::Dir(BTreeMap::new(), None);
    }
    if let RwNode::Dir(_, h) = entry {
        *h = Some(header);
    }
}

fn insert_leaf(root: &mut RwNode, path: &str, header: Header, offset: Option<u64>) {
    let parts: Vec<&str> = path.split('/').collect();
    let (last, dirs) = parts.split_last().expect("path is non-empty");
    let map = ensure_dir_chain(root, dirs);
    map.insert((*last).to_string(), RwNode::Leaf(header, offset));
}

fn sort_key(name: &str, node: &RwNode) -> String {
    match node {
        RwNode::Dir(..) => format!("{name}/"),
        RwNode::Leaf(..) => name.to_string(),
    }
}

fn emit<S: Read + Seek, W: Write>(
    path: &str,
    node: &RwNode,
    source: &mut S,
    out: &mut W,
    portable: bool,
) -> Result<(), TarError> {
    match node {
        RwNode::Dir(map, header) => {
            let own_header = header.clone().unwrap_or_else(|| {
                Header::new(RelativePathBuf::from(path.to_string()), EntryType::Directory, 0o755)
            });
            writer::write_entry(out, &own_header, io::empty(), portable)?;

            let mut entries: Vec<(&String, &RwNode)> = map.iter().collect();
            entries.sort_by(|(a, na), (b, nb)| sort_key(a, na).cmp(&sort_key(b, nb)));
            for (name, child) in entries {
                let child_path = if path == "." {
                    name.clone()
                } else {
                    format!("{path}/{name}")
                };
                emit(&child_path, child, source, out, portable)?;
            }
            Ok(())
        }
        RwNode::Leaf(header, offset) => match offset {
            Some(off) if header.size > 0 => {
                source.seek(io::SeekFrom::Start(*off))?;
                let bounded = source.by_ref().take(header.size as u64);
                writer::write_entry(out, header, bounded, portable)
            }
            _ => writer::write_entry(out, header, io::empty(), portable),
        },
    }
}

/// Reads `source` once, recording header and data-offset information, then
/// seeks back through it to reemit a byte-exact canonical tarball to `out`.
/// `source` must support [`Seek`]; non-seekable sources should go through
/// [`rewrite_buffered`] instead.
pub fn rewrite<S: Read + Seek, W: Write>(
    mut source: S,
    out: &mut W,
    mut predicate: Option<Box<dyn FnMut(&Header) -> bool>>,
    portable: bool,
) -> Result<(), TarError> {
    let mut root = RwNode::Dir(BTreeMap::new(), None);
    let mut file_locations: std::collections::HashMap<String, FileLocation> =
        std::collections::HashMap::new();

    {
        let mut reader = TarReader::new(&mut source);
        loop {
            let Some(entry) = reader.next_entry()? else {
                break;
            };
            let header = entry.header;

            if let Some(p) = predicate.as_mut() {
                if !p(&header) {
                    reader.skip_entry()?;
                    continue;
                }
            }
            if let Some(err) = entry.deferred_error {
                return Err(err);
            }

            match header.entry_type {
                EntryType::Directory => {
                    insert_directory(&mut root, header.path.as_str(), header.clone());
                }
                EntryType::Symlink => {
                    insert_leaf(&mut root, header.path.as_str(), header.clone(), None);
                }
                EntryType::File => {
                    let offset = reader.position();
                    let size = header.size.max(0) as u64;
                    file_locations.insert(
                        header.path.as_str().to_string(),
                        FileLocation {
                            offset,
                            size,
                            mode: header.mode,
                        },
                    );
                    insert_leaf(&mut root, header.path.as_str(), header.clone(), Some(offset));
                }
                EntryType::HardLink => {
                    let target = header.link.clone().unwrap_or_default();
                    let loc = file_locations.get(&target).copied().ok_or_else(|| {
                        TarError::Extract(ExtractError::HardlinkUnknownTarget {
                            link: header.path.as_str().into(),
                            target: target.clone().into(),
                        })
                    })?;
                    let mut synthesized = header.clone();
                    synthesized.entry_type = EntryType::File;
                    synthesized.mode = loc.mode;
                    synthesized.size = loc.size as i64;
                    synthesized.link = None;
                    insert_leaf(&mut root, header.path.as_str(), synthesized, Some(loc.offset));
                }
                other => return Err(TarError::UnsupportedEntry(other)),
            }

            reader.finish_entry()?;
        }
    }

    emit(".", &root, &mut source, out, portable)?;
    writer::write_end_of_archive(out);
    Ok(())
}

/// Buffers a non-seekable `source` into memory first, then rewrites it.
pub fn rewrite_buffered<R: Read, W: Write>(
    mut source: R,
    out: &mut W,
    predicate: Option<Box<dyn FnMut(&Header) -> bool>>,
    portable: bool,
) -> Result<(), TarError> {
    let mut buf = Vec::new();
    io::copy(&mut source, &mut buf)?;
    rewrite(io::Cursor::new(buf), out, predicate, portable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{self, HashAlgorithm};

    #[test]
    fn rewrite_is_idempotent() {
        let mut original = Vec::new();
        writer::write_directory_entry(&mut original, ".").unwrap();
        writer::write_directory_entry(&mut original, "b").unwrap();
        writer::write_file_entry(&mut original, "b/two.txt", 0o644, b"two").unwrap();
        writer::write_file_entry(&mut original, "a.txt", 0o644, b"one").unwrap();
        writer::write_end_of_archive(&mut original);

        let mut once = Vec::new();
        rewrite(io::Cursor::new(original), &mut once, None, false).unwrap();

        let mut twice = Vec::new();
        rewrite(io::Cursor::new(once.clone()), &mut twice, None, false).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn synthesizes_missing_parent_directories() {
        let mut original = Vec::new();
        writer::write_file_entry(&mut original, "deep/nested/file.txt", 0o644, b"x").unwrap();
        writer::write_end_of_archive(&mut original);

        let mut out = Vec::new();
        rewrite(io::Cursor::new(original), &mut out, None, false).unwrap();

        let hash = hash::tree_hash(io::Cursor::new(out), HashAlgorithm::GitSha1, false, None).unwrap();
        assert_eq!(hash.len(), 40);
    }

    #[test]
    fn hardlink_becomes_file_entry_with_target_bytes() {
        let mut original = Vec::new();
        writer::write_file_entry(&mut original, "a", 0o644, b"shared").unwrap();
        writer::write_hardlink_entry(&mut original, "b", "a").unwrap();
        writer::write_end_of_archive(&mut original);

        let mut out = Vec::new();
        rewrite(io::Cursor::new(original), &mut out, None, false).unwrap();

        let mut reader = TarReader::new(io::Cursor::new(out));
        let first = reader.next_entry().unwrap().unwrap();
        assert_eq!(first.header.entry_type, EntryType::File);
        let mut buf = Vec::new();
        io::copy(&mut reader, &mut buf).unwrap();
        assert_eq!(buf, b"shared");
        reader.finish_entry().unwrap();

        let second = reader.next_entry().unwrap().unwrap();
        assert_eq!(second.header.entry_type, EntryType::File);
        assert!(second.header.link.is_none());
        let mut buf2 = Vec::new();
        io::copy(&mut reader, &mut buf2).unwrap();
        assert_eq!(buf2, b"shared");
    }
}
