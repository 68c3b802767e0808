//! The git-compatible tree hasher: mirrors a tarball into an in-memory
//! tree, then reduces it with git's blob/tree object hash rules.

use std::collections::BTreeMap;
use std::io::{self, Read};

use digest::Digest;
use hashbrown::HashMap;
use sha1::Sha1;
use sha2::Sha256;

use crate::error::{ExtractError, HashError, TarError};
use crate::header::{EntryType, Header};
use crate::reader::TarReader;

/// The two hash functions git itself supports for tree objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    GitSha1,
    GitSha256,
}

impl HashAlgorithm {
    pub fn parse(s: &str) -> Result<Self, HashError> {
        match s {
            "git-sha1" => Ok(HashAlgorithm::GitSha1),
            "git-sha256" => Ok(HashAlgorithm::GitSha256),
            other => Err(HashError::UnknownAlgorithm(other.to_string())),
        }
    }
}

enum RunningHash {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl RunningHash {
    fn new(algo: HashAlgorithm) -> Self {
        match algo {
            HashAlgorithm::GitSha1 => RunningHash::Sha1(Sha1::new()),
            HashAlgorithm::GitSha256 => RunningHash::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            RunningHash::Sha1(h) => Digest::update(h, data),
            RunningHash::Sha256(h) => Digest::update(h, data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            RunningHash::Sha1(h) => h.finalize().to_vec(),
            RunningHash::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

fn git_object_hash(algo: HashAlgorithm, kind: &str, body: &[u8]) -> Vec<u8> {
    let mut h = RunningHash::new(algo);
    h.update(kind.as_bytes());
    h.update(b" ");
    h.update(body.len().to_string().as_bytes());
    h.update(b"\0");
    h.update(body);
    h.finalize()
}

#[must_use]
pub fn blob_hash(algo: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    git_object_hash(algo, "blob", data)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

enum TreeNode {
    Dir(BTreeMap<String, TreeNode>),
    Leaf { mode: &'static str, hash: Vec<u8> },
}

fn ensure_dir<'a>(root: &'a mut TreeNode, components: &[&str]) -> &'a mut BTreeMap<String, TreeNode> {
    let mut current = match root {
        TreeNode::Dir(m) => m,
        TreeNode::Leaf { .. } => unreachable!("root is always a directory"),
    };
    for comp in components {
        let entry = current
            .entry((*comp).to_string())
            .or_insert_with(|| TreeNode::Dir(BTreeMap::new()));
        if !matches!(entry, TreeNode::Dir(_)) {
            *entry = TreeNode::Dir(BTreeMap::new());
        }
        current = match entry {
            TreeNode::Dir(m) => m,
            TreeNode::Leaf { .. } => unreachable!(),
        };
    }
    current
}

fn ensure_directory(root: &mut TreeNode, path: &str) {
    if path == "." {
        return;
    }
    let parts: Vec<&str> = path.split('/').collect();
    let _ = ensure_dir(root, &parts);
}

fn insert_leaf(root: &mut TreeNode, path: &str, leaf: TreeNode) {
    if path == "." {
        return;
    }
    let parts: Vec<&str> = path.split('/').collect();
    let (last, dirs) = parts.split_last().expect("path is non-empty");
    let map = ensure_dir(root, dirs);
    map.insert((*last).to_string(), leaf);
}

/// Recursively drops directories that (after their own pruning) contain no
/// files or symlinks, reproducing git's behavior of never hashing an empty
/// subtree into its parent. The root itself is never dropped.
fn prune_empty(node: &mut TreeNode) -> bool {
    match node {
        TreeNode::Leaf { .. } => false,
        TreeNode::Dir(map) => {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                let drop_it = {
                    let child = map.get_mut(&key).expect("key just read from this map");
                    prune_empty(child)
                };
                if drop_it {
                    map.remove(&key);
                }
            }
            map.is_empty()
        }
    }
}

fn sort_key(name: &str, node: &TreeNode) -> String {
    match node {
        TreeNode::Dir(_) => format!("{name}/"),
        TreeNode::Leaf { .. } => name.to_string(),
    }
}

fn hash_node(algo: HashAlgorithm, node: &TreeNode) -> Vec<u8> {
    match node {
        TreeNode::Leaf { hash, .. } => hash.clone(),
        TreeNode::Dir(map) => {
            let mut entries: Vec<(&String, &TreeNode)> = map.iter().collect();
            entries.sort_by(|(a, na), (b, nb)| sort_key(a, na).cmp(&sort_key(b, nb)));

            let mut body = Vec::new();
            for (name, child) in entries {
                let (mode, raw_hash) = match child {
                    TreeNode::Leaf { mode, hash } => (*mode, hash.clone()),
                    TreeNode::Dir(_) => ("40000", hash_node(algo, child)),
                };
                body.extend_from_slice(mode.as_bytes());
                body.push(b' ');
                body.extend_from_slice(name.as_bytes());
                body.push(0);
                body.extend_from_slice(&raw_hash);
            }
            git_object_hash(algo, "tree", &body)
        }
    }
}

fn mode_string(mode: u16) -> &'static str {
    if mode & 0o100 != 0 {
        "100755"
    } else {
        "100644"
    }
}

/// Streams `source`, builds the logical file tree it implies, and reduces
/// it to a hex-encoded git tree hash.
pub fn tree_hash<R: Read>(
    source: R,
    algo: HashAlgorithm,
    skip_empty: bool,
    mut predicate: Option<Box<dyn FnMut(&Header) -> bool>>,
) -> Result<String, TarError> {
    let mut reader = TarReader::new(source);
    let mut root = TreeNode::Dir(BTreeMap::new());
    let mut file_hashes: HashMap<String, Vec<u8>> = HashMap::new();

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
                ensure_directory(&mut root, header.path.as_str());
            }
            EntryType::Symlink => {
                let target = header.link.clone().unwrap_or_default();
                let hash = blob_hash(algo, target.as_bytes());
                insert_leaf(
                    &mut root,
                    header.path.as_str(),
                    TreeNode::Leaf { mode: "120000", hash },
                );
            }
            EntryType::HardLink => {
                let target = header.link.clone().unwrap_or_default();
                let hash = file_hashes.get(&target).cloned().ok_or_else(|| {
                    TarError::Extract(ExtractError::HardlinkUnknownTarget {
                        link: header.path.as_str().into(),
                        target: target.clone().into(),
                    })
                })?;
                insert_leaf(
                    &mut root,
                    header.path.as_str(),
                    TreeNode::Leaf {
                        mode: mode_string(header.mode),
                        hash,
                    },
                );
            }
            EntryType::File => {
                let mut buf = Vec::with_capacity(header.size.max(0) as usize);
                io::copy(&mut reader, &mut buf)?;
                let hash = blob_hash(algo, &buf);
                file_hashes.insert(header.path.as_str().to_string(), hash.clone());
                insert_leaf(
                    &mut root,
                    header.path.as_str(),
                    TreeNode::Leaf {
                        mode: mode_string(header.mode),
                        hash,
                    },
                );
            }
            other => return Err(TarError::UnsupportedEntry(other)),
        }

        reader.finish_entry()?;
    }

    if skip_empty {
        prune_empty(&mut root);
    }

    Ok(to_hex(&hash_node(algo, &root)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer;

    #[test]
    fn empty_tree_matches_git_sha1() {
        let mut out = Vec::new();
        writer::write_directory_entry(&mut out, ".").unwrap();
        writer::write_end_of_archive(&mut out);

        let hash = tree_hash(io::Cursor::new(out), HashAlgorithm::GitSha1, true, None).unwrap();
        assert_eq!(hash, "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn empty_tree_matches_git_sha256() {
        let mut out = Vec::new();
        writer::write_directory_entry(&mut out, ".").unwrap();
        writer::write_end_of_archive(&mut out);

        let hash = tree_hash(io::Cursor::new(out), HashAlgorithm::GitSha256, true, None).unwrap();
        assert_eq!(
            hash,
            "6ef19b41225c5369f1c104d45d8d85efa9b057b53b14b4b9b939dd74decc5321"
        );
    }

    #[test]
    fn hardlink_matches_plain_file_hash() {
        let mut out_a = Vec::new();
        writer::write_directory_entry(&mut out_a, ".").unwrap();
        writer::write_file_entry(&mut out_a, "a", 0o644, b"shared content").unwrap();
        writer::write_file_entry(&mut out_a, "b", 0o644, b"shared content").unwrap();
        writer::write_end_of_archive(&mut out_a);
        let plain = tree_hash(io::Cursor::new(out_a), HashAlgorithm::GitSha1, false, None).unwrap();

        let mut out_b = Vec::new();
        writer::write_directory_entry(&mut out_b, ".").unwrap();
        writer::write_file_entry(&mut out_b, "a", 0o644, b"shared content").unwrap();
        writer::write_hardlink_entry(&mut out_b, "b", "a").unwrap();
        writer::write_end_of_archive(&mut out_b);
        let hardlinked = tree_hash(io::Cursor::new(out_b), HashAlgorithm::GitSha1, false, None).unwrap();

        assert_eq!(plain, hardlinked);
    }

    #[test]
    fn skip_empty_prunes_childless_directories() {
        let mut out = Vec::new();
        writer::write_directory_entry(&mut out, ".").unwrap();
        writer::write_directory_entry(&mut out, "empty").unwrap();
        writer::write_end_of_archive(&mut out);

        let pruned = tree_hash(io::Cursor::new(out.clone()), HashAlgorithm::GitSha1, true, None).unwrap();
        assert_eq!(pruned, "4b825dc642cb6eb9a060e54bf8d69288fbee4904");

        let unpruned = tree_hash(io::Cursor::new(out), HashAlgorithm::GitSha1, false, None).unwrap();
        assert_ne!(unpruned, pruned);
    }
}
