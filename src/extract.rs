//! The extractor: applies a stream of headers to a filesystem root, with
//! symlink-attack defense, hardlink-as-copy, and an optional cycle-safe
//! copy-symlinks resolver.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{ExtractError, TarError};
use crate::fs_host::{HostFs, NodeKind};
use crate::header::{EntryType, Header};
use crate::known_path::KnownPathKind;
use crate::reader::TarReader;
use crate::skeleton;

/// Whether the extractor creates real symlinks or copies through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySymlinks {
    True,
    False,
    Auto,
}

pub struct ExtractOptions<'a> {
    pub predicate: Option<Box<dyn FnMut(&Header) -> bool + 'a>>,
    pub skeleton_sink: Option<&'a mut dyn Write>,
    pub copy_symlinks: CopySymlinks,
    pub set_permissions: bool,
}

impl Default for ExtractOptions<'_> {
    fn default() -> Self {
        ExtractOptions {
            predicate: None,
            skeleton_sink: None,
            copy_symlinks: CopySymlinks::False,
            set_permissions: true,
        }
    }
}

fn joined_system_path(root: &Path, rel: &str) -> Result<PathBuf, TarError> {
    let candidate = if rel == "." {
        root.to_path_buf()
    } else {
        root.join(rel)
    };
    // `rel` was already normalized by the reader (no `..` components), so
    // this is a defense-in-depth assertion rather than the primary guard.
    if !candidate.starts_with(root) {
        return Err(ExtractError::PathEscapesRoot(candidate).into());
    }
    Ok(candidate)
}

fn ensure_parent(host: &dyn HostFs, path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    match host.lstat(parent)? {
        Some(meta) if meta.kind == NodeKind::Directory => Ok(()),
        Some(_) => {
            host.remove_all(parent)?;
            host.mkpath(parent)
        }
        None => host.mkpath(parent),
    }
}

fn compute_extracted_mode(current_mode: u32, hdr_mode: u16) -> u32 {
    let base = (hdr_mode as u32) & current_mode;
    if hdr_mode & 0o100 != 0 {
        base | 0o100 | ((current_mode & 0o444) >> 2)
    } else {
        base
    }
}

/// Applies `source`'s entries to `root`. Creates `root` if it does not
/// already exist, and removes it on failure in that case only.
pub fn extract<R: io::Read>(
    source: R,
    root: &Path,
    host: &dyn HostFs,
    mut options: ExtractOptions<'_>,
) -> Result<(), TarError> {
    if options.predicate.is_some() && options.skeleton_sink.is_some() {
        return Err(TarError::PredicateMisuse);
    }

    let root_preexisted = host.stat(root)?.is_some();
    if !root_preexisted {
        host.mkpath(root)?;
    }

    let result = extract_inner(source, root, host, &mut options);

    if result.is_err() && !root_preexisted {
        let _ = host.remove_all(root);
    }
    result
}

fn extract_inner<R: io::Read>(
    source: R,
    root: &Path,
    host: &dyn HostFs,
    options: &mut ExtractOptions<'_>,
) -> Result<(), TarError> {
    let mut reader = TarReader::new(source);
    if options.skeleton_sink.is_some() {
        reader.enable_tee();
    }

    let resolved_copy_symlinks = match options.copy_symlinks {
        CopySymlinks::True => true,
        CopySymlinks::False => false,
        CopySymlinks::Auto => host.can_symlink(root),
    };

    loop {
        let Some(entry) = reader.next_entry()? else {
            break;
        };
        let header = entry.header;

        if let Some(predicate) = options.predicate.as_mut() {
            if !predicate(&header) {
                reader.skip_entry()?;
                continue;
            }
        }

        if let Some(err) = entry.deferred_error {
            return Err(err);
        }

        apply_entry(&mut reader, &header, root, host, options.set_permissions)?;
        reader.finish_entry()?;
    }

    if resolved_copy_symlinks {
        resolve_copy_symlinks(reader.known_paths(), root, host)?;
    }

    if let Some(sink) = options.skeleton_sink.as_mut() {
        sink.write_all(&skeleton::SKELETON_MAGIC)?;
        sink.write_all(&reader.take_tee())?;
    }

    Ok(())
}

fn apply_entry<R: io::Read>(
    reader: &mut TarReader<R>,
    header: &Header,
    root: &Path,
    host: &dyn HostFs,
    set_permissions: bool,
) -> Result<(), TarError> {
    let rel = header.path.as_str();
    let sys_path = joined_system_path(root, rel)?;
    log::debug!("extract: path={rel:?} type={:?} size={}", header.entry_type, header.size);

    if rel == "." {
        host.mkpath(&sys_path)?;
        return Ok(());
    }

    ensure_parent(host, &sys_path)?;

    if let Some(existing) = host.lstat(&sys_path)? {
        let both_dirs = existing.kind == NodeKind::Directory && header.entry_type == EntryType::Directory;
        if !both_dirs {
            host.remove_all(&sys_path)?;
        } else {
            return Ok(());
        }
    }

    match header.entry_type {
        EntryType::Directory => {
            host.mkdir(&sys_path)?;
        }
        EntryType::Symlink => {
            // Deferred: materialized or copy-resolved in the post-pass, per
            // the known-path map that already recorded this symlink.
        }
        EntryType::HardLink => {
            let target = header.link.as_deref().unwrap_or_default();
            let target_sys = joined_system_path(root, target)?;
            if target_sys != sys_path {
                host.copy_file(&target_sys, &sys_path)?;
                if set_permissions {
                    apply_permissions(host, &sys_path, header.mode)?;
                }
            }
        }
        EntryType::File => {
            let mut file = host.create_file(&sys_path)?;
            io::copy(reader, &mut file)?;
            if set_permissions {
                apply_permissions(host, &sys_path, header.mode)?;
            }
        }
        other => {
            return Err(TarError::UnsupportedEntry(other));
        }
    }

    Ok(())
}

fn apply_permissions(host: &dyn HostFs, path: &Path, hdr_mode: u16) -> io::Result<()> {
    let current = host.stat(path)?.map(|m| m.mode).unwrap_or(0o644);
    let mode = compute_extracted_mode(current, hdr_mode);
    host.chmod(path, mode)
}

/// Caps the number of chained symlink hops `resolve_link_target` will
/// follow. Threaded explicitly through every recursive call (not a fresh
/// per-call loop counter), so a cycle of any length - including the
/// shortest possible, `A -> B -> A` - terminates instead of recursing
/// forever.
const MAX_SYMLINK_DEPTH: u32 = 64;

/// Resolves a symlink's textual target against its parent directory,
/// rejecting escapes and absolute targets, and following intermediate
/// symlink components recorded in the known-path map.
fn resolve_link_target(
    known_paths: &crate::known_path::KnownPathMap,
    link_path: &str,
    target: &str,
) -> Option<String> {
    resolve_link_target_bounded(known_paths, link_path, target, MAX_SYMLINK_DEPTH)
}

fn resolve_link_target_bounded(
    known_paths: &crate::known_path::KnownPathMap,
    link_path: &str,
    target: &str,
    depth_budget: u32,
) -> Option<String> {
    let depth_budget = depth_budget.checked_sub(1)?;

    if target.starts_with('/') {
        return None;
    }
    let parent = match link_path.rsplit_once('/') {
        Some((p, _)) => p,
        None => "",
    };

    let mut components: Vec<String> = if parent.is_empty() {
        Vec::new()
    } else {
        parent.split('/').map(str::to_string).collect()
    };

    let wants_directory = target == "." || target.ends_with('/') || target.ends_with("/.");

    for comp in target.split('/') {
        match comp {
            "" | "." => continue,
            ".." => {
                if components.pop().is_none() {
                    return None;
                }
            }
            _ => components.push(comp.to_string()),
        }
    }

    let resolved = if components.is_empty() {
        ".".to_string()
    } else {
        components.join("/")
    };

    let link_prefix = format!("{link_path}/");
    if resolved == link_path || resolved.starts_with(link_prefix.as_str()) {
        return None;
    }

    if wants_directory && !matches!(known_paths.get(&resolved), Some(KnownPathKind::Directory)) {
        return None;
    }

    match known_paths.get(&resolved) {
        Some(KnownPathKind::Symlink(next)) => {
            resolve_link_target_bounded(known_paths, &resolved, next, depth_budget)
        }
        _ => Some(resolved),
    }
}

/// Copies symlink targets onto their destination paths in dependency order,
/// so a chain of symlinks resolves to a single concrete copy. Cycles
/// collapse to "neither side materializes" rather than erroring.
fn resolve_copy_symlinks(
    known_paths: &crate::known_path::KnownPathMap,
    root: &Path,
    host: &dyn HostFs,
) -> Result<(), TarError> {
    let mut pending: Vec<(String, String)> = known_paths
        .iter()
        .filter_map(|(path, kind)| match kind {
            KnownPathKind::Symlink(target) => Some((path.to_string(), target.clone())),
            _ => None,
        })
        .collect();

    let mut resolved_targets = std::collections::HashMap::new();
    for (path, target) in &pending {
        let resolved = resolve_link_target(known_paths, path, target);
        resolved_targets.insert(path.clone(), resolved);
    }

    let mut progressed = true;
    while !pending.is_empty() && progressed {
        progressed = false;
        let mut next_round = Vec::new();
        for (path, target) in pending {
            let blocks_someone = {
                let resolved = resolved_targets.get(&path).cloned().flatten();
                match &resolved {
                    Some(r) => {
                        let prefix = format!("{r}/");
                        resolved_targets
                            .values()
                            .flatten()
                            .any(|other| other != r && other.starts_with(prefix.as_str()))
                    }
                    None => false,
                }
            };

            if blocks_someone {
                next_round.push((path, target));
                continue;
            }

            progressed = true;
            if let Some(Some(source_rel)) = resolved_targets.remove(&path) {
                let source_sys = joined_system_path(root, &source_rel)?;
                let dest_sys = joined_system_path(root, &path)?;
                if host.lstat(&source_sys)?.is_some() {
                    host.remove_all(&dest_sys)?;
                    host.copy_file(&source_sys, &dest_sys)?;
                    #[cfg(windows)]
                    crate::fs_host::propagate_mode_windows(host, &dest_sys)?;
                }
            }
        }
        pending = next_round;
    }

    if !pending.is_empty() {
        log::warn!(
            "copy-symlinks: breaking a cycle, leaving {} entries unmaterialized: {:?}",
            pending.len(),
            pending.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_host::StdHostFs;
    use crate::writer;

    fn tmp() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn resolve_link_target_terminates_on_a_two_node_cycle() {
        let mut known = crate::known_path::KnownPathMap::new();
        known.insert("A".to_string(), KnownPathKind::Symlink("B".to_string()));
        known.insert("B".to_string(), KnownPathKind::Symlink("A".to_string()));

        assert_eq!(resolve_link_target(&known, "A", "B"), None);
        assert_eq!(resolve_link_target(&known, "B", "A"), None);
    }

    #[test]
    fn resolve_link_target_rejects_dir_suffix_onto_a_non_directory() {
        let mut known = crate::known_path::KnownPathMap::new();
        known.insert("f".to_string(), KnownPathKind::File { size: 0 });

        assert_eq!(resolve_link_target(&known, "link", "f/"), None);
    }

    #[test]
    fn rejects_symlink_attack() {
        let dir = tmp();
        let mut out = Vec::new();
        writer::write_symlink_entry(&mut out, "link", "/tmp").unwrap();
        writer::write_file_entry(&mut out, "link/attack", 0o644, b"").unwrap();
        writer::write_end_of_archive(&mut out);

        let host = StdHostFs;
        let result = extract(
            io::Cursor::new(out),
            dir.path(),
            &host,
            ExtractOptions::default(),
        );
        assert!(result.is_err());
        assert!(!dir.path().join("link").join("attack").exists());
    }

    #[test]
    fn hardlink_copies_content() {
        let dir = tmp();
        let mut out = Vec::new();
        let content = vec![b'x'; 1000];
        writer::write_file_entry(&mut out, "a", 0o644, &content).unwrap();
        writer::write_hardlink_entry(&mut out, "b", "a").unwrap();
        writer::write_end_of_archive(&mut out);

        let host = StdHostFs;
        extract(
            io::Cursor::new(out),
            dir.path(),
            &host,
            ExtractOptions::default(),
        )
        .unwrap();

        let a = std::fs::read(dir.path().join("a")).unwrap();
        let b = std::fs::read(dir.path().join("b")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1000);
    }

    #[test]
    fn copy_symlinks_cycle_leaves_nothing() {
        let dir = tmp();
        let mut out = Vec::new();
        writer::write_symlink_entry(&mut out, "A", "B").unwrap();
        writer::write_symlink_entry(&mut out, "B", "A").unwrap();
        writer::write_end_of_archive(&mut out);

        let host = StdHostFs;
        let mut options = ExtractOptions::default();
        options.copy_symlinks = CopySymlinks::True;
        extract(io::Cursor::new(out), dir.path(), &host, options).unwrap();

        assert!(!dir.path().join("A").exists());
        assert!(!dir.path().join("B").exists());
    }
}
