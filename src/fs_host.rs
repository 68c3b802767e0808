//! The host filesystem interface used by the extractor and the
//! filesystem-backed writer. Kept as a narrow trait so tests can point it at
//! a throwaway [`tempfile::TempDir`]-rooted real filesystem rather than a
//! mock, and so a future alternate host (e.g. an in-memory filesystem) can
//! be substituted without touching engine logic.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One directory entry as returned by an unsorted `readdir`. The engine
/// itself is responsible for any ordering it needs (see the writer's
/// lexicographic sort).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: std::ffi::OsString,
    pub path: PathBuf,
}

/// What `lstat` found at a path, without following a trailing symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub kind: NodeKind,
    pub len: u64,
    pub mode: u32,
}

/// The filesystem operations the extractor and filesystem writer need.
pub trait HostFs {
    fn lstat(&self, path: &Path) -> io::Result<Option<Metadata>>;
    fn stat(&self, path: &Path) -> io::Result<Option<Metadata>>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
    fn mkdir(&self, path: &Path) -> io::Result<()>;
    fn mkpath(&self, path: &Path) -> io::Result<()>;
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;
    fn readlink(&self, path: &Path) -> io::Result<PathBuf>;
    fn remove_all(&self, path: &Path) -> io::Result<()>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn create_file(&self, path: &Path) -> io::Result<fs::File>;
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;
    fn hard_link(&self, target: &Path, link: &Path) -> io::Result<()>;
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn can_symlink(&self, under: &Path) -> bool;
    fn is_executable(&self, path: &Path) -> io::Result<bool>;
}

/// The production [`HostFs`] implementation, backed directly by `std::fs`
/// and, on Unix, `std::os::unix::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdHostFs;

impl HostFs for StdHostFs {
    fn lstat(&self, path: &Path) -> io::Result<Option<Metadata>> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(to_metadata(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stat(&self, path: &Path) -> io::Result<Option<Metadata>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(to_metadata(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            out.push(DirEntry {
                name: entry.file_name(),
                path: entry.path(),
            });
        }
        Ok(out)
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn mkpath(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, link)
        }
        #[cfg(windows)]
        {
            if target.is_dir() {
                std::os::windows::fs::symlink_dir(target, link)
            } else {
                std::os::windows::fs::symlink_file(target, link)
            }
        }
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn create_file(&self, path: &Path) -> io::Result<fs::File> {
        fs::File::create(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
        }
        #[cfg(not(unix))]
        {
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_readonly(mode & 0o200 == 0);
            fs::set_permissions(path, perms)
        }
    }

    fn hard_link(&self, target: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(target, link)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(from)?;
        if meta.is_dir() {
            copy_dir_recursive(from, to)
        } else {
            fs::copy(from, to)?;
            Ok(())
        }
    }

    fn can_symlink(&self, under: &Path) -> bool {
        let probe_link = under.join(".tartree-symlink-probe");
        let probe_target = under.join(".tartree-symlink-probe-target");
        let ok = self.symlink(&probe_target, &probe_link).is_ok();
        let _ = fs::remove_file(&probe_link);
        ok
    }

    fn is_executable(&self, path: &Path) -> io::Result<bool> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path)?.permissions().mode();
            Ok(mode & 0o111 != 0)
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(false)
        }
    }
}

fn to_metadata(meta: &fs::Metadata) -> Metadata {
    let kind = if meta.file_type().is_symlink() {
        NodeKind::Symlink
    } else if meta.is_dir() {
        NodeKind::Directory
    } else if meta.is_file() {
        NodeKind::File
    } else {
        NodeKind::Other
    };
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    };
    Metadata {
        kind,
        len: meta.len(),
        mode,
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let from_child = entry.path();
        let to_child = to.join(entry.file_name());
        let meta = entry.metadata()?;
        if meta.is_dir() {
            copy_dir_recursive(&from_child, &to_child)?;
        } else if meta.file_type().is_symlink() {
            let target = fs::read_link(&from_child)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &to_child)?;
            #[cfg(windows)]
            {
                if target.is_dir() {
                    std::os::windows::fs::symlink_dir(&target, &to_child)?;
                } else {
                    std::os::windows::fs::symlink_file(&target, &to_child)?;
                }
            }
        } else {
            fs::copy(&from_child, &to_child)?;
        }
    }
    Ok(())
}

/// Recursively propagates mode bits after a `cp`, needed only on Windows
/// where `copy_file`'s directory-copy path does not preserve them.
#[cfg(windows)]
pub fn propagate_mode_windows(host: &dyn HostFs, root: &Path) -> io::Result<()> {
    if let Some(meta) = host.lstat(root)? {
        if meta.kind == NodeKind::Directory {
            for entry in host.read_dir(root)? {
                propagate_mode_windows(host, &entry.path)?;
            }
        }
    }
    Ok(())
}
