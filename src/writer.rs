//! Writer/creator: walks a file tree and emits a canonical tarball, and
//! provides the low-level single-entry block encoder shared with the
//! rewriter and the skeleton replay path.

use std::io::{self, Read, Write};
use std::path::Path;

use relative_path::RelativePathBuf;

use crate::block::{self, RawBlock, BLOCK_SIZE, MAX_OCTAL_SIZE};
use crate::error::TarError;
use crate::fs_host::{HostFs, NodeKind};
use crate::header::{EntryType, Header};
use crate::pax;

/// Windows-illegal path bytes, checked in `portable` mode.
const WINDOWS_ILLEGAL_CHARS: &[char] = &['"', '*', ':', '<', '>', '?', '\\', '|'];

const WINDOWS_RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Options accepted by [`create`].
#[derive(Default)]
pub struct CreateOptions<'a> {
    pub predicate: Option<Box<dyn FnMut(&Header) -> bool + 'a>>,
    pub portable: bool,
}

/// Rejects path components containing Windows-illegal characters, control
/// bytes, or reserved device stems (case-insensitive, ignoring extension).
pub fn check_portable(path: &str) -> Result<(), TarError> {
    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }
        if component
            .chars()
            .any(|c| WINDOWS_ILLEGAL_CHARS.contains(&c) || (c as u32) < 0x20)
        {
            return Err(TarError::Portability(format!(
                "path component '{component}' contains a Windows-illegal character"
            )));
        }
        let stem = component.split('.').next().unwrap_or(component);
        if WINDOWS_RESERVED_STEMS
            .iter()
            .any(|r| r.eq_ignore_ascii_case(stem))
        {
            return Err(TarError::Portability(format!(
                "path component '{component}' is a reserved Windows device name"
            )));
        }
    }
    Ok(())
}

/// Splits `path` into ustar `(prefix, name)` fields if it fits without PAX:
/// total length < 256, split at a `/` with `name` ≤ 100 and `prefix` ≤ 155.
fn split_ustar_path(path: &str) -> Option<(String, String)> {
    if path.len() >= 256 {
        return None;
    }
    if path.len() <= 100 {
        return Some((String::new(), path.to_string()));
    }
    let bytes = path.as_bytes();
    for (i, &b) in bytes.iter().enumerate().rev() {
        if b != b'/' {
            continue;
        }
        let prefix = &path[..i];
        let name = &path[i + 1..];
        if !name.is_empty() && name.len() <= 100 && prefix.len() <= 155 {
            return Some((prefix.to_string(), name.to_string()));
        }
    }
    None
}

fn build_standard_block(
    name: &str,
    prefix: &str,
    mode: u16,
    size_field: &[u8; 12],
    typeflag: u8,
    linkname: &str,
) -> RawBlock {
    let mut block = RawBlock::zeroed();
    block::write_null_terminated(&mut block.name, name.as_bytes());
    block::write_null_terminated(&mut block.prefix, prefix.as_bytes());
    block::format_octal_field(u64::from(mode), &mut block.mode);
    block::format_octal_field(0, &mut block.uid);
    block::format_octal_field(0, &mut block.gid);
    block.size = *size_field;
    block::format_octal_field(0, &mut block.mtime);
    block.typeflag = typeflag;
    block::write_null_terminated(&mut block.linkname, linkname.as_bytes());
    block.magic = crate::block::MAGIC_USTAR;
    block.version = crate::block::VERSION_USTAR;
    block.write_checksum();
    block
}

fn write_pax_block<W: Write>(out: &mut W, records: &[(&str, &str)]) -> io::Result<()> {
    let data = pax::encode_pax_block(records);
    let mut size_field = [0u8; 12];
    block::format_octal_field(data.len() as u64, &mut size_field);
    let block = build_standard_block("PaxHeader", "", 0o644, &size_field, b'x', "");
    out.write_all(&block.to_bytes())?;
    out.write_all(&data)?;
    write_padding(out, data.len() as u64)
}

fn write_padding<W: Write>(out: &mut W, len: u64) -> io::Result<()> {
    let pad = block::round_up_512(len) - len;
    if pad > 0 {
        out.write_all(&vec![0u8; pad as usize])
    } else {
        Ok(())
    }
}

/// Writes one logical entry (header plus body) in canonical form, emitting
/// a preceding PAX block when any field needs long/large encoding.
pub fn write_entry<W: Write, R: Read>(
    out: &mut W,
    header: &Header,
    mut body: R,
    portable: bool,
) -> Result<(), TarError> {
    let path = header.path.as_str();
    if portable {
        check_portable(path)?;
    }

    let link = header.link.as_deref().unwrap_or("");
    let need_pax_link = link.len() > 100;
    let ustar_split = split_ustar_path(path);
    let need_pax_path = ustar_split.is_none();
    let need_pax_size = header.size as u64 >= MAX_OCTAL_SIZE;

    let mut records: Vec<(&str, String)> = Vec::new();
    if need_pax_path {
        records.push((pax::PAX_PATH, path.to_string()));
    }
    if need_pax_link {
        records.push((pax::PAX_LINKPATH, link.to_string()));
    }
    if need_pax_size {
        records.push((pax::PAX_SIZE, header.size.to_string()));
    }

    if !records.is_empty() {
        let refs: Vec<(&str, &str)> = records.iter().map(|(k, v)| (*k, v.as_str())).collect();
        write_pax_block(out, &refs)?;
    }

    let (prefix, name) = ustar_split.unwrap_or_default();
    let standard_linkname = if need_pax_link { "" } else { link };

    let mut size_field = [0u8; 12];
    if need_pax_size {
        block::format_binary_size_field(header.size, &mut size_field);
    } else {
        block::format_octal_field(header.size.max(0) as u64, &mut size_field);
    }

    let block = build_standard_block(
        &name,
        &prefix,
        header.mode,
        &size_field,
        header.entry_type.to_typeflag(),
        standard_linkname,
    );
    out.write_all(&block.to_bytes())?;

    if header.size > 0 {
        let copied = io::copy(&mut body, out)?;
        if copied != header.size as u64 {
            return Err(TarError::CallbackProtocolError {
                advanced: copied,
                expected: header.size as u64,
            });
        }
        write_padding(out, copied)?;
    }

    Ok(())
}

/// Writes the two all-zero end-of-archive blocks.
pub fn write_end_of_archive<W: Write>(out: &mut W) {
    let _ = out.write_all(&[0u8; BLOCK_SIZE]);
    let _ = out.write_all(&[0u8; BLOCK_SIZE]);
}

pub fn write_file_entry<W: Write>(
    out: &mut W,
    path: &str,
    mode: u16,
    data: &[u8],
) -> Result<(), TarError> {
    let mut h = Header::new(RelativePathBuf::from(path.to_string()), EntryType::File, mode);
    h.size = data.len() as i64;
    write_entry(out, &h, io::Cursor::new(data), false)
}

pub fn write_directory_entry<W: Write>(out: &mut W, path: &str) -> Result<(), TarError> {
    let h = Header::new(
        RelativePathBuf::from(path.to_string()),
        EntryType::Directory,
        0o755,
    );
    write_entry(out, &h, io::empty(), false)
}

pub fn write_symlink_entry<W: Write>(out: &mut W, path: &str, target: &str) -> Result<(), TarError> {
    let mut h = Header::new(
        RelativePathBuf::from(path.to_string()),
        EntryType::Symlink,
        0o777,
    );
    h.link = Some(target.to_string());
    write_entry(out, &h, io::empty(), false)
}

pub fn write_hardlink_entry<W: Write>(out: &mut W, path: &str, target: &str) -> Result<(), TarError> {
    let mut h = Header::new(
        RelativePathBuf::from(path.to_string()),
        EntryType::HardLink,
        0o644,
    );
    h.link = Some(target.to_string());
    write_entry(out, &h, io::empty(), false)
}

fn normalize_mode(kind: NodeKind, mode: u32, executable: bool) -> u16 {
    match kind {
        NodeKind::File => {
            if executable {
                0o755
            } else {
                0o644
            }
        }
        _ => {
            let _ = mode;
            0o755
        }
    }
}

/// Walks `root` on the host filesystem and writes a canonical tarball.
pub fn create<W: Write>(
    out: &mut W,
    root: &Path,
    host: &dyn HostFs,
    options: &mut CreateOptions<'_>,
) -> Result<(), TarError> {
    let walker = walkdir::WalkDir::new(root).sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| {
            TarError::Io(e.into_io_error().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "directory walk failed")
            }))
        })?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel_str = if rel.as_os_str().is_empty() {
            ".".to_string()
        } else {
            rel.to_string_lossy().replace('\\', "/")
        };

        let meta = match host.lstat(entry.path())? {
            Some(m) => m,
            None => continue,
        };

        let (entry_type, mode, link, size) = match meta.kind {
            NodeKind::Directory => (EntryType::Directory, normalize_mode(meta.kind, meta.mode, false), None, 0),
            NodeKind::Symlink => {
                let target = host.readlink(entry.path())?;
                (
                    EntryType::Symlink,
                    normalize_mode(meta.kind, meta.mode, false),
                    Some(target.to_string_lossy().replace('\\', "/")),
                    0,
                )
            }
            NodeKind::File => {
                let executable = host.is_executable(entry.path())?;
                (
                    EntryType::File,
                    normalize_mode(meta.kind, meta.mode, executable),
                    None,
                    meta.len as i64,
                )
            }
            NodeKind::Other => continue,
        };

        let mut header = Header::new(RelativePathBuf::from(rel_str), entry_type, mode);
        header.size = size;
        header.link = link;

        if let Some(predicate) = options.predicate.as_mut() {
            if !predicate(&header) {
                continue;
            }
        }

        if header.entry_type == EntryType::File && header.size > 0 {
            let data = host.read(entry.path())?;
            write_entry(out, &header, io::Cursor::new(data), options.portable)?;
        } else {
            write_entry(out, &header, io::empty(), options.portable)?;
        }
    }
    write_end_of_archive(out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_windows_name() {
        assert!(check_portable("a/CON.txt").is_err());
        assert!(check_portable("a/con").is_err());
        assert!(check_portable("normal/name.txt").is_ok());
    }

    #[test]
    fn rejects_illegal_windows_char() {
        assert!(check_portable("a/b:c").is_err());
    }

    #[test]
    fn splits_long_path_when_it_fits() {
        let long = format!("{}/{}", "a".repeat(150), "b".repeat(90));
        let (prefix, name) = split_ustar_path(&long).unwrap();
        assert_eq!(name.len(), 90);
        assert_eq!(prefix.len(), 150);
    }

    #[test]
    fn falls_back_to_pax_when_no_fit() {
        let long = format!("{}/{}", "a".repeat(150), "b".repeat(120));
        assert!(split_ustar_path(&long).is_none());
    }

    #[test]
    fn writes_pax_header_for_large_path() {
        let mut out = Vec::new();
        let long_name = "a".repeat(150) + "/" + &"b".repeat(120);
        write_file_entry(&mut out, &long_name, 0o644, &[]).unwrap();
        // First block should be the PAX extension header (typeflag 'x').
        assert_eq!(out[156], b'x');
    }

    #[test]
    fn emits_pax_size_record_and_binary_standard_field() {
        let mut h = Header::new(RelativePathBuf::from("big".to_string()), EntryType::File, 0o644);
        h.size = 1 << 36;
        let mut out2 = Vec::new();
        // Use a cheap non-allocating body: a reader that reports exactly h.size
        // without materializing the bytes, to keep this test fast.
        struct Zeros(u64);
        impl Read for Zeros {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = buf.len().min(self.0 as usize);
                for b in &mut buf[..n] {
                    *b = 0;
                }
                self.0 -= n as u64;
                Ok(n)
            }
        }
        write_entry(&mut out2, &h, Zeros(h.size as u64), false).unwrap();
        // First block is the PAX extension header.
        assert_eq!(out2[156], b'x');
        let pax_size = block::round_up_512(
            pax::encode_pax_block(&[(pax::PAX_SIZE, h.size.to_string().as_str())]).len() as u64,
        );
        let standard_block_offset = BLOCK_SIZE + pax_size as usize;
        assert_eq!(out2[standard_block_offset + 156], b'0');
        assert_eq!(out2[standard_block_offset + 124] & 0x80, 0x80);
    }
}
