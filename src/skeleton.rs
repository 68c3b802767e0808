//! The skeleton mechanism: a tarball whose file data regions are recorded
//! as zero bytes so the exact header byte layout (including PAX/GNU
//! choices) can be replayed later, substituting real file contents back in
//! from an on-disk tree.
//!
//! Capture happens inline in [`crate::extract::extract`] via
//! [`crate::reader::TarReader::enable_tee`]; this module owns the shared
//! magic prefix and the replay (writer) half.

use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::TarError;
use crate::fs_host::HostFs;
use crate::header::EntryType;
use crate::reader::TarReader;

/// `"%!skeleton:"` (11 ASCII bytes) followed by the four bytes `83 E6 A8
/// FE`: 15 bytes total, written once at the start of every skeleton
/// stream, ahead of the teed tar blocks.
pub const SKELETON_MAGIC: [u8; 15] = *b"%!skeleton:\x83\xE6\xA8\xfe";

/// Replays a skeleton stream, substituting real file contents read from
/// `tree_root` for the zero-filled regions recorded at capture time, and
/// writes the reconstructed tarball to `out`.
///
/// Every byte of the teed stream other than the zero-filled data regions —
/// standard headers, and any preceding PAX/GNU extension blocks — passes
/// through unchanged. Headers are never reparsed into a [`crate::header::Header`]
/// and re-emitted through [`writer::write_entry`]: doing so would lose any
/// encoding the writer doesn't itself produce (GNU long-name/long-link
/// blocks, PAX keys outside `path`/`linkpath`/`size`). [`TarReader`] is used
/// only to locate each entry's data-region offset and length within the
/// teed bytes; the bytes it parses are never written back out.
pub fn replay_skeleton<S: Read, W: Write>(
    mut skeleton: S,
    tree_root: &Path,
    host: &dyn HostFs,
    out: &mut W,
) -> Result<(), TarError> {
    let mut magic = [0u8; SKELETON_MAGIC.len()];
    skeleton.read_exact(&mut magic)?;
    if magic != SKELETON_MAGIC {
        return Err(TarError::NotASkeleton);
    }

    let mut body = Vec::new();
    skeleton.read_to_end(&mut body)?;

    let mut data_regions = Vec::new();
    {
        let mut reader = TarReader::new(io::Cursor::new(&body));
        loop {
            let Some(entry) = reader.next_entry()? else {
                break;
            };
            if let Some(err) = entry.deferred_error {
                return Err(err);
            }
            let header = entry.header;
            if header.entry_type == EntryType::File && header.size > 0 {
                let offset = reader.position();
                data_regions.push((offset, header.path.as_str().to_string(), header.size));
            }
            reader.finish_entry()?;
        }
    }

    for (offset, path, size) in data_regions {
        let data = host.read(&tree_root.join(&path))?;
        if data.len() as i64 != size {
            return Err(TarError::CallbackProtocolError {
                advanced: data.len() as u64,
                expected: size as u64,
            });
        }
        let start = offset as usize;
        body[start..start + data.len()].copy_from_slice(&data);
    }

    out.write_all(&body)?;
    Ok(())
}
