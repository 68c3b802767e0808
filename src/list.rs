//! The `list` operation: streams headers out of a tarball without ever
//! touching a filesystem, governed by the same [`TarViolationHandler`]
//! three-way split the reader documents.

use std::io::Read;

use crate::block::BLOCK_SIZE;
use crate::error::TarError;
use crate::header::Header;
use crate::reader::{IgnoreViolationHandler, StrictViolationHandler, TarReader, TarViolationHandler};

/// Options accepted by [`list`].
pub struct ListOptions<'a> {
    /// Retain each entry's raw 512-byte standard header block, reachable
    /// through the callback's second argument.
    pub raw: bool,
    /// Abort on the first tolerated-or-not structural violation instead of
    /// listing the offending entry and continuing.
    pub strict: bool,
    /// Overrides the strict/ignore default with a custom handler, e.g.
    /// [`crate::reader::AuditViolationHandler`].
    pub violation_handler: Option<Box<dyn TarViolationHandler + 'a>>,
    pub callback: Option<Box<dyn FnMut(&Header, Option<&[u8; BLOCK_SIZE]>) + 'a>>,
}

impl Default for ListOptions<'_> {
    fn default() -> Self {
        ListOptions {
            raw: false,
            strict: true,
            violation_handler: None,
            callback: None,
        }
    }
}

/// Streams every entry of `source`, returning the headers encountered in
/// order. Structural violations (symlink attacks, unknown hardlink targets,
/// unsupported entry types) are handled per `options.strict`/
/// `options.violation_handler`; malformed-block errors that leave the
/// stream unparseable always abort regardless of `strict`.
pub fn list<R: Read>(source: R, mut options: ListOptions<'_>) -> Result<Vec<Header>, TarError> {
    let mut reader = TarReader::new(source);
    reader.capture_raw = options.raw;

    let mut default_handler: Box<dyn TarViolationHandler> = if options.strict {
        Box::new(StrictViolationHandler)
    } else {
        Box::new(IgnoreViolationHandler)
    };
    let handler: &mut dyn TarViolationHandler = options
        .violation_handler
        .as_deref_mut()
        .unwrap_or(&mut *default_handler);

    let mut headers = Vec::new();
    loop {
        let Some(entry) = reader.next_entry()? else {
            break;
        };

        if let Some(err) = &entry.deferred_error {
            if !handler.handle(err) {
                return Err(entry.deferred_error.unwrap());
            }
            log::warn!("list: tolerated violation swallowed for {:?}: {err}", entry.header.path.as_str());
        } else if !entry.header.entry_type.is_writable() {
            let err = TarError::UnsupportedEntry(entry.header.entry_type);
            if !handler.handle(&err) {
                return Err(err);
            }
            log::warn!("list: tolerated unsupported entry {:?}", entry.header.path.as_str());
        }

        if let Some(callback) = options.callback.as_mut() {
            callback(&entry.header, entry.raw_header.as_ref());
        }
        headers.push(entry.header);
        reader.finish_entry()?;
    }
    Ok(headers)
}
