//! The tarball reader: streams logical headers from a byte source, applying
//! PAX/GNU overrides, maintaining the known-path map, and enforcing the
//! symlink-attack and hardlink-resolution rules.

use std::io::{self, Read};

use relative_path::RelativePathBuf;

use crate::block::{self, RawBlock, BLOCK_SIZE};
use crate::error::{BlockCodecError, ExtractError, TarError};
use crate::header::{self, EntryType, Header};
use crate::known_path::{KnownPathKind, KnownPathMap};
use crate::pax::{self, PaxAttributes};

/// Resource limits on PAX/GNU metadata, bounding worst-case memory a
/// hostile archive can force the reader to allocate while parsing headers
/// it may not even be interested in extracting.
#[derive(Debug, Clone)]
pub struct ParserLimits {
    pub max_pax_key_value_length: usize,
    pub max_global_attributes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        ParserLimits {
            max_pax_key_value_length: 1024 * 8,
            max_global_attributes: 1024,
        }
    }
}

/// Decides whether `list`'s non-strict mode continues past a tolerated
/// structural violation or aborts. Three stock implementations cover the
/// common cases; callers needing custom policy implement the trait.
pub trait TarViolationHandler {
    /// Returns `true` if parsing should continue after this error.
    fn handle(&mut self, error: &TarError) -> bool;
}

/// Aborts on the first violation. Used when `list(strict=true)`.
pub struct StrictViolationHandler;
impl TarViolationHandler for StrictViolationHandler {
    fn handle(&mut self, _error: &TarError) -> bool {
        false
    }
}

/// Tolerates every violation silently.
#[derive(Default)]
pub struct IgnoreViolationHandler;
impl TarViolationHandler for IgnoreViolationHandler {
    fn handle(&mut self, _error: &TarError) -> bool {
        true
    }
}

/// Tolerates every violation but records it for the caller to inspect once
/// the listing is done.
#[derive(Default)]
pub struct AuditViolationHandler {
    pub violations: Vec<String>,
}
impl TarViolationHandler for AuditViolationHandler {
    fn handle(&mut self, error: &TarError) -> bool {
        self.violations.push(error.to_string());
        true
    }
}

/// One entry pulled off the stream, with any deferred structural error
/// (hardlink-unknown-target, symlink-prefix attack) attached so the caller
/// can consult its predicate before deciding whether the error matters.
pub struct PendingEntry {
    pub header: Header,
    pub deferred_error: Option<TarError>,
    pub raw_header: Option<[u8; BLOCK_SIZE]>,
}

/// Streams `(Header, data)` pairs out of an uncompressed tar byte stream.
pub struct TarReader<R> {
    inner: R,
    globals: PaxAttributes,
    known_paths: KnownPathMap,
    limits: ParserLimits,
    finished: bool,
    body_remaining: u64,
    body_padding: u64,
    pub capture_raw: bool,
    capture_tee: bool,
    tee_buffer: Vec<u8>,
    consumed: u64,
}

impl<R: Read> TarReader<R> {
    #[must_use]
    pub fn new(inner: R) -> Self {
        TarReader {
            inner,
            globals: PaxAttributes::default(),
            known_paths: KnownPathMap::new(),
            limits: ParserLimits::default(),
            finished: false,
            body_remaining: 0,
            body_padding: 0,
            capture_raw: false,
            capture_tee: false,
            tee_buffer: Vec::new(),
            consumed: 0,
        }
    }

    /// Total bytes read from the underlying source so far. Used by the
    /// rewriter to record, for each entry, the byte offset of its data
    /// region without requiring the source to be seekable during this pass.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.consumed
    }

    pub fn with_limits(inner: R, limits: ParserLimits) -> Self {
        let mut r = Self::new(inner);
        r.limits = limits;
        r
    }

    #[must_use]
    pub fn known_paths(&self) -> &KnownPathMap {
        &self.known_paths
    }

    /// Enables skeleton capture: every header block (standard and
    /// extension) is recorded verbatim, and file data regions are recorded
    /// as same-length runs of zero bytes. See [`crate::skeleton`].
    pub fn enable_tee(&mut self) {
        self.capture_tee = true;
    }

    #[must_use]
    pub fn take_tee(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tee_buffer)
    }

    fn read_block(&mut self) -> io::Result<Option<[u8; BLOCK_SIZE]>> {
        let mut buf = [0u8; BLOCK_SIZE];
        let mut read = 0;
        while read < BLOCK_SIZE {
            let n = self.inner.read(&mut buf[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated tar header block",
                ));
            }
            read += n;
        }
        if self.capture_tee {
            self.tee_buffer.extend_from_slice(&buf);
        }
        self.consumed += BLOCK_SIZE as u64;
        Ok(Some(buf))
    }

    fn skip_exact(&mut self, mut n: u64) -> io::Result<()> {
        let mut buf = [0u8; 8192];
        while n > 0 {
            let chunk = (n as usize).min(buf.len());
            let read = self.inner.read(&mut buf[..chunk])?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated tar entry data",
                ));
            }
            n -= read as u64;
            self.consumed += read as u64;
        }
        Ok(())
    }

    /// Must be called once the caller is done consuming the current entry's
    /// body via [`Read`]; realigns the stream to the next 512-byte block.
    pub fn finish_entry(&mut self) -> io::Result<()> {
        if self.body_remaining > 0 {
            self.skip_exact(self.body_remaining)?;
            self.body_remaining = 0;
        }
        if self.body_padding > 0 {
            self.skip_exact(self.body_padding)?;
            self.body_padding = 0;
        }
        Ok(())
    }

    fn decode_standard(block: &[u8; BLOCK_SIZE]) -> Result<(RawBlock, Header, String), TarError> {
        RawBlock::verify_checksum(block).map_err(TarError::NotATarball)?;
        let raw = RawBlock::from_bytes(block);
        raw.check_magic_version().map_err(TarError::NotATarball)?;

        let name = std::str::from_utf8(block::parse_null_terminated(&raw.name))
            .map_err(|_| BlockCodecError::InvalidUtf8 {
                field: crate::error::HeaderField::Name,
            })?
            .to_string();
        let prefix = std::str::from_utf8(block::parse_null_terminated(&raw.prefix))
            .map_err(|_| BlockCodecError::InvalidUtf8 {
                field: crate::error::HeaderField::Prefix,
            })?
            .to_string();
        let full_name = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let linkname = std::str::from_utf8(block::parse_null_terminated(&raw.linkname))
            .map_err(|_| BlockCodecError::InvalidUtf8 {
                field: crate::error::HeaderField::Linkname,
            })?
            .to_string();
        let mode_raw = block::parse_octal_field(&raw.mode, crate::error::HeaderField::Mode)?;
        let mode = u16::try_from(mode_raw).map_err(|_| BlockCodecError::Overflow {
            field: crate::error::HeaderField::Mode,
        })?;
        let size = block::parse_size_field(&raw.size)?;
        let entry_type = EntryType::from_typeflag(raw.typeflag);

        let mut header = Header::new(RelativePathBuf::from(String::new()), entry_type, mode);
        header.size = size;
        if !linkname.is_empty() {
            header.link = Some(linkname);
        }
        Ok((raw, header, full_name))
    }

    /// Reads the next logical entry, transparently absorbing any number of
    /// leading PAX/GNU extension headers.
    pub fn next_entry(&mut self) -> Result<Option<PendingEntry>, TarError> {
        self.finish_entry()?;
        if self.finished {
            return Ok(None);
        }

        let mut local_pax = PaxAttributes::default();
        let mut gnu_long_path: Option<String> = None;
        let mut gnu_long_link: Option<String> = None;

        loop {
            let block = match self.read_block()? {
                Some(b) => b,
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            };
            if RawBlock::is_all_zero(&block) {
                self.finished = true;
                // Drain the rest of the stream, per the end-of-archive rule.
                // Kept in the tee (if active) so a replayed skeleton
                // reproduces the full trailing zero-block padding exactly,
                // rather than just the single block that triggered this.
                let mut rest = Vec::new();
                self.inner.read_to_end(&mut rest)?;
                if self.capture_tee {
                    self.tee_buffer.extend_from_slice(&rest);
                }
                return Ok(None);
            }

            let (raw, mut header, full_name) = Self::decode_standard(&block)?;
            let data_len = block::round_up_512(header.size.max(0) as u64);
            log::trace!(
                "decoded block: typeflag={:?} name={full_name:?} size={}",
                header.entry_type,
                header.size
            );

            match header.entry_type {
                EntryType::Other(b'x') => {
                    let data = self.read_extension_data(header.size as u64)?;
                    let records = pax::parse_pax_records(&data)?;
                    self.check_pax_limits(&records)?;
                    local_pax.merge_from(&records);
                    continue;
                }
                EntryType::Other(b'g') => {
                    let data = self.read_extension_data(header.size as u64)?;
                    let records = pax::parse_pax_records(&data)?;
                    self.check_pax_limits(&records)?;
                    self.globals.merge_from(&records);
                    if self.globals.unparsed.len() > self.limits.max_global_attributes {
                        return Err(crate::error::PaxError::LimitExceeded {
                            limit: self.limits.max_global_attributes,
                            unit: "attributes",
                            context: "pax.global_attributes",
                        }
                        .into());
                    }
                    continue;
                }
                EntryType::Other(b'L') if full_name == pax::GNU_LONGLINK_PATH => {
                    let data = self.read_extension_data(header.size as u64)?;
                    gnu_long_path = Some(pax::parse_gnu_long_name(&data)?);
                    continue;
                }
                EntryType::Other(b'K') if full_name == pax::GNU_LONGLINK_PATH => {
                    let data = self.read_extension_data(header.size as u64)?;
                    gnu_long_link = Some(pax::parse_gnu_long_name(&data)?);
                    continue;
                }
                _ => {
                    let _ = data_len;
                    let raw_header = if self.capture_raw { Some(block) } else { None };

                    let effective_path = gnu_long_path
                        .take()
                        .or_else(|| local_pax.path.clone())
                        .or_else(|| self.globals.path.clone())
                        .unwrap_or(full_name);
                    let effective_link = gnu_long_link
                        .take()
                        .or_else(|| local_pax.linkpath.clone())
                        .or_else(|| self.globals.linkpath.clone())
                        .or_else(|| header.link.clone());
                    let effective_size = local_pax
                        .size
                        .or(self.globals.size)
                        .unwrap_or(header.size);

                    let normalized_path = header::normalize_path(&effective_path)?;
                    header.path = RelativePathBuf::from(normalized_path.clone());
                    header.size = effective_size;
                    header.link = match effective_link {
                        Some(l) if !l.is_empty() => Some(header::normalize_link(&l)?),
                        _ => None,
                    };
                    header.unparsed_extended_attributes = self.globals.unparsed.clone();
                    for (k, v) in &local_pax.unparsed {
                        header.unparsed_extended_attributes.insert(k.clone(), v.clone());
                    }
                    let _ = raw;

                    self.body_remaining = header.size.max(0) as u64;
                    self.body_padding =
                        block::round_up_512(self.body_remaining) - self.body_remaining;

                    if self.capture_tee {
                        let total = self.body_remaining + self.body_padding;
                        self.tee_buffer
                            .extend(std::iter::repeat(0u8).take(total as usize));
                    }

                    let mut deferred_error = None;

                    if let Some(prefix) = self.known_paths.symlink_prefix_of(&normalized_path) {
                        deferred_error = Some(TarError::Extract(ExtractError::SymlinkAttack {
                            path: normalized_path.clone().into(),
                            prefix: prefix.to_string().into(),
                        }));
                    }

                    if header.entry_type == EntryType::HardLink {
                        if let Some(link) = &header.link {
                            match self.known_paths.is_plain_file(link) {
                                Some(size) => header.size = size,
                                None => {
                                    if deferred_error.is_none() {
                                        deferred_error = Some(TarError::Extract(
                                            ExtractError::HardlinkUnknownTarget {
                                                link: normalized_path.clone().into(),
                                                target: link.clone().into(),
                                            },
                                        ));
                                    }
                                }
                            }
                        }
                    }

                    if deferred_error.is_none() {
                        if let Err(e) = header::check_header(&header, &self.known_paths) {
                            deferred_error = Some(e.into());
                        }
                    }

                    let kind = match header.entry_type {
                        EntryType::Directory => KnownPathKind::Directory,
                        EntryType::Symlink => {
                            KnownPathKind::Symlink(header.link.clone().unwrap_or_default())
                        }
                        EntryType::File => KnownPathKind::File { size: header.size },
                        // Deliberately not `File`: a hardlink resolves to its
                        // target's bytes but is not itself a legal hardlink
                        // target, so a later `hardlink-to-hardlink` entry is
                        // rejected the same way a hardlink-to-directory is.
                        EntryType::HardLink => KnownPathKind::Other,
                        _ => KnownPathKind::Other,
                    };
                    self.known_paths.insert(normalized_path, kind);

                    log::debug!(
                        "entry: path={:?} type={:?} size={}",
                        header.path.as_str(),
                        header.entry_type,
                        header.size
                    );
                    if let Some(err) = &deferred_error {
                        log::warn!("tolerated structural violation on {:?}: {err}", header.path.as_str());
                    }

                    return Ok(Some(PendingEntry {
                        header,
                        deferred_error,
                        raw_header,
                    }));
                }
            }
        }
    }

    fn read_extension_data(&mut self, size: u64) -> Result<Vec<u8>, TarError> {
        if size as usize > self.limits.max_pax_key_value_length * 64 {
            return Err(crate::error::PaxError::LimitExceeded {
                limit: self.limits.max_pax_key_value_length * 64,
                unit: "bytes",
                context: "pax.extension_block",
            }
            .into());
        }
        let mut data = vec![0u8; size as usize];
        self.inner.read_exact(&mut data)?;
        self.consumed += size;
        let padding = block::round_up_512(size) - size;
        self.skip_exact(padding)?;
        if self.capture_tee {
            self.tee_buffer.extend_from_slice(&data);
            self.tee_buffer
                .extend(std::iter::repeat(0u8).take(padding as usize));
        }
        Ok(data)
    }

    fn check_pax_limits(&self, records: &[(String, String)]) -> Result<(), TarError> {
        for (k, v) in records {
            if k.len() > self.limits.max_pax_key_value_length
                || v.len() > self.limits.max_pax_key_value_length
            {
                return Err(crate::error::PaxError::LimitExceeded {
                    limit: self.limits.max_pax_key_value_length,
                    unit: "bytes",
                    context: "pax.key_or_value",
                }
                .into());
            }
        }
        Ok(())
    }

    /// Skips the current entry's body without reading it into memory.
    pub fn skip_entry(&mut self) -> io::Result<()> {
        self.finish_entry()
    }
}

impl<R: Read> Read for TarReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.body_remaining == 0 {
            return Ok(0);
        }
        let max = (buf.len() as u64).min(self.body_remaining) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        self.body_remaining -= n as u64;
        self.consumed += n as u64;
        Ok(n)
    }
}
