//! Error taxonomy for the tar engine.
//!
//! Every fallible entry point returns [`TarError`]. Each variant is a coarse
//! kind a caller can `match` on; the finer-grained detail (which field, which
//! record) lives in the nested context enums below and is reachable through
//! `std::error::Error::source()`.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Which fixed-offset header field a malformed-field error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Name,
    Mode,
    Uid,
    Gid,
    Size,
    Mtime,
    Checksum,
    Typeflag,
    Linkname,
    Magic,
    Version,
    Uname,
    Gname,
    DevMajor,
    DevMinor,
    Prefix,
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HeaderField::Name => "name",
            HeaderField::Mode => "mode",
            HeaderField::Uid => "uid",
            HeaderField::Gid => "gid",
            HeaderField::Size => "size",
            HeaderField::Mtime => "mtime",
            HeaderField::Checksum => "chksum",
            HeaderField::Typeflag => "typeflag",
            HeaderField::Linkname => "linkname",
            HeaderField::Magic => "magic",
            HeaderField::Version => "version",
            HeaderField::Uname => "uname",
            HeaderField::Gname => "gname",
            HeaderField::DevMajor => "devmajor",
            HeaderField::DevMinor => "devminor",
            HeaderField::Prefix => "prefix",
        };
        f.write_str(s)
    }
}

/// Errors raised while decoding or encoding a single 512-byte header block.
#[derive(Error, Debug)]
pub enum BlockCodecError {
    #[error("header field {field} is malformed")]
    Malformed { field: HeaderField },
    #[error("header field {field} overflowed while accumulating its value")]
    Overflow { field: HeaderField },
    #[error("unrecognized magic/version combination: magic={magic:?} version={version:?}")]
    UnknownMagicVersion { magic: [u8; 6], version: [u8; 2] },
    #[error("header checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("header field {field} is not valid UTF-8")]
    InvalidUtf8 { field: HeaderField },
}

/// Errors raised while assembling or parsing PAX/GNU extended headers.
#[derive(Error, Debug)]
pub enum PaxError {
    #[error("PAX record length field is malformed")]
    MalformedLength,
    #[error("PAX record is missing the '=' separator")]
    MissingSeparator,
    #[error("PAX record key is not valid UTF-8")]
    InvalidKeyUtf8,
    #[error("PAX record value is not valid UTF-8")]
    InvalidValueUtf8,
    #[error("GNU long-name/long-link data is not NUL-terminated")]
    UnterminatedLongName,
    #[error("PAX size attribute is malformed")]
    MalformedSize,
    #[error("limit of {limit} {unit} exceeded while parsing {context}")]
    LimitExceeded {
        limit: usize,
        unit: &'static str,
        context: &'static str,
    },
}

/// Structural violations of the [`crate::header::Header`] invariants.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("path is empty")]
    EmptyPath,
    #[error("path contains a NUL byte")]
    PathHasNul,
    #[error("path is absolute: {0}")]
    PathIsAbsolute(String),
    #[error("path contains a '..' component: {0}")]
    PathEscapes(String),
    #[error("non-directory path must not end in '/': {0}")]
    TrailingSlash(String),
    #[error("non-directory path must not be '.' or end in '/.': {0}")]
    DotPath(String),
    #[error("size must be zero for entry type {entry_type:?}, found {size}")]
    NonZeroSizeForType { entry_type: crate::header::EntryType, size: i64 },
    #[error("size is negative: {0}")]
    NegativeSize(i64),
    #[error("link target is empty for entry type {0:?}")]
    EmptyLink(crate::header::EntryType),
    #[error("link target is set but entry type {0:?} does not carry a link")]
    UnexpectedLink(crate::header::EntryType),
    #[error("link target contains a NUL byte")]
    LinkHasNul,
    #[error("hardlink target has a leading '/': {0}")]
    HardlinkAbsolute(String),
    #[error("hardlink target contains a '..' component: {0}")]
    HardlinkEscapes(String),
}

/// Errors raised while applying headers to a filesystem root.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("path '{0}' escapes the extraction root")]
    PathEscapesRoot(PathBuf),
    #[error("hardlink '{link}' targets unknown path '{target}'")]
    HardlinkUnknownTarget { link: PathBuf, target: PathBuf },
    #[error("symlink attack: '{path}' has a symlink prefix at '{prefix}'")]
    SymlinkAttack { path: PathBuf, prefix: PathBuf },
    #[error("copy-symlinks resolver could not make progress: a dependency cycle remains")]
    CopySymlinksStuck,
}

/// Errors raised while building the git-compatible tree hash.
#[derive(Error, Debug)]
pub enum HashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Top-level error type returned by every public operation.
#[derive(Error, Debug)]
pub enum TarError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a tar archive (the input may be compressed): {0}")]
    NotATarball(#[source] BlockCodecError),

    #[error("invalid header: {0}")]
    InvalidHeader(#[source] HeaderError),

    #[error("unsupported entry type: {0:?}")]
    UnsupportedEntry(crate::header::EntryType),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("portability error: {0}")]
    Portability(String),

    #[error("input does not begin with the skeleton magic prefix")]
    NotASkeleton,

    #[error("predicate and skeleton cannot both be supplied to the same operation")]
    PredicateMisuse,

    #[error(
        "callback protocol error: consumer advanced the stream by {advanced} bytes, expected {expected}"
    )]
    CallbackProtocolError { advanced: u64, expected: u64 },
}

/// Either a block-codec or a PAX-assembler failure, folded under `InvalidHeader`.
#[derive(Error, Debug)]
pub enum HeaderError {
    #[error(transparent)]
    Block(#[from] BlockCodecError),
    #[error(transparent)]
    Pax(#[from] PaxError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<BlockCodecError> for TarError {
    fn from(e: BlockCodecError) -> Self {
        TarError::InvalidHeader(HeaderError::Block(e))
    }
}

impl From<PaxError> for TarError {
    fn from(e: PaxError) -> Self {
        TarError::InvalidHeader(HeaderError::Pax(e))
    }
}

impl From<ValidationError> for TarError {
    fn from(e: ValidationError) -> Self {
        TarError::InvalidHeader(HeaderError::Validation(e))
    }
}

pub type Result<T> = std::result::Result<T, TarError>;
