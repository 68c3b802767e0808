//! A library for reading, writing, rewriting, and content-hashing
//! POSIX-1003.1-2001 (ustar) tar archives, specialized for transferring file
//! trees between systems rather than preserving host metadata: ownership,
//! timestamps, device numbers and sparse regions are not round-tripped.
//!
//! The five public operations are [`create`], [`extract`], [`list`],
//! [`rewrite`]/[`rewrite_buffered`], and [`tree_hash`], all built over the
//! shared [`Header`] record and the streaming [`TarReader`].

mod block;
mod error;
mod extract;
mod fs_host;
mod hash;
mod header;
mod known_path;
mod list;
mod pax;
mod reader;
mod rewrite;
mod skeleton;
mod writer;

pub use error::{
    BlockCodecError, ExtractError, HashError, HeaderError, HeaderField, PaxError, Result, TarError,
    ValidationError,
};
pub use extract::{extract, CopySymlinks, ExtractOptions};
pub use fs_host::{DirEntry, HostFs, Metadata, NodeKind, StdHostFs};
pub use hash::{blob_hash, tree_hash, HashAlgorithm};
pub use header::{EntryType, Header};
pub use known_path::{KnownPathKind, KnownPathMap};
pub use list::{list, ListOptions};
pub use reader::{
    AuditViolationHandler, IgnoreViolationHandler, ParserLimits, StrictViolationHandler, TarReader,
    TarViolationHandler,
};
pub use rewrite::{rewrite, rewrite_buffered};
pub use skeleton::{replay_skeleton, SKELETON_MAGIC};
pub use writer::{check_portable, create, CreateOptions};
