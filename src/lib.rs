//! burrow-db: a single-writer / multi-reader persistent key-value store.
//!
//! The data file is a page space: two meta pages hold a double-buffered,
//! counter-published root; a bitmap spanning the next pages tracks page
//! allocation; everything after that is B+-tree nodes and overflow chains.
//! Writers copy every page they touch (freed originals go to a free-list
//! table keyed by transaction id), so readers traverse an immutable
//! snapshot without taking any lock. Freed pages are recycled once no live
//! reader can still observe them. Durability is certified by a background
//! worker that batches `fdatasync` requests over a bounded channel.

#[cfg(target_endian = "big")]
compile_error!("big-endian targets are not supported: on-page data is little-endian");

use bitflags::bitflags;

mod channel;
mod cursor;
mod db;
mod env;
mod error;
mod lock;
mod meta;
mod node;
mod readers;
mod txn;

pub use cursor::{Cursor, CursorMut, CursorOp};
pub use db::{Dbi, KeyCmp, Stat};
pub use env::{Env, EnvOptions, SyncTicket};
pub use error::{Error, Result};
pub use txn::{ReadTxn, TxnRead, WriteTxn};

/// A single page. Must be a power of two and a multiple of the OS page.
pub const PAGE_SIZE: usize = 4096;

/// The minimum usable environment: metas, one bitmap page, one data page.
pub const MIN_PAGES: u64 = 4;

/// Longest key accepted by `put` and friends.
pub const MAX_KEY_SIZE: usize = 511;

/// Deepest tree a cursor can descend.
pub const CURSOR_STACK: usize = 32;

/// Table handle of the free-list table.
pub(crate) const FREE_DBI: usize = 0;
/// Table handle of the main table.
pub(crate) const MAIN_DBI: usize = 1;
/// Table handles below this are never user-visible names.
pub(crate) const CORE_DBS: usize = 2;

/// Sentinel page id for "no page".
pub(crate) const P_INVALID: u64 = u64::MAX;

bitflags! {
    /// Environment open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Validate the stored map-address hint on open.
        const FIXEDMAP      = 0x0000_0001;
        /// `path` is a file, not a directory; the lock file is `path`-lock.
        const NOSUBDIR      = 0x0000_4000;
        /// Open read-only; no writer may be started.
        const RDONLY        = 0x0002_0000;
        /// Mutate through the mapping. Always the operating mode here;
        /// accepted for compatibility.
        const WRITEMAP      = 0x0008_0000;
        /// Skip the ranged meta flush at commit.
        const NOMETASYNC    = 0x0004_0000;
        /// Skip all flushing and the durability wait at commit.
        const NOSYNC        = 0x0001_0000;
        /// Use asynchronous flushes for data pages.
        const MAPASYNC      = 0x0010_0000;
        /// Don't zero-initialize reused pages before handing them out.
        const NOMEMINIT     = 0x0100_0000;
        /// Advise the kernel against read-ahead on the data map.
        const NORDAHEAD     = 0x0080_0000;
        /// No lock file: the caller serializes all access.
        const NOLOCK        = 0x0040_0000;
        /// Open the previous (older) meta snapshot. Needs exclusivity.
        const PREV_SNAPSHOT = 0x0200_0000;
    }
}

bitflags! {
    /// Per-table flags. The low 16 bits persist in the table record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        /// Compare keys back-to-front.
        const REVERSEKEY = 0x0002;
        /// Keys may repeat; duplicates are kept sorted.
        const DUPSORT    = 0x0004;
        /// Keys are fixed-width little-endian integers (u32 or u64).
        const INTEGERKEY = 0x0008;
        /// With `DUPSORT`: all duplicates of a key share one fixed width.
        const DUPFIXED   = 0x0010;
        /// With `DUPSORT`: duplicates are fixed-width integers.
        const INTEGERDUP = 0x0020;
        /// With `DUPSORT`: compare duplicates back-to-front.
        const REVERSEDUP = 0x0040;
        /// Create the named table if it doesn't exist (write txn only).
        const CREATE     = 0x4_0000;
    }
}

impl DbFlags {
    /// The subset stored in the on-page table record.
    pub(crate) fn persistent(self) -> u16 {
        (self.bits() & 0xffff) as u16
    }
}

bitflags! {
    /// `put` / `cursor_put` behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Fail with `Exists` instead of overwriting.
        const NOOVERWRITE = 0x0010;
        /// With `DUPSORT`: fail with `Exists` if this exact pair exists.
        const NODUPDATA   = 0x0020;
        /// Replace the entry at the cursor's current position.
        const CURRENT     = 0x0040;
        /// Reserve space for the value and return it for the caller to fill.
        const RESERVE     = 0x0001_0000;
        /// Key is known to sort after everything present; skip the search.
        const APPEND      = 0x0002_0000;
        /// `APPEND` for a duplicate value.
        const APPENDDUP   = 0x0004_0000;
        /// Store multiple contiguous fixed-size items (DUPFIXED only).
        const MULTIPLE    = 0x0008_0000;
    }
}
