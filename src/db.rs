//! Named tables, key ordering, and table statistics.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::{DbFlags, CORE_DBS, FREE_DBI, MAIN_DBI};

/// Handle to an open table. Handles are environment-scoped and stay valid
/// until `dbi_close` or environment close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dbi(pub(crate) u32);

impl Dbi {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Key ordering for one table: the four built-in orders or a caller
/// supplied total order.
#[derive(Clone, Copy)]
pub enum KeyCmp {
    /// Byte-lexicographic, front to back.
    Bytes,
    /// Byte-lexicographic, back to front.
    BytesRev,
    /// Fixed-width little-endian unsigned integers (4 or 8 bytes).
    IntLe,
    /// `IntLe` reversed.
    IntLeRev,
    /// Caller-supplied total order.
    Custom(fn(&[u8], &[u8]) -> Ordering),
}

impl std::fmt::Debug for KeyCmp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyCmp::Bytes => "Bytes",
            KeyCmp::BytesRev => "BytesRev",
            KeyCmp::IntLe => "IntLe",
            KeyCmp::IntLeRev => "IntLeRev",
            KeyCmp::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

fn int_le(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    match a.len() {
        4 => LittleEndian::read_u32(a).cmp(&LittleEndian::read_u32(b)),
        8 => LittleEndian::read_u64(a).cmp(&LittleEndian::read_u64(b)),
        // Unequal or odd widths can only appear through corruption; fall
        // back to a numeric comparison of the little-endian bytes.
        _ => a
            .iter()
            .rev()
            .cmp(b.iter().rev()),
    }
}

impl KeyCmp {
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyCmp::Bytes => a.cmp(b),
            KeyCmp::BytesRev => a.iter().rev().cmp(b.iter().rev()),
            KeyCmp::IntLe => int_le(a, b),
            KeyCmp::IntLeRev => int_le(b, a),
            KeyCmp::Custom(f) => f(a, b),
        }
    }

    /// The built-in order selected by a table's flags.
    pub(crate) fn for_keys(flags: DbFlags) -> KeyCmp {
        if flags.contains(DbFlags::INTEGERKEY) {
            KeyCmp::IntLe
        } else if flags.contains(DbFlags::REVERSEKEY) {
            KeyCmp::BytesRev
        } else {
            KeyCmp::Bytes
        }
    }

    /// The built-in order for duplicate values of a `DUPSORT` table.
    pub(crate) fn for_dups(flags: DbFlags) -> KeyCmp {
        if flags.contains(DbFlags::INTEGERDUP) {
            KeyCmp::IntLe
        } else if flags.contains(DbFlags::REVERSEDUP) {
            KeyCmp::BytesRev
        } else {
            KeyCmp::Bytes
        }
    }
}

/// Tree statistics of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub page_size: usize,
    pub depth: usize,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
}

impl Stat {
    pub(crate) fn from_record(rec: &DbRecord) -> Stat {
        Stat {
            page_size: crate::PAGE_SIZE,
            depth: rec.depth as usize,
            branch_pages: rec.branch_pages,
            leaf_pages: rec.leaf_pages,
            overflow_pages: rec.overflow_pages,
            entries: rec.entries,
        }
    }
}

/// One slot of the environment's table registry.
pub(crate) struct DbiEntry {
    pub name: Option<String>,
    pub flags: DbFlags,
    pub cmp: KeyCmp,
    pub dcmp: KeyCmp,
    pub valid: bool,
}

/// Environment-wide registry mapping handles to named tables.
pub(crate) struct DbiTable {
    entries: Vec<DbiEntry>,
}

impl DbiTable {
    pub fn new() -> DbiTable {
        let free = DbiEntry {
            name: None,
            flags: DbFlags::INTEGERKEY,
            cmp: KeyCmp::IntLe,
            dcmp: KeyCmp::Bytes,
            valid: true,
        };
        let main = DbiEntry {
            name: None,
            flags: DbFlags::empty(),
            cmp: KeyCmp::Bytes,
            dcmp: KeyCmp::Bytes,
            valid: true,
        };
        DbiTable {
            entries: vec![free, main],
        }
    }

    pub fn get(&self, dbi: Dbi) -> Result<&DbiEntry> {
        self.entries
            .get(dbi.index())
            .filter(|e| e.valid)
            .ok_or(Error::BadDbi)
    }

    pub fn find(&self, name: &str) -> Option<(Dbi, &DbiEntry)> {
        self.entries.iter().enumerate().find_map(|(i, e)| {
            (e.valid && e.name.as_deref() == Some(name)).then_some((Dbi(i as u32), e))
        })
    }

    /// Register a named table, reusing a closed slot when one exists.
    pub fn insert(&mut self, name: String, flags: DbFlags, maxdbs: usize) -> Result<Dbi> {
        let entry = DbiEntry {
            name: Some(name),
            flags,
            cmp: KeyCmp::for_keys(flags),
            dcmp: KeyCmp::for_dups(flags),
            valid: true,
        };
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| !e.valid)
            .filter(|i| *i >= CORE_DBS)
        {
            self.entries[i] = entry;
            return Ok(Dbi(i as u32));
        }
        if self.entries.len() >= maxdbs {
            return Err(Error::BadDbi);
        }
        self.entries.push(entry);
        Ok(Dbi(self.entries.len() as u32 - 1))
    }

    /// Update the main table's comparators when it is opened with flags.
    pub fn set_main_flags(&mut self, flags: DbFlags) {
        let main = &mut self.entries[MAIN_DBI];
        main.flags = flags;
        main.cmp = KeyCmp::for_keys(flags);
        main.dcmp = KeyCmp::for_dups(flags);
    }

    pub fn set_compare(&mut self, dbi: Dbi, cmp: KeyCmp) -> Result<()> {
        let e = self
            .entries
            .get_mut(dbi.index())
            .filter(|e| e.valid)
            .ok_or(Error::BadDbi)?;
        e.cmp = cmp;
        Ok(())
    }

    pub fn set_dup_compare(&mut self, dbi: Dbi, cmp: KeyCmp) -> Result<()> {
        let e = self
            .entries
            .get_mut(dbi.index())
            .filter(|e| e.valid)
            .ok_or(Error::BadDbi)?;
        e.dcmp = cmp;
        Ok(())
    }

    /// Invalidate a handle. The named table itself is untouched.
    pub fn close(&mut self, dbi: Dbi) {
        if dbi.index() >= CORE_DBS {
            if let Some(e) = self.entries.get_mut(dbi.index()) {
                e.valid = false;
                e.name = None;
            }
        }
    }
}

/// The two built-in handles.
pub(crate) fn free_dbi() -> Dbi {
    Dbi(FREE_DBI as u32)
}

pub(crate) fn main_dbi() -> Dbi {
    Dbi(MAIN_DBI as u32)
}
