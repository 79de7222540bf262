//! On-page meta layout.
//!
//! Pages 0 and 1 each hold a `MetaPage`. The leading counter word carries
//! the double-buffer publication protocol (see `env`); the rest is the
//! meta body: format identification, geometry, the records of the two
//! core tables, the last allocated page and the transaction id, sealed
//! with an xxh3 checksum that is validated on open.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::{DbFlags, P_INVALID};

pub(crate) const META_MAGIC: u32 = 0xBEE7_DB01;
pub(crate) const META_VERSION: u32 = 1;

/// Persisted per-table record: comparator-selecting flags, tree shape
/// statistics, and the root page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DbRecord {
    pub flags: u16,
    pub depth: u16,
    pub pad: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
    pub root: u64,
}

impl DbRecord {
    pub fn empty(flags: u16) -> Self {
        DbRecord {
            flags,
            depth: 0,
            pad: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: P_INVALID,
        }
    }

    pub fn db_flags(&self) -> DbFlags {
        DbFlags::from_bits_truncate(self.flags as u32)
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct MetaPage {
    /// Publication counter; not part of the checksummed body.
    pub counter: u64,
    pub magic: u32,
    pub version: u32,
    pub pagesize: u32,
    pub flags: u32,
    /// Map address hint for `FIXEDMAP`.
    pub address: u64,
    pub mapsize: u64,
    /// Highest data page id handed out so far.
    pub last_pg: u64,
    /// Monotonic transaction id of this snapshot.
    pub txnid: u64,
    /// Root value published through `env::set_root`.
    pub root: u64,
    /// FREE_DBI and MAIN_DBI records.
    pub dbs: [DbRecord; 2],
    pub checksum: u64,
}

impl MetaPage {
    pub fn new(pagesize: u32, mapsize: u64, flags: u32) -> Self {
        let mut meta = MetaPage {
            counter: 0,
            magic: META_MAGIC,
            version: META_VERSION,
            pagesize,
            flags,
            address: 0,
            mapsize,
            last_pg: 0,
            txnid: 0,
            root: 0,
            dbs: [DbRecord::empty(0), DbRecord::empty(0)],
            checksum: 0,
        };
        meta.seal();
        meta
    }

    fn body_bytes(&self) -> &[u8] {
        let all = bytemuck::bytes_of(self);
        // Skip the counter, stop before the checksum.
        &all[8..all.len() - 8]
    }

    pub fn compute_checksum(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.body_bytes())
    }

    /// Recompute and store the body checksum.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Validate magic, version, page size, and checksum.
    pub fn validate(&self, pagesize: u32) -> Result<()> {
        if self.magic != META_MAGIC {
            return Err(Error::Corrupted("meta magic mismatch"));
        }
        if self.version != META_VERSION {
            return Err(Error::VersionMismatch);
        }
        if self.pagesize != pagesize {
            return Err(Error::Corrupted("meta page size mismatch"));
        }
        if self.checksum != self.compute_checksum() {
            return Err(Error::Corrupted("meta checksum mismatch"));
        }
        Ok(())
    }
}
