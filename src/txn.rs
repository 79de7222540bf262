//! Transactions.
//!
//! Read transactions freeze the winning meta in a reader slot and walk
//! the mapping without locks. The single write transaction holds the
//! cross-process writer mutex, copies every page it touches (old pages go
//! to the free-list table under this transaction's id), recycles pages
//! freed by transactions no live reader can still observe, and commits by
//! flushing its dirty pages and flipping the meta counter.
//!
//! Nested write transactions are save-frames over the outer writer: a
//! frame snapshots the table records and list watermarks, shadows any
//! outer dirty page before mutating it, and on abort releases everything
//! it allocated.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};

use crate::cursor::{Cursor, CursorMut, TreeRef};
use crate::db::{free_dbi, main_dbi, Dbi, KeyCmp, Stat};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::meta::{DbRecord, MetaPage};
use crate::node::{self, NodeMut, NodeRef};
use crate::readers::WriterGuard;
use crate::{DbFlags, EnvFlags, WriteFlags, CORE_DBS, FREE_DBI, MAIN_DBI, PAGE_SIZE, P_INVALID};

/// Dirty pages allowed before the spill pass starts writing early.
const DIRTY_ROOM: usize = 16 * 1024;
/// Hard ceiling on the dirty list; beyond this the transaction is full.
const MAX_DIRTY: usize = 4 * DIRTY_ROOM;

/// Per-transaction view of one table.
#[derive(Clone)]
pub(crate) struct DbState {
    pub rec: DbRecord,
    /// Record changed this transaction; persisted at commit.
    pub dirty: bool,
}

mod internal {
    use super::*;

    /// Read-side surface shared by both transaction kinds. Sealed: the
    /// two implementations in this crate are the only ones.
    pub trait TxnInternal {
        fn env_ref(&self) -> &Env;
        fn snapshot_id(&self) -> u64;
        fn db_state(&self, dbi: Dbi) -> Result<&DbState>;
        fn tree_of(&self, dbi: Dbi) -> Result<TreeRef>;
        fn node(&self, pgno: u64) -> Result<NodeRef<'_>>;
    }
}

pub(crate) use internal::TxnInternal;

/// Read-side transaction surface.
pub trait TxnRead: internal::TxnInternal {
    /// The snapshot's transaction id.
    fn id(&self) -> u64;
}

fn load_tree<T: TxnInternal + ?Sized>(txn: &T, dbi: Dbi) -> Result<TreeRef> {
    let state = txn.db_state(dbi)?;
    let env = txn.env_ref();
    let dbis = env.inner.dbis.read();
    let entry = dbis.get(dbi)?;
    Ok(TreeRef {
        root: state.rec.root,
        flags: entry.flags,
        cmp: entry.cmp,
        dcmp: entry.dcmp,
    })
}

/// Search the main table for a named table's record.
fn find_db_record<T: TxnInternal>(txn: &T, name: &str) -> Result<Option<(DbRecord, u16)>> {
    let tree = txn.tree_of(main_dbi())?;
    let Some((node_pg, ix)) = crate::cursor::search_exact(txn, &tree, name.as_bytes())? else {
        return Ok(None);
    };
    let node = txn.node(node_pg)?;
    let flags = node.entry_flags(ix)?;
    if flags & node::F_SUBDATA == 0 || node.value_len(ix)? != std::mem::size_of::<DbRecord>() {
        return Err(Error::Incompatible);
    }
    let rec: DbRecord = bytemuck::pod_read_unaligned(node.value(ix)?);
    Ok(Some((rec, rec.flags)))
}

fn check_db_flags(requested: DbFlags, stored: u16) -> Result<()> {
    let persistent = requested.persistent();
    if persistent != 0 && persistent != stored {
        return Err(Error::Incompatible);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Read transactions
// ---------------------------------------------------------------------

pub struct ReadTxn<'env> {
    env: &'env Env,
    meta: MetaPage,
    dbs: Vec<Option<DbState>>,
    slot: Option<usize>,
    parked: bool,
}

impl<'env> ReadTxn<'env> {
    pub(crate) fn new(env: &'env Env) -> Result<Self> {
        env.fail_if_poisoned()?;
        let meta = if env.flags().contains(EnvFlags::PREV_SNAPSHOT) {
            env.meta_snapshot_prev()
        } else {
            env.meta_snapshot()
        };
        if meta.mapsize > (env.inner.geo.total_pages * PAGE_SIZE as u64) {
            return Err(Error::MapResized);
        }
        let slot = env.inner.lockers.claim_reader(meta.txnid)?;
        // The slot pins our snapshot; if a commit raced the claim, move
        // both forward so the pinned id matches the snapshot we hold.
        let meta = {
            let again = env.meta_snapshot();
            if again.txnid != meta.txnid {
                env.inner.lockers.update_reader(slot, again.txnid);
                again
            } else {
                meta
            }
        };
        Ok(ReadTxn {
            env,
            dbs: core_states(&meta),
            meta,
            slot: Some(slot),
            parked: false,
        })
    }

    /// Open a table handle inside this snapshot.
    pub fn open_db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Dbi> {
        open_db_read(self, name, flags)
    }

    /// Look a key up in a table.
    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Cow<'_, [u8]>> {
        crate::cursor::tree_get(self, dbi, key)
    }

    /// Open a read cursor on a table.
    pub fn cursor(&self, dbi: Dbi) -> Result<Cursor<'_, Self>> {
        Cursor::new(self, dbi)
    }

    /// Release the snapshot but keep the reader slot for `renew`.
    pub fn reset(&mut self) {
        if let Some(slot) = self.slot {
            self.env.inner.lockers.park_reader(slot);
            self.parked = true;
        }
    }

    /// Re-arm a `reset` transaction on the current snapshot.
    pub fn renew(&mut self) -> Result<()> {
        let slot = self.slot.ok_or(Error::BadReaderSlot)?;
        if !self.parked {
            return Err(Error::BadReaderSlot);
        }
        self.meta = self.env.meta_snapshot();
        self.env.inner.lockers.update_reader(slot, self.meta.txnid);
        self.dbs = core_states(&self.meta);
        self.parked = false;
        Ok(())
    }

    pub fn abort(self) {}

    /// Statistics of one table in this snapshot.
    pub fn db_stat(&self, dbi: Dbi) -> Result<Stat> {
        Ok(Stat::from_record(&self.db_state(dbi)?.rec))
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.env.inner.lockers.release_reader(slot);
        }
    }
}

fn core_states(meta: &MetaPage) -> Vec<Option<DbState>> {
    vec![
        Some(DbState {
            rec: meta.dbs[FREE_DBI],
            dirty: false,
        }),
        Some(DbState {
            rec: meta.dbs[MAIN_DBI],
            dirty: false,
        }),
    ]
}

impl internal::TxnInternal for ReadTxn<'_> {
    fn env_ref(&self) -> &Env {
        self.env
    }

    fn snapshot_id(&self) -> u64 {
        self.meta.txnid
    }

    fn db_state(&self, dbi: Dbi) -> Result<&DbState> {
        if self.parked {
            return Err(Error::BadTxn);
        }
        self.dbs
            .get(dbi.index())
            .and_then(|s| s.as_ref())
            .ok_or(Error::BadDbi)
    }

    fn tree_of(&self, dbi: Dbi) -> Result<TreeRef> {
        load_tree(self, dbi)
    }

    fn node(&self, pgno: u64) -> Result<NodeRef<'_>> {
        Ok(NodeRef::new(self.env.page(pgno)?))
    }
}

impl TxnRead for ReadTxn<'_> {
    fn id(&self) -> u64 {
        self.meta.txnid
    }
}

fn open_db_read<T>(txn: &mut T, name: Option<&str>, flags: DbFlags) -> Result<Dbi>
where
    T: internal::TxnInternal + StatesMut,
{
    let Some(name) = name else {
        if flags.persistent() != 0 {
            let env = txn.env_ref().clone();
            env.inner.dbis.write().set_main_flags(flags & !DbFlags::CREATE);
        }
        return Ok(main_dbi());
    };

    let env = txn.env_ref().clone();
    // Already registered in the environment?
    let known = {
        let dbis = env.inner.dbis.read();
        dbis.find(name).map(|(dbi, e)| (dbi, e.flags))
    };
    if let Some((dbi, known_flags)) = known {
        check_db_flags(flags, known_flags.persistent())?;
        if txn.state_of(dbi).is_none() {
            let Some((rec, _)) = find_db_record(txn, name)? else {
                return Err(Error::NotFound);
            };
            txn.install_state(dbi, rec);
        }
        return Ok(dbi);
    }

    let Some((rec, stored_flags)) = find_db_record(txn, name)? else {
        return Err(Error::NotFound);
    };
    check_db_flags(flags, stored_flags)?;
    let dbi = {
        env.inner.dbis.write().insert(
            name.to_string(),
            DbFlags::from_bits_truncate(stored_flags as u32),
            env.inner.maxdbs,
        )?
    };
    txn.install_state(dbi, rec);
    Ok(dbi)
}

/// Mutable access to the per-transaction table states, shared by the
/// `open_db` paths of both transaction kinds.
pub(crate) trait StatesMut {
    fn state_of(&self, dbi: Dbi) -> Option<&DbState>;
    fn install_state(&mut self, dbi: Dbi, rec: DbRecord);
}

impl StatesMut for ReadTxn<'_> {
    fn state_of(&self, dbi: Dbi) -> Option<&DbState> {
        self.dbs.get(dbi.index()).and_then(|s| s.as_ref())
    }

    fn install_state(&mut self, dbi: Dbi, rec: DbRecord) {
        if self.dbs.len() <= dbi.index() {
            self.dbs.resize_with(dbi.index() + 1, || None);
        }
        self.dbs[dbi.index()] = Some(DbState { rec, dirty: false });
    }
}

// ---------------------------------------------------------------------
// Write transactions
// ---------------------------------------------------------------------

/// Snapshot taken by `begin_nested`.
struct NestFrame {
    dbs: Vec<Option<DbState>>,
    dirty_len: usize,
    free_len: usize,
    consumed_len: usize,
    loose: Vec<u64>,
    pghead: Vec<u64>,
    /// `(outer_dirty_page, shadow_page)` pairs created in this frame.
    shadows: Vec<(u64, u64)>,
}

pub struct WriteTxn<'env> {
    env: &'env Env,
    id: u64,
    begin_seqno: u64,
    meta: MetaPage,
    dbs: Vec<Option<DbState>>,
    guard: Option<WriterGuard<'env>>,
    /// Pages allocated (or copied into) by this transaction, in order.
    dirty: Vec<u64>,
    /// pgno -> frame level that owns the dirty copy.
    dirty_set: HashMap<u64, u32>,
    /// Early-flushed dirty pages, as `pgno << 1`; low bit = unspilled.
    spill: Vec<u64>,
    /// Published pages freed by this transaction.
    free_pgs: Vec<u64>,
    /// Unpublished dirty pages freed by this transaction, kept for reuse.
    loose: Vec<u64>,
    /// Reclaimed ids from old free-list records, sorted ascending.
    pghead: Vec<u64>,
    /// Every id ever merged into `pghead`. Abort must keep their bitmap
    /// bits set: the free-list records naming them survive the abort.
    reclaimed: HashSet<u64>,
    /// Highest free-list key merged into `pghead`.
    pglast: u64,
    /// Free-list keys consumed this transaction; deleted at commit.
    consumed: Vec<u64>,
    frames: Vec<NestFrame>,
    /// Guards free-list maintenance against reentrant reclamation.
    in_alloc: bool,
    errored: bool,
    finished: bool,
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn new(env: &'env Env) -> Result<Self> {
        env.fail_if_poisoned()?;
        if env.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::InvalidArg("environment is read-only"));
        }
        let guard = env.inner.lockers.lock_writer()?;
        let meta = env.meta_snapshot();
        if meta.mapsize > (env.inner.geo.total_pages * PAGE_SIZE as u64) {
            return Err(Error::MapResized);
        }
        Ok(WriteTxn {
            env,
            id: meta.txnid + 1,
            begin_seqno: env.root_seqno(),
            dbs: core_states(&meta),
            meta,
            guard: Some(guard),
            dirty: Vec::new(),
            dirty_set: HashMap::new(),
            spill: Vec::new(),
            free_pgs: Vec::new(),
            loose: Vec::new(),
            pghead: Vec::new(),
            reclaimed: HashSet::new(),
            pglast: 0,
            consumed: Vec::new(),
            frames: Vec::new(),
            in_alloc: false,
            errored: false,
            finished: false,
        })
    }

    fn usable(&self) -> Result<()> {
        if self.errored || self.finished {
            return Err(Error::BadTxn);
        }
        self.env.fail_if_poisoned()
    }

    fn level(&self) -> u32 {
        self.frames.len() as u32
    }

    // -- table management ------------------------------------------------

    pub fn open_db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Dbi> {
        self.usable()?;
        match open_db_read(self, name, flags) {
            Err(Error::NotFound) if flags.contains(DbFlags::CREATE) && name.is_some() => {
                self.create_db(name.unwrap(), flags)
            }
            other => other,
        }
    }

    fn create_db(&mut self, name: &str, flags: DbFlags) -> Result<Dbi> {
        if !self.env.db_flags_ok(flags) {
            return Err(Error::Incompatible);
        }
        let rec = DbRecord::empty(flags.persistent());
        self.put_db_record(name, &rec)?;
        let dbi = {
            self.env.inner.dbis.write().insert(
                name.to_string(),
                flags & !DbFlags::CREATE,
                self.env.inner.maxdbs,
            )?
        };
        self.install_state(dbi, rec);
        if let Some(state) = self.dbs[dbi.index()].as_mut() {
            state.dirty = true;
        }
        log::debug!("created table {name:?}");
        Ok(dbi)
    }

    /// Write a named table's record into the main table.
    fn put_db_record(&mut self, name: &str, rec: &DbRecord) -> Result<()> {
        let bytes = bytemuck::bytes_of(rec).to_vec();
        let mut cursor = CursorMut::new_raw(self, main_dbi())?;
        cursor.put_sub_record(name.as_bytes(), &bytes)
    }

    /// Empty a named table, or delete it entirely.
    pub fn drop_db(&mut self, dbi: Dbi, delete: bool) -> Result<()> {
        self.usable()?;
        if dbi.index() < CORE_DBS && delete {
            return Err(Error::InvalidArg("core tables cannot be deleted"));
        }
        let rec = self.db_state(dbi)?.rec;
        if rec.root != P_INVALID {
            self.free_tree(rec.root)?;
        }
        let flags = rec.flags;
        let state = self.state_mut(dbi)?;
        state.rec = DbRecord::empty(flags);
        state.dirty = true;
        if delete {
            let name = {
                let dbis = self.env.inner.dbis.read();
                dbis.get(dbi)?.name.clone().ok_or(Error::BadDbi)?
            };
            let mut cursor = CursorMut::new_raw(self, main_dbi())?;
            cursor.del_sub_record(name.as_bytes())?;
            self.env.inner.dbis.write().close(dbi);
            self.dbs[dbi.index()] = None;
        }
        Ok(())
    }

    /// Free every page reachable from `root`, including overflow chains
    /// and duplicate sub-trees.
    fn free_tree(&mut self, root: u64) -> Result<()> {
        let mut stack = vec![root];
        while let Some(pgno) = stack.pop() {
            let mut overflow_pages = Vec::new();
            let mut sub_roots = Vec::new();
            {
                let node = self.node(pgno)?;
                if node.is_branch() {
                    for i in 0..node.num_entries() {
                        stack.push(node.child(i)?);
                    }
                } else if node.is_leaf() && !node.is_leaf2() {
                    for i in 0..node.num_entries() {
                        let flags = node.entry_flags(i)?;
                        if flags & node::F_OVERFLOW != 0 {
                            let (first, last, _) = node.overflow_span(i)?;
                            for pg in first..=last {
                                overflow_pages.push(pg);
                            }
                        } else if flags & node::F_SUBDATA != 0 {
                            let rec: DbRecord = bytemuck::pod_read_unaligned(node.value(i)?);
                            if rec.root != P_INVALID {
                                sub_roots.push(rec.root);
                            }
                        }
                    }
                }
            }
            for pg in overflow_pages {
                self.free_page(pg)?;
            }
            stack.extend(sub_roots);
            self.free_page(pgno)?;
        }
        Ok(())
    }

    // -- data plane ------------------------------------------------------

    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Cow<'_, [u8]>> {
        self.usable()?;
        crate::cursor::tree_get(self, dbi, key)
    }

    pub fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.usable()?;
        let mut cursor = CursorMut::new(self, dbi)?;
        let res = cursor.put(key, value, flags);
        drop(cursor);
        self.note(res)
    }

    /// Insert a zero-filled value of `len` bytes and return it for the
    /// caller to fill before commit.
    pub fn reserve(&mut self, dbi: Dbi, key: &[u8], len: usize) -> Result<&mut [u8]> {
        self.usable()?;
        let zeros = vec![0u8; len];
        let mut cursor = CursorMut::new(self, dbi)?;
        let res = cursor.put(key, &zeros, WriteFlags::empty());
        drop(cursor);
        self.note(res)?;
        let cursor = CursorMut::new(self, dbi)?;
        cursor.reserve_current(key)
    }

    pub fn del(&mut self, dbi: Dbi, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.usable()?;
        let mut cursor = CursorMut::new(self, dbi)?;
        let res = cursor.del_key(key, value);
        drop(cursor);
        self.note(res)
    }

    pub fn cursor(&self, dbi: Dbi) -> Result<Cursor<'_, Self>> {
        self.usable()?;
        Cursor::new(self, dbi)
    }

    pub fn cursor_mut<'t>(&'t mut self, dbi: Dbi) -> Result<CursorMut<'t, 'env>> {
        self.usable()?;
        CursorMut::new(self, dbi)
    }

    pub fn db_stat(&self, dbi: Dbi) -> Result<Stat> {
        Ok(Stat::from_record(&self.db_state(dbi)?.rec))
    }

    pub fn set_compare(&self, dbi: Dbi, cmp: KeyCmp) -> Result<()> {
        self.env.inner.dbis.write().set_compare(dbi, cmp)
    }

    pub fn set_dup_compare(&self, dbi: Dbi, cmp: KeyCmp) -> Result<()> {
        self.env.inner.dbis.write().set_dup_compare(dbi, cmp)
    }

    /// Record a fatal data-plane failure: the transaction can only abort.
    fn note<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            match e {
                Error::NotFound | Error::Exists | Error::Incompatible | Error::BadValSize(_)
                | Error::InvalidArg(_) | Error::BadDbi => {}
                _ => {
                    self.errored = true;
                }
            }
        }
        res
    }

    // -- page plane (used by the cursor layer) ---------------------------

    /// Allocate `num` contiguous pages, preferring recycled ones.
    pub(crate) fn alloc_pages(&mut self, num: u64) -> Result<u64> {
        debug_assert!(num >= 1);
        if self.dirty.len() + num as usize > MAX_DIRTY {
            return Err(Error::TxnFull);
        }
        // Loose pages are unpublished dirties of this transaction.
        if num == 1 && self.frames.is_empty() && !self.in_alloc {
            if let Some(pg) = self.loose.pop() {
                self.dirty.push(pg);
                self.dirty_set.insert(pg, self.level());
                return Ok(pg);
            }
            if let Some(pg) = self.take_from_pghead(1) {
                self.dirty.push(pg);
                self.dirty_set.insert(pg, self.level());
                return Ok(pg);
            }
            while self.reclaim()? {
                if let Some(pg) = self.take_from_pghead(1) {
                    self.dirty.push(pg);
                    self.dirty_set.insert(pg, self.level());
                    return Ok(pg);
                }
            }
        } else if num > 1 && self.frames.is_empty() && !self.in_alloc {
            if let Some(pg) = self.take_from_pghead(num) {
                for p in pg..pg + num {
                    self.dirty.push(p);
                    self.dirty_set.insert(p, self.level());
                }
                return Ok(pg);
            }
        }

        let pg = loop {
            let res = if num == 1 {
                self.env.alloc()
            } else {
                self.env.alloc_run(num)
            };
            match res {
                Ok(pg) => break pg,
                Err(Error::MapFull)
                    if num > 1 && self.frames.is_empty() && !self.in_alloc =>
                {
                    // No fresh run left; reclaiming may assemble one.
                    if !self.reclaim()? {
                        return Err(Error::MapFull);
                    }
                    if let Some(pg) = self.take_from_pghead(num) {
                        for p in pg..pg + num {
                            self.dirty.push(p);
                            self.dirty_set.insert(p, self.level());
                        }
                        return Ok(pg);
                    }
                }
                Err(e) => return Err(e),
            }
        };
        for p in pg..pg + num {
            self.dirty.push(p);
            self.dirty_set.insert(p, self.level());
        }
        if pg + num - 1 > self.meta.last_pg {
            self.meta.last_pg = pg + num - 1;
        }
        Ok(pg)
    }

    fn take_from_pghead(&mut self, num: u64) -> Option<u64> {
        if num == 1 {
            if self.pghead.is_empty() {
                return None;
            }
            return Some(self.pghead.remove(0));
        }
        let n = num as usize;
        let len = self.pghead.len();
        if len < n {
            return None;
        }
        for i in 0..=len - n {
            if self.pghead[i + n - 1] == self.pghead[i] + num - 1 {
                let pg = self.pghead[i];
                self.pghead.drain(i..i + n);
                return Some(pg);
            }
        }
        None
    }

    /// Merge one more old-enough free-list record into `pghead`.
    fn reclaim(&mut self) -> Result<bool> {
        if self.in_alloc || !self.frames.is_empty() {
            return Ok(false);
        }
        let oldest = self.env.inner.lockers.oldest(self.id);
        self.in_alloc = true;
        let res = (|| -> Result<bool> {
            let mut from = self.pglast + 1;
            loop {
                let tree = self.tree_of(free_dbi())?;
                if tree.root == P_INVALID {
                    return Ok(false);
                }
                let mut key = [0u8; 8];
                LittleEndian::write_u64(&mut key, from);
                let Some((txnid, ids)) =
                    crate::cursor::freelist_next(self, &tree, &key)?
                else {
                    return Ok(false);
                };
                if txnid >= oldest {
                    return Ok(false);
                }
                if txnid <= self.pglast {
                    from = self.pglast + 1;
                    continue;
                }
                log::debug!(
                    "reclaiming {} pages freed by transaction {txnid}",
                    ids.len()
                );
                self.reclaimed.extend(ids.iter().copied());
                self.pghead.extend_from_slice(&ids);
                self.pghead.sort_unstable();
                self.pglast = txnid;
                self.consumed.push(txnid);
                return Ok(true);
            }
        })();
        self.in_alloc = false;
        res
    }

    /// Copy-on-write entry point. Returns the page id holding the
    /// writable copy (the same id when the page is already ours).
    pub(crate) fn touch_page(&mut self, pgno: u64) -> Result<u64> {
        // Spilled pages only need their bookkeeping back.
        if let Some(pos) = self.spill.iter().position(|s| *s == pgno << 1) {
            self.spill[pos] |= 1;
            self.dirty.push(pgno);
            self.dirty_set.insert(pgno, self.level());
            return Ok(pgno);
        }
        match self.dirty_set.get(&pgno).copied() {
            Some(level) if level == self.level() => Ok(pgno),
            Some(_) => {
                // An outer frame owns this dirty page; shadow it so the
                // outer state survives an abort of this frame.
                let new = self.shadow_copy(pgno)?;
                self.frames
                    .last_mut()
                    .expect("shadow only happens inside a frame")
                    .shadows
                    .push((pgno, new));
                Ok(new)
            }
            None => {
                let new = self.shadow_copy(pgno)?;
                self.free_pgs.push(pgno);
                Ok(new)
            }
        }
    }

    fn shadow_copy(&mut self, pgno: u64) -> Result<u64> {
        let new = self.alloc_pages(1)?;
        unsafe {
            let src = self.env.page_ptr(pgno);
            let dst = self.env.page_ptr(new);
            std::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
            let page = self.env.page_mut(new)?;
            // The copy carries its own id and the writable-copy mark.
            page[..8].copy_from_slice(&new.to_le_bytes());
            NodeMut::new(page).set_copy(true);
        }
        Ok(new)
    }

    /// A writable view of a page this transaction owns.
    pub(crate) fn node_mut(&mut self, pgno: u64) -> Result<NodeMut<'_>> {
        debug_assert!(
            self.dirty_set.contains_key(&pgno),
            "mutable access to a page this transaction does not own"
        );
        unsafe { Ok(NodeMut::new(self.env.page_mut(pgno)?)) }
    }

    /// Initialize a freshly allocated page as a node.
    pub(crate) fn init_node(&mut self, pgno: u64, parent: u64, flags: u16, leaf2: u16) -> Result<()> {
        if !self.env.flags().contains(EnvFlags::NOMEMINIT) {
            unsafe {
                self.env.page_mut(pgno)?.fill(0);
            }
        }
        let mut node = self.node_mut(pgno)?;
        node.init(pgno, parent, flags, leaf2);
        Ok(())
    }

    /// Drop a page this transaction can no longer reach.
    pub(crate) fn free_page(&mut self, pgno: u64) -> Result<()> {
        match self.dirty_set.get(&pgno).copied() {
            Some(level) if level == self.level() && self.frames.is_empty() => {
                // Never published: keep it loose for immediate reuse.
                self.dirty_set.remove(&pgno);
                if let Some(pos) = self.dirty.iter().position(|p| *p == pgno) {
                    self.dirty.swap_remove(pos);
                }
                unsafe {
                    NodeMut::new(self.env.page_mut(pgno)?).init(pgno, 0, node::P_LOOSE, 0);
                }
                self.loose.push(pgno);
                Ok(())
            }
            Some(level) if level == self.level() => {
                // Frame-local page: release outright; the bitmap bit is
                // the only bookkeeping it has.
                self.dirty_set.remove(&pgno);
                if let Some(pos) = self.dirty.iter().position(|p| *p == pgno) {
                    self.dirty.swap_remove(pos);
                }
                self.env.release(pgno)
            }
            Some(_) => {
                // Owned by an outer frame; only the outer level may
                // decide its fate. Treat it like a published page.
                self.free_pgs.push(pgno);
                Ok(())
            }
            None => {
                if let Some(pos) = self.spill.iter().position(|s| *s >> 1 == pgno) {
                    self.spill.swap_remove(pos);
                }
                self.free_pgs.push(pgno);
                Ok(())
            }
        }
    }

    /// Write `value` into a fresh overflow chain.
    pub(crate) fn write_overflow(&mut self, value: &[u8]) -> Result<(u64, u64)> {
        let npages = node::overflow_pages(value.len());
        let first = self.alloc_pages(npages)?;
        let last = first + npages - 1;
        let mut off = 0usize;
        for pg in first..=last {
            self.init_node(pg, 0, node::P_OVERFLOW, 0)?;
            let mut n = self.node_mut(pg)?;
            n.set_aux(npages)?;
            let chunk = value.len().min(off + node::OVERFLOW_DATA) - off;
            unsafe {
                let page = self.env.page_mut(pg)?;
                page[node::NODE_HDR..node::NODE_HDR + chunk]
                    .copy_from_slice(&value[off..off + chunk]);
            }
            off += chunk;
        }
        Ok((first, last))
    }

    /// Release an overflow chain.
    pub(crate) fn free_overflow(&mut self, first: u64, last: u64) -> Result<()> {
        for pg in first..=last {
            self.free_page(pg)?;
        }
        Ok(())
    }

    /// Early-write dirty pages when the dirty list outgrows its room.
    /// Pages named in `keep` (the active cursor's stack) are marked
    /// `P_KEEP` and stay resident.
    pub(crate) fn spill_check(&mut self, keep: &[u64]) -> Result<()> {
        if self.dirty.len() < DIRTY_ROOM || !self.frames.is_empty() {
            return Ok(());
        }
        if self.env.flags().contains(EnvFlags::NOSYNC) {
            return Ok(());
        }
        for pg in keep {
            if self.dirty_set.contains_key(pg) {
                unsafe {
                    NodeMut::new(self.env.page_mut(*pg)?).set_keep(true);
                }
            }
        }
        let mut spilled = 0usize;
        let target = self.dirty.len() / 8;
        let mut i = 0;
        while i < self.dirty.len() && spilled < target {
            let pg = self.dirty[i];
            let kept = self.node(pg)?.flags() & node::P_KEEP != 0;
            if kept {
                i += 1;
                continue;
            }
            self.env.flush_pages(pg, 1)?;
            self.spill.push(pg << 1);
            self.dirty_set.remove(&pg);
            self.dirty.swap_remove(i);
            spilled += 1;
        }
        for pg in keep {
            if self.dirty_set.contains_key(pg) {
                unsafe {
                    NodeMut::new(self.env.page_mut(*pg)?).set_keep(false);
                }
            }
        }
        if spilled > 0 {
            log::debug!("spilled {spilled} dirty pages");
        }
        Ok(())
    }

    // -- nested transactions --------------------------------------------

    /// Begin a nested write transaction over this one.
    pub fn begin_nested(&mut self) -> Result<()> {
        self.usable()?;
        self.frames.push(NestFrame {
            dbs: self.dbs.clone(),
            dirty_len: self.dirty.len(),
            free_len: self.free_pgs.len(),
            consumed_len: self.consumed.len(),
            loose: self.loose.clone(),
            pghead: self.pghead.clone(),
            shadows: Vec::new(),
        });
        Ok(())
    }

    /// Commit the innermost nested transaction into its parent.
    pub fn commit_nested(&mut self) -> Result<()> {
        self.usable()?;
        let frame = self.frames.pop().ok_or(Error::BadTxn)?;
        let inner_level = self.frames.len() as u32 + 1;
        // Shadowed outer copies are unreachable now; release them, except
        // reclaimed pages, which stay pinned by their free-list records.
        for (old, _new) in frame.shadows {
            self.dirty_set.remove(&old);
            if let Some(pos) = self.dirty.iter().position(|p| *p == old) {
                self.dirty.swap_remove(pos);
            }
            if self.reclaimed.contains(&old) {
                let at = self.pghead.partition_point(|p| *p < old);
                self.pghead.insert(at, old);
            } else {
                self.env.release(old)?;
            }
        }
        for level in self.dirty_set.values_mut() {
            if *level == inner_level {
                *level -= 1;
            }
        }
        Ok(())
    }

    /// Abort the innermost nested transaction.
    pub fn abort_nested(&mut self) -> Result<()> {
        let frame = self.frames.pop().ok_or(Error::BadTxn)?;
        self.dbs = frame.dbs;
        self.free_pgs.truncate(frame.free_len);
        self.consumed.truncate(frame.consumed_len);
        self.loose = frame.loose;
        self.pghead = frame.pghead;
        for pg in self.dirty.split_off(frame.dirty_len) {
            self.dirty_set.remove(&pg);
            self.env.release(pg)?;
        }
        Ok(())
    }

    // -- commit / abort --------------------------------------------------

    pub fn commit(mut self) -> Result<()> {
        self.usable()?;
        if !self.frames.is_empty() {
            return Err(Error::BadTxn);
        }
        match self.commit_inner() {
            Ok(()) => {
                self.finished = true;
                Ok(())
            }
            Err(e) => {
                log::error!("commit failed, aborting: {e}");
                self.errored = true;
                self.abort_inner();
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        // Nothing written: just release the writer.
        if self.dirty.is_empty()
            && self.spill.is_empty()
            && self.free_pgs.is_empty()
            && self.loose.is_empty()
            && !self.dbs.iter().flatten().any(|s| s.dirty)
        {
            self.finished = true;
            return Ok(());
        }

        // 1. Persist changed named-table records into the main table.
        let named: Vec<(usize, DbRecord)> = self
            .dbs
            .iter()
            .enumerate()
            .skip(CORE_DBS)
            .filter_map(|(i, s)| {
                s.as_ref()
                    .filter(|s| s.dirty)
                    .map(|s| (i, s.rec))
            })
            .collect();
        for (index, rec) in named {
            let name = {
                let dbis = self.env.inner.dbis.read();
                dbis.get(Dbi(index as u32))?
                    .name
                    .clone()
                    .ok_or(Error::BadDbi)?
            };
            self.put_db_record(&name, &rec)?;
        }

        // 2. Free-list maintenance.
        self.save_freelist()?;

        let flags = self.env.flags();
        let sync = !flags.contains(EnvFlags::NOSYNC);

        // 3. Publish the copies: clear the is-copy bit everywhere.
        let mut to_flush: Vec<u64> = self
            .dirty
            .iter()
            .copied()
            .chain(self.spill.iter().map(|s| s >> 1))
            .collect();
        to_flush.sort_unstable();
        to_flush.dedup();
        for pg in &to_flush {
            unsafe {
                NodeMut::new(self.env.page_mut(*pg)?).set_copy(false);
            }
        }

        // 4. Flush data pages and the bitmap, then wait on the worker.
        if sync {
            let mut run_start = None;
            let mut prev = 0u64;
            for pg in to_flush.iter().copied() {
                match run_start {
                    None => {
                        run_start = Some(pg);
                        prev = pg;
                    }
                    Some(start) => {
                        if pg == prev + 1 {
                            prev = pg;
                        } else {
                            self.env.flush_pages(start, prev - start + 1)?;
                            run_start = Some(pg);
                            prev = pg;
                        }
                    }
                }
            }
            if let Some(start) = run_start {
                self.env.flush_pages(start, prev - start + 1)?;
            }
            self.env
                .flush_pages(2, self.env.inner.geo.bitmap_pages)?;
            let (_, ticket) = self.env.register_notification()?;
            ticket.wait()?;
        }

        // 5. The meta flip is the commit point.
        let mut meta = self.meta;
        meta.dbs[FREE_DBI] = self.dbs[FREE_DBI].as_ref().map(|s| s.rec).unwrap_or(meta.dbs[FREE_DBI]);
        meta.dbs[MAIN_DBI] = self.dbs[MAIN_DBI].as_ref().map(|s| s.rec).unwrap_or(meta.dbs[MAIN_DBI]);
        meta.txnid = self.id;
        meta.root = meta.dbs[MAIN_DBI].root;
        if flags.contains(EnvFlags::FIXEDMAP) {
            meta.address = self.env.base() as u64;
        }
        meta.seal();
        self.env.publish_meta(self.begin_seqno, &meta)?;
        if sync && !flags.contains(EnvFlags::NOMETASYNC) {
            self.env.flush_metas()?;
        }

        log::debug!(
            "transaction {} committed: {} pages written, {} freed",
            self.id,
            to_flush.len(),
            self.free_pgs.len()
        );
        self.dirty.clear();
        self.dirty_set.clear();
        self.spill.clear();
        self.loose.clear();
        Ok(())
    }

    /// Write this transaction's freed pages into the free-list table and
    /// drop the records it consumed.
    fn save_freelist(&mut self) -> Result<()> {
        self.in_alloc = true;
        let res = (|| -> Result<()> {
            // Unused reclaimed pages ride back under the first consumed
            // key; remaining consumed records are deleted.
            let returned = std::mem::take(&mut self.pghead);
            let consumed = std::mem::take(&mut self.consumed);
            let mut consumed = consumed.into_iter();
            if !returned.is_empty() {
                let key_id = consumed.next().expect("pghead implies a consumed record");
                self.put_free_record(key_id, &returned)?;
            }
            for key_id in consumed {
                let mut key = [0u8; 8];
                LittleEndian::write_u64(&mut key, key_id);
                let mut cursor = CursorMut::new_raw(self, free_dbi())?;
                cursor.del_key(&key, None)?;
            }

            // Loose pages never made it into any snapshot, but a crash
            // between here and the flip must not leak them: record them
            // as frees of this transaction.
            let loose = std::mem::take(&mut self.loose);
            self.free_pgs.extend(loose);

            // Writing the free record can itself free pages (touched
            // free-table nodes); loop until the list stops growing.
            let mut saved = false;
            loop {
                let pending = std::mem::take(&mut self.free_pgs);
                if pending.is_empty() {
                    break;
                }
                if saved {
                    // Merge follow-up frees into the same record.
                    let mut all = self.read_own_free_record()?;
                    all.extend_from_slice(&pending);
                    self.put_free_record(self.id, &all)?;
                } else {
                    self.put_free_record(self.id, &pending)?;
                    saved = true;
                }
            }
            Ok(())
        })();
        self.in_alloc = false;
        res
    }

    fn put_free_record(&mut self, key_id: u64, ids: &[u64]) -> Result<()> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut value = vec![0u8; sorted.len() * 8];
        for (i, id) in sorted.iter().enumerate() {
            LittleEndian::write_u64(&mut value[i * 8..], *id);
        }
        let mut key = [0u8; 8];
        LittleEndian::write_u64(&mut key, key_id);
        let mut cursor = CursorMut::new_raw(self, free_dbi())?;
        cursor.put(&key, &value, WriteFlags::empty())
    }

    fn read_own_free_record(&self) -> Result<Vec<u64>> {
        let mut key = [0u8; 8];
        LittleEndian::write_u64(&mut key, self.id);
        match self.get(free_dbi(), &key) {
            Ok(v) => Ok(v
                .chunks_exact(8)
                .map(LittleEndian::read_u64)
                .collect()),
            Err(Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn abort(mut self) {
        self.abort_inner();
        self.finished = true;
    }

    fn abort_inner(&mut self) {
        while !self.frames.is_empty() {
            let _ = self.abort_nested();
        }
        // Reclaimed pages stay allocated in the bitmap: the free-list
        // records that name them survive this abort untouched.
        for pg in std::mem::take(&mut self.dirty) {
            if !self.reclaimed.contains(&pg) {
                let _ = self.env.release(pg);
            }
        }
        for s in std::mem::take(&mut self.spill) {
            if s & 1 == 0 && !self.reclaimed.contains(&(s >> 1)) {
                let _ = self.env.release(s >> 1);
            }
        }
        for pg in std::mem::take(&mut self.loose) {
            if !self.reclaimed.contains(&pg) {
                let _ = self.env.release(pg);
            }
        }
        self.dirty_set.clear();
        self.free_pgs.clear();
        self.pghead.clear();
        self.reclaimed.clear();
        self.consumed.clear();
    }

    pub(crate) fn state_mut(&mut self, dbi: Dbi) -> Result<&mut DbState> {
        self.dbs
            .get_mut(dbi.index())
            .and_then(|s| s.as_mut())
            .ok_or(Error::BadDbi)
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort_inner();
        }
        // Guard drops here, releasing the writer mutex.
        self.guard.take();
    }
}

impl internal::TxnInternal for WriteTxn<'_> {
    fn env_ref(&self) -> &Env {
        self.env
    }

    fn snapshot_id(&self) -> u64 {
        self.id
    }

    fn db_state(&self, dbi: Dbi) -> Result<&DbState> {
        self.dbs
            .get(dbi.index())
            .and_then(|s| s.as_ref())
            .ok_or(Error::BadDbi)
    }

    fn tree_of(&self, dbi: Dbi) -> Result<TreeRef> {
        load_tree(self, dbi)
    }

    fn node(&self, pgno: u64) -> Result<NodeRef<'_>> {
        Ok(NodeRef::new(self.env.page(pgno)?))
    }
}

impl TxnRead for WriteTxn<'_> {
    fn id(&self) -> u64 {
        self.id
    }
}

impl StatesMut for WriteTxn<'_> {
    fn state_of(&self, dbi: Dbi) -> Option<&DbState> {
        self.dbs.get(dbi.index()).and_then(|s| s.as_ref())
    }

    fn install_state(&mut self, dbi: Dbi, rec: DbRecord) {
        if self.dbs.len() <= dbi.index() {
            self.dbs.resize_with(dbi.index() + 1, || None);
        }
        self.dbs[dbi.index()] = Some(DbState { rec, dirty: false });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    fn env(pages: usize) -> Env {
        Env::options()
            .map_size(pages * PAGE_SIZE)
            .open_anon()
            .unwrap()
    }

    #[test]
    fn put_commit_get() {
        let env = env(64);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"test_key", b"test_value", WriteFlags::empty())
            .unwrap();
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
        let v = rtxn.get(dbi, b"test_key").unwrap();
        assert_eq!(&*v, b"test_value");
        assert_eq!(v.len(), 10);
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let env = env(64);
        {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            txn.put(dbi, b"k", b"v", WriteFlags::empty()).unwrap();
            txn.abort();
        }
        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
        assert!(matches!(rtxn.get(dbi, b"k"), Err(Error::NotFound)));
    }

    #[test]
    fn reader_sees_begin_time_snapshot() {
        let env = env(64);
        {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            txn.put(dbi, b"stable", b"1", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
        }

        let mut old = env.begin_read().unwrap();
        let old_dbi = old.open_db(None, DbFlags::empty()).unwrap();

        {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            txn.put(dbi, b"fresh", b"2", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
        }

        assert!(matches!(old.get(old_dbi, b"fresh"), Err(Error::NotFound)));
        assert_eq!(&*old.get(old_dbi, b"stable").unwrap(), b"1");

        let mut new = env.begin_read().unwrap();
        let new_dbi = new.open_db(None, DbFlags::empty()).unwrap();
        assert_eq!(&*new.get(new_dbi, b"fresh").unwrap(), b"2");
        assert!(new.id() > old.id());
    }

    #[test]
    fn overwrite_and_delete() {
        let env = env(64);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"k", b"v1", WriteFlags::empty()).unwrap();
        txn.put(dbi, b"k", b"v2", WriteFlags::empty()).unwrap();
        assert_eq!(&*txn.get(dbi, b"k").unwrap(), b"v2");
        assert!(matches!(
            txn.put(dbi, b"k", b"v3", WriteFlags::NOOVERWRITE),
            Err(Error::Exists)
        ));
        txn.del(dbi, b"k", None).unwrap();
        assert!(matches!(txn.get(dbi, b"k"), Err(Error::NotFound)));
        assert!(matches!(txn.del(dbi, b"k", None), Err(Error::NotFound)));
        txn.commit().unwrap();
    }

    #[test]
    fn zero_and_max_size_keys() {
        let env = env(64);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"", b"empty", WriteFlags::empty()).unwrap();
        let big_key = vec![7u8; crate::MAX_KEY_SIZE];
        txn.put(dbi, &big_key, b"max", WriteFlags::empty()).unwrap();
        let over = vec![7u8; crate::MAX_KEY_SIZE + 1];
        assert!(matches!(
            txn.put(dbi, &over, b"no", WriteFlags::empty()),
            Err(Error::BadValSize(_))
        ));
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
        assert_eq!(&*rtxn.get(dbi, b"").unwrap(), b"empty");
        assert_eq!(&*rtxn.get(dbi, &big_key).unwrap(), b"max");
    }

    #[test]
    fn overflow_values_round_trip() {
        let env = env(256);
        let value: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"big", &value, WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
        assert_eq!(&*rtxn.get(dbi, b"big").unwrap(), &value[..]);
        drop(rtxn);

        // Replacing the value retires the old chain.
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"big", b"small-now", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
        assert_eq!(&*rtxn.get(dbi, b"big").unwrap(), b"small-now");
    }

    #[test]
    fn map_full_recovers_after_abort() {
        let env = env(16);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        let mut full = false;
        for i in 0..10_000u32 {
            let key = i.to_be_bytes();
            match txn.put(dbi, &key, &[0u8; 512], WriteFlags::empty()) {
                Ok(()) => {}
                Err(Error::MapFull) => {
                    full = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(full);
        txn.abort();

        // The aborted transaction returned its pages; a new one works.
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"after", b"abort", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn freed_pages_are_recycled_across_transactions() {
        // Ten fill/clear rounds only fit if the free list is reclaimed.
        let env = env(64);
        for round in 0..10u32 {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            for i in 0..20u32 {
                let key = (round * 100 + i).to_be_bytes();
                txn.put(dbi, &key, &[round as u8; 1000], WriteFlags::empty())
                    .unwrap();
            }
            txn.commit().unwrap();

            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            for i in 0..20u32 {
                let key = (round * 100 + i).to_be_bytes();
                txn.del(dbi, &key, None).unwrap();
            }
            txn.commit().unwrap();
        }
    }

    #[test]
    fn live_reader_pins_free_pages() {
        let env = env(64);
        {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            txn.put(dbi, b"pinned", b"value", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
        }
        let mut pinned = env.begin_read().unwrap();
        let pinned_dbi = pinned.open_db(None, DbFlags::empty()).unwrap();

        {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            txn.del(dbi, b"pinned", None).unwrap();
            txn.commit().unwrap();
        }
        // More writes while the reader is live must not disturb it.
        for i in 0..5u32 {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            txn.put(dbi, &i.to_be_bytes(), &[i as u8; 800], WriteFlags::empty())
                .unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(&*pinned.get(pinned_dbi, b"pinned").unwrap(), b"value");
    }

    #[test]
    fn nested_abort_and_commit() {
        let env = env(64);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"outer", b"1", WriteFlags::empty()).unwrap();

        txn.begin_nested().unwrap();
        txn.put(dbi, b"inner-dropped", b"x", WriteFlags::empty()).unwrap();
        txn.abort_nested().unwrap();
        assert!(matches!(txn.get(dbi, b"inner-dropped"), Err(Error::NotFound)));
        assert_eq!(&*txn.get(dbi, b"outer").unwrap(), b"1");

        txn.begin_nested().unwrap();
        txn.put(dbi, b"inner-kept", b"y", WriteFlags::empty()).unwrap();
        txn.commit_nested().unwrap();
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
        assert_eq!(&*rtxn.get(dbi, b"inner-kept").unwrap(), b"y");
        assert_eq!(&*rtxn.get(dbi, b"outer").unwrap(), b"1");
        assert!(matches!(rtxn.get(dbi, b"inner-dropped"), Err(Error::NotFound)));
    }

    #[test]
    fn named_tables_create_and_drop() {
        let env = env(64);
        let mut txn = env.begin_write().unwrap();
        assert!(matches!(
            txn.open_db(Some("missing"), DbFlags::empty()),
            Err(Error::NotFound)
        ));
        let pets = txn.open_db(Some("pets"), DbFlags::CREATE).unwrap();
        txn.put(pets, b"cat", b"meow", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let pets = rtxn.open_db(Some("pets"), DbFlags::empty()).unwrap();
        assert_eq!(&*rtxn.get(pets, b"cat").unwrap(), b"meow");
        assert_eq!(rtxn.db_stat(pets).unwrap().entries, 1);
        drop(rtxn);

        let mut txn = env.begin_write().unwrap();
        let pets = txn.open_db(Some("pets"), DbFlags::empty()).unwrap();
        txn.drop_db(pets, true).unwrap();
        txn.commit().unwrap();

        let mut txn = env.begin_write().unwrap();
        assert!(matches!(
            txn.open_db(Some("pets"), DbFlags::empty()),
            Err(Error::NotFound)
        ));
        txn.abort();
    }

    #[test]
    fn reset_renew_reader() {
        let env = env(64);
        {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            txn.put(dbi, b"a", b"1", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
        }
        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
        rtxn.reset();
        assert!(matches!(rtxn.get(dbi, b"a"), Err(Error::BadTxn)));

        {
            let mut txn = env.begin_write().unwrap();
            let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
            txn.put(dbi, b"b", b"2", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
        }
        rtxn.renew().unwrap();
        assert_eq!(&*rtxn.get(dbi, b"b").unwrap(), b"2");
    }

    #[test]
    fn readers_full_at_limit() {
        let env = Env::options()
            .map_size(64 * PAGE_SIZE)
            .max_readers(2)
            .open_anon()
            .unwrap();
        let _r1 = env.begin_read().unwrap();
        let _r2 = env.begin_read().unwrap();
        assert!(matches!(env.begin_read(), Err(Error::ReadersFull)));
        drop(_r1);
        let _r3 = env.begin_read().unwrap();
    }

    #[test]
    fn reserve_returns_writable_value() {
        let env = env(64);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        {
            let slot = txn.reserve(dbi, b"r", 6).unwrap();
            slot.copy_from_slice(b"filled");
        }
        assert_eq!(&*txn.get(dbi, b"r").unwrap(), b"filled");
        txn.commit().unwrap();
    }

    #[test]
    fn integer_keys_require_fixed_width() {
        let env = env(64);
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(Some("ints"), DbFlags::CREATE | DbFlags::INTEGERKEY).unwrap();
        txn.put(dbi, &7u64.to_le_bytes(), b"seven", WriteFlags::empty())
            .unwrap();
        assert!(matches!(
            txn.put(dbi, b"odd", b"no", WriteFlags::empty()),
            Err(Error::BadValSize(_))
        ));
        // Numeric order, not byte order.
        txn.put(dbi, &256u64.to_le_bytes(), b"256", WriteFlags::empty())
            .unwrap();
        txn.put(dbi, &5u64.to_le_bytes(), b"5", WriteFlags::empty())
            .unwrap();
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(Some("ints"), DbFlags::empty()).unwrap();
        let mut cursor = rtxn.cursor(dbi).unwrap();
        let (k, _) = cursor.get(crate::CursorOp::First, None, None).unwrap();
        assert_eq!(LittleEndian::read_u64(&k), 5);
        let (k, _) = cursor.get(crate::CursorOp::Last, None, None).unwrap();
        assert_eq!(LittleEndian::read_u64(&k), 256);
    }
}
