//! The reader table and cross-process mutexes.
//!
//! A separate lock file is mapped read-write shared by every process
//! using the environment: a small header holding the robust reader and
//! writer locks, then `max_readers` cache-line-padded slots of
//! `(pid, txnid)`. The writer scans live slots to learn the oldest
//! transaction id any reader can still observe; slots of dead processes
//! are reaped using the pid-byte record-lock probe.
//!
//! Anonymous and `NOLOCK` environments use an in-process table with the
//! same surface.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use memmap2::{MmapOptions, MmapRaw};

use crate::error::{Error, Result};
use crate::lock::{self, RobustGuard};

const LOCK_MAGIC: u32 = 0x0BEE_70CC;
const LOCK_FORMAT: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_FORMAT: usize = 4;
const OFF_WLOCK: usize = 8;
const OFF_RLOCK: usize = 12;
const OFF_NUMREADERS: usize = 16;
const OFF_MAXREADERS: usize = 20;
/// Header is padded to one cache line; slots follow.
const SLOTS_BASE: usize = 64;
/// One slot per reader, cache-line padded: `pid` at +0, `txnid` at +8.
const SLOT_SIZE: usize = 64;

/// Slot txnid meaning "claimed but not yet snapshotted".
const TXN_INVALID: u64 = u64::MAX;

pub(crate) struct FileLockers {
    map: MmapRaw,
    file: File,
    maxreaders: usize,
}

unsafe impl Send for FileLockers {}
unsafe impl Sync for FileLockers {}

struct LocalSlot {
    used: bool,
    txnid: u64,
}

pub(crate) struct LocalLockers {
    slots: Mutex<Vec<LocalSlot>>,
    maxreaders: usize,
    wlock: Mutex<()>,
}

pub(crate) enum Lockers {
    File(FileLockers),
    Local(LocalLockers),
}

pub(crate) enum WriterGuard<'a> {
    File(RobustGuard<'a>),
    Local(MutexGuard<'a, ()>),
}

impl FileLockers {
    fn u32_at(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= self.map.len());
        unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU32) }
    }

    fn u64_at(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset + 8 <= self.map.len());
        unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU64) }
    }

    fn slot_pid(&self, slot: usize) -> &AtomicU32 {
        self.u32_at(SLOTS_BASE + slot * SLOT_SIZE)
    }

    fn slot_txnid(&self, slot: usize) -> &AtomicU64 {
        self.u64_at(SLOTS_BASE + slot * SLOT_SIZE + 8)
    }

    fn numreaders(&self) -> usize {
        self.u32_at(OFF_NUMREADERS).load(Ordering::Acquire) as usize
    }

    /// True iff the process owning `pid` is still alive, preferring the
    /// record-lock probe over the signal probe.
    fn slot_owner_alive(&self, pid: u32) -> bool {
        match lock::pid_byte_held(&self.file, pid) {
            Ok(held) => held,
            Err(_) => lock::pid_alive(pid),
        }
    }
}

impl Lockers {
    /// Open (creating if needed) the lock file beside the data file.
    pub fn open_file(path: &Path, maxreaders: usize) -> Result<Lockers> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(Error::Open)?;

        let wanted = SLOTS_BASE + maxreaders * SLOT_SIZE;
        let existing = file.metadata().map_err(Error::Open)?.len() as usize;
        let fresh = existing == 0;
        if existing < wanted {
            file.set_len(wanted as u64).map_err(|e| Error::Resize {
                size: existing,
                requested: wanted,
                source: e,
            })?;
        }
        let len = file.metadata().map_err(Error::Open)?.len() as usize;
        let map = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .map_err(|e| Error::Map {
                requested: len,
                source: e,
            })?;

        let lockers = FileLockers {
            map,
            file,
            maxreaders,
        };

        if fresh {
            lockers
                .u32_at(OFF_MAXREADERS)
                .store(maxreaders as u32, Ordering::Release);
            lockers.u32_at(OFF_FORMAT).store(LOCK_FORMAT, Ordering::Release);
            // Magic last: a reader seeing it may trust the rest.
            lockers.u32_at(OFF_MAGIC).store(LOCK_MAGIC, Ordering::Release);
        } else {
            if lockers.u32_at(OFF_MAGIC).load(Ordering::Acquire) != LOCK_MAGIC {
                return Err(Error::Corrupted("lock file magic mismatch"));
            }
            if lockers.u32_at(OFF_FORMAT).load(Ordering::Acquire) != LOCK_FORMAT {
                return Err(Error::VersionMismatch);
            }
        }

        // The first opener of this process marks itself alive.
        if let Err(e) = lock::lock_own_pid_byte(&lockers.file) {
            log::warn!("pid-byte record lock unavailable: {e}");
        }

        // An existing lock file's stored table size wins over ours.
        let effective = lockers.u32_at(OFF_MAXREADERS).load(Ordering::Acquire) as usize;
        let cap = (lockers.map.len() - SLOTS_BASE) / SLOT_SIZE;
        let mut lockers = lockers;
        lockers.maxreaders = effective.min(cap);
        Ok(Lockers::File(lockers))
    }

    pub fn local(maxreaders: usize) -> Lockers {
        Lockers::Local(LocalLockers {
            slots: Mutex::new(Vec::new()),
            maxreaders,
            wlock: Mutex::new(()),
        })
    }

    /// Claim a reader slot and record `(pid, txnid)` in it.
    pub fn claim_reader(&self, txnid: u64) -> Result<usize> {
        match self {
            Lockers::File(f) => {
                // Readers serialize against each other, not the writer.
                let _serial = lock::robust_lock(f.u32_at(OFF_RLOCK));
                let pid = lock::own_pid();
                for slot in 0..f.maxreaders {
                    let owner = f.slot_pid(slot).load(Ordering::Acquire);
                    let free = owner == 0
                        || (owner != pid && !f.slot_owner_alive(owner));
                    if free {
                        if owner != 0 {
                            log::warn!("reaping reader slot {slot} of dead process {owner}");
                        }
                        // txnid first so the writer never pairs a live pid
                        // with a stale snapshot id.
                        f.slot_txnid(slot).store(txnid, Ordering::Release);
                        f.slot_pid(slot).store(pid, Ordering::Release);
                        let n = f.u32_at(OFF_NUMREADERS);
                        let mut cur = n.load(Ordering::Acquire);
                        while (slot as u32) >= cur {
                            match n.compare_exchange(
                                cur,
                                slot as u32 + 1,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            ) {
                                Ok(_) => break,
                                Err(now) => cur = now,
                            }
                        }
                        return Ok(slot);
                    }
                }
                Err(Error::ReadersFull)
            }
            Lockers::Local(l) => {
                let mut slots = l.slots.lock().map_err(|_| Error::Panic)?;
                if let Some(i) = slots.iter().position(|s| !s.used) {
                    slots[i] = LocalSlot { used: true, txnid };
                    return Ok(i);
                }
                if slots.len() >= l.maxreaders {
                    return Err(Error::ReadersFull);
                }
                slots.push(LocalSlot { used: true, txnid });
                Ok(slots.len() - 1)
            }
        }
    }

    /// Refresh the snapshot id of an owned slot (`txn_renew`).
    pub fn update_reader(&self, slot: usize, txnid: u64) {
        match self {
            Lockers::File(f) => f.slot_txnid(slot).store(txnid, Ordering::Release),
            Lockers::Local(l) => {
                if let Ok(mut slots) = l.slots.lock() {
                    slots[slot].txnid = txnid;
                }
            }
        }
    }

    /// Park an owned slot without releasing it (`txn_reset`).
    pub fn park_reader(&self, slot: usize) {
        self.update_reader(slot, TXN_INVALID);
    }

    pub fn release_reader(&self, slot: usize) {
        match self {
            Lockers::File(f) => f.slot_pid(slot).store(0, Ordering::Release),
            Lockers::Local(l) => {
                if let Ok(mut slots) = l.slots.lock() {
                    slots[slot].used = false;
                }
            }
        }
    }

    /// Oldest transaction id any live reader may still observe; `newest`
    /// when the table is empty.
    pub fn oldest(&self, newest: u64) -> u64 {
        let mut oldest = newest;
        match self {
            Lockers::File(f) => {
                for slot in 0..f.numreaders().min(f.maxreaders) {
                    let pid = f.slot_pid(slot).load(Ordering::Acquire);
                    if pid == 0 {
                        continue;
                    }
                    if !f.slot_owner_alive(pid) {
                        continue;
                    }
                    let txnid = f.slot_txnid(slot).load(Ordering::Acquire);
                    if txnid != TXN_INVALID {
                        oldest = oldest.min(txnid);
                    }
                }
            }
            Lockers::Local(l) => {
                if let Ok(slots) = l.slots.lock() {
                    for s in slots.iter() {
                        if s.used && s.txnid != TXN_INVALID {
                            oldest = oldest.min(s.txnid);
                        }
                    }
                }
            }
        }
        oldest
    }

    /// Clear slots owned by dead processes. Returns how many were reaped.
    pub fn reap_dead(&self) -> usize {
        match self {
            Lockers::File(f) => {
                let mut reaped = 0;
                for slot in 0..f.numreaders().min(f.maxreaders) {
                    let pid = f.slot_pid(slot).load(Ordering::Acquire);
                    if pid != 0 && !f.slot_owner_alive(pid) {
                        log::warn!("reaping reader slot {slot} of dead process {pid}");
                        f.slot_pid(slot).store(0, Ordering::Release);
                        reaped += 1;
                    }
                }
                reaped
            }
            Lockers::Local(_) => 0,
        }
    }

    /// Take the single-writer mutex.
    pub fn lock_writer(&self) -> Result<WriterGuard<'_>> {
        match self {
            Lockers::File(f) => Ok(WriterGuard::File(lock::robust_lock(f.u32_at(OFF_WLOCK)))),
            Lockers::Local(l) => Ok(WriterGuard::Local(
                l.wlock.lock().map_err(|_| Error::Panic)?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn local_slots_claim_release() {
        let lockers = Lockers::local(2);
        let a = lockers.claim_reader(10).unwrap();
        let b = lockers.claim_reader(12).unwrap();
        assert_ne!(a, b);
        assert!(matches!(lockers.claim_reader(13), Err(Error::ReadersFull)));
        assert_eq!(lockers.oldest(20), 10);

        lockers.release_reader(a);
        assert_eq!(lockers.oldest(20), 12);
        let c = lockers.claim_reader(15).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn parked_slot_does_not_pin_reclamation() {
        let lockers = Lockers::local(2);
        let a = lockers.claim_reader(10).unwrap();
        lockers.park_reader(a);
        assert_eq!(lockers.oldest(42), 42);
        lockers.update_reader(a, 41);
        assert_eq!(lockers.oldest(42), 41);
    }

    #[test]
    fn file_table_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.bdb");
        let lockers = Lockers::open_file(&path, 4).unwrap();

        let slot = lockers.claim_reader(7).unwrap();
        assert_eq!(lockers.oldest(9), 7);
        lockers.release_reader(slot);
        assert_eq!(lockers.oldest(9), 9);

        // A second open sees the same format and honors the stored table.
        let again = Lockers::open_file(&path, 4).unwrap();
        let s = again.claim_reader(3).unwrap();
        assert_eq!(lockers.oldest(9), 3);
        again.release_reader(s);
    }

    #[test]
    fn writer_lock_is_exclusive_in_process() {
        let lockers = Lockers::local(2);
        let g = lockers.lock_writer().unwrap();
        drop(g);
        let _g2 = lockers.lock_writer().unwrap();
    }

    #[test]
    fn file_table_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.bdb");
        std::fs::write(&path, vec![0xffu8; 4096]).unwrap();
        assert!(Lockers::open_file(&path, 4).is_err());
    }
}
