//! The page space: a shared mapping partitioned into fixed-size pages.
//!
//! Pages 0 and 1 are the double-buffered meta pages; a bitmap starting at
//! page 2 tracks allocation of every data page behind it. The environment
//! also hosts the durability worker, a background thread that batches
//! `fdatasync` requests arriving over a bounded channel and certifies them
//! through a pair of monotonic counters.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use fs4::fs_std::FileExt;
use memmap2::{MmapOptions, MmapRaw};

use crate::channel::Channel;
use crate::db::DbiTable;
use crate::error::{Error, Result};
use crate::meta::MetaPage;
use crate::lock::WordRwCell;
use crate::readers::Lockers;
use crate::txn::{ReadTxn, WriteTxn};
use crate::{EnvFlags, DbFlags, PAGE_SIZE};

/// Most waiters woken by one sync cycle.
const MAX_WAKEUPS: usize = 128;
/// Depth of the durability channel.
const SYNC_QUEUE: usize = 256;

pub(crate) enum SyncMsg {
    Sync(mpsc::SyncSender<()>),
    Shutdown,
}

/// A completed registration with the durability worker.
pub struct SyncTicket {
    rx: mpsc::Receiver<()>,
}

impl SyncTicket {
    /// Block until the covering sync cycle completes.
    pub fn wait(self) -> Result<()> {
        self.rx.recv().map_err(|_| Error::WorkerGone)
    }
}

/// Backing storage: one mapping, optionally file-backed.
pub(crate) struct Storage {
    map: MmapRaw,
    file: Option<File>,
    readonly: bool,
}

impl Storage {
    pub fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Flush a byte range of the mapping to its backing file.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.map.flush_range(offset, len).map_err(Error::Sync)
    }

    /// Asynchronous flush of a byte range.
    pub fn flush_range_async(&self, offset: usize, len: usize) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.map.flush_async_range(offset, len).map_err(Error::Sync)
    }
}

/// Derived page-space geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    /// Total pages in the mapping.
    pub total_pages: u64,
    /// Pages occupied by the bitmap, starting at page 2.
    pub bitmap_pages: u64,
    /// Bytes of bitmap actually used.
    pub bitmap_bytes: u64,
    /// First data page: `2 + bitmap_pages`.
    pub data_start: u64,
    /// Number of allocatable data pages.
    pub num_pages: u64,
}

impl Geometry {
    pub fn derive(capacity: usize) -> Result<Geometry> {
        let p = PAGE_SIZE as u64;
        let total_pages = capacity as u64 / p;
        if capacity % PAGE_SIZE != 0 || total_pages < crate::MIN_PAGES {
            return Err(Error::InvalidArg("map size too small or not page-aligned"));
        }
        let nn = total_pages - 2;
        let bitmap_bytes = nn.div_ceil(8);
        let bitmap_pages = bitmap_bytes.div_ceil(p);
        if total_pages < 2 + bitmap_pages + 1 {
            return Err(Error::InvalidArg("map size too small or not page-aligned"));
        }
        let num_pages = total_pages - 2 - bitmap_pages;
        Ok(Geometry {
            total_pages,
            bitmap_pages,
            bitmap_bytes: num_pages.div_ceil(8),
            data_start: 2 + bitmap_pages,
            num_pages,
        })
    }
}

pub(crate) struct EnvInner {
    pub storage: Storage,
    pub geo: Geometry,
    pub flags: EnvFlags,
    pub maxdbs: usize,
    path: Option<PathBuf>,
    /// Scan start hint for the bitmap allocator.
    last_freed_word: AtomicU64,
    /// Root publication sequence number; advances once per `set_root`.
    seqno: AtomicU64,
    /// Sticky fatal flag. Once set, everything fails with `Panic`.
    panicked: AtomicBool,
    channel: Arc<Channel<SyncMsg>>,
    counter_pre: Arc<AtomicU64>,
    counter: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pub lockers: Lockers,
    pub dbis: WordRwCell<DbiTable>,
}

// The raw page accesses below hand out pointers into the mapping; the
// mapping itself lives as long as the inner value.
unsafe impl Send for EnvInner {}
unsafe impl Sync for EnvInner {}

/// A shared handle to an open environment.
#[derive(Clone)]
pub struct Env {
    pub(crate) inner: Arc<EnvInner>,
}

/// Builder for opening an environment, in the style of `std::fs::OpenOptions`.
#[derive(Debug, Clone)]
pub struct EnvOptions {
    map_size: usize,
    max_dbs: usize,
    max_readers: usize,
    mode: u32,
    flags: EnvFlags,
}

impl Default for EnvOptions {
    fn default() -> Self {
        EnvOptions {
            map_size: 1 << 20,
            max_dbs: 16,
            max_readers: 126,
            mode: 0o644,
            flags: EnvFlags::empty(),
        }
    }
}

impl EnvOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total size of the page space. Rounded up to a page multiple.
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    pub fn max_dbs(mut self, n: usize) -> Self {
        self.max_dbs = n;
        self
    }

    pub fn max_readers(mut self, n: usize) -> Self {
        self.max_readers = n;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Open an environment over an anonymous shared mapping. Lock-free,
    /// single-process, never durable.
    pub fn open_anon(&self) -> Result<Env> {
        let size = self.map_size.next_multiple_of(PAGE_SIZE);
        let geo = Geometry::derive(size)?;
        let map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|e| Error::Map {
                requested: size,
                source: e,
            })?;
        let map = MmapRaw::from(map);
        let storage = Storage {
            map,
            file: None,
            readonly: false,
        };
        Env::finish_open(
            storage,
            geo,
            self.flags | EnvFlags::NOLOCK,
            self,
            None,
            None,
        )
    }

    /// Open a file-backed environment. `path` names a directory unless
    /// `NOSUBDIR` is set, in which case it names the data file itself.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Env> {
        if page_size::get() > PAGE_SIZE || PAGE_SIZE % page_size::get() != 0 {
            return Err(Error::InvalidArg("page size is not a multiple of the OS page"));
        }

        let path = path.as_ref();
        let (data_path, lock_path) = if self.flags.contains(EnvFlags::NOSUBDIR) {
            let mut lock = path.as_os_str().to_owned();
            lock.push("-lock");
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            std::fs::create_dir_all(path).map_err(Error::Open)?;
            (path.join("data.bdb"), path.join("lock.bdb"))
        };

        let rdonly = self.flags.contains(EnvFlags::RDONLY);
        let file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .read(true)
                .write(!rdonly)
                .create(!rdonly)
                .truncate(false)
                .mode(self.mode)
                .open(&data_path)
                .map_err(Error::Open)?
        };

        if self.flags.contains(EnvFlags::PREV_SNAPSHOT) {
            // Rolling back to the previous snapshot is only safe with the
            // environment to ourselves.
            fs4::fs_std::FileExt::try_lock_exclusive(&file).map_err(|_| Error::Busy)?;
        } else {
            fs4::fs_std::FileExt::try_lock_shared(&file).map_err(Error::Lock)?;
        }

        let file_size = file.metadata().map_err(Error::Open)?.len() as usize;
        let requested = self
            .map_size
            .next_multiple_of(PAGE_SIZE)
            .max(file_size.next_multiple_of(PAGE_SIZE));
        if requested != file_size && !rdonly {
            file.set_len(requested as u64).map_err(|e| Error::Resize {
                size: file_size,
                requested,
                source: e,
            })?;
        }
        let capacity = if rdonly { file_size } else { requested };
        let geo = Geometry::derive(capacity)?;

        let map = if rdonly {
            MmapOptions::new()
                .len(capacity)
                .map_raw_read_only(&file)
        } else {
            MmapOptions::new().len(capacity).map_raw(&file)
        }
        .map_err(|e| Error::Map {
            requested: capacity,
            source: e,
        })?;

        if self.flags.contains(EnvFlags::NORDAHEAD) {
            let _ = map.advise(memmap2::Advice::Random);
        }

        let worker_file = file.try_clone().map_err(Error::Open)?;
        let storage = Storage {
            map,
            file: Some(file),
            readonly: rdonly,
        };
        Env::finish_open(
            storage,
            geo,
            self.flags,
            self,
            Some(worker_file),
            Some((data_path, lock_path)),
        )
    }
}

impl Env {
    pub fn options() -> EnvOptions {
        EnvOptions::new()
    }

    fn finish_open(
        storage: Storage,
        geo: Geometry,
        flags: EnvFlags,
        opts: &EnvOptions,
        worker_file: Option<File>,
        paths: Option<(PathBuf, PathBuf)>,
    ) -> Result<Env> {
        let lockers = match (&paths, flags.contains(EnvFlags::NOLOCK)) {
            (Some((_, lock_path)), false) => Lockers::open_file(lock_path, opts.max_readers)?,
            _ => Lockers::local(opts.max_readers),
        };

        let channel = Arc::new(Channel::new(SYNC_QUEUE));
        let counter_pre = Arc::new(AtomicU64::new(1));
        let counter = Arc::new(AtomicU64::new(1));

        let inner = Arc::new(EnvInner {
            storage,
            geo,
            flags,
            maxdbs: opts.max_dbs + crate::CORE_DBS,
            path: paths.map(|(data, _)| data),
            last_freed_word: AtomicU64::new(0),
            seqno: AtomicU64::new(0),
            panicked: AtomicBool::new(false),
            channel: channel.clone(),
            counter_pre: counter_pre.clone(),
            counter: counter.clone(),
            worker: Mutex::new(None),
            lockers,
            dbis: WordRwCell::new(DbiTable::new()),
        });

        let env = Env { inner };
        env.init_metas()?;

        let worker = std::thread::Builder::new()
            .name("burrow-sync".into())
            .spawn(move || sync_worker(channel, counter_pre, counter, worker_file))
            .map_err(Error::Open)?;
        *env.inner.worker.lock().map_err(|_| Error::Panic)? = Some(worker);

        log::debug!(
            "environment open: {} pages, bitmap {} pages, data starts at {}",
            env.inner.geo.total_pages,
            env.inner.geo.bitmap_pages,
            env.inner.geo.data_start
        );
        Ok(env)
    }

    /// First-open initialization: write fresh meta bodies, then CAS meta
    /// zero's counter from 0 to 2 so concurrent openers see it done.
    fn init_metas(&self) -> Result<()> {
        let c0 = self.meta_counter(0);
        let c1 = self.meta_counter(1);
        if c0.load(Ordering::Acquire) == 0 && c1.load(Ordering::Acquire) == 0 {
            if self.inner.storage.readonly {
                return Err(Error::Corrupted("uninitialized environment opened read-only"));
            }
            let fresh = MetaPage::new(
                PAGE_SIZE as u32,
                (self.inner.geo.total_pages as usize * PAGE_SIZE) as u64,
                self.inner.flags.bits() & EnvFlags::WRITEMAP.bits(),
            );
            unsafe {
                let body = bytemuck::bytes_of(&fresh);
                for pg in 0..2usize {
                    let dst = self.page_ptr(pg as u64).add(8);
                    std::ptr::copy_nonoverlapping(body[8..].as_ptr(), dst, body.len() - 8);
                }
            }
            // Publish meta 0 as the winner for anyone racing this open.
            let _ = c0.compare_exchange(0, 2, Ordering::AcqRel, Ordering::Acquire);
            return Ok(());
        }

        // Existing environment: at least one meta must validate.
        let m0 = self.read_meta(0);
        let m1 = self.read_meta(1);
        let v0 = m0.validate(PAGE_SIZE as u32);
        let v1 = m1.validate(PAGE_SIZE as u32);
        if v0.is_err() && v1.is_err() {
            return v0.and(v1);
        }
        if self.inner.flags.contains(EnvFlags::FIXEDMAP) {
            let hint = self.meta_snapshot().address;
            if hint != 0 && hint != self.base() as u64 {
                log::warn!(
                    "map address hint 0x{hint:x} not honored; mapped at {:p}",
                    self.base()
                );
            }
        }
        Ok(())
    }

    pub(crate) fn fail_if_poisoned(&self) -> Result<()> {
        if self.inner.panicked.load(Ordering::Acquire) {
            Err(Error::Panic)
        } else {
            Ok(())
        }
    }

    pub(crate) fn poison(&self, why: &'static str) -> Error {
        log::error!("environment poisoned: {why}");
        self.inner.panicked.store(true, Ordering::Release);
        Error::Corrupted(why)
    }

    // ------------------------------------------------------------------
    // Raw page access
    // ------------------------------------------------------------------

    pub(crate) fn base(&self) -> *mut u8 {
        self.inner.storage.base()
    }

    /// Pointer to the start of page `pgno`.
    ///
    /// # Safety
    ///
    /// `pgno` must be below the mapped page count.
    pub(crate) unsafe fn page_ptr(&self, pgno: u64) -> *mut u8 {
        debug_assert!(pgno < self.inner.geo.total_pages);
        self.base().add(pgno as usize * PAGE_SIZE)
    }

    /// Immutable view of a page, bounded by the borrow of `self`.
    pub(crate) fn page(&self, pgno: u64) -> Result<&[u8; PAGE_SIZE]> {
        if pgno >= self.inner.geo.total_pages {
            return Err(Error::Corrupted("page id beyond the mapping"));
        }
        unsafe { Ok(&*(self.page_ptr(pgno) as *const [u8; PAGE_SIZE])) }
    }

    /// Mutable view of a page. Callers must hold the write token for it
    /// (a dirty page of the sole write transaction).
    ///
    /// # Safety
    ///
    /// No other live reference to this page may exist.
    pub(crate) unsafe fn page_mut(&self, pgno: u64) -> Result<&mut [u8; PAGE_SIZE]> {
        if pgno >= self.inner.geo.total_pages {
            return Err(Error::Corrupted("page id beyond the mapping"));
        }
        if self.inner.storage.readonly {
            return Err(Error::InvalidArg("environment is read-only"));
        }
        Ok(&mut *(self.page_ptr(pgno) as *mut [u8; PAGE_SIZE]))
    }

    // ------------------------------------------------------------------
    // Bitmap allocator
    // ------------------------------------------------------------------

    fn bitmap_word(&self, word_index: u64) -> &AtomicU64 {
        debug_assert!(word_index * 8 < self.inner.geo.bitmap_pages * PAGE_SIZE as u64);
        unsafe {
            let ptr = self.base().add(2 * PAGE_SIZE + word_index as usize * 8);
            &*(ptr as *const AtomicU64)
        }
    }

    fn bitmap_words(&self) -> u64 {
        self.inner.geo.bitmap_bytes.div_ceil(8)
    }

    /// Allocate one page; returns its absolute page id.
    pub(crate) fn alloc(&self) -> Result<u64> {
        self.fail_if_poisoned()?;
        let words = self.bitmap_words();
        let start = self.inner.last_freed_word.load(Ordering::Relaxed) % words;
        for i in 0..words {
            let w = (start + i) % words;
            let word = self.bitmap_word(w);
            let mut cur = word.load(Ordering::Acquire);
            while cur != !0u64 {
                let bit = (!cur).trailing_zeros() as u64;
                let index = w * 64 + bit;
                if index >= self.inner.geo.num_pages {
                    break;
                }
                match word.compare_exchange(
                    cur,
                    cur | (1u64 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(index + self.inner.geo.data_start),
                    Err(now) => cur = now,
                }
            }
        }
        Err(Error::MapFull)
    }

    /// Allocate `n` contiguous pages; returns the first absolute page id.
    pub(crate) fn alloc_run(&self, n: u64) -> Result<u64> {
        self.fail_if_poisoned()?;
        if n == 0 {
            return Err(Error::InvalidArg("zero-length run"));
        }
        if n == 1 {
            return self.alloc();
        }
        let total = self.inner.geo.num_pages;
        let mut idx = 0u64;
        'scan: while idx + n <= total {
            // Find a clear run starting at idx.
            for j in 0..n {
                if self.test_bit(idx + j) {
                    idx += j + 1;
                    continue 'scan;
                }
            }
            // Claim it bit by bit; back out on any collision.
            for j in 0..n {
                if !self.try_set_bit(idx + j) {
                    for k in 0..j {
                        self.clear_bit(idx + k)?;
                    }
                    idx += j + 1;
                    continue 'scan;
                }
            }
            return Ok(idx + self.inner.geo.data_start);
        }
        Err(Error::MapFull)
    }

    fn test_bit(&self, index: u64) -> bool {
        let word = self.bitmap_word(index / 64);
        word.load(Ordering::Acquire) & (1u64 << (index % 64)) != 0
    }

    fn try_set_bit(&self, index: u64) -> bool {
        let word = self.bitmap_word(index / 64);
        let bit = 1u64 << (index % 64);
        let mut cur = word.load(Ordering::Acquire);
        loop {
            if cur & bit != 0 {
                return false;
            }
            match word.compare_exchange(cur, cur | bit, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
    }

    fn clear_bit(&self, index: u64) -> Result<()> {
        let word = self.bitmap_word(index / 64);
        let bit = 1u64 << (index % 64);
        let mut cur = word.load(Ordering::Acquire);
        loop {
            if cur & bit == 0 {
                return Err(self.poison("double free of a page"));
            }
            match word.compare_exchange(cur, cur & !bit, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(now) => cur = now,
            }
        }
    }

    /// Return a page to the allocator. Freeing a meta or bitmap page, or a
    /// page that is already free, poisons the environment.
    pub(crate) fn release(&self, pgno: u64) -> Result<()> {
        self.fail_if_poisoned()?;
        let geo = &self.inner.geo;
        if pgno < geo.data_start || pgno >= geo.data_start + geo.num_pages {
            return Err(self.poison("freeing a page outside the data region"));
        }
        let index = pgno - geo.data_start;
        self.inner
            .last_freed_word
            .store(index / 64, Ordering::Relaxed);
        self.clear_bit(index)
    }

    // ------------------------------------------------------------------
    // Double-buffered meta
    // ------------------------------------------------------------------

    fn meta_counter(&self, which: usize) -> &AtomicU64 {
        unsafe { &*(self.page_ptr(which as u64) as *const AtomicU64) }
    }

    fn read_meta(&self, which: usize) -> MetaPage {
        unsafe { std::ptr::read_volatile(self.page_ptr(which as u64) as *const MetaPage) }
    }

    /// Current root publication sequence number.
    pub fn root_seqno(&self) -> u64 {
        self.inner.seqno.load(Ordering::Acquire)
    }

    /// Wait-free read of the published root value.
    pub fn root(&self) -> u64 {
        self.meta_snapshot().root
    }

    /// Snapshot the winning meta under the stable-counter double check.
    pub(crate) fn meta_snapshot(&self) -> MetaPage {
        loop {
            let c0 = self.meta_counter(0).load(Ordering::Acquire);
            let c1 = self.meta_counter(1).load(Ordering::Acquire);
            let winner = if c0 > c1 { 0 } else { 1 };
            let meta = self.read_meta(winner);
            if self.meta_counter(0).load(Ordering::Acquire) == c0
                && self.meta_counter(1).load(Ordering::Acquire) == c1
            {
                return meta;
            }
            std::thread::yield_now();
        }
    }

    /// Snapshot the previous (losing) meta; used by `PREV_SNAPSHOT` opens.
    pub(crate) fn meta_snapshot_prev(&self) -> MetaPage {
        loop {
            let c0 = self.meta_counter(0).load(Ordering::Acquire);
            let c1 = self.meta_counter(1).load(Ordering::Acquire);
            let loser = if c0 > c1 { 1 } else { 0 };
            let meta = self.read_meta(loser);
            if self.meta_counter(0).load(Ordering::Acquire) == c0
                && self.meta_counter(1).load(Ordering::Acquire) == c1
            {
                return meta;
            }
            std::thread::yield_now();
        }
    }

    /// Publish a new meta body into the trailing buffer.
    ///
    /// The counters implement the tick protocol: the trailing buffer sits
    /// a full tick (2) behind; `c -> c+1` marks "writing", `c+1 -> c+4`
    /// completes the commit and moves this buffer two ticks ahead. A
    /// half-tick difference means another writer is mid-flight, which with
    /// a held writer lock can only be a stale crashed attempt: roll it
    /// back and retry. Any other difference is corruption.
    pub(crate) fn publish_meta(&self, seqno: u64, body: &MetaPage) -> Result<()> {
        self.fail_if_poisoned()?;
        loop {
            let c0 = self.meta_counter(0).load(Ordering::Acquire) as i64;
            let c1 = self.meta_counter(1).load(Ordering::Acquire) as i64;
            let diff = c1 - c0;

            let (target, counter) = if diff < 0 {
                if diff == -1 {
                    std::thread::yield_now();
                    let _ = self.meta_counter(1).compare_exchange(
                        c1 as u64,
                        (c1 - 1) as u64,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    continue;
                }
                if diff != -2 {
                    return Err(self.poison("meta double buffer is corrupted"));
                }
                (1usize, c1 as u64)
            } else {
                if diff == 1 {
                    std::thread::yield_now();
                    let _ = self.meta_counter(0).compare_exchange(
                        c0 as u64,
                        (c0 - 1) as u64,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    continue;
                }
                if diff != 2 {
                    return Err(self.poison("meta double buffer is corrupted"));
                }
                (0usize, c0 as u64)
            };

            if self
                .meta_counter(target)
                .compare_exchange(counter, counter + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            if self.inner.seqno.load(Ordering::Acquire) != seqno {
                return Err(Error::BadTxn);
            }

            unsafe {
                let bytes = bytemuck::bytes_of(body);
                let dst = self.page_ptr(target as u64).add(8);
                std::ptr::copy_nonoverlapping(bytes[8..].as_ptr(), dst, bytes.len() - 8);
            }

            if self
                .meta_counter(target)
                .compare_exchange(counter + 1, counter + 4, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.inner.seqno.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
        }
    }

    /// Publish only a new root value, keeping the rest of the meta body.
    pub fn set_root(&self, seqno: u64, root: u64) -> Result<()> {
        let mut body = self.meta_snapshot();
        body.root = root;
        body.seal();
        self.publish_meta(seqno, &body)
    }

    /// Flush the meta-page neighborhood (pages 0 and 1).
    pub(crate) fn flush_metas(&self) -> Result<()> {
        self.inner.storage.flush_range(0, 2 * PAGE_SIZE)
    }

    /// Flush a run of pages.
    pub(crate) fn flush_pages(&self, first: u64, count: u64) -> Result<()> {
        let off = first as usize * PAGE_SIZE;
        let len = count as usize * PAGE_SIZE;
        if self.inner.flags.contains(EnvFlags::MAPASYNC) {
            self.inner.storage.flush_range_async(off, len)
        } else {
            self.inner.storage.flush_range(off, len)
        }
    }

    // ------------------------------------------------------------------
    // Durability worker
    // ------------------------------------------------------------------

    /// Enqueue a sync request. Returns the pre-sync counter identifying
    /// the cycle that will cover every write made before this call, and a
    /// ticket to block on.
    pub fn register_notification(&self) -> Result<(u64, SyncTicket)> {
        self.fail_if_poisoned()?;
        let pre = self.inner.counter_pre.load(Ordering::Acquire);
        let (tx, rx) = mpsc::sync_channel(1);
        self.inner.channel.send(SyncMsg::Sync(tx))?;
        Ok((pre, SyncTicket { rx }))
    }

    /// Completed-sync counter. Once this passes the value returned from
    /// `register_notification`, the registered writes are on stable
    /// storage.
    pub fn counter(&self) -> u64 {
        self.inner.counter.load(Ordering::Acquire)
    }

    /// Force a synchronous flush through the worker.
    pub fn sync(&self, force: bool) -> Result<()> {
        if !force && self.inner.flags.contains(EnvFlags::NOSYNC) {
            return Ok(());
        }
        let (_, ticket) = self.register_notification()?;
        ticket.wait()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin_read(&self) -> Result<ReadTxn<'_>> {
        ReadTxn::new(self)
    }

    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        WriteTxn::new(self)
    }

    /// Reap reader slots whose owning process has died. Returns how many
    /// slots were cleared.
    pub fn reader_check(&self) -> Result<usize> {
        self.fail_if_poisoned()?;
        Ok(self.inner.lockers.reap_dead())
    }

    /// Statistics of the main table as of the current snapshot.
    pub fn stat(&self) -> crate::db::Stat {
        let meta = self.meta_snapshot();
        crate::db::Stat::from_record(&meta.dbs[crate::MAIN_DBI])
    }

    /// Adjust the logical map size. The mapping itself is sized at open;
    /// growing past it requires a reopen, reported as `MapResized`.
    pub fn set_map_size(&self, size: usize) -> Result<()> {
        self.fail_if_poisoned()?;
        let mapped = self.inner.geo.total_pages as usize * PAGE_SIZE;
        if size.next_multiple_of(PAGE_SIZE) > mapped {
            return Err(Error::MapResized);
        }
        Ok(())
    }

    /// Invalidate a named-table handle. The table's data is untouched.
    pub fn close_db(&self, dbi: crate::db::Dbi) {
        self.inner.dbis.write().close(dbi);
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn flags(&self) -> EnvFlags {
        self.inner.flags
    }

    pub(crate) fn db_flags_ok(&self, flags: DbFlags) -> bool {
        // INTEGERDUP and REVERSEDUP only make sense under DUPSORT.
        let dup_only = DbFlags::DUPFIXED | DbFlags::INTEGERDUP | DbFlags::REVERSEDUP;
        flags.contains(DbFlags::DUPSORT) || !flags.intersects(dup_only)
    }

    /// Shut the durability worker down and release the environment.
    pub fn close(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        let handle = self
            .inner
            .worker
            .lock()
            .ok()
            .and_then(|mut w| w.take());
        if let Some(handle) = handle {
            let _ = self.inner.channel.send(SyncMsg::Shutdown);
            self.inner.channel.close();
            let _ = handle.join();
            log::debug!("durability worker stopped");
        }
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        self.channel.close();
        if let Some(handle) = self.worker.lock().ok().and_then(|mut w| w.take()) {
            let _ = handle.join();
        }
    }
}

/// The durability worker: batch waiters, sync once, wake them all.
fn sync_worker(
    channel: Arc<Channel<SyncMsg>>,
    counter_pre: Arc<AtomicU64>,
    counter: Arc<AtomicU64>,
    file: Option<File>,
) {
    loop {
        let first = match channel.recv() {
            Some(SyncMsg::Sync(w)) => w,
            Some(SyncMsg::Shutdown) | None => return,
        };
        let mut waiters = vec![first];
        let mut shutdown = false;
        while waiters.len() < MAX_WAKEUPS {
            match channel.try_recv() {
                Some(SyncMsg::Sync(w)) => waiters.push(w),
                Some(SyncMsg::Shutdown) => {
                    shutdown = true;
                    break;
                }
                None => break,
            }
        }

        counter_pre.fetch_add(1, Ordering::AcqRel);
        if let Some(f) = &file {
            if let Err(e) = f.sync_data() {
                log::error!("fdatasync failed, durability worker exiting: {e}");
                return;
            }
        }
        counter.fetch_add(1, Ordering::AcqRel);

        for w in waiters {
            let _ = w.send(());
        }
        if shutdown {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_env(pages: usize) -> Env {
        Env::options()
            .map_size(pages * PAGE_SIZE)
            .open_anon()
            .unwrap()
    }

    #[test]
    fn geometry_small_env() {
        let geo = Geometry::derive(8 * PAGE_SIZE).unwrap();
        assert_eq!(geo.total_pages, 8);
        assert_eq!(geo.bitmap_pages, 1);
        assert_eq!(geo.data_start, 3);
        assert_eq!(geo.num_pages, 5);
    }

    #[test]
    fn geometry_rejects_tiny_and_unaligned() {
        assert!(Geometry::derive(2 * PAGE_SIZE).is_err());
        assert!(Geometry::derive(8 * PAGE_SIZE + 13).is_err());
    }

    #[test]
    fn alloc_until_full_then_release_and_reuse() {
        let env = anon_env(8);
        let mut got = Vec::new();
        for _ in 0..5 {
            let pg = env.alloc().unwrap();
            assert!(pg >= env.inner.geo.data_start);
            assert!(pg < env.inner.geo.data_start + env.inner.geo.num_pages);
            assert!(!got.contains(&pg));
            got.push(pg);
        }
        assert!(matches!(env.alloc(), Err(Error::MapFull)));
        for pg in &got {
            env.release(*pg).unwrap();
        }
        let again = env.alloc().unwrap();
        assert!(got.contains(&again));
    }

    #[test]
    fn release_unallocated_poisons() {
        let env = anon_env(8);
        let pg = env.alloc().unwrap();
        env.release(pg).unwrap();
        assert!(env.release(pg).is_err());
        assert!(matches!(env.alloc(), Err(Error::Panic)));
    }

    #[test]
    fn alloc_run_is_contiguous() {
        let env = anon_env(64);
        let first = env.alloc_run(4).unwrap();
        let single = env.alloc().unwrap();
        assert!(single < first || single >= first + 4);
        for pg in first..first + 4 {
            env.release(pg).unwrap();
        }
    }

    #[test]
    fn root_publication_sequence() {
        let env = anon_env(8);
        assert_eq!(env.root(), 0);

        let s0 = env.root_seqno();
        env.set_root(s0, 10).unwrap();
        assert_eq!(env.root(), 10);

        let s1 = env.root_seqno();
        assert_eq!(s1, s0 + 1);
        env.set_root(s1, 12).unwrap();
        assert_eq!(env.root(), 12);

        let s2 = env.root_seqno();
        env.set_root(s2, 11).unwrap();
        assert_eq!(env.root(), 11);
        assert_eq!(env.root_seqno(), s0 + 3);
    }

    #[test]
    fn stale_seqno_is_rejected() {
        let env = anon_env(8);
        let s0 = env.root_seqno();
        env.set_root(s0, 5).unwrap();
        assert!(env.set_root(s0, 6).is_err());
        assert_eq!(env.root(), 5);
    }

    #[test]
    fn durability_counters_advance() {
        let env = anon_env(8);
        for _ in 0..2 {
            let (pre, ticket) = env.register_notification().unwrap();
            ticket.wait().unwrap();
            assert!(env.counter() > pre);
        }
    }

    #[test]
    fn meta_snapshot_follows_publication() {
        let env = anon_env(8);
        let mut body = env.meta_snapshot();
        body.txnid = 41;
        body.seal();
        env.publish_meta(env.root_seqno(), &body).unwrap();
        assert_eq!(env.meta_snapshot().txnid, 41);
        // The losing buffer still holds the previous snapshot.
        assert_ne!(env.meta_snapshot_prev().txnid, 41);
    }
}
