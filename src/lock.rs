//! Synchronization words shared through mapped memory.
//!
//! Three primitives, all sized to live inside a shared mapping:
//! a 32-bit reader–writer word lock, a robust cross-process lock storing
//! the holder's pid, and pid-byte record locks on the lock file used to
//! probe whether a registered process is still alive.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};

/// Write-held bit of the reader–writer word.
const WRITE_FLAG: u32 = 1 << 31;
/// Writer-waiting bit; discourages new readers.
const WRITE_REQUEST: u32 = 1 << 30;

/// Shared-mode guard over a reader–writer word.
pub(crate) struct ReadWordGuard<'a> {
    word: &'a AtomicU32,
}

/// Exclusive-mode guard over a reader–writer word.
pub(crate) struct WriteWordGuard<'a> {
    word: &'a AtomicU32,
}

/// Acquire the word in shared mode. Spins with yields while a writer
/// holds or has requested the lock.
pub(crate) fn read_word(word: &AtomicU32) -> ReadWordGuard<'_> {
    let mut spins = 0u32;
    loop {
        if spins > 0 {
            std::thread::yield_now();
        }
        spins += 1;
        let state = word.load(Ordering::Acquire) & !(WRITE_FLAG | WRITE_REQUEST);
        if word
            .compare_exchange(state, state + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return ReadWordGuard { word };
        }
    }
}

/// Acquire the word exclusively. Sets the request bit first so readers
/// drain, then claims the write flag once the count hits zero.
pub(crate) fn write_word(word: &AtomicU32) -> WriteWordGuard<'_> {
    let mut spins = 0u32;
    loop {
        if spins > 0 {
            std::thread::yield_now();
        }
        spins += 1;
        let state = word.load(Ordering::Acquire) & !(WRITE_FLAG | WRITE_REQUEST);
        if word
            .compare_exchange(
                state,
                state | WRITE_REQUEST,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            break;
        }
    }
    loop {
        let state = word.load(Ordering::Acquire);
        if state != WRITE_REQUEST {
            std::thread::yield_now();
            continue;
        }
        if word
            .compare_exchange(WRITE_REQUEST, WRITE_FLAG, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return WriteWordGuard { word };
        }
    }
}

impl Drop for ReadWordGuard<'_> {
    fn drop(&mut self) {
        self.word.fetch_sub(1, Ordering::Release);
    }
}

impl Drop for WriteWordGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// A value guarded by the reader–writer word lock. Fits workloads that
/// are almost entirely reads, like the table registry.
pub(crate) struct WordRwCell<T> {
    word: AtomicU32,
    value: std::cell::UnsafeCell<T>,
}

// The guards below enforce the usual shared-xor-mutable discipline.
unsafe impl<T: Send> Send for WordRwCell<T> {}
unsafe impl<T: Send + Sync> Sync for WordRwCell<T> {}

pub(crate) struct WordReadRef<'a, T> {
    _guard: ReadWordGuard<'a>,
    value: *const T,
}

pub(crate) struct WordWriteRef<'a, T> {
    _guard: WriteWordGuard<'a>,
    value: *mut T,
}

impl<T> WordRwCell<T> {
    pub fn new(value: T) -> Self {
        WordRwCell {
            word: AtomicU32::new(0),
            value: std::cell::UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> WordReadRef<'_, T> {
        WordReadRef {
            _guard: read_word(&self.word),
            value: self.value.get(),
        }
    }

    pub fn write(&self) -> WordWriteRef<'_, T> {
        WordWriteRef {
            _guard: write_word(&self.word),
            value: self.value.get(),
        }
    }
}

impl<T> std::ops::Deref for WordReadRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.value }
    }
}

impl<T> std::ops::Deref for WordWriteRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.value }
    }
}

impl<T> std::ops::DerefMut for WordWriteRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.value }
    }
}

/// True iff `pid` names a live process we could signal.
pub(crate) fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but isn't ours.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub(crate) fn own_pid() -> u32 {
    unsafe { libc::getpid() as u32 }
}

/// Guard over a robust pid lock; releases by CASing our pid back to zero.
pub(crate) struct RobustGuard<'a> {
    word: &'a AtomicU32,
    pid: u32,
}

/// Acquire a robust cross-process lock: CAS zero to our pid, and when the
/// word holds another pid, probe it. A dead holder is replaced in place,
/// which is the whole of the crash-recovery story for this lock.
pub(crate) fn robust_lock(word: &AtomicU32) -> RobustGuard<'_> {
    let pid = own_pid();
    let mut spins = 0u32;
    loop {
        if spins > 0 {
            std::thread::yield_now();
        }
        spins += 1;
        match word.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return RobustGuard { word, pid },
            Err(holder) => {
                if holder == pid {
                    // Re-entry by the same process is a caller bug, but a
                    // stale word from a recycled pid is indistinguishable;
                    // claim it.
                    return RobustGuard { word, pid };
                }
                if !pid_alive(holder) {
                    log::warn!("reclaiming lock from dead process {holder}");
                    if word
                        .compare_exchange(holder, pid, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return RobustGuard { word, pid };
                    }
                }
            }
        }
    }
}

impl Drop for RobustGuard<'_> {
    fn drop(&mut self) {
        if self
            .word
            .compare_exchange(self.pid, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            log::warn!("robust lock was taken over while held by {}", self.pid);
        }
    }
}

fn flock_template(ty: libc::c_short, pid: u32) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = ty;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = pid as libc::off_t;
    fl.l_len = 1;
    fl
}

/// Write-lock the byte at offset = our pid in the lock file, marking this
/// process alive for as long as it holds the descriptor.
pub(crate) fn lock_own_pid_byte(file: &File) -> io::Result<()> {
    let mut fl = flock_template(libc::F_WRLCK as libc::c_short, own_pid());
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Probe whether `pid`'s byte is still locked, i.e. the process that
/// registered it is still alive and has the lock file open.
pub(crate) fn pid_byte_held(file: &File, pid: u32) -> io::Result<bool> {
    if pid == own_pid() {
        return Ok(true);
    }
    let mut fl = flock_template(libc::F_WRLCK as libc::c_short, pid);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fl.l_type != libc::F_UNLCK as libc::c_short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn readers_share_writers_exclude() {
        let word = Arc::new(AtomicU32::new(0));
        let hits = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let word = word.clone();
            let hits = hits.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let _g = read_word(&word);
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for _ in 0..2 {
            let word = word.clone();
            let hits = hits.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _g = write_word(&word);
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 4 * 200 + 2 * 100);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn write_guard_blocks_new_readers() {
        let word = AtomicU32::new(0);
        {
            let _w = write_word(&word);
            assert_eq!(word.load(Ordering::Relaxed), WRITE_FLAG);
        }
        assert_eq!(word.load(Ordering::Relaxed), 0);
        let _r = read_word(&word);
        assert_eq!(word.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn robust_lock_round_trip() {
        let word = AtomicU32::new(0);
        {
            let _g = robust_lock(&word);
            assert_eq!(word.load(Ordering::Relaxed), own_pid());
        }
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn robust_lock_reclaims_dead_holder() {
        // Pid 1 is init; kill(1, 0) fails with EPERM so it reads alive.
        // Use a pid far above pid_max instead.
        let word = AtomicU32::new(0x3fff_fff0);
        let _g = robust_lock(&word);
        assert_eq!(word.load(Ordering::Relaxed), own_pid());
    }

    #[test]
    fn own_pid_probe_is_alive() {
        assert!(pid_alive(own_pid()));
    }
}
