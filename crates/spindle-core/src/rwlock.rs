//! Reader-writer locks with writer preference.
//!
//! Two futex words — one for sleeping readers, one for sleeping writers —
//! under a small internal lock. A reader is admitted only when there is
//! neither an active writer nor a queued one, so a stream of readers can
//! never starve a writer; the trade is that readers queue behind any writer
//! that has announced itself. Unlock hands the lock to one queued writer
//! first, or wakes all readers when no writer is waiting.
//!
//! An all-zero `RwLock` is a valid open lock.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::Result;
use crate::cancel;
use crate::errno::EBUSY;
use crate::futex::{RawFutex, futex_wait, futex_wake, futex_wake_all};
use crate::thread::descriptor::current;

/// A reader-writer lock.
#[repr(C)]
pub struct RwLock {
    /// Internal lock guarding every field below.
    lock: RawFutex,
    /// Active readers.
    readers: AtomicU32,
    /// Writer descriptor address, 0 when no writer holds the lock.
    writer: AtomicUsize,
    /// Writers announced and waiting.
    writers_queued: AtomicU32,
    /// Readers sleep on this word.
    rd_futex: AtomicU32,
    /// Writers sleep on this word.
    wr_futex: AtomicU32,
}

// SAFETY: all state is atomic and serialized by `lock`.
unsafe impl Send for RwLock {}
unsafe impl Sync for RwLock {}

impl RwLock {
    /// A fresh open lock; all-zero representation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: RawFutex::new(),
            readers: AtomicU32::new(0),
            writer: AtomicUsize::new(0),
            writers_queued: AtomicU32::new(0),
            rd_futex: AtomicU32::new(0),
            wr_futex: AtomicU32::new(0),
        }
    }

    /// Acquire for reading; yields to active and queued writers.
    pub fn rdlock(&self) -> Result<()> {
        loop {
            self.lock.lock();
            if self.writer.load(Ordering::SeqCst) == 0
                && self.writers_queued.load(Ordering::SeqCst) == 0
            {
                self.readers.fetch_add(1, Ordering::SeqCst);
                self.lock.unlock();
                return Ok(());
            }
            let sleep_seq = self.rd_futex.load(Ordering::SeqCst);
            self.lock.unlock();

            let _ = futex_wait(&self.rd_futex, sleep_seq);
            cancel::testcancel();
        }
    }

    /// Acquire for writing; waits out active readers and the current
    /// writer, with this writer's place in the queue held the whole time.
    pub fn wrlock(&self) -> Result<()> {
        let mut queued = false;
        loop {
            self.lock.lock();
            if !queued {
                queued = true;
                self.writers_queued.fetch_add(1, Ordering::SeqCst);
            }
            if self.writer.load(Ordering::SeqCst) == 0 && self.readers.load(Ordering::SeqCst) == 0
            {
                self.writer.store(current().as_usize(), Ordering::SeqCst);
                self.writers_queued.fetch_sub(1, Ordering::SeqCst);
                self.lock.unlock();
                return Ok(());
            }
            let sleep_seq = self.wr_futex.load(Ordering::SeqCst);
            self.lock.unlock();

            // Not a cancellation point: the queued-writer slot is held
            // across the sleep and gates every reader admission.
            let _ = futex_wait(&self.wr_futex, sleep_seq);
        }
    }

    /// Release the lock, as writer or as one reader.
    ///
    /// A departing writer wakes one queued writer if any, otherwise all
    /// readers; the last departing reader wakes one queued writer.
    pub fn unlock(&self) -> Result<()> {
        self.lock.lock();
        if self.writer.load(Ordering::SeqCst) != 0 {
            self.writer.store(0, Ordering::SeqCst);
            if self.writers_queued.load(Ordering::SeqCst) != 0 {
                self.wr_futex.fetch_add(1, Ordering::SeqCst);
                futex_wake(&self.wr_futex, 1);
            } else {
                self.rd_futex.fetch_add(1, Ordering::SeqCst);
                futex_wake_all(&self.rd_futex);
            }
            self.lock.unlock();
            return Ok(());
        }

        self.readers.fetch_sub(1, Ordering::SeqCst);
        if self.readers.load(Ordering::SeqCst) == 0
            && self.writers_queued.load(Ordering::SeqCst) != 0
        {
            self.wr_futex.fetch_add(1, Ordering::SeqCst);
            futex_wake(&self.wr_futex, 1);
        }
        self.lock.unlock();
        Ok(())
    }

    /// Acquire for reading without waiting; `Err(EBUSY)` if a writer is
    /// active or queued.
    pub fn tryrdlock(&self) -> Result<()> {
        self.lock.lock();
        let admitted = self.writer.load(Ordering::SeqCst) == 0
            && self.writers_queued.load(Ordering::SeqCst) == 0;
        if admitted {
            self.readers.fetch_add(1, Ordering::SeqCst);
        }
        self.lock.unlock();
        if admitted { Ok(()) } else { Err(EBUSY) }
    }

    /// Acquire for writing without waiting; `Err(EBUSY)` if any reader or
    /// writer is active.
    pub fn trywrlock(&self) -> Result<()> {
        self.lock.lock();
        let admitted = self.writer.load(Ordering::SeqCst) == 0
            && self.readers.load(Ordering::SeqCst) == 0;
        if admitted {
            self.writer.store(current().as_usize(), Ordering::SeqCst);
        }
        self.lock.unlock();
        if admitted { Ok(()) } else { Err(EBUSY) }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn zeroed_bytes_are_an_open_lock() {
        runtime::init().unwrap();
        // SAFETY: RwLock is repr(C) over atomics; zero is valid throughout.
        let rw: RwLock = unsafe { core::mem::zeroed() };
        assert_eq!(rw.tryrdlock(), Ok(()));
        assert_eq!(rw.unlock(), Ok(()));
        assert_eq!(rw.trywrlock(), Ok(()));
        assert_eq!(rw.unlock(), Ok(()));
    }

    #[test]
    fn multiple_readers_coexist() {
        runtime::init().unwrap();
        let rw = RwLock::new();
        rw.rdlock().unwrap();
        rw.rdlock().unwrap();
        assert_eq!(rw.readers.load(Ordering::SeqCst), 2);
        assert_eq!(rw.trywrlock(), Err(EBUSY));
        rw.unlock().unwrap();
        rw.unlock().unwrap();
        assert_eq!(rw.trywrlock(), Ok(()));
        rw.unlock().unwrap();
    }

    #[test]
    fn writer_excludes_readers() {
        runtime::init().unwrap();
        let rw = RwLock::new();
        rw.wrlock().unwrap();
        assert_eq!(rw.tryrdlock(), Err(EBUSY));
        assert_eq!(rw.trywrlock(), Err(EBUSY));
        rw.unlock().unwrap();
        assert_eq!(rw.tryrdlock(), Ok(()));
        rw.unlock().unwrap();
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        runtime::init().unwrap();
        use crate::thread::{self, Attr};
        use core::time::Duration;

        struct Shared {
            rw: RwLock,
            writer_done: AtomicU32,
        }

        extern "C" fn writer(arg: usize) -> usize {
            // SAFETY: arg points to a leaked Shared.
            let s = unsafe { &*(arg as *const Shared) };
            s.rw.wrlock().unwrap();
            s.rw.unlock().unwrap();
            s.writer_done.store(1, Ordering::SeqCst);
            0
        }

        let s = Box::leak(Box::new(Shared {
            rw: RwLock::new(),
            writer_done: AtomicU32::new(0),
        }));

        s.rw.rdlock().unwrap();
        let t = thread::create(&Attr::new(), writer, s as *const Shared as usize).unwrap();

        // Wait until the writer has announced itself.
        while s.rw.writers_queued.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // Writer preference: a new reader must not overtake the queued
        // writer even though only readers are active.
        assert_eq!(s.rw.tryrdlock(), Err(EBUSY));

        s.rw.unlock().unwrap();
        thread::join(t).unwrap();
        assert_eq!(s.writer_done.load(Ordering::SeqCst), 1);
        assert_eq!(s.rw.tryrdlock(), Ok(()));
        s.rw.unlock().unwrap();
    }
}
