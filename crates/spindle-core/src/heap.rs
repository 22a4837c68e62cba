//! First-fit arena allocator.
//!
//! A singly linked list of chunks carved out of one large anonymous private
//! mapping. Each chunk carries a header `{next, size}`; bit 62 of `size`
//! marks the chunk used. Allocation scans for the first free chunk of
//! sufficient size, splitting it when the leftover can hold a header plus a
//! minimum-size payload; when no chunk fits, a page-rounded extent is carved
//! from the untouched tail of the arena. Free just clears the used bit.
//!
//! The arena is reserved up front and committed lazily by the kernel, so the
//! large reservation costs nothing until touched and never moves — chunk
//! pointers stay valid for the life of the process. One futex lock guards
//! the whole allocator.
//!
//! This is a boundary utility: the runtime proper allocates descriptors
//! through the host heap, and this allocator serves callers that need
//! storage decoupled from the host (and the heap-fuzz torture scenario).

use crate::cell::RacyCell;
use crate::futex::RawFutex;
use crate::syscall::{
    self, MAP_ANONYMOUS, MAP_PRIVATE, PAGE_SIZE, PROT_READ, PROT_WRITE,
};

/// Total arena reservation. Committed lazily, page by page.
const ARENA_SIZE: usize = 256 * 1024 * 1024;

/// Flag bit marking a chunk in use.
const CHUNK_USED: u64 = 0x4000_0000_0000_0000;

/// Smallest payload worth tracking.
const MIN_ALLOC: usize = 16;

#[repr(C)]
struct Chunk {
    next: *mut Chunk,
    size: u64,
}

const HEADER: usize = core::mem::size_of::<Chunk>();

struct Heap {
    /// First chunk, or null before anything was carved.
    head: *mut Chunk,
    /// Last chunk, for appending fresh extents.
    tail: *mut Chunk,
    /// Arena base; null until the first allocation maps it.
    arena: usize,
    /// First never-carved byte of the arena.
    wilderness: usize,
    /// One past the end of the arena.
    limit: usize,
}

static HEAP_LOCK: RawFutex = RawFutex::new();
static HEAP: RacyCell<Heap> = RacyCell::new(Heap {
    head: core::ptr::null_mut(),
    tail: core::ptr::null_mut(),
    arena: 0,
    wilderness: 0,
    limit: 0,
});

/// Counts of chunks carved and chunks currently in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapState {
    pub chunks: u64,
    pub allocated: u64,
}

#[inline]
fn align_up(size: usize) -> usize {
    let aligned = ((size.wrapping_sub(1) >> 3) << 3).wrapping_add(8);
    aligned.max(MIN_ALLOC)
}

impl Heap {
    /// Map the arena on first use.
    fn ensure_arena(&mut self) -> bool {
        if self.arena != 0 {
            return true;
        }
        // SAFETY: anonymous private mapping with no fixed address.
        let base = unsafe {
            syscall::sys_mmap(
                core::ptr::null_mut(),
                ARENA_SIZE,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        match base {
            Ok(p) => {
                self.arena = p as usize;
                self.wilderness = self.arena;
                self.limit = self.arena + ARENA_SIZE;
                true
            }
            Err(_) => false,
        }
    }

    /// Carve a fresh extent of at least `payload` bytes from the wilderness
    /// and append it as one free chunk.
    fn grow(&mut self, payload: usize) -> *mut Chunk {
        if !self.ensure_arena() {
            return core::ptr::null_mut();
        }
        let mut extent = (payload + HEADER - 1) / PAGE_SIZE * PAGE_SIZE;
        extent += PAGE_SIZE;
        if self.wilderness + extent > self.limit {
            return core::ptr::null_mut();
        }
        let chunk = self.wilderness as *mut Chunk;
        // SAFETY: the extent lies inside the mapped arena.
        unsafe {
            (*chunk).next = core::ptr::null_mut();
            (*chunk).size = (extent - HEADER) as u64;
        }
        self.wilderness += extent;
        if self.tail.is_null() {
            self.head = chunk;
        } else {
            // SAFETY: tail is a valid chunk inside the arena.
            unsafe { (*self.tail).next = chunk };
        }
        self.tail = chunk;
        chunk
    }

    fn find_free(&self, want: usize) -> *mut Chunk {
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: every list node lies inside the arena.
            unsafe {
                if (*cursor).size & CHUNK_USED == 0 && (*cursor).size >= want as u64 {
                    return cursor;
                }
                cursor = (*cursor).next;
            }
        }
        core::ptr::null_mut()
    }
}

/// Allocate `size` bytes. Returns null when the arena is exhausted.
///
/// Zero-sized requests are rounded up to the minimum payload.
pub fn alloc(size: usize) -> *mut u8 {
    let want = align_up(size);
    HEAP_LOCK.lock();
    // SAFETY: HEAP_LOCK serializes all access to HEAP.
    let heap = unsafe { HEAP.get_mut() };

    let mut chunk = heap.find_free(want);
    if chunk.is_null() {
        chunk = heap.grow(want);
    }
    if chunk.is_null() {
        HEAP_LOCK.unlock();
        return core::ptr::null_mut();
    }

    // SAFETY: chunk points to a valid free chunk inside the arena.
    unsafe {
        // Split when the remainder can hold a header and a minimal payload.
        if (*chunk).size as usize > want + HEADER + MIN_ALLOC {
            let rest = (chunk as usize + HEADER + want) as *mut Chunk;
            (*rest).size = (*chunk).size - want as u64 - HEADER as u64;
            (*rest).next = (*chunk).next;
            (*chunk).next = rest;
            (*chunk).size = want as u64;
            if heap.tail == chunk {
                heap.tail = rest;
            }
        }
        (*chunk).size |= CHUNK_USED;
        HEAP_LOCK.unlock();
        (chunk as *mut u8).add(HEADER)
    }
}

/// Release a pointer previously returned by [`alloc`] or [`realloc`].
///
/// # Safety
///
/// `ptr` must come from this allocator and must not be used afterwards.
/// Null is ignored.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    HEAP_LOCK.lock();
    // SAFETY: ptr points just past a chunk header per the caller contract.
    unsafe {
        let chunk = ptr.sub(HEADER) as *mut Chunk;
        (*chunk).size &= !CHUNK_USED;
    }
    HEAP_LOCK.unlock();
}

/// Resize an allocation, preserving the common prefix of the contents.
///
/// Returns null (leaving the original allocation intact) when the arena is
/// exhausted.
///
/// # Safety
///
/// `ptr` must come from this allocator.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size);
    }
    // SAFETY: ptr points just past a chunk header per the caller contract.
    let old_size = unsafe {
        let chunk = ptr.sub(HEADER) as *const Chunk;
        ((*chunk).size & !CHUNK_USED) as usize
    };
    let new_ptr = alloc(size);
    if new_ptr.is_null() {
        return core::ptr::null_mut();
    }
    let count = old_size.min(size);
    // SAFETY: both regions are live and at least `count` bytes long; alloc
    // never returns memory overlapping a used chunk.
    unsafe {
        core::ptr::copy_nonoverlapping(ptr, new_ptr, count);
        free(ptr);
    }
    new_ptr
}

/// Snapshot chunk totals, for leak checks.
pub fn state() -> HeapState {
    HEAP_LOCK.lock();
    // SAFETY: HEAP_LOCK serializes all access to HEAP.
    let heap = unsafe { HEAP.get_mut() };
    let mut st = HeapState { chunks: 0, allocated: 0 };
    let mut cursor = heap.head;
    while !cursor.is_null() {
        // SAFETY: list nodes lie inside the arena.
        unsafe {
            st.chunks += 1;
            if (*cursor).size & CHUNK_USED != 0 {
                st.allocated += 1;
            }
            cursor = (*cursor).next;
        }
    }
    HEAP_LOCK.unlock();
    st
}

#[cfg(test)]
mod tests {
    use super::*;

    // The harness runs tests concurrently; chunk-accounting assertions need
    // the allocator to themselves.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn alloc_free_roundtrip() {
        let _g = TEST_LOCK.lock().unwrap();
        let p = alloc(100);
        assert!(!p.is_null());
        // SAFETY: p is a fresh 100-byte allocation.
        unsafe {
            core::ptr::write_bytes(p, 0xAB, 100);
            assert_eq!(*p, 0xAB);
            assert_eq!(*p.add(99), 0xAB);
            free(p);
        }
    }

    #[test]
    fn zero_sized_alloc_is_usable() {
        let _g = TEST_LOCK.lock().unwrap();
        let p = alloc(0);
        assert!(!p.is_null());
        // SAFETY: zero-size requests round up to MIN_ALLOC bytes.
        unsafe {
            *p = 1;
            free(p);
        }
    }

    #[test]
    fn freed_chunk_is_reused() {
        let _g = TEST_LOCK.lock().unwrap();
        let a = alloc(64);
        // SAFETY: a is live until freed.
        unsafe { free(a) };
        let b = alloc(48);
        // First-fit lands on the chunk just vacated (same or earlier address).
        assert!(b as usize <= a as usize);
        // SAFETY: b is live.
        unsafe { free(b) };
    }

    #[test]
    fn realloc_preserves_contents() {
        let _g = TEST_LOCK.lock().unwrap();
        let p = alloc(32);
        // SAFETY: p is a live 32-byte allocation, then q replaces it.
        unsafe {
            for i in 0..32 {
                *p.add(i) = i as u8;
            }
            let q = realloc(p, 128);
            assert!(!q.is_null());
            for i in 0..32 {
                assert_eq!(*q.add(i), i as u8);
            }
            let r = realloc(q, 8);
            assert!(!r.is_null());
            for i in 0..8 {
                assert_eq!(*r.add(i), i as u8);
            }
            free(r);
        }
    }

    #[test]
    fn state_tracks_used_chunks() {
        let _g = TEST_LOCK.lock().unwrap();
        let before = state();
        let p = alloc(40);
        let mid = state();
        assert!(mid.allocated >= before.allocated + 1);
        // SAFETY: p is live.
        unsafe { free(p) };
        let after = state();
        assert_eq!(after.allocated, mid.allocated - 1);
    }
}
