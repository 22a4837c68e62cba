//! Keyed thread-local storage with destructors.
//!
//! A global table of `MAX_KEYS` slots, each a `{generation, destructor}`
//! pair. The generation is a version counter: odd means the key is live,
//! even means it is free, and both allocation and deletion are a CAS
//! increment. Per-thread values live in the descriptor and record the
//! generation they were stored under; a value is only visible while its
//! recorded generation matches the key's current one, which invalidates
//! stale values across key reuse without any per-thread bookkeeping.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::Result;
use crate::errno::{EINVAL, ENOMEM};
use crate::thread::descriptor::current;

/// Number of TLS keys available process-wide.
pub const MAX_KEYS: usize = 1024;

struct KeySlot {
    /// Version counter: odd = allocated, even = free.
    seq: AtomicU64,
    /// Destructor fn pointer as usize, 0 = none.
    destructor: AtomicUsize,
}

static KEYS: [KeySlot; MAX_KEYS] = [const {
    KeySlot {
        seq: AtomicU64::new(0),
        destructor: AtomicUsize::new(0),
    }
}; MAX_KEYS];

/// Handle to an allocated TLS key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key(pub(crate) u16);

impl Key {
    /// The key's index, e.g. for diagnostics.
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

#[inline]
fn key_unused(seq: u64) -> bool {
    seq & 1 == 0
}

/// Allocate a key, optionally with a destructor invoked at thread exit for
/// non-null values. `Err(ENOMEM)` when all keys are taken.
pub fn key_create(destructor: Option<extern "C" fn(usize)>) -> Result<Key> {
    for (i, slot) in KEYS.iter().enumerate() {
        let seq = slot.seq.load(Ordering::SeqCst);
        if key_unused(seq)
            && slot
                .seq
                .compare_exchange(seq, seq + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            slot.destructor
                .store(destructor.map_or(0, |d| d as usize), Ordering::SeqCst);
            return Ok(Key(i as u16));
        }
    }
    Err(ENOMEM)
}

/// Release a key. Values stored under it become invisible everywhere at
/// once (their recorded generation no longer matches); destructors are not
/// run.
pub fn key_delete(key: Key) -> Result<()> {
    let Some(slot) = KEYS.get(key.index()) else {
        return Err(EINVAL);
    };
    let seq = slot.seq.load(Ordering::SeqCst);
    if !key_unused(seq)
        && slot
            .seq
            .compare_exchange(seq, seq + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    {
        return Ok(());
    }
    Err(EINVAL)
}

/// Read the calling thread's value for `key`; 0 when nothing valid is
/// stored (never-set, stale from key reuse, or the key is free).
#[must_use]
pub fn getspecific(key: Key) -> usize {
    let idx = key.index();
    let Some(slot) = KEYS.get(idx) else {
        return 0;
    };
    let seq = slot.seq.load(Ordering::SeqCst);
    if key_unused(seq) {
        return 0;
    }
    // SAFETY: the slot array is only touched by its owning thread.
    let tls = unsafe { &*(*current().descriptor()).tls.get() };
    if tls[idx].seq == seq { tls[idx].value } else { 0 }
}

/// Store the calling thread's value for `key`, stamping it with the key's
/// current generation.
pub fn setspecific(key: Key, value: usize) -> Result<()> {
    let idx = key.index();
    let Some(slot) = KEYS.get(idx) else {
        return Err(EINVAL);
    };
    let seq = slot.seq.load(Ordering::SeqCst);
    if key_unused(seq) {
        return Err(EINVAL);
    }
    // SAFETY: the slot array is only touched by its owning thread.
    let tls = unsafe { &mut *(*current().descriptor()).tls.get() };
    tls[idx].seq = seq;
    tls[idx].value = value;
    Ok(())
}

/// Run destructors for every live key with a current-generation, non-null
/// value on the calling thread. Called on the exit path.
///
/// Each value is nulled before its destructor runs, so a destructor that
/// re-enters the runtime cannot loop on its own slot.
pub(crate) fn run_destructors() {
    // SAFETY: the slot array is only touched by its owning thread.
    let tls = unsafe { &mut *(*current().descriptor()).tls.get() };
    for (idx, slot) in KEYS.iter().enumerate() {
        let seq = slot.seq.load(Ordering::SeqCst);
        if key_unused(seq) || tls[idx].seq != seq || tls[idx].value == 0 {
            continue;
        }
        let dtor = slot.destructor.load(Ordering::SeqCst);
        if dtor == 0 {
            continue;
        }
        let value = tls[idx].value;
        tls[idx].value = 0;
        // SAFETY: dtor was stored from a valid extern "C" fn(usize).
        let f: extern "C" fn(usize) = unsafe { core::mem::transmute(dtor) };
        f(value);
    }
}
