//! One-time initialization that survives cancellation of the executor.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::Result;
use crate::cancel;
use crate::futex::{futex_wait, futex_wake_all};

const ONCE_NEW: u32 = 0;
const ONCE_IN_PROGRESS: u32 = 1;
const ONCE_DONE: u32 = 2;

/// One-time initialization gate. The all-zero value is a fresh gate, so a
/// `static ONCE: Once = Once::new()` needs nothing else.
#[repr(transparent)]
pub struct Once(AtomicU32);

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(ONCE_NEW))
    }
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

/// Reset handler pushed around the initializer: if the executor is
/// cancelled mid-call, the gate reopens and every waiter retries.
extern "C" fn once_reset(arg: usize) {
    // SAFETY: arg is the address of the Once's state word, which outlives
    // every caller of `once` on it.
    let state = unsafe { &*(arg as *const AtomicU32) };
    state.store(ONCE_NEW, Ordering::SeqCst);
    futex_wake_all(state);
}

/// Run `f` exactly once across all concurrent callers of this `Once`.
///
/// The winner of the NEW→IN_PROGRESS transition runs `f`; everyone else
/// blocks until the state settles. Cancellation is disabled across the
/// state transitions but enabled (restored) around `f` itself, and a
/// cancelled executor resets the gate so that another caller can complete
/// the initialization.
pub fn once(gate: &Once, f: extern "C" fn()) -> Result<()> {
    let state = &gate.0;
    loop {
        match state.load(Ordering::SeqCst) {
            ONCE_DONE => return Ok(()),
            ONCE_NEW => {
                let was_enabled = cancel::disable_quietly();
                if state
                    .compare_exchange(
                        ONCE_NEW,
                        ONCE_IN_PROGRESS,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    if was_enabled {
                        cancel::enable_quietly();
                        cancel::testcancel();
                    }
                    continue;
                }

                if let Err(e) =
                    cancel::cleanup_push(once_reset, state as *const AtomicU32 as usize)
                {
                    state.store(ONCE_NEW, Ordering::SeqCst);
                    futex_wake_all(state);
                    if was_enabled {
                        cancel::enable_quietly();
                    }
                    return Err(e);
                }
                if was_enabled {
                    cancel::enable_quietly();
                    cancel::testcancel();
                }

                f();

                let _ = cancel::disable_quietly();
                cancel::cleanup_pop(false);
                state.store(ONCE_DONE, Ordering::SeqCst);
                futex_wake_all(state);
                if was_enabled {
                    cancel::enable_quietly();
                    cancel::testcancel();
                }
                return Ok(());
            }
            s => {
                let _ = futex_wait(state, s);
                cancel::testcancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn once_runs_exactly_once_sequentially() {
        runtime::init().unwrap();
        use core::sync::atomic::AtomicUsize;
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static GATE: Once = Once::new();

        extern "C" fn initializer() {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        for _ in 0..5 {
            once(&GATE, initializer).unwrap();
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_runs_exactly_once_concurrently() {
        runtime::init().unwrap();
        use core::sync::atomic::AtomicUsize;
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static GATE: Once = Once::new();

        extern "C" fn initializer() {
            // Widen the race window a little.
            crate::thread::sleep(core::time::Duration::from_millis(5));
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        extern "C" fn contender(_arg: usize) -> usize {
            once(&GATE, initializer).unwrap();
            CALLS.load(Ordering::SeqCst)
        }

        let attr = crate::thread::Attr::new();
        let threads: Vec<_> = (0..4)
            .map(|_| crate::thread::create(&attr, contender, 0).unwrap())
            .collect();
        for t in threads {
            assert_eq!(crate::thread::join(t), Ok(1));
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
