//! # spindle-core
//!
//! A minimal 1:1 user-space threading runtime built directly on Linux
//! syscalls: thread creation via `clone`, blocking via `futex`, cancellation
//! via `tgkill`, and priority-aware scheduling via `sched_setscheduler`.
//! No existing thread library is involved — the runtime owns its stacks,
//! descriptors, and synchronization from the raw syscall layer up.
//!
//! The public surface mirrors the POSIX thread API: mutexes (three types
//! composed with three priority protocols), condition variables,
//! reader-writer locks, one-time initialization, keyed thread-local storage
//! with destructors, cancellation with cleanup handlers, and scheduling
//! parameter control.
//!
//! ## Usage
//!
//! Call [`runtime::init`] before anything else. It installs the cancellation
//! signal handler, records the process id, and registers the calling thread
//! with the runtime. Any *other* host thread that wants to call into the
//! runtime must call [`runtime::init`] (or [`runtime::ensure_thread`]) once
//! first; threads created through [`thread::create`] are registered
//! automatically.
//!
//! All fallible calls return `Result<T, i32>` where the error is a positive
//! errno value from the conventional POSIX set (see [`errno`]).
//!
//! x86_64 Linux only.

pub mod cancel;
mod cell;
pub mod cond;
pub mod errno;
pub mod futex;
pub mod heap;
pub mod mutex;
pub mod rawio;
pub mod runtime;
pub mod rwlock;
pub mod sched;
pub mod signal;
#[cfg(target_arch = "x86_64")]
pub mod syscall;
pub mod thread;
pub mod tls;

pub use cancel::{CANCELED_RETVAL, CancelState, CancelType};
pub use cond::Cond;
pub use mutex::{Mutex, MutexAttr, MutexType, Protocol};
pub use rwlock::RwLock;
pub use sched::{Policy, SchedInfo};
pub use thread::{Attr, DetachState, InheritSched, Once, StartFn, Thread};
pub use tls::Key;

/// Result alias used by every fallible runtime call: the error is a positive
/// errno value.
pub type Result<T> = core::result::Result<T, i32>;
