//! Signal plumbing for cancellation.
//!
//! The runtime claims exactly one signal (the first realtime signal) and
//! installs its handler through the raw `rt_sigaction` syscall with
//! hand-rolled kernel struct layouts. On x86_64 the kernel does not supply
//! a signal-return trampoline, so `SA_RESTORER` points at the runtime's own
//! `rt_sigreturn` stub.

use crate::Result;
use crate::syscall::{self, __spindle_rt_sigreturn};

/// `SA_SIGINFO`: handler takes (signo, siginfo, ucontext).
const SA_SIGINFO: u64 = 0x0000_0004;
/// `SA_RESTORER`: `sa_restorer` is valid.
const SA_RESTORER: u64 = 0x0400_0000;

/// Size of the kernel sigset in bytes (`_NSIG / 8`).
const SIGSET_SIZE: usize = 8;

/// Kernel `struct sigaction` (x86_64 layout: handler, flags, restorer,
/// mask).
#[repr(C)]
struct KernelSigaction {
    handler: usize,
    flags: u64,
    restorer: usize,
    mask: u64,
}

/// The prefix of the kernel `siginfo_t` the cancellation handler inspects.
/// For tkill-style signals the union places `si_pid`/`si_uid` directly
/// after the three-word header.
#[repr(C)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    _pad: i32,
    pub si_pid: i32,
    pub si_uid: u32,
    // The rest of the 128-byte union is irrelevant here.
}

/// Install `handler` for `signum` with SIGINFO semantics, an empty mask,
/// and the runtime's restorer.
pub(crate) fn install_siginfo_handler(
    signum: i32,
    handler: extern "C" fn(i32, *mut SigInfo, *mut core::ffi::c_void),
) -> Result<()> {
    let act = KernelSigaction {
        handler: handler as usize,
        flags: SA_SIGINFO | SA_RESTORER,
        restorer: __spindle_rt_sigreturn as usize,
        mask: 0,
    };
    // SAFETY: act is a fully initialized kernel sigaction with a valid
    // restorer; no old-action output is requested.
    unsafe {
        syscall::sys_rt_sigaction(
            signum,
            &act as *const KernelSigaction as usize,
            0,
            SIGSET_SIZE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn siginfo_field_offsets_match_kernel_layout() {
        assert_eq!(core::mem::offset_of!(SigInfo, si_signo), 0);
        assert_eq!(core::mem::offset_of!(SigInfo, si_code), 8);
        assert_eq!(core::mem::offset_of!(SigInfo, si_pid), 16);
        assert_eq!(core::mem::offset_of!(SigInfo, si_uid), 20);
    }

    #[test]
    fn sigaction_struct_is_four_words() {
        assert_eq!(core::mem::size_of::<KernelSigaction>(), 32);
    }

    #[test]
    fn install_rejects_bogus_signal_number() {
        extern "C" fn nop(_: i32, _: *mut SigInfo, _: *mut core::ffi::c_void) {}
        assert_eq!(
            install_siginfo_handler(9999, nop),
            Err(crate::errno::EINVAL)
        );
    }
}
