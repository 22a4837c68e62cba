//! POSIX errno constants and the errno-to-message table.
//!
//! The runtime reports failures as positive errno values inside `Err(..)`.
//! Only the codes the runtime can actually produce get named constants;
//! [`strerror`] covers the wider conventional set for diagnostics.

/// Operation not permitted.
pub const EPERM: i32 = 1;
/// No such process (or thread).
pub const ESRCH: i32 = 3;
/// Interrupted system call.
pub const EINTR: i32 = 4;
/// Try again.
pub const EAGAIN: i32 = 11;
/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Device or resource busy.
pub const EBUSY: i32 = 16;
/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Resource deadlock would occur.
pub const EDEADLK: i32 = 35;

struct ErrInfo {
    errno: i32,
    msg: &'static str,
}

static ERRORS: &[ErrInfo] = &[
    ErrInfo { errno: EPERM, msg: "Operation not permitted" },
    ErrInfo { errno: 2, msg: "No such file or directory" },
    ErrInfo { errno: ESRCH, msg: "No such process" },
    ErrInfo { errno: EINTR, msg: "Interrupted function call" },
    ErrInfo { errno: 5, msg: "Input/output error" },
    ErrInfo { errno: 6, msg: "No such device or address" },
    ErrInfo { errno: 7, msg: "Argument list too long" },
    ErrInfo { errno: 8, msg: "Exec format error" },
    ErrInfo { errno: 9, msg: "Bad file descriptor" },
    ErrInfo { errno: 10, msg: "No child processes" },
    ErrInfo { errno: EAGAIN, msg: "Resource temporarily unavailable" },
    ErrInfo { errno: ENOMEM, msg: "Not enough space" },
    ErrInfo { errno: 13, msg: "Permission denied" },
    ErrInfo { errno: 14, msg: "Bad address" },
    ErrInfo { errno: EBUSY, msg: "Device or resource busy" },
    ErrInfo { errno: 17, msg: "File exists" },
    ErrInfo { errno: 18, msg: "Improper link" },
    ErrInfo { errno: 19, msg: "No such device" },
    ErrInfo { errno: 20, msg: "Not a directory" },
    ErrInfo { errno: 21, msg: "Is a directory" },
    ErrInfo { errno: EINVAL, msg: "Invalid argument" },
    ErrInfo { errno: 23, msg: "Too many open files in system" },
    ErrInfo { errno: 24, msg: "Too many open files" },
    ErrInfo { errno: 28, msg: "No space left on device" },
    ErrInfo { errno: 30, msg: "Read-only filesystem" },
    ErrInfo { errno: 32, msg: "Broken pipe" },
    ErrInfo { errno: 33, msg: "Mathematics argument out of domain of function" },
    ErrInfo { errno: 34, msg: "Result too large" },
    ErrInfo { errno: EDEADLK, msg: "Resource deadlock avoided" },
    ErrInfo { errno: 36, msg: "Filename too long" },
    ErrInfo { errno: 37, msg: "No locks available" },
    ErrInfo { errno: 38, msg: "Function not implemented" },
    ErrInfo { errno: 39, msg: "Directory not empty" },
    ErrInfo { errno: 40, msg: "Too many levels of symbolic links" },
    ErrInfo { errno: 75, msg: "Value too large to be stored in data type" },
    ErrInfo { errno: 95, msg: "Operation not supported" },
    ErrInfo { errno: 110, msg: "Connection timed out" },
    ErrInfo { errno: 125, msg: "Operation canceled" },
];

/// Translates an errno value to a message.
///
/// Unknown values (including 0) map to `"Unknown"`.
#[must_use]
pub fn strerror(errno: i32) -> &'static str {
    ERRORS
        .iter()
        .find(|e| e.errno == errno)
        .map_or("Unknown", |e| e.msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_constants_resolve() {
        assert_eq!(strerror(EINVAL), "Invalid argument");
        assert_eq!(strerror(EDEADLK), "Resource deadlock avoided");
        assert_eq!(strerror(EPERM), "Operation not permitted");
        assert_eq!(strerror(EBUSY), "Device or resource busy");
        assert_eq!(strerror(ESRCH), "No such process");
    }

    #[test]
    fn unknown_errno_maps_to_unknown() {
        assert_eq!(strerror(0), "Unknown");
        assert_eq!(strerror(-1), "Unknown");
        assert_eq!(strerror(4096), "Unknown");
    }
}
