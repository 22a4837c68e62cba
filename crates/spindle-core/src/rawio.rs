//! Formatted output through the write syscall.
//!
//! The runtime cannot use buffered host I/O on its own threads (those may
//! run with no usable host TLS and, on the exit path, no stack worth
//! trusting), so diagnostics go straight to the kernel. One process-wide
//! futex lock serializes whole messages.

use core::fmt::{self, Write};

use crate::futex::RawFutex;
use crate::syscall;

static PRINT_LOCK: RawFutex = RawFutex::new();

/// `fmt::Write` sink over `write(2)` to a file descriptor.
pub struct RawFd(pub i32);

impl Write for RawFd {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut buf = s.as_bytes();
        while !buf.is_empty() {
            // SAFETY: buf points into a live &str.
            match unsafe { syscall::sys_write(self.0, buf.as_ptr(), buf.len()) } {
                Ok(0) => return Err(fmt::Error),
                Ok(n) => buf = &buf[n..],
                Err(crate::errno::EINTR) => continue,
                Err(_) => return Err(fmt::Error),
            }
        }
        Ok(())
    }
}

/// Write formatted output to stdout under the global print lock.
pub fn print_args(args: fmt::Arguments<'_>) {
    PRINT_LOCK.lock();
    let _ = RawFd(1).write_fmt(args);
    PRINT_LOCK.unlock();
}

/// Write formatted output to stderr under the global print lock.
pub fn eprint_args(args: fmt::Arguments<'_>) {
    PRINT_LOCK.lock();
    let _ = RawFd(2).write_fmt(args);
    PRINT_LOCK.unlock();
}

/// Serialized print to stdout via the write syscall.
#[macro_export]
macro_rules! raw_print {
    ($($arg:tt)*) => {
        $crate::rawio::print_args(core::format_args!($($arg)*))
    };
}

/// Serialized print to stdout with a trailing newline.
#[macro_export]
macro_rules! raw_println {
    () => { $crate::rawio::print_args(core::format_args!("\n")) };
    ($($arg:tt)*) => {
        $crate::rawio::print_args(core::format_args!("{}\n", core::format_args!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_empty_and_short_strings() {
        assert!(RawFd(1).write_str("").is_ok());
        raw_println!("rawio self-test {}", 7);
    }

    #[test]
    fn write_to_bad_fd_errors() {
        assert!(RawFd(-1).write_str("x").is_err());
    }
}
