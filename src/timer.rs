use std::io;
use std::os::unix::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

fn timespec_from_ns(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    }
}

/// Timer
///
/// A periodic timer backed by a nonblocking timerfd, so expiry can sit in
/// the same readiness set as a socket. All operations take `&self`; the
/// descriptor may be armed from producer threads while the dispatcher
/// waits on it.
pub struct Timer {
    fd: RawFd,
    interval_us: AtomicU64,
    enabled: AtomicBool,
}

impl Timer {
    pub fn new() -> io::Result<Timer> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Timer {
            fd,
            interval_us: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
        })
    }

    fn settime(&self, interval_ns: u64, value_ns: u64) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: timespec_from_ns(interval_ns),
            it_value: timespec_from_ns(value_ns),
        };

        let result = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Arm with a period of `interval_us` and the next expiry after
    /// `value_us`. A `value_us` of zero disarms the descriptor.
    pub fn adjust(&self, interval_us: u64, value_us: u64) -> io::Result<()> {
        self.interval_us.store(interval_us, Ordering::Relaxed);
        self.enabled.store(value_us > 0, Ordering::Relaxed);
        self.settime(interval_us * 1_000, value_us * 1_000)
    }

    /// Re-arm with the last configured period.
    pub fn enable(&self) -> io::Result<()> {
        let interval = self.interval_us.load(Ordering::Relaxed);
        self.adjust(interval, interval)
    }

    pub fn disable(&self) -> io::Result<()> {
        self.enabled.store(false, Ordering::Relaxed);
        self.settime(0, 0)
    }

    /// Force the next expiry to happen immediately, keeping the period.
    pub fn fire(&self) -> io::Result<()> {
        self.enabled.store(true, Ordering::Relaxed);
        let interval = self.interval_us.load(Ordering::Relaxed);
        self.settime(interval * 1_000, 1)
    }

    /// Number of expirations since the last read, 0 when none are pending.
    pub fn read(&self) -> u64 {
        let mut expirations: u64 = 0;
        let result = unsafe {
            libc::read(
                self.fd,
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };

        if result as usize != std::mem::size_of::<u64>() {
            return 0;
        }
        expirations
    }

    /// Remaining time until the next expiry.
    pub fn value_us(&self) -> io::Result<u64> {
        let mut spec = libc::itimerspec {
            it_interval: timespec_from_ns(0),
            it_value: timespec_from_ns(0),
        };

        let result = unsafe { libc::timerfd_gettime(self.fd, &mut spec) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(spec.it_value.tv_sec as u64 * 1_000_000 + spec.it_value.tv_nsec as u64 / 1_000)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for Timer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}
