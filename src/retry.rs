use std::fmt::Debug;
use std::io::{Error, ErrorKind, Result};

/// Check an error return value for recoverable conditions.
///
/// Nonblocking reads report an empty queue as an error, and a signal can
/// knock a thread out of a readiness wait. This trait adds a
/// `should_retry` method to `Error` and `Result` so the receive paths can
/// tell those conditions apart from real failures.
pub trait ShouldRetry {
    /// Check for a recoverable condition
    ///
    /// If `true`, the operation may simply be repeated later.
    fn should_retry(&self) -> bool;
}

impl ShouldRetry for Error {
    fn should_retry(&self) -> bool {
        match self.kind() {
            // EAGAIN and EWOULDBLOCK mean the queue is empty, EINTR that a
            // signal arrived mid-wait. the stdlib maps the first two to
            // WouldBlock
            ErrorKind::WouldBlock | ErrorKind::Interrupted => true,
            // however, EINPROGRESS is also valid
            ErrorKind::Other => {
                if let Some(i) = self.raw_os_error() {
                    i == nix::errno::Errno::EINPROGRESS as i32
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

impl<E: Debug> ShouldRetry for Result<E> {
    fn should_retry(&self) -> bool {
        if let &Err(ref e) = self {
            e.should_retry()
        } else {
            false
        }
    }
}
