//! Error taxonomy for kernel operations.
//!
//! Every fallible operation returns [`KernelResult`]. The syscall layer
//! turns an [`Errno`] into its negative raw value; nothing else crosses the
//! user boundary.

use core::fmt;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, Errno>;

/// Recoverable error conditions reported by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Target thread, service or child vanished or never existed
    NoEntry,
    /// Non-blocking operation found nothing, or a wait was interrupted
    Again,
    /// Resource busy (live thread, object with queued waiters)
    Busy,
    /// Cross-address-space copy touched an inaccessible address
    Fault,
    /// Malformed flags, priority, timeout or state transition request
    Invalid,
    /// Allocation of a kernel resource failed
    NoMemory,
    /// Caller is not allowed to perform the operation
    Permission,
    /// Object is still linked where it must already be detached
    TooManyLinks,
    /// Unknown system call number
    NoSys,
}

impl Errno {
    /// Positive errno number of this error.
    pub const fn code(self) -> i64 {
        match self {
            Errno::Permission => 1,
            Errno::NoEntry => 2,
            Errno::Again => 11,
            Errno::NoMemory => 12,
            Errno::Fault => 14,
            Errno::Busy => 16,
            Errno::Invalid => 22,
            Errno::TooManyLinks => 31,
            Errno::NoSys => 38,
        }
    }

    /// Value returned to user space (`-code`).
    pub const fn as_neg(self) -> i64 {
        -self.code()
    }

    /// Map a negative syscall return value back to an error.
    pub fn from_neg(rc: i64) -> Option<Self> {
        let all = [
            Errno::Permission,
            Errno::NoEntry,
            Errno::Again,
            Errno::NoMemory,
            Errno::Fault,
            Errno::Busy,
            Errno::Invalid,
            Errno::TooManyLinks,
            Errno::NoSys,
        ];
        all.into_iter().find(|e| e.as_neg() == rc)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Errno::NoEntry => write!(f, "No such thread or endpoint"),
            Errno::Again => write!(f, "Resource temporarily unavailable"),
            Errno::Busy => write!(f, "Resource busy"),
            Errno::Fault => write!(f, "Bad address"),
            Errno::Invalid => write!(f, "Invalid argument"),
            Errno::NoMemory => write!(f, "Out of memory"),
            Errno::Permission => write!(f, "Operation not permitted"),
            Errno::TooManyLinks => write!(f, "Object still linked"),
            Errno::NoSys => write!(f, "Function not implemented"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_errno_codes() {
        assert_eq!(Errno::NoEntry.as_neg(), -2);
        assert_eq!(Errno::Again.as_neg(), -11);
        assert_eq!(Errno::Fault.as_neg(), -14);
        assert_eq!(Errno::Busy.as_neg(), -16);
        assert_eq!(Errno::Invalid.as_neg(), -22);
    }

    #[test]
    fn test_from_neg() {
        assert_eq!(Errno::from_neg(-11), Some(Errno::Again));
        assert_eq!(Errno::from_neg(-38), Some(Errno::NoSys));
        assert_eq!(Errno::from_neg(0), None);
        assert_eq!(Errno::from_neg(-1000), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Errno::Fault.to_string(), "Bad address");
        assert_eq!(Errno::NoEntry.to_string(), "No such thread or endpoint");
    }
}
