//! Crate-wide error type and hypercall status codes.

/// Errors surfaced by hypervisor subsystems. Hypercall handlers convert
/// these to numeric status codes; init-time code logs and isolates them
/// to the offending partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation not permitted on this handle.
    Perm,
    /// No such object (queue empty, node missing).
    NotFound,
    /// I/O error (hardware did not respond as required).
    Io,
    /// Temporarily out of resources; retry is reasonable.
    Again,
    /// Out of memory or out of a fixed resource pool.
    NoMem,
    /// Bad guest buffer address.
    Fault,
    /// No such device.
    NoDev,
    /// Invalid argument.
    Invalid,
    /// Malformed configuration tree.
    BadTree,
    /// Object exists but is in the wrong state (e.g. unclaimed).
    InvalidState,
    /// Hypercall or optional operation not implemented.
    Unimplemented,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Numeric status returned to guests in GPR3.
    pub fn status(self) -> u32 {
        match self {
            Error::Perm => 1,
            Error::NotFound => 2,
            Error::Io => 3,
            Error::Again => 4,
            Error::NoMem => 5,
            Error::Fault => 6,
            Error::NoDev => 7,
            Error::Invalid => 8,
            Error::BadTree => 10,
            Error::InvalidState => 11,
            Error::Unimplemented => 12,
        }
    }
}

/// Hypercall success status.
pub const EV_SUCCESS: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_distinct() {
        let all = [
            Error::Perm,
            Error::NotFound,
            Error::Io,
            Error::Again,
            Error::NoMem,
            Error::Fault,
            Error::NoDev,
            Error::Invalid,
            Error::BadTree,
            Error::InvalidState,
            Error::Unimplemented,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.status(), b.status());
            }
            assert_ne!(a.status(), EV_SUCCESS);
        }
    }
}
