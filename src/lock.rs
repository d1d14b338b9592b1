//! Single-instance guard
//!
//! Binds an abstract-namespace unix socket; the kernel releases it when the
//! process dies, so no stale lock files are left behind. A second instance
//! fails the bind and must exit.

use nix::sys::socket::{bind, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

const LOCK_NAME: &[u8] = b"nx-proxy-instance-lock";

/// Held for the process lifetime; dropping it releases the lock
pub struct InstanceLock {
    _socket: OwnedFd,
}

impl InstanceLock {
    pub fn acquire() -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .map_err(io::Error::from)?;

        let addr = UnixAddr::new_abstract(LOCK_NAME).map_err(io::Error::from)?;

        bind(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;

        Ok(Self { _socket: fd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let lock = InstanceLock::acquire().expect("first lock");
        assert!(InstanceLock::acquire().is_err());

        drop(lock);
        let _lock = InstanceLock::acquire().expect("lock after release");
    }
}
