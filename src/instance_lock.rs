//! Machine-wide single-instance lock.
//!
//! The lock is a TCP listener bound to a fixed loopback port. The socket is
//! never accepted on; the bind itself is the mutex. The OS rejecting the
//! bind with "address in use" is the only signal that another launcher is
//! running, and the OS reclaims the port if the process dies without
//! releasing it.

use std::io;
use std::net::{SocketAddr, TcpListener};

use tracing::{debug, info};

use crate::error::{LauncherError, Result};

/// The well-known endpoint used as a mutex.
#[derive(Debug, Clone, Copy)]
pub struct InstanceLock {
    endpoint: SocketAddr,
}

impl InstanceLock {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Bind the lock endpoint. Either fully succeeds or leaves nothing bound.
    pub fn acquire(&self) -> Result<LockHandle> {
        match TcpListener::bind(self.endpoint) {
            Ok(listener) => {
                info!("Instance lock acquired on {}", self.endpoint);
                Ok(LockHandle {
                    endpoint: self.endpoint,
                    listener: Some(listener),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(LauncherError::AlreadyRunning {
                endpoint: self.endpoint,
            }),
            Err(source) => Err(LauncherError::Lock {
                endpoint: self.endpoint,
                source,
            }),
        }
    }
}

/// Proof of holding the instance lock. Dropping it also releases the lock.
#[derive(Debug)]
pub struct LockHandle {
    endpoint: SocketAddr,
    listener: Option<TcpListener>,
}

impl LockHandle {
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_held(&self) -> bool {
        self.listener.is_some()
    }

    /// Close the bound socket. Later calls do nothing.
    pub fn release(&mut self) {
        if let Some(listener) = self.listener.take() {
            drop(listener);
            debug!("Instance lock on {} released", self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::free_port;

    fn lock_on_free_port() -> InstanceLock {
        InstanceLock::new(SocketAddr::from(([127, 0, 0, 1], free_port())))
    }

    #[test]
    fn test_second_acquire_reports_already_running() {
        let lock = lock_on_free_port();
        let first = lock.acquire().expect("first acquire");
        assert!(first.is_held());

        match lock.acquire() {
            Err(LauncherError::AlreadyRunning { endpoint }) => {
                assert_eq!(endpoint, lock.endpoint())
            }
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        drop(first);
    }

    #[test]
    fn test_acquire_succeeds_after_release() {
        let lock = lock_on_free_port();
        let mut first = lock.acquire().expect("first acquire");
        first.release();
        assert!(!first.is_held());

        let second = lock.acquire().expect("acquire after release");
        assert!(second.is_held());
    }

    #[test]
    fn test_release_twice_is_harmless() {
        let lock = lock_on_free_port();
        let mut handle = lock.acquire().expect("acquire");
        handle.release();
        handle.release();
        assert!(!handle.is_held());
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_drop_releases_lock() {
        let lock = lock_on_free_port();
        {
            let _handle = lock.acquire().expect("acquire");
        }
        assert!(lock.acquire().is_ok());
    }
}
