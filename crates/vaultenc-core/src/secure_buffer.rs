//! Scoped storage for key material that must never survive past one file operation.
//!
//! A [`SecureBuffer`] copies sensitive bytes into memory that is page-locked where the
//! OS allows it (via `memsafe`'s `mlock`/`mprotect` wrapper) and is zeroed with a
//! volatile write on every exit path, including panics, because it is wired through `Drop`.
//! It never hands out an owned copy of its contents — only scoped, read-only access.

use std::fmt;
use std::sync::RwLock;

use memsafe::MemSafe;
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

/// Error accessing a [`SecureBuffer`]'s protected memory region.
#[derive(Debug, Error)]
pub enum SecureBufferError {
    /// A thread panicked while holding the buffer's lock.
    #[error("secure buffer lock was poisoned")]
    LockPoisoned,
    /// The underlying `mprotect` toggle failed on read.
    #[error("memory protection operation failed: {0}")]
    MemoryProtection(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The caller supplied the wrong number of bytes.
    #[error("expected {expected} bytes of key material, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

const DEK_LEN: usize = 32;

/// Either the page-locked representation, or a best-effort fallback when the OS
/// refuses `mlock` (still zeroized on drop, just not swap-protected).
enum Storage {
    Locked(MemSafe<[u8; DEK_LEN]>),
    Unlocked(Zeroizing<[u8; DEK_LEN]>),
}

/// A 256-bit data encryption key held exclusively in zeroing, best-effort page-locked
/// memory.
///
/// Construction copies the caller's bytes in; the caller is responsible for zeroing its
/// own copy once the `SecureBuffer` is built. The key is never `Clone`, never `Debug`,
/// and is only reachable through [`SecureBuffer::with_bytes`].
pub struct SecureBuffer {
    inner: RwLock<Storage>,
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer").field("bytes", &"[REDACTED]").finish()
    }
}

impl SecureBuffer {
    /// Copy `bytes` into a new buffer, page-locking it when the platform allows.
    /// Failure to lock is logged at `warn` and degrades to a plain zeroizing buffer,
    /// per the "not fatal" memory-hygiene requirement.
    pub fn new(bytes: [u8; DEK_LEN]) -> Self {
        let storage = match MemSafe::new(bytes) {
            Ok(locked) => Storage::Locked(locked),
            Err(e) => {
                warn!(error = %e, "failed to page-lock DEK material, continuing without mlock");
                Storage::Unlocked(Zeroizing::new(bytes))
            }
        };
        Self {
            inner: RwLock::new(storage),
        }
    }

    /// Build a `SecureBuffer` from a byte slice of the correct length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SecureBufferError> {
        if bytes.len() != DEK_LEN {
            return Err(SecureBufferError::WrongLength {
                expected: DEK_LEN,
                actual: bytes.len(),
            });
        }
        let mut owned = [0u8; DEK_LEN];
        owned.copy_from_slice(bytes);
        Ok(Self::new(owned))
    }

    /// Run `f` with read-only access to the key bytes. The slice does not outlive the
    /// call; no copy is returned to the caller.
    pub fn with_bytes<F, R>(&self, f: F) -> Result<R, SecureBufferError>
    where
        F: FnOnce(&[u8; DEK_LEN]) -> R,
    {
        let mut lock = self.inner.write().map_err(|_| SecureBufferError::LockPoisoned)?;
        match &mut *lock {
            Storage::Locked(guarded) => {
                let guard = guarded
                    .read()
                    .map_err(|e| SecureBufferError::MemoryProtection(Box::new(e)))?;
                Ok(f(&guard))
            }
            Storage::Unlocked(bytes) => Ok(f(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let src = [7u8; DEK_LEN];
        let buf = SecureBuffer::from_slice(&src).unwrap();
        buf.with_bytes(|bytes| assert_eq!(bytes, &[7u8; DEK_LEN])).unwrap();
    }

    #[test]
    fn rejects_wrong_length() {
        let err = SecureBuffer::from_slice(&[0u8; 10]);
        assert!(matches!(err, Err(SecureBufferError::WrongLength { .. })));
    }

    #[test]
    fn debug_redacts_contents() {
        let buf = SecureBuffer::new([9u8; DEK_LEN]);
        let rendered = format!("{buf:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains('9'));
    }
}
