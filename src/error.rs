//! Error types returned by this crate.
//!
//! Mirrors the style of `procfs::ProcError`: a small, hand-rolled tagged-variant enum rather than
//! a `thiserror`-derived one, since the variant set here is fixed and the `Display` impls are
//! trivial to write out.

use std::fmt;
use std::io;

/// The error type returned by fallible operations in this crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum PurgeError {
    /// Mapping the data region failed.
    MmapData(io::Error),
    /// Unmapping the data region failed.
    UnmapData(io::Error),
    /// Mapping the UXPT window failed.
    MmapUxpt(io::Error),
    /// Unmapping the UXPT window failed.
    UnmapUxpt(io::Error),
    /// A UXPT range operation's address range fell outside the table's covered region.
    UxptOutOfRange,
    /// `PurgeableObject::create` was called with a zero-length size.
    InvalidSize,
    /// The builder chain failed to (re)build the content; the object remains usable, but this
    /// access did not succeed.
    BuildFailed,
    /// One or more steps of `destroy` failed. Carries every individual failure, not just the
    /// first, so a caller diagnosing a stuck teardown can see the whole picture.
    Destroy(Vec<PurgeError>),
}

impl fmt::Display for PurgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurgeError::MmapData(e) => write!(f, "failed to map data region: {}", e),
            PurgeError::UnmapData(e) => write!(f, "failed to unmap data region: {}", e),
            PurgeError::MmapUxpt(e) => write!(f, "failed to map UXPT window: {}", e),
            PurgeError::UnmapUxpt(e) => write!(f, "failed to unmap UXPT window: {}", e),
            PurgeError::UxptOutOfRange => write!(f, "UXPT range operation out of range"),
            PurgeError::InvalidSize => write!(f, "purgeable object size must be non-zero"),
            PurgeError::BuildFailed => write!(f, "builder chain failed to reconstruct content"),
            PurgeError::Destroy(errs) => {
                write!(f, "destroy failed ({} step(s)): ", errs.len())?;
                for (i, e) in errs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for PurgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PurgeError::MmapData(e)
            | PurgeError::UnmapData(e)
            | PurgeError::MmapUxpt(e)
            | PurgeError::UnmapUxpt(e) => Some(e),
            _ => None,
        }
    }
}

/// Builds a `PurgeError` from the current `errno`, the way `build_internal_error!` in `procfs`
/// wraps the underlying OS error without losing it.
macro_rules! last_os_error {
    ($variant:ident) => {
        crate::error::PurgeError::$variant(::std::io::Error::last_os_error())
    };
}

pub(crate) use last_os_error;
