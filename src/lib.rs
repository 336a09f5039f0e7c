//! A userspace library for **purgeable memory**: anonymous memory regions whose physical pages
//! the kernel may reclaim under memory pressure, and which the application lazily rebuilds on
//! next access using a caller-supplied reconstruction function.
//!
//! The library mediates between a kernel facility — page-reclaim-eligible anonymous mappings
//! plus a companion user-extended page table ("UXPT") exposing per-page presence/refcount bits —
//! and client code that wants to hold large, regeneratable caches (decoded images, parsed blobs)
//! without pinning RAM.
//!
//! # Example
//!
//! ```no_run
//! use purgemem::PurgeableObject;
//!
//! let object = PurgeableObject::create(64 * 1024, Box::new(|buf: &mut [u8]| {
//!     buf.fill(0xAB);
//!     true
//! })).expect("create purgeable object");
//!
//! {
//!     let guard = object.begin_read().expect("begin_read");
//!     assert_eq!(guard.content()[0], 0xAB);
//! } // guard dropped here: releases the read lock and the UXPT pin
//!
//! object.destroy().expect("destroy");
//! ```
//!
//! # What this crate does not do
//!
//! No scheduling or eviction policy (the kernel decides when to purge); no serialization of
//! content; no inter-process sharing; no transparent paging to disk; no language bindings. A
//! DMA-BUF-style heap allocator sometimes paired with this kind of cache in the wild is out of
//! scope entirely: it is a thin ioctl wrapper with no policy of its own.
//!
//! # Cargo features
//!
//! * `uxpt` -- Default. Compiles in the kernel-backed UXPT path. With this off, every object
//!   always runs the fallback (never-purged) path.
//! * `probe` -- Default. Lets the platform probe attempt the purgeable/UXPT mmap calls at
//!   startup. With this off, the probe is skipped and fallback mode is forced unconditionally.

mod builder;
mod error;
mod object;
mod platform;
mod uxpt;

pub use builder::Step;
pub use error::PurgeError;
pub use object::{PurgeableObject, ReadGuard, WriteGuard};
pub use platform::{page_size, uxpt_supported};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_level_smoke_test() {
        let object = PurgeableObject::create(
            4096,
            Box::new(|buf: &mut [u8]| {
                buf.fill(0x42);
                true
            }),
        )
        .expect("create");

        let guard = object.begin_read().expect("begin_read");
        assert!(guard.content().iter().all(|&b| b == 0x42));
        drop(guard);

        assert!(object.destroy().is_ok());
    }

    #[test]
    fn uxpt_supported_does_not_panic() {
        let _ = uxpt_supported();
        assert!(page_size() > 0);
    }
}
