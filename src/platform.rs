//! The platform probe (component A).
//!
//! Detects, once per process, whether the running kernel accepts the purgeable-mapping and UXPT
//! mmap flags this crate relies on. The probe result is a process-wide immutable flag, the Rust
//! rendition of the source's "global static flag from constructor" pattern (see SPEC_FULL.md
//! §9), computed lazily on first use via `lazy_static`, the same crate `procfs` reaches for to
//! cache `TICKS_PER_SECOND`/`PAGESIZE`.

use std::ptr;

/// Platform-specific flag requesting a page-reclaim-eligible anonymous mapping.
///
/// Not part of the mainline `libc` crate: this is a vendor kernel extension, so the constant is
/// declared locally and its acceptance is probed at runtime rather than assumed from the target
/// triple.
#[cfg(unix)]
pub(crate) const MAP_PURGEABLE: libc::c_int = 0x0004_0000;

/// Platform-specific flag requesting a mapping of the user-extended page-table window.
#[cfg(unix)]
pub(crate) const MAP_USEREXPTE: libc::c_int = 0x0008_0000;

lazy_static::lazy_static! {
    /// Whether the kernel supports purgeable mappings and UXPT. Computed once; every `UxptTable`
    /// constructor consults this instead of re-probing.
    static ref UXPT_SUPPORTED: bool = probe();

    /// The system page size, in bytes. Computed once from `sysconf(_SC_PAGESIZE)`.
    pub(crate) static ref PAGE_SIZE: usize = page_size();
}

/// Returns whether this process's kernel supports purgeable mappings and UXPT.
///
/// This is the single enabled-flag component A exposes to the rest of the crate. It never
/// surfaces an error to callers: any probe failure silently selects the fallback path (§4.E).
pub fn uxpt_supported() -> bool {
    cfg!(feature = "uxpt") && *UXPT_SUPPORTED
}

/// Byte size of one page on this system.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ps > 0 {
            ps as usize
        } else {
            4096
        }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// Rounds `len` up to the next multiple of the page size (or returns `len` unchanged if it is
/// already page-aligned).
pub(crate) fn round_up_page(len: usize) -> usize {
    let page = *PAGE_SIZE;
    (len + page - 1) / page * page
}

/// Rounds `addr` down to the nearest page boundary.
pub(crate) fn round_down_page(addr: usize) -> usize {
    let page = *PAGE_SIZE;
    addr - (addr % page)
}

#[cfg(unix)]
fn probe() -> bool {
    if !cfg!(feature = "probe") {
        log::debug!("purgemem: platform probe disabled at compile time, forcing fallback mode");
        return false;
    }

    let page = *PAGE_SIZE;

    let data = unsafe {
        libc::mmap(
            ptr::null_mut(),
            page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | MAP_PURGEABLE,
            -1,
            0,
        )
    };
    if data == libc::MAP_FAILED {
        log::debug!("purgemem: purgeable mapping not supported by this kernel, using fallback mode");
        return false;
    }

    let uxpt = unsafe {
        libc::mmap(
            ptr::null_mut(),
            page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | MAP_USEREXPTE,
            -1,
            0,
        )
    };

    unsafe {
        libc::munmap(data, page);
    }

    if uxpt == libc::MAP_FAILED {
        log::debug!("purgemem: UXPT mapping not supported by this kernel, using fallback mode");
        return false;
    }

    unsafe {
        libc::munmap(uxpt, page);
    }

    log::debug!("purgemem: kernel supports purgeable mappings and UXPT");
    true
}

#[cfg(not(unix))]
fn probe() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn round_up_is_idempotent() {
        let ps = *PAGE_SIZE;
        assert_eq!(round_up_page(0), 0);
        assert_eq!(round_up_page(1), ps);
        assert_eq!(round_up_page(ps), ps);
        assert_eq!(round_up_page(ps + 1), ps * 2);
    }

    #[test]
    fn round_down_snaps_to_boundary() {
        let ps = *PAGE_SIZE;
        assert_eq!(round_down_page(0), 0);
        assert_eq!(round_down_page(ps - 1), 0);
        assert_eq!(round_down_page(ps), ps);
        assert_eq!(round_down_page(ps + 1), ps);
    }

    #[test]
    fn probe_runs_without_panicking() {
        let _ = uxpt_supported();
    }
}
