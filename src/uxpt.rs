//! The UXPT table (component B): ownership of the user-extended page-table window covering a
//! data region, and the atomic get/put/clear/is-present protocol over it.
//!
//! Entry layout mirrors the bitflags-over-a-kernel-reported-u64 style `procfs` uses for pagemap
//! entries (`process::pagemap::MemoryPageFlags`): bit 0 is a kernel-maintained "present" bit,
//! and the bits above it are a userspace refcount. The refcount is maintained in units of
//! [`REFCNT_ONE`] specifically so that plain integer addition/subtraction on the whole 64-bit
//! entry can never perturb bit 0 — see the crate-level docs for why `REFCNT_ONE == 2`.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::PurgeError;
use crate::platform;

/// Userspace refcount increments/decrements happen in units of two, so that plain integer
/// arithmetic on the raw entry never touches bit 0 (the kernel-owned present bit).
pub(crate) const REFCNT_ONE: u64 = 2;

bitflags::bitflags! {
    /// The kernel-maintained bits of a UXPT entry, mirroring the `bitflags`-over-a-raw-`u64`
    /// style `procfs` uses for pagemap entries (`process::pagemap::MemoryPageFlags`). The
    /// refcount bits above `PRESENT` are userspace-owned and manipulated with plain integer
    /// arithmetic rather than through this type -- see [`REFCNT_ONE`].
    struct EntryFlags: u64 {
        const PRESENT = 1;
    }
}

/// The kernel-maintained "present" bit: set when the page is resident, cleared on reclaim.
const PRESENT_BIT: u64 = EntryFlags::PRESENT.bits();

/// Sentinel entry value signaling "this page is currently being reclaimed by the kernel" —
/// the two's-complement representation of `-REFCNT_ONE`.
const UNDER_RECLAIM: u64 = (0u64).wrapping_sub(REFCNT_ONE);

/// `log2` of the UXPT entry size (8 bytes).
const ENTRY_SHIFT: u32 = 3;

/// Number of UXPT entries that fit in one UXPT page.
fn entries_per_uxpt_page() -> usize {
    1usize << (page_shift() - ENTRY_SHIFT)
}

fn page_shift() -> u32 {
    (*platform::PAGE_SIZE).trailing_zeros()
}

/// The UXPT page number covering virtual address `v`, per SPEC_FULL.md §4.B's indexing scheme.
fn uxpt_page_no(v: usize) -> usize {
    (v >> page_shift()) >> (page_shift() - ENTRY_SHIFT)
}

/// A UXPT table, dispatching between the real kernel-backed implementation and the no-op
/// fallback depending on what the platform probe found (component E). This is a runtime choice,
/// not a `cfg`, so a single binary degrades gracefully on a kernel that lacks UXPT support.
pub(crate) enum UxptTable {
    Kernel(KernelUxpt),
    Fallback(FallbackUxpt),
}

impl UxptTable {
    pub(crate) fn init(data_addr: usize, data_size: usize) -> Result<UxptTable, PurgeError> {
        if platform::uxpt_supported() {
            Ok(UxptTable::Kernel(KernelUxpt::init(data_addr, data_size)?))
        } else {
            Ok(UxptTable::Fallback(FallbackUxpt::init(data_addr, data_size)))
        }
    }

    pub(crate) fn deinit(&mut self) -> Result<(), PurgeError> {
        match self {
            UxptTable::Kernel(k) => k.deinit(),
            UxptTable::Fallback(f) => f.deinit(),
        }
    }

    pub(crate) fn get(&self, addr: usize, len: usize) -> Result<(), PurgeError> {
        match self {
            UxptTable::Kernel(k) => k.get(addr, len),
            UxptTable::Fallback(f) => f.get(addr, len),
        }
    }

    pub(crate) fn put(&self, addr: usize, len: usize) -> Result<(), PurgeError> {
        match self {
            UxptTable::Kernel(k) => k.put(addr, len),
            UxptTable::Fallback(f) => f.put(addr, len),
        }
    }

    pub(crate) fn clear(&self, addr: usize, len: usize) -> Result<(), PurgeError> {
        match self {
            UxptTable::Kernel(k) => k.clear(addr, len),
            UxptTable::Fallback(f) => f.clear(addr, len),
        }
    }

    pub(crate) fn is_present(&self, addr: usize, len: usize) -> bool {
        match self {
            UxptTable::Kernel(k) => k.is_present(addr, len),
            UxptTable::Fallback(f) => f.is_present(addr, len),
        }
    }

    pub(crate) fn size(&self) -> usize {
        match self {
            UxptTable::Kernel(k) => k.size(),
            UxptTable::Fallback(f) => f.size(),
        }
    }

    /// Test-only hook (§8 S2/S3): clear every present bit in the covered range, simulating a
    /// kernel reclaim without actually touching the data mapping.
    #[cfg(test)]
    pub(crate) fn simulate_purge(&self) {
        match self {
            UxptTable::Kernel(k) => k.simulate_purge(),
            UxptTable::Fallback(_) => {}
        }
    }
}

/// The kernel-backed implementation: a real mmap'd window of 64-bit entries.
pub(crate) struct KernelUxpt {
    data_addr: usize,
    data_size: usize,
    entries: *mut u64,
    /// Number of entries mapped (one per data page).
    len: usize,
    /// Byte length of the mmap'd window.
    window_len: usize,
}

// The mapping is owned exclusively by this table and all access to `entries` goes through
// atomic operations, so it's safe to move/share the handle across threads.
unsafe impl Send for KernelUxpt {}
unsafe impl Sync for KernelUxpt {}

impl KernelUxpt {
    fn init(data_addr: usize, data_size: usize) -> Result<KernelUxpt, PurgeError> {
        let npages = platform::round_up_page(data_size) / *platform::PAGE_SIZE;
        let uxpt_pages = (npages + entries_per_uxpt_page() - 1) / entries_per_uxpt_page();
        let window_len = uxpt_pages * *platform::PAGE_SIZE;
        let offset = (uxpt_page_no(data_addr) * *platform::PAGE_SIZE) as libc::off_t;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                window_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | platform::MAP_USEREXPTE,
                -1,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(crate::error::last_os_error!(MmapUxpt));
        }

        let table = KernelUxpt {
            data_addr,
            data_size,
            entries: ptr as *mut u64,
            len: npages,
            window_len,
        };
        table.clear(data_addr, data_size)?;
        Ok(table)
    }

    fn deinit(&mut self) -> Result<(), PurgeError> {
        if self.entries.is_null() {
            return Ok(());
        }
        let rc = unsafe { libc::munmap(self.entries as *mut libc::c_void, self.window_len) };
        self.entries = ptr::null_mut();
        if rc != 0 {
            return Err(crate::error::last_os_error!(UnmapUxpt));
        }
        Ok(())
    }

    fn entry(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.len);
        unsafe { &*(self.entries.add(index) as *const AtomicU64) }
    }

    /// Validates `[addr, addr+len)` against the covered region and returns the inclusive page
    /// index range, without mutating anything — so range ops can reject out-of-range input with
    /// no side effects, per SPEC_FULL.md §4.B.
    fn page_range(&self, addr: usize, len: usize) -> Result<std::ops::Range<usize>, PurgeError> {
        let page_size = *platform::PAGE_SIZE;
        let start = platform::round_down_page(addr);
        let end = platform::round_up_page(addr + len);
        let covered_end = self.data_addr + platform::round_up_page(self.data_size);
        if start < self.data_addr || end > covered_end {
            return Err(PurgeError::UxptOutOfRange);
        }
        let start_idx = (start - self.data_addr) / page_size;
        let end_idx = (end - self.data_addr) / page_size;
        Ok(start_idx..end_idx)
    }

    fn get(&self, addr: usize, len: usize) -> Result<(), PurgeError> {
        let range = self.page_range(addr, len)?;
        for i in range {
            let entry = self.entry(i);
            loop {
                let old = entry.load(Ordering::Acquire);
                if old == UNDER_RECLAIM {
                    std::thread::yield_now();
                    continue;
                }
                let new = match old.checked_add(REFCNT_ONE) {
                    Some(n) => n,
                    None => {
                        log::warn!("purgemem: UXPT refcount overflow at page {}, dropping increment", i);
                        break;
                    }
                };
                if entry
                    .compare_exchange_weak(old, new, Ordering::Release, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
        Ok(())
    }

    fn put(&self, addr: usize, len: usize) -> Result<(), PurgeError> {
        let range = self.page_range(addr, len)?;
        for i in range {
            let entry = self.entry(i);
            loop {
                let old = entry.load(Ordering::Acquire);
                let new = old.wrapping_sub(REFCNT_ONE);
                if entry
                    .compare_exchange_weak(old, new, Ordering::Release, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
        Ok(())
    }

    fn clear(&self, addr: usize, len: usize) -> Result<(), PurgeError> {
        let range = self.page_range(addr, len)?;
        for i in range {
            let entry = self.entry(i);
            let old = entry.swap(0, Ordering::AcqRel);
            if old != 0 {
                log::warn!("purgemem: UXPT entry {} was non-zero ({:#x}) when cleared", i, old);
            }
        }
        Ok(())
    }

    fn is_present(&self, addr: usize, len: usize) -> bool {
        let range = match self.page_range(addr, len) {
            Ok(r) => r,
            Err(_) => return false,
        };
        range.into_iter().all(|i| {
            EntryFlags::from_bits_truncate(self.entry(i).load(Ordering::Acquire))
                .contains(EntryFlags::PRESENT)
        })
    }

    fn size(&self) -> usize {
        self.window_len
    }

    #[cfg(test)]
    fn simulate_purge(&self) {
        for i in 0..self.len {
            self.entry(i).fetch_and(!PRESENT_BIT, Ordering::AcqRel);
        }
    }
}

/// Component E: when the kernel lacks UXPT support, every operation is a no-op and presence is
/// reported unconditionally. This collapses the "purged" predicate down to `build_count == 0`
/// (see `PurgeableObject`), since there is no kernel-maintained presence bit to consult.
pub(crate) struct FallbackUxpt {
    #[allow(dead_code)]
    data_addr: usize,
    #[allow(dead_code)]
    data_size: usize,
}

impl FallbackUxpt {
    fn init(data_addr: usize, data_size: usize) -> FallbackUxpt {
        FallbackUxpt { data_addr, data_size }
    }

    fn deinit(&mut self) -> Result<(), PurgeError> {
        Ok(())
    }

    fn get(&self, _addr: usize, _len: usize) -> Result<(), PurgeError> {
        Ok(())
    }

    fn put(&self, _addr: usize, _len: usize) -> Result<(), PurgeError> {
        Ok(())
    }

    fn clear(&self, _addr: usize, _len: usize) -> Result<(), PurgeError> {
        Ok(())
    }

    fn is_present(&self, _addr: usize, _len: usize) -> bool {
        true
    }

    fn size(&self) -> usize {
        0
    }
}
