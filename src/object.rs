//! The purgeable object (component D): the type this crate exists to provide.
//!
//! Binds a data mapping, a UXPT table, a builder chain, a reader/writer lock, and a build
//! counter behind one owning handle whose `Drop` releases everything in reverse order of
//! acquisition — the Rust rendition of SPEC_FULL.md §9's "manual memory + kernel handles →
//! ownership types" note.

use std::ptr;
use std::slice;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::builder::{BuilderChain, Step};
use crate::error::PurgeError;
use crate::platform;
use crate::uxpt::UxptTable;

/// State guarded by the object's reader/writer lock: the build counter and the builder chain
/// that reproduces content after a purge. The data buffer itself is *not* behind this lock in
/// the Rust type system's eyes (it's raw memory reached through a pointer) — the lock's job is
/// to serialize access to it, which is why every access goes through a guard that holds this
/// lock for its whole lifetime.
struct Inner {
    chain: BuilderChain,
    build_count: u64,
}

/// A purgeable memory object: `requested_size` bytes of content that the kernel may reclaim
/// under memory pressure, and which this type transparently rebuilds via its builder chain on
/// next access.
pub struct PurgeableObject {
    data: *mut u8,
    requested_size: usize,
    mapped_size: usize,
    uxpt: UxptTable,
    lock: RwLock<Inner>,
}

// `data` is an exclusively-owned mapping; all access to the bytes it points to is mediated by
// `lock`, and `uxpt` is itself `Send + Sync`. Safe to share across threads.
unsafe impl Send for PurgeableObject {}
unsafe impl Sync for PurgeableObject {}

impl PurgeableObject {
    /// Creates a new purgeable object of `len` bytes, materializing its initial content by
    /// running `step` once against a zeroed buffer.
    ///
    /// Fails with [`PurgeError::InvalidSize`] if `len == 0`, or with a mapping error if the data
    /// region or its UXPT table could not be set up.
    pub fn create(len: usize, mut step: Step) -> Result<PurgeableObject, PurgeError> {
        if len == 0 {
            return Err(PurgeError::InvalidSize);
        }

        let mapped_size = platform::round_up_page(len);
        let data = map_data(mapped_size)?;

        let uxpt = match UxptTable::init(data as usize, len) {
            Ok(uxpt) => uxpt,
            Err(e) => {
                unmap_data(data, mapped_size);
                return Err(e);
            }
        };

        // Run the initial step directly against the (already-zero, freshly mapped) buffer; this
        // is the object's first-ever build. See DESIGN.md for why `build_count` starts at 1
        // rather than 0 here, even though construction conceptually "zeroes build_count" first.
        let buf = unsafe { slice::from_raw_parts_mut(data, len) };
        if !step(buf) {
            let mut uxpt = uxpt;
            let _ = uxpt.deinit();
            unmap_data(data, mapped_size);
            return Err(PurgeError::BuildFailed);
        }

        Ok(PurgeableObject {
            data,
            requested_size: len,
            mapped_size,
            uxpt,
            lock: RwLock::new(Inner {
                chain: BuilderChain::new(step),
                build_count: 1,
            }),
        })
    }

    /// Releases the data mapping, the UXPT window, and the builder chain, in that order.
    ///
    /// Consuming `self` replaces the source's "destroy(None) is a no-op" special case: there is
    /// no way to call `destroy` on a value that doesn't exist. If `self` is simply dropped
    /// instead of calling this explicitly, the same sequence still runs (logged, errors
    /// discarded) via `Drop`.
    pub fn destroy(mut self) -> Result<(), PurgeError> {
        let result = self.teardown();
        // `teardown` only releases the kernel handles (`data`, `uxpt`); `lock` (and the builder
        // chain/closures it owns) still needs its destructor to run, or every `Step` ever
        // appended leaks. Drop it explicitly, then forget the rest of `self` so the `Drop` impl
        // doesn't run too and tear down the already-torn-down kernel handles a second time.
        unsafe {
            std::ptr::drop_in_place(&mut self.lock);
        }
        std::mem::forget(self);
        result
    }

    fn teardown(&mut self) -> Result<(), PurgeError> {
        let mut errors = Vec::new();

        let data_unmapped = unmap_data(self.data, self.mapped_size);
        if !data_unmapped {
            errors.push(crate::error::last_os_error!(UnmapData));
        }

        // Defensive post-check, while the UXPT window is still mapped: once the data mapping is
        // gone, the kernel guarantees UXPT presence is cleared. Checked before `deinit`, which
        // would otherwise unmap the very table we're reading.
        if data_unmapped
            && platform::uxpt_supported()
            && self.uxpt.is_present(self.data as usize, self.requested_size)
        {
            log::warn!("purgemem: UXPT still reports pages present after unmapping data region");
        }

        if let Err(e) = self.uxpt.deinit() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            for e in &errors {
                log::error!("purgemem: destroy step failed: {}", e);
            }
            Err(PurgeError::Destroy(errors))
        }
    }

    /// Begins a read access window. Blocks until content is present and built, rebuilding via
    /// the builder chain if the object was purged (or never built).
    ///
    /// See SPEC_FULL.md §4.D: this is a retry loop, not a single lock acquisition, because the
    /// rebuild path releases the read lock before taking the write lock.
    pub fn begin_read(&self) -> Result<ReadGuard<'_>, PurgeError> {
        self.uxpt.get(self.data as usize, self.requested_size)?;

        loop {
            {
                let guard = self.lock.read();
                if self.is_settled(&guard) {
                    return Ok(ReadGuard { object: self, guard });
                }
            }

            if let Err(e) = self.rebuild_under_write_lock() {
                let _ = self.uxpt.put(self.data as usize, self.requested_size);
                return Err(e);
            }
            // Build succeeded (by us or by a racing thread): loop back and take the fast path.
        }
    }

    /// Begins a write access window, rebuilding first if the object was purged.
    pub fn begin_write(&self) -> Result<WriteGuard<'_>, PurgeError> {
        self.uxpt.get(self.data as usize, self.requested_size)?;

        let mut guard = self.lock.write();
        if !self.is_settled(&guard) {
            if !self.run_build(&mut guard) {
                drop(guard);
                let _ = self.uxpt.put(self.data as usize, self.requested_size);
                return Err(PurgeError::BuildFailed);
            }
        }
        Ok(WriteGuard { object: self, guard })
    }

    /// Applies `step` once to the live buffer, then appends it to the builder chain so future
    /// rebuilds reproduce the edit. On failure, the chain is left unmodified.
    ///
    /// Takes the object's write lock for the duration, resolving the source's open question
    /// about concurrent safety conservatively: concurrent readers may finish their current
    /// access window, but new `begin_write`/`append_modify` calls block until this one
    /// completes.
    pub fn append_modify(&self, mut step: Step) -> Result<(), PurgeError> {
        let mut guard = self.lock.write();
        let buf = unsafe { slice::from_raw_parts_mut(self.data, self.requested_size) };
        if !step(buf) {
            return Err(PurgeError::BuildFailed);
        }
        guard.chain.append(step);
        Ok(())
    }

    /// The number of successful (re)builds so far. Zero means content has never materialized;
    /// this can only happen transiently during `create`, since `create` always performs the
    /// first build itself.
    pub fn build_count(&self) -> u64 {
        self.lock.read().build_count
    }

    /// The caller-visible content size in bytes (always `<=` the page-rounded mapping size).
    pub fn content_size(&self) -> usize {
        self.requested_size
    }

    /// Test-only hook (SPEC_FULL.md §8, scenarios S2/S3): zero the buffer and clear UXPT
    /// presence, simulating a kernel reclaim without an access window held.
    #[cfg(test)]
    pub(crate) fn simulate_purge(&self) {
        let guard = self.lock.write();
        unsafe {
            ptr::write_bytes(self.data, 0, self.requested_size);
        }
        self.uxpt.simulate_purge();
        drop(guard);
    }

    fn is_settled(&self, guard: &Inner) -> bool {
        guard.build_count > 0 && self.uxpt.is_present(self.data as usize, self.requested_size)
    }

    fn rebuild_under_write_lock(&self) -> Result<(), PurgeError> {
        let mut guard = self.lock.write();
        if self.is_settled(&guard) {
            // A racing thread already rebuilt; the caller's loop will take the fast path.
            return Ok(());
        }
        if self.run_build(&mut guard) {
            Ok(())
        } else {
            Err(PurgeError::BuildFailed)
        }
    }

    fn run_build(&self, guard: &mut Inner) -> bool {
        unsafe {
            ptr::write_bytes(self.data, 0, self.requested_size);
        }
        let buf = unsafe { slice::from_raw_parts_mut(self.data, self.requested_size) };
        if guard.chain.build_all(buf) {
            guard.build_count += 1;
            true
        } else {
            false
        }
    }
}

impl Drop for PurgeableObject {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("purgemem: error tearing down purgeable object on drop: {}", e);
        }
    }
}

/// An open read access window. Dropping the guard releases the read lock and puts back the UXPT
/// refcount pinned by `begin_read` — the Rust rendition of `end_read`, expressed as `Drop` so it
/// cannot be forgotten or mismatched with a write access.
pub struct ReadGuard<'a> {
    object: &'a PurgeableObject,
    // Held for its lifetime, never read directly: its presence is what keeps concurrent writers
    // out for the duration of the access window.
    #[allow(dead_code)]
    guard: RwLockReadGuard<'a, Inner>,
}

impl<'a> ReadGuard<'a> {
    /// The object's content for the duration of this access window.
    pub fn content(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.object.data, self.object.requested_size) }
    }
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.object.uxpt.put(self.object.data as usize, self.object.requested_size) {
            log::error!("purgemem: failed to release UXPT refcount on end_read: {}", e);
        }
    }
}

/// An open write access window. Dropping the guard releases the write lock and puts back the
/// UXPT refcount pinned by `begin_write` — the Rust rendition of `end_write`.
pub struct WriteGuard<'a> {
    object: &'a PurgeableObject,
    #[allow(dead_code)]
    guard: RwLockWriteGuard<'a, Inner>,
}

impl<'a> WriteGuard<'a> {
    /// The object's content for the duration of this access window.
    pub fn content(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.object.data, self.object.requested_size) }
    }

    /// Mutable access to the object's content for the duration of this access window.
    pub fn content_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.object.data, self.object.requested_size) }
    }
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.object.uxpt.put(self.object.data as usize, self.object.requested_size) {
            log::error!("purgemem: failed to release UXPT refcount on end_write: {}", e);
        }
    }
}

fn map_data(mapped_size: usize) -> Result<*mut u8, PurgeError> {
    #[cfg(unix)]
    {
        let flags = if platform::uxpt_supported() {
            libc::MAP_ANONYMOUS | platform::MAP_PURGEABLE
        } else {
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE
        };

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(crate::error::last_os_error!(MmapData));
        }
        Ok(ptr as *mut u8)
    }
    #[cfg(not(unix))]
    {
        let _ = mapped_size;
        unreachable!("purgemem requires a unix-like target")
    }
}

fn unmap_data(data: *mut u8, mapped_size: usize) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::munmap(data as *mut libc::c_void, mapped_size) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = (data, mapped_size);
        unreachable!("purgemem requires a unix-like target")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fill_with(byte: u8) -> Step {
        Box::new(move |buf: &mut [u8]| {
            buf.fill(byte);
            true
        })
    }

    #[test]
    fn s1_create_read_destroy() {
        let obj = PurgeableObject::create(4096, fill_with(0xAB)).expect("create");
        let guard = obj.begin_read().expect("begin_read");
        assert_eq!(guard.content()[0], 0xAB);
        assert_eq!(guard.content()[4095], 0xAB);
        drop(guard);
        assert!(obj.destroy().is_ok());
    }

    #[test]
    fn destroy_drops_the_builder_chain() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let initial_dropped = Arc::new(AtomicBool::new(false));
        let appended_dropped = Arc::new(AtomicBool::new(false));
        let initial_flag = DropFlag(initial_dropped.clone());
        let appended_flag = DropFlag(appended_dropped.clone());

        let obj = PurgeableObject::create(
            4096,
            Box::new(move |buf: &mut [u8]| {
                let _keep_alive = &initial_flag;
                buf.fill(0xAB);
                true
            }),
        )
        .expect("create");
        obj.append_modify(Box::new(move |_buf: &mut [u8]| {
            let _keep_alive = &appended_flag;
            true
        }))
        .expect("append_modify");

        assert!(!initial_dropped.load(Ordering::SeqCst));
        assert!(!appended_dropped.load(Ordering::SeqCst));

        assert!(obj.destroy().is_ok());

        assert!(initial_dropped.load(Ordering::SeqCst));
        assert!(appended_dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn s2_purge_then_rebuild() {
        let obj = PurgeableObject::create(8192, fill_with(0xAB)).expect("create");
        obj.simulate_purge();
        let guard = obj.begin_read().expect("begin_read after purge");
        assert!(guard.content().iter().all(|&b| b == 0xAB));
        assert_eq!(obj.build_count(), 2);
    }

    #[test]
    fn s3_append_modify_survives_purge() {
        let obj = PurgeableObject::create(4096, fill_with(0xAB)).expect("create");
        obj.append_modify(Box::new(|buf: &mut [u8]| {
            buf[10] = 0xCD;
            true
        }))
        .expect("append_modify");

        {
            let guard = obj.begin_read().expect("begin_read");
            assert_eq!(guard.content()[10], 0xCD);
            assert_eq!(guard.content()[0], 0xAB);
        }

        obj.simulate_purge();
        let guard = obj.begin_read().expect("begin_read after purge");
        assert_eq!(guard.content()[10], 0xCD);
    }

    #[test]
    fn s5_zero_length_rejected() {
        assert!(matches!(
            PurgeableObject::create(0, fill_with(0xAB)),
            Err(PurgeError::InvalidSize)
        ));
    }

    #[test]
    fn s6_build_failure_then_success() {
        let attempt = Arc::new(AtomicUsize::new(0));
        let attempt_clone = attempt.clone();
        let obj = PurgeableObject::create(
            4096,
            Box::new(move |buf: &mut [u8]| {
                let n = attempt_clone.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    true // the initial build during create must succeed
                } else {
                    buf.fill(0xEE);
                    n != 1 // fail exactly once: the first post-purge rebuild
                }
            }),
        )
        .expect("create");

        obj.simulate_purge();
        assert!(obj.begin_read().is_err());

        obj.simulate_purge();
        let guard = obj.begin_read().expect("second rebuild should succeed");
        assert!(guard.content().iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn begin_write_non_purged_path_holds_lock_without_double_put() {
        let obj = PurgeableObject::create(4096, fill_with(0xAB)).expect("create");
        {
            let mut guard = obj.begin_write().expect("begin_write");
            guard.content_mut()[0] = 0x01;
        }
        let guard = obj.begin_read().expect("begin_read");
        assert_eq!(guard.content()[0], 0x01);
    }

    #[test]
    fn refcount_conservation_across_balanced_access() {
        let obj = PurgeableObject::create(4096, fill_with(0xAB)).expect("create");
        for _ in 0..8 {
            let g = obj.begin_read().unwrap();
            drop(g);
        }
        for _ in 0..8 {
            let mut g = obj.begin_write().unwrap();
            g.content_mut()[0] = 0x02;
            drop(g);
        }
        // No direct refcount introspection in fallback mode, but a fresh access window must
        // still succeed cleanly, which would deadlock/err if gets and puts had drifted.
        let g = obj.begin_read().unwrap();
        assert_eq!(g.content()[0], 0x02);
    }

    #[test]
    fn concurrent_readers_with_periodic_purges() {
        let obj = Arc::new(PurgeableObject::create(16 * 1024, fill_with(0xAB)).expect("create"));
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let obj = obj.clone();
            let stop = stop.clone();
            handles.push(std::thread::spawn(move || {
                let mut iterations = 0;
                while !stop.load(Ordering::Relaxed) && iterations < 200 {
                    let guard = obj.begin_read().expect("begin_read");
                    assert!(guard.content().iter().all(|&b| b == 0xAB));
                    drop(guard);
                    iterations += 1;
                }
            }));
        }

        for i in 0..20 {
            if i % 2 == 0 {
                obj.simulate_purge();
            }
            std::thread::yield_now();
        }
        stop.store(true, Ordering::Relaxed);

        for h in handles {
            h.join().unwrap();
        }
        assert!(obj.build_count() >= 1);
    }
}
