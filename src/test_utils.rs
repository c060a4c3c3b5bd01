//! Mock hardware-abstraction layer for unit tests.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::{Hal, HostPhysAddr, HostVirtAddr};

#[repr(align(4096))]
struct MockPage(#[allow(dead_code)] [u8; 4096]);

/// A counting page allocator with identity phys-to-virt mapping and
/// injectable allocation failure.
#[derive(Debug)]
pub struct MockHal;

static ALLOCS: AtomicUsize = AtomicUsize::new(0);
static DEALLOCS: AtomicUsize = AtomicUsize::new(0);
static IRQ_SAVES: AtomicUsize = AtomicUsize::new(0);
static IRQ_RESTORES: AtomicUsize = AtomicUsize::new(0);
static FAIL_AFTER: AtomicUsize = AtomicUsize::new(usize::MAX);

static SERIAL: Mutex<()> = Mutex::new(());

/// Serialize tests that assert on the shared counters.
pub fn serialize() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockHal {
    /// Reset all counters and disable failure injection.
    pub fn reset() {
        ALLOCS.store(0, Ordering::SeqCst);
        DEALLOCS.store(0, Ordering::SeqCst);
        IRQ_SAVES.store(0, Ordering::SeqCst);
        IRQ_RESTORES.store(0, Ordering::SeqCst);
        FAIL_AFTER.store(usize::MAX, Ordering::SeqCst);
    }

    /// Make every allocation after the first `n` fail.
    pub fn fail_after(n: usize) {
        FAIL_AFTER.store(n, Ordering::SeqCst);
    }

    pub fn alloc_count() -> usize {
        ALLOCS.load(Ordering::SeqCst)
    }

    pub fn dealloc_count() -> usize {
        DEALLOCS.load(Ordering::SeqCst)
    }

    pub fn irq_save_count() -> usize {
        IRQ_SAVES.load(Ordering::SeqCst)
    }

    pub fn irq_restore_count() -> usize {
        IRQ_RESTORES.load(Ordering::SeqCst)
    }
}

impl Hal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        if ALLOCS.load(Ordering::SeqCst) >= FAIL_AFTER.load(Ordering::SeqCst) {
            return None;
        }
        ALLOCS.fetch_add(1, Ordering::SeqCst);
        // deliberately dirty so zero-filling is observable
        let page = Box::new(MockPage([0xa5; 4096]));
        Some(Box::into_raw(page) as usize)
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        DEALLOCS.fetch_add(1, Ordering::SeqCst);
        unsafe { drop(Box::from_raw(paddr as *mut MockPage)) }
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        paddr
    }

    fn irq_save() -> u64 {
        IRQ_SAVES.fetch_add(1, Ordering::SeqCst);
        0x200
    }

    fn irq_restore(_flags: u64) {
        IRQ_RESTORES.fetch_add(1, Ordering::SeqCst);
    }
}
