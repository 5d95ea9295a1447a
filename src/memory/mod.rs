//! Kernel heap: a fixed 512 KiB arena managed by a block bitmap.
//!
//! Every dynamic allocation in the kernel (PCBs, stacks, argv copies, queue
//! nodes, semaphores, pipes) comes out of this arena: the `alloc` crate is
//! wired to it through the `GlobalAlloc` shim below, and the `malloc`/`free`
//! syscalls hand blocks from the same pool to userland.

pub mod bitmap;

pub use bitmap::BitmapAllocator;

use spin::Mutex;

static HEAP: Mutex<BitmapAllocator> = Mutex::new(BitmapAllocator::new());

/// Prepare the heap metadata. Idempotent; must run before any allocation.
pub fn init() {
    crate::arch::without_interrupts(|| HEAP.lock().init());
}

/// Fallible raw allocation, exposed to userland through `sys_malloc`.
pub fn kmalloc(size: usize) -> *mut u8 {
    crate::arch::without_interrupts(|| HEAP.lock().alloc(size))
}

/// Release `ptr` if and only if it is the head of a live allocation.
/// Returns whether anything was freed.
pub fn kfree(ptr: *mut u8) -> bool {
    crate::arch::without_interrupts(|| HEAP.lock().free(ptr))
}

/// The exact predicate `sys_free` uses before releasing a user pointer.
pub fn is_valid_heap_ptr(ptr: *const u8) -> bool {
    crate::arch::without_interrupts(|| HEAP.lock().is_valid_heap_ptr(ptr))
}

/// Heap usage in bytes: (total, used, available).
pub fn memstats() -> (usize, usize, usize) {
    crate::arch::without_interrupts(|| HEAP.lock().stats())
}

/// Routes `alloc::*` types (Box, Vec, String) into the kernel arena.
#[cfg(not(test))]
struct KernelHeap;

#[cfg(not(test))]
unsafe impl core::alloc::GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > bitmap::BLOCK_SIZE {
            return core::ptr::null_mut();
        }
        crate::arch::without_interrupts(|| HEAP.lock().alloc(layout.size()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        crate::arch::without_interrupts(|| {
            HEAP.lock().free(ptr);
        });
    }
}

#[cfg(not(test))]
#[global_allocator]
static GLOBAL_HEAP: KernelHeap = KernelHeap;
