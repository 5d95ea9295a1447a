//! First-fit bitmap allocator over a static arena.
//!
//! One bit per 64-byte block marks occupancy. A parallel `allocation_map`
//! records, at the first block of each allocation, how many blocks it spans;
//! continuation blocks hold a sentinel so a pointer into the middle of an
//! allocation can never be freed.

use bit_field::BitField;

pub const HEAP_SIZE: usize = 4096 * 128; // 512 KiB
pub const BLOCK_SIZE: usize = 64;
pub const NUM_BLOCKS: usize = HEAP_SIZE / BLOCK_SIZE;
const BITMAP_BYTES: usize = NUM_BLOCKS / 8;
const CONTINUATION: u16 = 0xFFFF;

#[repr(align(64))]
struct Arena([u8; HEAP_SIZE]);

pub struct BitmapAllocator {
    bitmap: [u8; BITMAP_BYTES],
    allocation_map: [u16; NUM_BLOCKS],
    arena: Arena,
    blocks_used: usize,
    initialized: bool,
}

impl BitmapAllocator {
    pub const fn new() -> Self {
        BitmapAllocator {
            bitmap: [0; BITMAP_BYTES],
            allocation_map: [0; NUM_BLOCKS],
            arena: Arena([0; HEAP_SIZE]),
            blocks_used: 0,
            initialized: false,
        }
    }

    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.bitmap = [0; BITMAP_BYTES];
        self.allocation_map = [0; NUM_BLOCKS];
        self.blocks_used = 0;
        self.initialized = true;
    }

    fn block_in_use(&self, block: usize) -> bool {
        self.bitmap[block / 8].get_bit(block % 8)
    }

    fn set_block(&mut self, block: usize, used: bool) {
        self.bitmap[block / 8].set_bit(block % 8, used);
    }

    fn block_ptr(&mut self, block: usize) -> *mut u8 {
        unsafe { self.arena.0.as_mut_ptr().add(block * BLOCK_SIZE) }
    }

    /// First-fit scan for a contiguous run of free blocks.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if !self.initialized || size == 0 {
            return core::ptr::null_mut();
        }

        let blocks_needed = (size + BLOCK_SIZE - 1) / BLOCK_SIZE;
        if blocks_needed > NUM_BLOCKS {
            return core::ptr::null_mut();
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for block in 0..NUM_BLOCKS {
            if self.block_in_use(block) {
                run_start = block + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == blocks_needed {
                for b in run_start..run_start + blocks_needed {
                    self.set_block(b, true);
                    self.allocation_map[b] = CONTINUATION;
                }
                self.allocation_map[run_start] = blocks_needed as u16;
                self.blocks_used += blocks_needed;
                return self.block_ptr(run_start);
            }
        }

        core::ptr::null_mut()
    }

    /// True iff `ptr` is the head block of a live allocation.
    pub fn is_valid_heap_ptr(&self, ptr: *const u8) -> bool {
        let base = self.arena.0.as_ptr() as usize;
        let addr = ptr as usize;

        if addr < base || addr >= base + HEAP_SIZE {
            return false;
        }
        let offset = addr - base;
        if offset % BLOCK_SIZE != 0 {
            return false;
        }

        let block = offset / BLOCK_SIZE;
        if !self.block_in_use(block) {
            return false;
        }
        self.allocation_map[block] != CONTINUATION && self.allocation_map[block] != 0
    }

    /// Release the allocation headed at `ptr`. Invalid pointers (null, out of
    /// range, unaligned, continuation blocks) are ignored so corrupted input
    /// can never damage the metadata. Returns whether blocks were released.
    pub fn free(&mut self, ptr: *mut u8) -> bool {
        if ptr.is_null() || !self.is_valid_heap_ptr(ptr) {
            return false;
        }

        let base = self.arena.0.as_ptr() as usize;
        let block = (ptr as usize - base) / BLOCK_SIZE;
        let blocks = self.allocation_map[block] as usize;

        for b in block..block + blocks {
            self.set_block(b, false);
            self.allocation_map[b] = 0;
        }
        self.blocks_used -= blocks;
        true
    }

    /// (total, used, available) in bytes.
    pub fn stats(&self) -> (usize, usize, usize) {
        let used = self.blocks_used * BLOCK_SIZE;
        (HEAP_SIZE, used, HEAP_SIZE - used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn fresh() -> Box<BitmapAllocator> {
        let mut mm = Box::new(BitmapAllocator::new());
        mm.init();
        mm
    }

    #[test]
    fn alloc_returns_block_aligned_pointer() {
        let mut mm = fresh();
        let p = mm.alloc(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % BLOCK_SIZE, 0);
    }

    #[test]
    fn alloc_zero_fails() {
        let mut mm = fresh();
        assert!(mm.alloc(0).is_null());
    }

    #[test]
    fn stats_track_block_granularity() {
        let mut mm = fresh();
        let (total, used, available) = mm.stats();
        assert_eq!(total, HEAP_SIZE);
        assert_eq!(used, 0);
        assert_eq!(available, HEAP_SIZE);

        let p = mm.alloc(100); // rounds up to 2 blocks
        let (_, used, _) = mm.stats();
        assert_eq!(used, 2 * BLOCK_SIZE);

        assert!(mm.free(p));
        let (_, used, _) = mm.stats();
        assert_eq!(used, 0);
    }

    #[test]
    fn first_fit_reuses_freed_hole() {
        let mut mm = fresh();
        let a = mm.alloc(64);
        let b = mm.alloc(64);
        let _c = mm.alloc(64);
        assert!(!a.is_null() && !b.is_null());

        assert!(mm.free(b));
        let d = mm.alloc(64);
        assert_eq!(d, b);
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut mm = fresh();
        assert!(mm.alloc(HEAP_SIZE + 1).is_null());
        let p = mm.alloc(HEAP_SIZE);
        assert!(!p.is_null());
        assert!(mm.alloc(1).is_null());
    }

    #[test]
    fn free_of_invalid_pointers_is_a_no_op() {
        let mut mm = fresh();
        let p = mm.alloc(256); // 4 blocks
        let (_, used_before, _) = mm.stats();

        // Null, out-of-range, unaligned and continuation pointers.
        assert!(!mm.free(core::ptr::null_mut()));
        assert!(!mm.free(0x1000 as *mut u8));
        assert!(!mm.free(unsafe { p.add(1) }));
        assert!(!mm.free(unsafe { p.add(BLOCK_SIZE) }));

        let (_, used_after, _) = mm.stats();
        assert_eq!(used_before, used_after);
        assert!(mm.is_valid_heap_ptr(p));
    }

    #[test]
    fn double_free_is_a_no_op() {
        let mut mm = fresh();
        let p = mm.alloc(64);
        assert!(mm.free(p));
        assert!(!mm.free(p));
        let (_, used, _) = mm.stats();
        assert_eq!(used, 0);
    }

    #[test]
    fn is_valid_heap_ptr_matches_allocation_heads() {
        let mut mm = fresh();
        let p = mm.alloc(200);
        assert!(mm.is_valid_heap_ptr(p));
        assert!(!mm.is_valid_heap_ptr(unsafe { p.add(BLOCK_SIZE) }));
        mm.free(p);
        assert!(!mm.is_valid_heap_ptr(p));
    }

    #[test]
    fn init_is_idempotent() {
        let mut mm = fresh();
        let p = mm.alloc(64);
        mm.init();
        assert!(mm.is_valid_heap_ptr(p));
    }
}
