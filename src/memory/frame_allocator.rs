use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use super::layout::PAGE_SIZE;

/// Most frames the allocator will ever track (one bit each).
const MAX_FRAMES: usize = 1024;

/// Bitmap allocator for the physical frames backing user pages.
/// Frames come back on `exit` and on fork rollback, so unlike a bump
/// allocator it must support freeing in any order.
pub struct BitmapFrameAllocator {
    used: [u64; MAX_FRAMES / 64],
    /// Frame number of bit 0.
    base: u64,
    /// Frames actually managed; at most `MAX_FRAMES`.
    frames: usize,
    allocated: usize,
}

impl BitmapFrameAllocator {
    pub const fn new() -> Self {
        BitmapFrameAllocator {
            used: [0; MAX_FRAMES / 64],
            base: 0,
            frames: 0,
            allocated: 0,
        }
    }

    /// Hand the allocator a physical window.
    ///
    /// # Safety
    /// The range must be real, unused RAM; every frame in it becomes
    /// eligible to back user pages.
    pub unsafe fn init(&mut self, start: PhysAddr, end: PhysAddr) {
        let first = PhysFrame::<Size4KiB>::containing_address(start);
        self.base = first.start_address().as_u64() / PAGE_SIZE as u64;
        let span = (end.as_u64().saturating_sub(first.start_address().as_u64())) as usize / PAGE_SIZE;
        self.frames = span.min(MAX_FRAMES);
        self.used = [0; MAX_FRAMES / 64];
        self.allocated = 0;
    }

    /// Frames still available.
    pub fn free_frames(&self) -> usize {
        self.frames - self.allocated
    }

    fn bit(&self, frame: PhysFrame) -> Option<usize> {
        let number = frame.start_address().as_u64() / PAGE_SIZE as u64;
        let idx = number.checked_sub(self.base)? as usize;
        (idx < self.frames).then_some(idx)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        for idx in 0..self.frames {
            let (word, mask) = (idx / 64, 1u64 << (idx % 64));
            if self.used[word] & mask == 0 {
                self.used[word] |= mask;
                self.allocated += 1;
                let addr = (self.base + idx as u64) * PAGE_SIZE as u64;
                return Some(PhysFrame::containing_address(PhysAddr::new(addr)));
            }
        }
        None
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        let idx = self
            .bit(frame)
            .expect("freed frame is outside the managed window");
        let (word, mask) = (idx / 64, 1u64 << (idx % 64));
        debug_assert!(self.used[word] & mask != 0, "double free of a frame");
        self.used[word] &= !mask;
        self.allocated -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(frames: usize) -> BitmapFrameAllocator {
        let mut alloc = BitmapFrameAllocator::new();
        let start = 0x40_0000u64;
        let end = start + (frames * PAGE_SIZE) as u64;
        unsafe { alloc.init(PhysAddr::new(start), PhysAddr::new(end)) };
        alloc
    }

    #[test]
    fn allocates_distinct_frames_until_exhausted() {
        let mut alloc = allocator(3);
        let a = alloc.allocate_frame().unwrap();
        let b = alloc.allocate_frame().unwrap();
        let c = alloc.allocate_frame().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(alloc.allocate_frame().is_none());
        assert_eq!(alloc.free_frames(), 0);
    }

    #[test]
    fn freed_frames_become_available_again() {
        let mut alloc = allocator(2);
        let a = alloc.allocate_frame().unwrap();
        let _b = alloc.allocate_frame().unwrap();
        unsafe { alloc.deallocate_frame(a) };
        assert_eq!(alloc.free_frames(), 1);
        assert_eq!(alloc.allocate_frame(), Some(a));
    }

    #[test]
    fn window_is_capped_at_the_bitmap_size() {
        let alloc = allocator(MAX_FRAMES * 2);
        assert_eq!(alloc.free_frames(), MAX_FRAMES);
    }
}
