use spin::Mutex;
use x86_64::structures::paging::{
    FrameAllocator, FrameDeallocator, PageTable, PageTableFlags, PhysFrame,
};
use x86_64::PhysAddr;

use super::frame_allocator::BitmapFrameAllocator;
use super::layout::{
    INIT_IMAGE_PHYS, NUM_PAG_CODE, NUM_PAG_DATA, NUM_PAG_KERNEL, PAGE_SIZE, PAG_LOG_ALIAS,
    PAG_LOG_INIT_CODE, PAG_LOG_INIT_DATA,
};
use crate::scheduler::task::NR_TASKS;

/// The frame allocator ran dry while building an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfFrames;

/// One process's translation tree: the root directory CR3 points at, the
/// two fixed intermediate tables, and the leaf table that maps the user
/// window. Kernel statics are identity-mapped, so a table's own address is
/// the physical address its parent entry stores.
#[repr(C)]
pub struct AddressSpace {
    root: PageTable,
    l3: PageTable,
    l2: PageTable,
    user_pt: PageTable,
}

impl AddressSpace {
    const fn new() -> Self {
        AddressSpace {
            root: PageTable::new(),
            l3: PageTable::new(),
            l2: PageTable::new(),
            user_pt: PageTable::new(),
        }
    }
}

/// Statically pooled address spaces, one per task slot, plus the single
/// kernel-window table every directory shares. A slot's directory is free
/// exactly when the slot is; `allocate_dir` rebuilds it from scratch.
pub struct UserSpaces {
    spaces: [AddressSpace; NR_TASKS],
    kernel_pt: PageTable,
}

pub static USER_SPACES: Mutex<UserSpaces> = Mutex::new(UserSpaces::new());

fn table_phys(table: &PageTable) -> u64 {
    table as *const PageTable as u64
}

fn kernel_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE
}

fn user_code_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE
}

fn user_data_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
}

/// Point a user-window page at a physical frame.
pub fn map_user_page(pt: &mut PageTable, page: usize, frame: PhysFrame, flags: PageTableFlags) {
    pt[index(page)].set_addr(frame.start_address(), flags);
}

/// Drop a user-window translation.
pub fn unmap_user_page(pt: &mut PageTable, page: usize) {
    pt[index(page)].set_unused();
}

/// Frame a user-window page currently translates to, if any.
pub fn mapped_frame(pt: &PageTable, page: usize) -> Option<PhysFrame> {
    let entry = &pt[index(page)];
    if entry.is_unused() {
        None
    } else {
        Some(PhysFrame::containing_address(entry.addr()))
    }
}

/// Flags of a user-window translation, if one is present. The checked user
/// copies consult this to tell an absent or read-only page apart from a
/// merely range-valid address.
pub fn user_page_flags(pt: &PageTable, page: usize) -> Option<PageTableFlags> {
    let entry = &pt[index(page)];
    if entry.is_unused() {
        None
    } else {
        Some(entry.flags())
    }
}

fn index(page: usize) -> usize {
    debug_assert!(
        (NUM_PAG_KERNEL..NUM_PAG_KERNEL + 512).contains(&page),
        "page {page} is outside the user window"
    );
    page - NUM_PAG_KERNEL
}

impl UserSpaces {
    pub const fn new() -> Self {
        const SPACE: AddressSpace = AddressSpace::new();
        UserSpaces { spaces: [SPACE; NR_TASKS], kernel_pt: PageTable::new() }
    }

    /// Identity-map the kernel window once at boot; every directory built
    /// afterwards hangs this table off its kernel slot.
    pub fn init_kernel_window(&mut self) {
        for page in 0..NUM_PAG_KERNEL {
            let addr = PhysAddr::new((page * PAGE_SIZE) as u64);
            self.kernel_pt[page].set_addr(addr, kernel_flags());
        }
    }

    /// CR3 value for a slot's directory.
    pub fn dir_phys(&self, slot: usize) -> u64 {
        table_phys(&self.spaces[slot].root)
    }

    /// The leaf table mapping a slot's user window; the kernel mapping
    /// convention puts the whole window under one table.
    pub fn user_table(&self, slot: usize) -> &PageTable {
        &self.spaces[slot].user_pt
    }

    pub fn user_table_mut(&mut self, slot: usize) -> &mut PageTable {
        &mut self.spaces[slot].user_pt
    }

    /// Rebuild a slot's directory: wire root → l3 → l2, hang the shared
    /// kernel table and this slot's user leaf off l2, and clear every user
    /// translation. Returns the new CR3 value.
    pub fn allocate_dir(&mut self, slot: usize) -> u64 {
        let kernel_pt_phys = table_phys(&self.kernel_pt);
        let space = &mut self.spaces[slot];
        let l3_phys = table_phys(&space.l3);
        let l2_phys = table_phys(&space.l2);
        let user_pt_phys = table_phys(&space.user_pt);

        space.root.zero();
        space.l3.zero();
        space.l2.zero();
        space.user_pt.zero();

        // Intermediate entries carry the user flag; the leaf entries decide
        // what ring 3 may actually touch.
        space.root[0].set_addr(PhysAddr::new(l3_phys), user_data_flags());
        space.l3[0].set_addr(PhysAddr::new(l2_phys), user_data_flags());
        space.l2[0].set_addr(PhysAddr::new(kernel_pt_phys), kernel_flags());
        space.l2[1].set_addr(PhysAddr::new(user_pt_phys), user_data_flags());

        table_phys(&space.root)
    }

    /// Map the init task's program: code pages straight onto the image the
    /// bootloader left at `INIT_IMAGE_PHYS`, data pages onto fresh frames
    /// seeded from the image's data template.
    pub fn init_user_program(
        &mut self,
        slot: usize,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<(), OutOfFrames> {
        for i in 0..NUM_PAG_CODE {
            let image = PhysAddr::new(INIT_IMAGE_PHYS + (i * PAGE_SIZE) as u64);
            let frame = PhysFrame::containing_address(image);
            map_user_page(self.user_table_mut(slot), PAG_LOG_INIT_CODE + i, frame, user_code_flags());
        }
        for i in 0..NUM_PAG_DATA {
            let frame = frames.allocate_frame().ok_or(OutOfFrames)?;
            let template = INIT_IMAGE_PHYS + ((NUM_PAG_CODE + i) * PAGE_SIZE) as u64;
            unsafe { copy_frame(template, frame.start_address().as_u64()) };
            map_user_page(self.user_table_mut(slot), PAG_LOG_INIT_DATA + i, frame, user_data_flags());
        }
        Ok(())
    }

    /// Duplicate the parent's user window into the child for fork.
    ///
    /// Code pages are shared: the child's entries reuse the parent's frames.
    /// Data pages are private: every child frame is reserved up front (on
    /// exhaustion the reserved prefix goes straight back and nothing was
    /// mapped), then aliased into the parent one data-region stride above
    /// its data window so the parent can copy each page through its own
    /// address space. The aliases are dropped again and the stale
    /// translations die with the TLB flush.
    pub fn clone_user(
        &mut self,
        parent: usize,
        child: usize,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<(), OutOfFrames> {
        let mut reserved = [None::<PhysFrame>; NUM_PAG_DATA];
        for slot in reserved.iter_mut() {
            match frames.allocate_frame() {
                Some(frame) => *slot = Some(frame),
                None => {
                    for frame in reserved.iter().flatten() {
                        unsafe { frames.deallocate_frame(*frame) };
                    }
                    return Err(OutOfFrames);
                }
            }
        }

        let (parent_space, child_space) = self.pair_mut(parent, child);
        for page in PAG_LOG_INIT_CODE..PAG_LOG_INIT_DATA {
            if let Some(frame) = mapped_frame(&parent_space.user_pt, page) {
                map_user_page(&mut child_space.user_pt, page, frame, user_code_flags());
            }
        }
        for (i, frame) in reserved.iter().flatten().enumerate() {
            let page = PAG_LOG_INIT_DATA + i;
            let alias = PAG_LOG_ALIAS + i;
            map_user_page(&mut child_space.user_pt, page, *frame, user_data_flags());
            map_user_page(&mut parent_space.user_pt, alias, *frame, user_data_flags());
            unsafe { copy_page(page, alias) };
            unmap_user_page(&mut parent_space.user_pt, alias);
        }
        flush_tlb();
        Ok(())
    }

    /// Return a dead process's data frames to the allocator and clear its
    /// user window. Code frames are shared with the image or with siblings
    /// and are only unmapped.
    pub fn free_user_pages(&mut self, slot: usize, frames: &mut BitmapFrameAllocator) {
        let pt = &mut self.spaces[slot].user_pt;
        for i in 0..NUM_PAG_DATA {
            let page = PAG_LOG_INIT_DATA + i;
            if let Some(frame) = mapped_frame(pt, page) {
                unsafe { frames.deallocate_frame(frame) };
                unmap_user_page(pt, page);
            }
        }
        for i in 0..NUM_PAG_CODE {
            unmap_user_page(pt, PAG_LOG_INIT_CODE + i);
        }
    }

    fn pair_mut(&mut self, a: usize, b: usize) -> (&mut AddressSpace, &mut AddressSpace) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.spaces.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.spaces.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }
}

/// Copy one page between two mapped logical pages of the active address
/// space. Fork runs this with the parent's directory loaded, copying its
/// data pages into the aliased child frames.
///
/// # Safety
/// Both pages must be mapped writable/readable in the active directory.
#[cfg(not(test))]
unsafe fn copy_page(src_page: usize, dst_page: usize) {
    let src = (src_page * PAGE_SIZE) as *const u8;
    let dst = (dst_page * PAGE_SIZE) as *mut u8;
    core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
}

#[cfg(test)]
unsafe fn copy_page(_src_page: usize, _dst_page: usize) {}

/// Copy one frame to another through the boot identity mapping. Only valid
/// before the first user directory is loaded.
///
/// # Safety
/// Both physical ranges must be RAM and identity-reachable.
#[cfg(not(test))]
unsafe fn copy_frame(src_phys: u64, dst_phys: u64) {
    core::ptr::copy_nonoverlapping(src_phys as *const u8, dst_phys as *mut u8, PAGE_SIZE);
}

#[cfg(test)]
unsafe fn copy_frame(_src_phys: u64, _dst_phys: u64) {}

/// Invalidate every cached translation by reloading the directory register.
#[cfg(not(test))]
pub fn flush_tlb() {
    use x86_64::registers::control::Cr3;
    let (frame, flags) = Cr3::read();
    unsafe { Cr3::write(frame, flags) };
}

#[cfg(test)]
pub fn flush_tlb() {}

/// Activate a directory; the hardware flushes the TLB as a side effect.
///
/// # Safety
/// `dir_phys` must be the physical address of a directory built by
/// `allocate_dir`, with the kernel window mapped.
#[cfg(not(test))]
pub unsafe fn load_dir(dir_phys: u64) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::Size4KiB;
    let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(dir_phys));
    Cr3::write(frame, Cr3Flags::empty());
}

#[cfg(test)]
pub unsafe fn load_dir(_dir_phys: u64) {}
