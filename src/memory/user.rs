//! User-pointer validation and checked copies across the ring boundary.
//!
//! Two independent guards: `access_ok` is a pure range check against the
//! user window, done by every syscall before anything else. The copy
//! routines then walk the live page table as well, because a range-valid
//! pointer can still sit over pages that are absent or read-only (the
//! shared code region). Syscalls never dereference a user pointer except
//! through here.

use x86_64::structures::paging::{PageTable, PageTableFlags};

use super::layout::{PAGE_SIZE, USER_END, USER_START};
use super::paging;

/// A checked copy found the range valid but the backing pages missing or
/// not writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadUserAccess;

/// Whether `[addr, addr + size)` lies entirely inside the user window.
/// Null pointers and wrap-around ranges never validate.
pub fn access_ok(addr: u64, size: usize) -> bool {
    if addr == 0 {
        return false;
    }
    let Some(end) = addr.checked_add(size as u64) else {
        return false;
    };
    addr >= USER_START && end <= USER_END
}

/// Whether every page under `[addr, addr + size)` is actually mapped, and
/// mapped writable when `needs_write`. Only meaningful after `access_ok`
/// confirmed the range is in the window.
fn range_mapped(pt: &PageTable, addr: u64, size: usize, needs_write: bool) -> bool {
    if size == 0 {
        return true;
    }
    let first = addr as usize / PAGE_SIZE;
    let last = (addr as usize + size - 1) / PAGE_SIZE;
    (first..=last).all(|page| match paging::user_page_flags(pt, page) {
        Some(flags) => !needs_write || flags.contains(PageTableFlags::WRITABLE),
        None => false,
    })
}

/// Copy user bytes into a kernel buffer through the given process's user
/// table.
pub fn copy_from_user(
    pt: &PageTable,
    user_src: u64,
    kernel_dst: &mut [u8],
) -> Result<(), BadUserAccess> {
    if !access_ok(user_src, kernel_dst.len()) || !range_mapped(pt, user_src, kernel_dst.len(), false)
    {
        return Err(BadUserAccess);
    }
    unsafe { copy_in(user_src, kernel_dst) };
    Ok(())
}

/// Copy a kernel value out to user memory through the given process's user
/// table. Fails on any destination page that is not writable-mapped.
pub fn copy_to_user<T: Copy>(
    value: &T,
    pt: &PageTable,
    user_dst: u64,
) -> Result<(), BadUserAccess> {
    let size = core::mem::size_of::<T>();
    if !access_ok(user_dst, size) || !range_mapped(pt, user_dst, size, true) {
        return Err(BadUserAccess);
    }
    unsafe { copy_out(value, user_dst) };
    Ok(())
}

// The raw copies run with the current process's directory loaded; both
// guards held, so every byte is reachable.
#[cfg(not(test))]
unsafe fn copy_in(user_src: u64, kernel_dst: &mut [u8]) {
    core::ptr::copy_nonoverlapping(user_src as *const u8, kernel_dst.as_mut_ptr(), kernel_dst.len());
}

#[cfg(test)]
unsafe fn copy_in(_user_src: u64, _kernel_dst: &mut [u8]) {}

#[cfg(not(test))]
unsafe fn copy_out<T: Copy>(value: &T, user_dst: u64) {
    core::ptr::copy_nonoverlapping(value as *const T, user_dst as *mut T, 1);
}

#[cfg(test)]
unsafe fn copy_out<T: Copy>(_value: &T, _user_dst: u64) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::{PAG_LOG_INIT_CODE, PAG_LOG_INIT_DATA};
    use crate::memory::paging::map_user_page;
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    const CODE_ADDR: u64 = (PAG_LOG_INIT_CODE * PAGE_SIZE) as u64;
    const DATA_ADDR: u64 = (PAG_LOG_INIT_DATA * PAGE_SIZE) as u64;

    /// A user table shaped like a live process's: one read-only code page,
    /// one writable data page, everything else absent.
    fn user_table() -> Box<PageTable> {
        let mut pt = Box::new(PageTable::new());
        let frame = |addr| PhysFrame::containing_address(PhysAddr::new(addr));
        map_user_page(
            &mut pt,
            PAG_LOG_INIT_CODE,
            frame(0x40_0000),
            PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE,
        );
        map_user_page(
            &mut pt,
            PAG_LOG_INIT_DATA,
            frame(0x40_1000),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        );
        pt
    }

    #[test]
    fn null_and_kernel_pointers_fail() {
        assert!(!access_ok(0, 1));
        assert!(!access_ok(0x1000, 16)); // kernel window
        assert!(!access_ok(USER_START - 8, 4));
    }

    #[test]
    fn in_window_ranges_validate() {
        assert!(access_ok(USER_START, PAGE_SIZE));
        assert!(access_ok(USER_END - 16, 16));
        assert!(access_ok(USER_START, (USER_END - USER_START) as usize));
    }

    #[test]
    fn ranges_may_not_leave_the_window() {
        assert!(!access_ok(USER_END - 8, 16));
        assert!(!access_ok(USER_END, 1));
        assert!(!access_ok(u64::MAX - 4, 64)); // would wrap
    }

    #[test]
    fn copies_reject_out_of_window_pointers() {
        let pt = user_table();
        let mut buf = [0u8; 8];
        assert_eq!(copy_from_user(&pt, 0, &mut buf), Err(BadUserAccess));
        assert_eq!(copy_to_user(&0u64, &pt, 0x2000), Err(BadUserAccess));
    }

    #[test]
    fn reads_work_from_any_mapped_page() {
        let pt = user_table();
        let mut buf = [0u8; 8];
        assert!(copy_from_user(&pt, CODE_ADDR, &mut buf).is_ok());
        assert!(copy_from_user(&pt, DATA_ADDR, &mut buf).is_ok());
    }

    #[test]
    fn reads_fail_on_absent_pages() {
        let pt = user_table();
        let mut buf = [0u8; 8];
        // In the window, but nothing mapped there.
        assert_eq!(copy_from_user(&pt, DATA_ADDR + PAGE_SIZE as u64, &mut buf), Err(BadUserAccess));
        // Starts on the mapped data page but runs onto the absent one.
        let spill = DATA_ADDR + PAGE_SIZE as u64 - 4;
        assert_eq!(copy_from_user(&pt, spill, &mut buf), Err(BadUserAccess));
    }

    #[test]
    fn writes_to_read_only_pages_are_refused() {
        let pt = user_table();
        assert!(copy_to_user(&7u64, &pt, DATA_ADDR).is_ok());
        // Range-valid, present, but the code region is not writable.
        assert_eq!(copy_to_user(&7u64, &pt, CODE_ADDR), Err(BadUserAccess));
    }

    #[test]
    fn writes_to_absent_pages_are_refused() {
        let pt = user_table();
        assert_eq!(
            copy_to_user(&7u64, &pt, DATA_ADDR + PAGE_SIZE as u64),
            Err(BadUserAccess)
        );
    }
}
