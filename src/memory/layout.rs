//! Fixed logical-memory geometry shared by the paging code, the scheduler
//! and the syscall layer.
//!
//! The low 4 MiB of every address space look the same: the first 2 MiB are
//! the identity-mapped kernel window (image, VGA text buffer, statics), the
//! second 2 MiB are the per-process user window covered by a single leaf
//! page table. The bootloader loads the init program at the start of the
//! user code range.

/// Bytes per page / physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Pages of the identity-mapped kernel window (low 2 MiB). Ring 3 cannot
/// touch any of them.
pub const NUM_PAG_KERNEL: usize = 512;

/// First logical page of user code, directly above the kernel window.
pub const PAG_LOG_INIT_CODE: usize = NUM_PAG_KERNEL;

/// Pages of user code. Shared between parent and child on fork.
pub const NUM_PAG_CODE: usize = 8;

/// First logical page of user data.
pub const PAG_LOG_INIT_DATA: usize = PAG_LOG_INIT_CODE + NUM_PAG_CODE;

/// Pages of user data. Private per process; fork copies them.
pub const NUM_PAG_DATA: usize = 20;

/// Start of the scratch window fork uses to alias the child's data frames
/// into the parent: one data-region stride above the data pages.
pub const PAG_LOG_ALIAS: usize = PAG_LOG_INIT_DATA + NUM_PAG_DATA;

/// Pages one user leaf table covers. Code, data and the alias window must
/// all fall inside `PAG_LOG_INIT_CODE .. PAG_LOG_INIT_CODE + USER_WINDOW_PAGES`.
pub const USER_WINDOW_PAGES: usize = 512;

/// First user-addressable byte; also where the init program is entered.
pub const USER_START: u64 = (PAG_LOG_INIT_CODE * PAGE_SIZE) as u64;

/// One past the last user-addressable byte.
pub const USER_END: u64 = ((PAG_LOG_INIT_DATA + NUM_PAG_DATA) * PAGE_SIZE) as u64;

/// Initial user stack top: the very end of the data region, growing down.
pub const USER_STACK_TOP: u64 = USER_END;

/// Physical address where the bootloader leaves the init program image:
/// `NUM_PAG_CODE` code pages followed by the `NUM_PAG_DATA`-page data
/// template. Outside both the kernel window and the frame pool.
pub const INIT_IMAGE_PHYS: u64 = 0x20_0000;

/// Physical window handed to the frame allocator for user pages. It is not
/// identity-mapped: the kernel reaches these frames only through user or
/// alias mappings.
pub const USER_FRAME_POOL_START: u64 = 0x40_0000;
pub const USER_FRAME_POOL_END: u64 = 0x80_0000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ranges_fit_one_leaf_table() {
        let last = PAG_LOG_ALIAS + NUM_PAG_DATA;
        assert!(last <= PAG_LOG_INIT_CODE + USER_WINDOW_PAGES);
    }

    #[test]
    fn alias_window_is_one_stride_above_data() {
        assert_eq!(PAG_LOG_ALIAS - PAG_LOG_INIT_DATA, NUM_PAG_DATA);
    }

    #[test]
    fn user_window_sits_above_the_kernel() {
        assert_eq!(USER_START, (NUM_PAG_KERNEL * PAGE_SIZE) as u64);
        assert!(USER_END > USER_START);
    }
}
