pub mod frame_allocator;
pub mod layout;
pub mod paging;
pub mod user;

use frame_allocator::BitmapFrameAllocator;
use spin::Mutex;
use x86_64::PhysAddr;

/// Physical frames backing user pages. Taken after the scheduler lock when
/// both are needed (fork, exit).
pub static FRAME_ALLOCATOR: Mutex<BitmapFrameAllocator> = Mutex::new(BitmapFrameAllocator::new());

/// Seed the frame allocator from the multiboot2 memory map and build the
/// shared kernel window. The allocator only manages the fixed user pool;
/// the map is consulted to confirm that pool is real RAM.
pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("multiboot2 info is unreadable")
    };
    let memory_map = boot_info.memory_map_tag().expect("memory map tag required");

    let pool_start = layout::USER_FRAME_POOL_START;
    let mut pool_end = layout::USER_FRAME_POOL_END;
    let covering = memory_map
        .memory_areas()
        .iter()
        .find(|area| area.start_address() <= pool_start && area.end_address() > pool_start)
        .expect("no memory region covers the user frame pool");
    if covering.end_address() < pool_end {
        pool_end = covering.end_address();
    }

    let mut allocator = FRAME_ALLOCATOR.lock();
    unsafe { allocator.init(PhysAddr::new(pool_start), PhysAddr::new(pool_end)) };
    crate::log_info!(
        "Frame allocator manages {} frames at {:#x}.",
        allocator.free_frames(),
        pool_start
    );
    drop(allocator);

    paging::USER_SPACES.lock().init_kernel_window();
    crate::log_info!("Kernel window mapped; per-process directories ready.");
}
