pub mod frame_allocator;
pub mod paging;

use core::sync::atomic::{AtomicUsize, Ordering};

use frame_allocator::FrameAllocator;
use lazy_static::lazy_static;
use spin::Mutex;

pub use paging::{
    memory_alloc_and_map_range, memory_handle_page_fault, memory_space_clone, memory_space_create,
    memory_space_destroy, memory_space_reclaim, memory_space_switch, memory_space_write,
    memory_validate_vptr_len, memory_validate_vstr, MTag, PteFlags, USER_HI, USER_LO,
};

pub const PAGE_SIZE: usize = 4096;

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());
}

/// Root of the kernel-only address space built at boot; threads without a
/// process run on it, and exiting processes fall back to it before their
/// own space is torn down.
static KERNEL_ROOT: AtomicUsize = AtomicUsize::new(0);

pub fn kernel_space() -> MTag {
    let pa = KERNEL_ROOT.load(Ordering::Relaxed);
    debug_assert_ne!(pa, 0);
    MTag::from_root_pa(pa)
}

pub fn init() {
    unsafe { FRAME_ALLOCATOR.lock().init() };
    crate::log_info!("Physical memory frame allocator initialized.");

    crate::allocator::init_heap();
    crate::log_info!("Heap allocator initialized.");

    let kernel = memory_space_create().expect("building the kernel address space");
    KERNEL_ROOT.store(kernel.root_pa(), Ordering::Relaxed);
    memory_space_switch(kernel);
    crate::cpu::allow_user_memory_access();
    crate::log_info!("Sv39 paging enabled, kernel windows installed.");
}
