use linked_list_allocator::LockedHeap;

/// Kernel heap backing store, 1 MiB of .bss. Dynamic structures (thread
/// names, descriptor tables, ELF staging buffers) live here; user frames
/// and page tables come from the frame allocator instead.
pub const HEAP_SIZE: usize = 1024 * 1024;

static mut HEAP_REGION: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub fn init_heap() {
    unsafe {
        let bottom = core::ptr::addr_of_mut!(HEAP_REGION) as *mut u8;
        ALLOCATOR.lock().init(bottom, HEAP_SIZE);
    }
}
