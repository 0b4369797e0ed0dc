// Kernel heap. A fixed slab is carved out of the physical pool at boot and
// handed to linked_list_allocator; Box/Vec in kernel code allocate from it.

use linked_list_allocator::LockedHeap;

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Safety: [start, start + size) must be unused, writable memory, and this
/// must be called exactly once before the first allocation.
pub(crate) unsafe fn init(start: u32, size: u32) {
    ALLOCATOR.lock().init(start as *mut u8, size as usize);
}
