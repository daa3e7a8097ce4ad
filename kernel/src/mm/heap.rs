//! Kernel heap
//!
//! Byte-granular allocator layered on the frame-backed heap window. Every
//! returned pointer is preceded by one machine word recording the
//! allocation size, so [`KernelHeap::realloc`] can return the same pointer
//! when the block still fits and otherwise move the old contents into a
//! larger block. The fit strategy underneath is a linked free list.
//!
//! Heap calls are task-context only; interrupt handlers must not allocate.
//! A debug assertion enforces this.

use core::alloc::Layout;
use core::mem;
use core::ptr;

use linked_list_allocator::Heap;
use spin::Mutex;

/// Size of the word header preceding every allocation.
const HEADER_SIZE: usize = mem::size_of::<usize>();

/// Size-prefixed byte allocator over a caller-provided memory window.
pub struct KernelHeap {
    inner: Heap,
}

impl KernelHeap {
    pub const fn empty() -> Self {
        Self { inner: Heap::empty() }
    }

    /// Initialize over `[start, start + size)`.
    ///
    /// # Safety
    ///
    /// The window must be valid, writable, unused by anything else, and
    /// live for the lifetime of the heap. On bare metal the window is
    /// backed on demand by the page-fault handler.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        // SAFETY: Forwarded contract; the caller guarantees the window.
        unsafe { self.inner.init(start, size) };
    }

    fn layout_for(size: usize) -> Layout {
        // Header plus payload, word aligned.
        Layout::from_size_align(HEADER_SIZE + size, mem::align_of::<usize>())
            .expect("heap allocation size overflows layout")
    }

    /// Allocate `size` bytes. Returns null when the heap is exhausted or
    /// `size` is zero.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        debug_assert!(
            !crate::interrupts::in_interrupt_context(),
            "kernel heap used from interrupt context"
        );
        if size == 0 {
            return ptr::null_mut();
        }
        match self.inner.allocate_first_fit(Self::layout_for(size)) {
            Ok(block) => {
                let base = block.as_ptr() as *mut usize;
                // SAFETY: The block is at least HEADER_SIZE + size bytes and
                // word aligned; the first word is ours to use as the header.
                unsafe {
                    base.write(size);
                    (base.add(1)) as *mut u8
                }
            }
            Err(_) => ptr::null_mut(),
        }
    }

    /// Allocate `size` zeroed bytes.
    pub fn alloc_zeroed(&mut self, size: usize) -> *mut u8 {
        let p = self.alloc(size);
        if !p.is_null() {
            // SAFETY: alloc returned a live block of at least `size` bytes.
            unsafe { ptr::write_bytes(p, 0, size) };
        }
        p
    }

    /// Size recorded for an allocation returned by [`Self::alloc`].
    ///
    /// # Safety
    ///
    /// `p` must be a live pointer previously returned by this heap.
    pub unsafe fn allocation_size(&self, p: *mut u8) -> usize {
        // SAFETY: Every allocation is preceded by its size header.
        unsafe { (p as *const usize).sub(1).read() }
    }

    /// Resize an allocation, preserving contents up to
    /// `min(old size, new size)`.
    ///
    /// Returns the same pointer when the block already fits `new_size`,
    /// otherwise a fresh block (or null if allocation fails, in which case
    /// the old block is untouched). A null `p` behaves like `alloc`.
    ///
    /// # Safety
    ///
    /// `p` must be null or a live pointer previously returned by this heap.
    pub unsafe fn realloc(&mut self, p: *mut u8, new_size: usize) -> *mut u8 {
        if p.is_null() {
            return self.alloc(new_size);
        }
        // SAFETY: Caller guarantees `p` is one of ours.
        let old_size = unsafe { self.allocation_size(p) };
        if new_size <= old_size {
            return p;
        }
        let fresh = self.alloc(new_size);
        if !fresh.is_null() {
            // SAFETY: Both blocks are live and at least old_size bytes.
            unsafe {
                ptr::copy_nonoverlapping(p, fresh, old_size);
                self.free(p);
            }
        }
        fresh
    }

    /// Return an allocation to the heap.
    ///
    /// # Safety
    ///
    /// `p` must be a live pointer previously returned by this heap; it must
    /// not be used afterwards.
    pub unsafe fn free(&mut self, p: *mut u8) {
        debug_assert!(
            !crate::interrupts::in_interrupt_context(),
            "kernel heap used from interrupt context"
        );
        // SAFETY: Header read and deallocation mirror the alloc path.
        unsafe {
            let size = self.allocation_size(p);
            let base = (p as *mut usize).sub(1);
            self.inner.deallocate(
                ptr::NonNull::new_unchecked(base as *mut u8),
                Self::layout_for(size),
            );
        }
    }

    /// Bytes currently handed out (including headers).
    pub fn used(&self) -> usize {
        self.inner.used()
    }

    /// Bytes still available.
    pub fn free_space(&self) -> usize {
        self.inner.free()
    }
}

/// Global kernel heap over the demand-paged heap window.
pub static KERNEL_HEAP: Mutex<KernelHeap> = Mutex::new(KernelHeap::empty());

/// Wire up the global allocators on bare metal: the Rust allocator over a
/// static bootstrap arena, and the kernel heap over its fault-grown window.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init_global() {
    use super::page_fault::{KHEAP_SIZE, KHEAP_START};

    // Bootstrap arena for Box/Vec/BTreeMap before (and independent of) the
    // demand-paged window.
    const BOOTSTRAP_HEAP_SIZE: usize = 1024 * 1024;
    static mut BOOTSTRAP_HEAP: [u8; BOOTSTRAP_HEAP_SIZE] = [0; BOOTSTRAP_HEAP_SIZE];

    // SAFETY: The arena is a private static used exactly once, and the heap
    // window is reserved virtual space backed by the page-fault handler.
    unsafe {
        let arena = &raw mut BOOTSTRAP_HEAP;
        crate::get_allocator()
            .lock()
            .init(arena as *mut u8, BOOTSTRAP_HEAP_SIZE);
        KERNEL_HEAP
            .lock()
            .init(KHEAP_START as *mut u8, KHEAP_SIZE as usize);
    }
    log::info!(
        "heap: bootstrap {} KiB, window {:#010x}+{:#x}",
        BOOTSTRAP_HEAP_SIZE / 1024,
        KHEAP_START,
        KHEAP_SIZE
    );
}
