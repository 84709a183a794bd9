use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PageKind {
    Huge,
    Regular,
}

/// A page-backed region for the cluster array. On Linux the region is
/// aligned to a 2 MiB boundary and advised to the kernel as huge-page
/// material; elsewhere an ordinary page boundary is used.
pub struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
    kind: PageKind,
}

impl Allocation {
    /// Returns `None` when the underlying allocator refuses the request.
    pub fn new(size: usize, align: usize) -> Option<Self> {
        #[cfg(target_os = "linux")]
        let (page_align, kind) = (2 * 1024 * 1024, PageKind::Huge);
        #[cfg(not(target_os = "linux"))]
        let (page_align, kind) = (4096, PageKind::Regular);

        let layout = Layout::from_size_align(size, align.max(page_align))
            .ok()?
            .pad_to_align();
        let ptr = NonNull::new(unsafe { alloc(layout) })?;

        #[cfg(target_os = "linux")]
        unsafe {
            // Advisory only; a refusal just means 4 KiB pages
            let _ = libc::madvise(ptr.as_ptr() as *mut _, layout.size(), libc::MADV_HUGEPAGE);
        }

        Some(Self { ptr, layout, kind })
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn kind(&self) -> PageKind {
        self.kind
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// The region is plain bytes; all concurrent access discipline lives in the
// cluster types layered on top of it.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}
