use core::mem::{align_of, size_of};

/// A borrowed view of a contiguous block of (possibly shared) memory.
///
/// `Region` is `Copy` and does not own the memory. Whoever created it must keep
/// the backing mapping alive for as long as any copy is in use.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// SAFETY: all cross-thread access to region memory goes through atomics or is
// serialized by an external lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region from a raw base pointer and length.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// the region (or any copy of it) is used.
    #[inline]
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to the byte at `offset`.
    ///
    /// Panics if `offset` is past the end of the region.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.add(offset) }
    }

    /// Shared reference to a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a valid `T`.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        self.check::<T>(offset);
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Exclusive reference to a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a valid `T` (or be about to be fully
    /// initialized), and no other reference to them may be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        self.check::<T>(offset);
        unsafe { &mut *(self.base.add(offset) as *mut T) }
    }

    /// Raw pointer to a `T` at `offset`.
    #[inline]
    pub fn ptr<T>(&self, offset: usize) -> *mut T {
        self.check::<T>(offset);
        // SAFETY: bounds and alignment checked above.
        unsafe { self.base.add(offset) as *mut T }
    }

    #[inline]
    fn check<T>(&self, offset: usize) {
        assert!(
            offset
                .checked_add(size_of::<T>())
                .is_some_and(|end| end <= self.len),
            "region access out of bounds"
        );
        assert!(
            (self.base as usize + offset).is_multiple_of(align_of::<T>()),
            "region access misaligned"
        );
    }
}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::Region;
    use alloc::alloc::{Layout, alloc_zeroed, dealloc};

    /// Zeroed, 64-byte aligned heap memory exposed as a [`Region`].
    ///
    /// Used by tests and single-process harnesses in place of a real mapping.
    pub struct HeapRegion {
        ptr: *mut u8,
        layout: Layout,
    }

    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}

    impl HeapRegion {
        pub fn new_zeroed(len: usize) -> Self {
            let layout = Layout::from_size_align(len.max(1), 64)
                .unwrap_or_else(|_| panic!("heap region too large: {len} bytes"));
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                alloc::alloc::handle_alloc_error(layout);
            }
            Self { ptr, layout }
        }

        pub fn region(&self) -> Region {
            // SAFETY: the allocation lives as long as self.
            unsafe { Region::from_raw(self.ptr, self.layout.size()) }
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            // SAFETY: allocated in new_zeroed with the same layout.
            unsafe { dealloc(self.ptr, self.layout) }
        }
    }
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;
