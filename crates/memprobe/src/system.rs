//! The default upstream: a thin adapter over the process heap that
//! honors explicit alignments.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::AllocError;
use crate::layout::resolve_alignment;
use crate::resource::MemoryResource;

/// Aligned allocation straight from `std::alloc`.
///
/// Performs no tracking of its own; it exists so every other resource
/// in the crate has a real allocator to forward to. The process-wide
/// instance returned by [`system_resource`] lives for the whole program
/// and is never torn down.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResource;

impl SystemResource {
    fn layout_for(bytes: usize, align: usize) -> Result<Layout, AllocError> {
        let align = resolve_alignment(bytes, align);
        if !align.is_power_of_two() {
            return Err(AllocError::UnsupportedAlignment { bytes, align });
        }
        // The global allocator rejects zero-sized layouts; serve them
        // with a minimal block so callers always get a unique pointer.
        Layout::from_size_align(bytes.max(1), align)
            .map_err(|_| AllocError::UnsupportedAlignment { bytes, align })
    }
}

impl MemoryResource for SystemResource {
    fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let layout = Self::layout_for(bytes, align)?;
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::OutOfMemory { bytes, align })
    }

    unsafe fn deallocate(
        &self,
        ptr: *mut u8,
        bytes: usize,
        align: usize,
    ) -> Result<(), AllocError> {
        if ptr.is_null() {
            return Ok(());
        }
        let layout = Self::layout_for(bytes, align)?;
        unsafe { alloc::dealloc(ptr, layout) };
        Ok(())
    }
}

/// The immortal process-wide system resource.
pub fn system_resource() -> &'static SystemResource {
    static SYSTEM: SystemResource = SystemResource;
    &SYSTEM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_at_every_supported_alignment() {
        let resource = system_resource();
        for shift in 0..13 {
            let align = 1usize << shift;
            let ptr = resource.allocate(100, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "align {align}");
            unsafe { resource.deallocate(ptr.as_ptr(), 100, align).unwrap() };
        }
    }

    #[test]
    fn zero_byte_allocation_is_non_null() {
        let resource = system_resource();
        let ptr = resource.allocate(0, 0).unwrap();
        unsafe { resource.deallocate(ptr.as_ptr(), 0, 0).unwrap() };
    }

    #[test]
    fn identity_equality() {
        let a = system_resource();
        let b = SystemResource;
        assert!(a.is_equal(a));
        assert!(!a.is_equal(&b));
    }
}
