//! Typed single-object allocation over a [`MemoryResource`].

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::AllocError;
use crate::resource::MemoryResource;

/// An owned value living in memory drawn from a named resource.
///
/// This is the create/destroy pairing the resource contract asks for,
/// made unforgettable by ownership: the box remembers which resource
/// produced it, and its `Drop` returns the bytes with the exact size
/// and alignment they were allocated with. A checking resource will
/// therefore see every `ResourceBox` round-trip as well-paired.
///
/// # Examples
///
/// ```rust
/// use memprobe::{ProbeResource, ResourceBox};
///
/// let probe = ProbeResource::new("boxes");
/// {
///     let value = ResourceBox::new_in(&probe, 42u64).unwrap();
///     assert_eq!(*value, 42);
///     assert_eq!(probe.blocks_in_use(), 1);
/// }
/// assert_eq!(probe.status(), 0);
/// ```
pub struct ResourceBox<'r, T> {
    ptr: NonNull<T>,
    resource: &'r dyn MemoryResource,
}

impl<'r, T> ResourceBox<'r, T> {
    /// Allocates room for `value` in `resource` and moves it there.
    pub fn new_in(resource: &'r dyn MemoryResource, value: T) -> Result<Self, AllocError> {
        let ptr = resource
            .allocate(mem::size_of::<T>(), mem::align_of::<T>())?
            .cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr, resource })
    }

    /// Moves the value out, returning its memory to the resource.
    pub fn into_inner(self) -> T {
        let value = unsafe { self.ptr.as_ptr().read() };
        unsafe {
            let _ = self.resource.deallocate(
                self.ptr.as_ptr().cast::<u8>(),
                mem::size_of::<T>(),
                mem::align_of::<T>(),
            );
        }
        mem::forget(self);
        value
    }

    /// The resource this box was allocated from.
    pub fn resource(&self) -> &'r dyn MemoryResource {
        self.resource
    }
}

impl<T> Deref for ResourceBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for ResourceBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for ResourceBox<'_, T> {
    fn drop(&mut self) {
        unsafe {
            self.ptr.as_ptr().drop_in_place();
            let _ = self.resource.deallocate(
                self.ptr.as_ptr().cast::<u8>(),
                mem::size_of::<T>(),
                mem::align_of::<T>(),
            );
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ResourceBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// A ResourceBox is as thread-mobile as its contents; the resource
// reference is Sync by trait bound.
unsafe impl<T: Send> Send for ResourceBox<'_, T> {}
unsafe impl<T: Sync> Sync for ResourceBox<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeResource;

    #[test]
    fn round_trip_is_well_paired() {
        let probe = ProbeResource::new("boxed");
        {
            let mut boxed = ResourceBox::new_in(&probe, vec![1, 2, 3]).unwrap();
            boxed.push(4);
            assert_eq!(boxed.len(), 4);
        }
        assert_eq!(probe.blocks_in_use(), 0);
        assert_eq!(probe.status(), 0);
    }

    #[test]
    fn into_inner_releases_the_block() {
        let probe = ProbeResource::new("boxed-inner");
        let boxed = ResourceBox::new_in(&probe, String::from("payload")).unwrap();
        let value = boxed.into_inner();
        assert_eq!(value, "payload");
        assert_eq!(probe.blocks_in_use(), 0);
        assert_eq!(probe.status(), 0);
    }

    #[test]
    fn drop_runs_the_payload_destructor() {
        use std::sync::atomic::{AtomicU32, Ordering};

        static DROPS: AtomicU32 = AtomicU32::new(0);
        struct Witness;
        impl Drop for Witness {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let probe = ProbeResource::new("boxed-drop");
        drop(ResourceBox::new_in(&probe, Witness).unwrap());
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
        assert_eq!(probe.status(), 0);
    }
}
