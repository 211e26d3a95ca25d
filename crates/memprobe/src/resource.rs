//! The polymorphic memory-resource abstraction and the process-wide
//! default resource slot.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::AllocError;
use crate::system::system_resource;

/// An allocator that serves byte requests at explicit alignments.
///
/// This is the vocabulary seam of the crate: everything above it
/// (instrumentation, typed helpers, failure injection) speaks to
/// `&dyn MemoryResource`, and resources compose by forwarding to an
/// upstream `&dyn MemoryResource`.
///
/// Equality is reference identity: no two distinct resources compare
/// equal, which is what makes "was this block allocated by me?" a
/// meaningful question.
pub trait MemoryResource: Sync {
    /// Allocates `bytes` bytes aligned to `align`.
    ///
    /// An `align` of zero asks for the natural alignment of `bytes`
    /// (the largest power of two dividing it, capped at
    /// [`MAX_NATURAL_ALIGNMENT`](crate::MAX_NATURAL_ALIGNMENT)).
    /// Zero-byte requests succeed and return a non-null pointer.
    fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, AllocError>;

    /// Returns a block previously produced by this resource.
    ///
    /// `bytes` and `align` must repeat the values the block was
    /// allocated with. `Err` is reserved for requests that cannot be
    /// interpreted at all (unsupported alignment); checking resources
    /// record and report misuse instead of returning it.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from `allocate` on this
    /// resource and not yet deallocated. Checking implementations
    /// tolerate violations by design, but the baseline contract is the
    /// usual allocator one.
    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, align: usize)
        -> Result<(), AllocError>;

    /// Reference identity. `a.is_equal(b)` holds only when `a` and `b`
    /// are the same object.
    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        std::ptr::eq(
            (self as *const Self).cast::<u8>(),
            (other as *const dyn MemoryResource).cast::<u8>(),
        )
    }
}

static DEFAULT_RESOURCE: Mutex<Option<&'static dyn MemoryResource>> = Mutex::new(None);

/// Returns the process-wide default resource.
///
/// Initially (and whenever the slot holds `None`) this is the immortal
/// [`system_resource`]. The slot is normally managed through
/// [`DefaultResourceGuard`](crate::DefaultResourceGuard) rather than
/// set directly.
pub fn default_resource() -> &'static dyn MemoryResource {
    let slot = DEFAULT_RESOURCE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.unwrap_or_else(|| system_resource())
}

/// Replaces the process-wide default resource and returns the previous
/// slot value.
///
/// `None` clears the override; [`default_resource`] then falls back to
/// the system resource.
pub fn set_default_resource(
    resource: Option<&'static dyn MemoryResource>,
) -> Option<&'static dyn MemoryResource> {
    let mut slot = DEFAULT_RESOURCE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::replace(&mut *slot, resource)
}
