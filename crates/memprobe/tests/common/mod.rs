use std::ptr::NonNull;
use std::sync::Mutex;

use memprobe::{system_resource, AllocError, MemoryResource};

/// Upstream that allocates from the system but quarantines freed blocks
/// instead of returning them, so their bytes stay readable.
///
/// Double-free and scribble assertions need the released header and
/// payload to survive; a real heap may recycle or overwrite them.
/// Everything quarantined is returned to the system when the resource
/// drops.
pub struct RetainingResource {
    freed: Mutex<Vec<(usize, usize, usize)>>,
}

impl RetainingResource {
    pub fn new() -> Self {
        Self {
            freed: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryResource for RetainingResource {
    fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        system_resource().allocate(bytes, align)
    }

    unsafe fn deallocate(
        &self,
        ptr: *mut u8,
        bytes: usize,
        align: usize,
    ) -> Result<(), AllocError> {
        self.freed.lock().unwrap().push((ptr as usize, bytes, align));
        Ok(())
    }
}

impl Drop for RetainingResource {
    fn drop(&mut self) {
        for (ptr, bytes, align) in self.freed.lock().unwrap().drain(..) {
            unsafe {
                let _ = system_resource().deallocate(ptr as *mut u8, bytes, align);
            }
        }
    }
}
