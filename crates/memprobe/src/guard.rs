//! Scoped override of the process-wide default resource.

use crate::resource::{set_default_resource, MemoryResource};

/// Installs a new process-wide default resource on construction and
/// restores what it recorded on drop.
///
/// Guards nest: because each drop restores the value its guard
/// displaced, nested guards unwind in LIFO order. Constructed with
/// `None`, the guard leaves the slot alone but still restores `None`
/// on drop, which resets the default to the system resource.
///
/// # Examples
///
/// ```rust
/// use memprobe::{default_resource, system_resource, DefaultResourceGuard, MemoryResource};
///
/// {
///     let _guard = DefaultResourceGuard::new(Some(system_resource()));
///     assert!(default_resource().is_equal(system_resource()));
/// }
/// ```
#[must_use = "guard is dropped immediately, restoring the previous default"]
pub struct DefaultResourceGuard {
    previous: Option<&'static dyn MemoryResource>,
}

impl DefaultResourceGuard {
    pub fn new(new_default: Option<&'static dyn MemoryResource>) -> Self {
        let previous = match new_default {
            Some(resource) => set_default_resource(Some(resource)),
            None => None,
        };
        Self { previous }
    }
}

impl Drop for DefaultResourceGuard {
    fn drop(&mut self) {
        set_default_resource(self.previous);
    }
}
