use std::error::Error;
use std::fmt;

/// Opaque identity of a memory resource.
///
/// Identifies the resource that produced a block independently of the
/// address of the resource value itself, so identity survives moves of
/// the owning [`ProbeResource`](crate::ProbeResource). Carried by
/// [`AllocError::LimitExceeded`] so failure-injection drivers can tell
/// their own injected failures from somebody else's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(usize);

impl ResourceId {
    pub(crate) fn new(token: usize) -> Self {
        Self(token)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Failure modes of a [`MemoryResource`](crate::MemoryResource) request.
///
/// `LimitExceeded` is deliberately distinguished from `OutOfMemory`: it
/// is the failure a [`ProbeResource`](crate::ProbeResource) injects when
/// its allocation limit runs out, and it names the resource that
/// injected it. [`check_allocation_failures`](crate::check_allocation_failures)
/// relies on that to decide whether an observed failure was the expected
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The upstream resource could not serve the request.
    OutOfMemory { bytes: usize, align: usize },
    /// The originating resource's allocation limit reached zero.
    LimitExceeded {
        owner: ResourceId,
        bytes: usize,
        align: usize,
    },
    /// The requested alignment is not a supported power of two.
    UnsupportedAlignment { bytes: usize, align: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { bytes, align } => {
                write!(f, "out of memory allocating {bytes} bytes (aligned {align})")
            }
            AllocError::LimitExceeded { owner, bytes, align } => {
                write!(
                    f,
                    "allocation limit exceeded in resource {owner} allocating {bytes} bytes (aligned {align})"
                )
            }
            AllocError::UnsupportedAlignment { bytes, align } => {
                write!(
                    f,
                    "unsupported alignment {align} allocating {bytes} bytes"
                )
            }
        }
    }
}

impl Error for AllocError {}
