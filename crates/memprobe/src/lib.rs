//! An instrumented, polymorphic memory resource for tests and
//! diagnostics.
//!
//! `memprobe` wraps an upstream allocator behind the crate's
//! [`MemoryResource`] abstraction and watches everything that passes
//! through: it counts blocks and bytes (current, peak and cumulative),
//! detects leaks, double frees, cross-resource frees, mismatched
//! deallocation parameters and guard-zone corruption, scribbles freed
//! payloads, and can inject allocation failures on a configurable
//! schedule so error paths get exercised too.
//!
//! It is a diagnostic tool, not a production allocator: it never pools
//! or reuses memory itself, and every real request is forwarded to the
//! upstream resource (the process heap by default).
//!
//! # Quick start
//!
//! ```rust
//! use memprobe::{MemoryResource, ProbeResource};
//!
//! let probe = ProbeResource::new("demo");
//! probe.set_no_abort(true);
//!
//! let ptr = probe.allocate(100, 16).unwrap();
//! assert_eq!(probe.blocks_in_use(), 1);
//! assert_eq!(probe.bytes_in_use(), 100);
//!
//! unsafe { probe.deallocate(ptr.as_ptr(), 100, 16).unwrap() };
//! assert_eq!(probe.status(), 0); // no errors, nothing outstanding
//! ```
//!
//! # Failure injection
//!
//! ```rust
//! use memprobe::{check_allocation_failures, ProbeResource, ResourceBox};
//!
//! let probe = ProbeResource::new("faults");
//! check_allocation_failures(&probe, |r| {
//!     let buffer = ResourceBox::new_in(r, [0u8; 128])?;
//!     assert_eq!(buffer.len(), 128);
//!     Ok(())
//! })
//! .unwrap();
//! assert_eq!(probe.status(), 0);
//! ```

mod blocks;
mod boxed;
mod error;
mod failure;
mod guard;
mod layout;
mod monitor;
mod probe;
mod report;
mod reporters;
mod resource;
mod system;

pub use boxed::ResourceBox;
pub use error::{AllocError, ResourceId};
pub use failure::check_allocation_failures;
pub use guard::DefaultResourceGuard;
pub use layout::{GUARD_BYTE, MAX_NATURAL_ALIGNMENT, MAX_SUPPORTED_ALIGNMENT, SCRIBBLE_BYTE};
pub use monitor::ProbeMonitor;
pub use probe::{ProbeResource, ProbeResourceBuilder, ResourceView};
pub use report::{
    default_reporter, format_hex_dump, set_default_reporter, InvalidBlockReport, NullReporter,
    ProbeReporter, StatsSnapshot,
};
pub use reporters::{ConsoleReporter, FileReporter, JsonReporter};
pub use resource::{default_resource, set_default_resource, MemoryResource};
pub use system::{system_resource, SystemResource};
