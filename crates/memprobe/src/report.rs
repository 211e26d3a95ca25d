//! The reporter seam: how a [`ProbeResource`](crate::ProbeResource)
//! tells the world what it saw.

use std::fmt;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::layout::{ALLOCATED_MAGIC, DEALLOCATED_MAGIC};
use crate::probe::ResourceView;
use crate::reporters::ConsoleReporter;

/// Sink for the events a [`ProbeResource`](crate::ProbeResource) emits.
///
/// Callbacks fire while the emitting resource's lock is held, so
/// implementations must not call back into the resource's allocation
/// paths. The [`ResourceView`] argument exposes everything a reporter
/// may read: the statistics accessors and the outstanding allocation
/// indices.
///
/// `on_release` implementations are expected to treat outstanding
/// allocations as a leak and abort the process unless the resource has
/// its no-abort switch set; the bundled reporters all do.
///
/// # Examples
///
/// ```rust
/// use memprobe::{ProbeReporter, ResourceView, InvalidBlockReport};
///
/// struct CountingSink(std::sync::atomic::AtomicU64);
///
/// impl ProbeReporter for CountingSink {
///     fn on_allocation(&self, _view: &ResourceView<'_>) {
///         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///     }
///     fn on_deallocation(&self, _view: &ResourceView<'_>) {}
///     fn on_release(&self, _view: &ResourceView<'_>) {}
///     fn on_invalid_block(&self, _view: &ResourceView<'_>, _report: &InvalidBlockReport) {}
///     fn on_print(&self, _view: &ResourceView<'_>) {}
///     fn on_log(&self, _message: std::fmt::Arguments<'_>) {}
/// }
/// ```
pub trait ProbeReporter: Send + Sync {
    /// A block was allocated (emitted only in verbose mode).
    fn on_allocation(&self, view: &ResourceView<'_>);
    /// A block was released cleanly (emitted only in verbose mode).
    fn on_deallocation(&self, view: &ResourceView<'_>);
    /// The resource is going away; outstanding allocations are leaks.
    fn on_release(&self, view: &ResourceView<'_>);
    /// A deallocation failed validation.
    fn on_invalid_block(&self, view: &ResourceView<'_>, report: &InvalidBlockReport);
    /// An explicit statistics dump was requested.
    fn on_print(&self, view: &ResourceView<'_>);
    /// Free-form diagnostic line.
    fn on_log(&self, message: fmt::Arguments<'_>);
}

/// Everything a reporter gets to know about a deallocation that failed
/// validation.
///
/// The memory dumps are copies taken by the resource while it still
/// held its lock; reporters never touch block memory themselves.
#[derive(Debug, Clone)]
pub struct InvalidBlockReport {
    /// Address the caller asked to free.
    pub payload_address: usize,
    /// Size the caller claimed.
    pub claimed_bytes: usize,
    /// Alignment the caller claimed (post-resolution).
    pub claimed_alignment: usize,
    /// Magic found where the header should be.
    pub magic: u32,
    /// Magic matched but the block belongs to another resource.
    pub wrong_owner: bool,
    /// Size recorded in the header; `None` when the header is not
    /// trustworthy.
    pub recorded_bytes: Option<usize>,
    /// Alignment recorded in the header; `None` when the header is not
    /// trustworthy.
    pub recorded_alignment: Option<usize>,
    /// Distance from the payload to the nearest trashed front-guard
    /// byte; zero when intact.
    pub underrun_by: usize,
    /// One-based offset of the first trashed trailing-guard byte; zero
    /// when intact.
    pub overrun_by: usize,
    /// Address the header was recovered at.
    pub header_address: usize,
    /// Copy of the header and front guard, `[header_address, payload)`.
    pub header_dump: Vec<u8>,
    /// Copy of the first payload bytes (at most 64, bounded by the
    /// claimed size).
    pub payload_dump: Vec<u8>,
    /// Copy of the trailing guard zone, when the header was readable.
    pub trailing_dump: Option<Vec<u8>>,
}

impl InvalidBlockReport {
    /// The header carried the live-allocation magic.
    pub fn magic_is_live(&self) -> bool {
        self.magic == ALLOCATED_MAGIC
    }

    /// The header carried the already-freed magic: a double free.
    pub fn magic_is_freed(&self) -> bool {
        self.magic == DEALLOCATED_MAGIC
    }
}

/// Point-in-time copy of a resource's statistics, serializable for
/// machine-readable reporters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub allocations: i64,
    pub deallocations: i64,
    pub blocks_in_use: i64,
    pub max_blocks: i64,
    pub total_blocks: i64,
    pub bytes_in_use: i64,
    pub max_bytes: i64,
    pub total_bytes: i64,
    pub mismatches: i64,
    pub bounds_errors: i64,
    pub bad_deallocate_params: i64,
}

/// Reporter that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProbeReporter for NullReporter {
    fn on_allocation(&self, _view: &ResourceView<'_>) {}
    fn on_deallocation(&self, _view: &ResourceView<'_>) {}
    fn on_release(&self, _view: &ResourceView<'_>) {}
    fn on_invalid_block(&self, _view: &ResourceView<'_>, _report: &InvalidBlockReport) {}
    fn on_print(&self, _view: &ResourceView<'_>) {}
    fn on_log(&self, _message: fmt::Arguments<'_>) {}
}

// arc-swap cannot hold a bare `Arc<dyn Trait>` (fat pointer), so the
// global goes through one sized cell.
struct ReporterCell(Arc<dyn ProbeReporter>);

static DEFAULT_REPORTER: OnceLock<ArcSwap<ReporterCell>> = OnceLock::new();

fn reporter_cell() -> &'static ArcSwap<ReporterCell> {
    DEFAULT_REPORTER.get_or_init(|| {
        ArcSwap::from_pointee(ReporterCell(Arc::new(ConsoleReporter::new())))
    })
}

/// Returns the process-wide default reporter (initially a
/// [`ConsoleReporter`] on standard output).
pub fn default_reporter() -> Arc<dyn ProbeReporter> {
    reporter_cell().load().0.clone()
}

/// Atomically installs a new process-wide default reporter and returns
/// the previous one.
///
/// Resources capture the default at construction; swapping it does not
/// affect already-built resources.
pub fn set_default_reporter(reporter: Arc<dyn ProbeReporter>) -> Arc<dyn ProbeReporter> {
    reporter_cell()
        .swap(Arc::new(ReporterCell(reporter)))
        .0
        .clone()
}

/// Renders a memory dump in the classic sixteen-bytes-per-line hex
/// form, each line prefixed with the address of its first byte.
pub fn format_hex_dump(bytes: &[u8], start_address: usize) -> String {
    let mut out = String::with_capacity((bytes.len() / 16 + 1) * 80);
    for (line_index, line) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:#018x}:", start_address + line_index * 16));
        for (i, byte) in line.iter().enumerate() {
            if i % 4 == 0 {
                out.push(' ');
            }
            out.push_str(&format!(" {byte:02x}"));
        }
        out.push('\n');
    }
    out
}

pub(crate) fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_groups_by_four_and_breaks_by_sixteen() {
        let bytes: Vec<u8> = (0u8..20).collect();
        let dump = format_hex_dump(&bytes, 0x1000);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0x0000000000001000:"));
        assert!(lines[1].starts_with("0x0000000000001010:"));
        assert!(lines[0].contains("00 01 02 03  04 05 06 07"));
        assert!(lines[1].ends_with("10 11 12 13"));
    }

    #[test]
    fn default_reporter_swap_returns_the_previous_one() {
        let replacement: Arc<dyn ProbeReporter> = Arc::new(NullReporter);
        let original = set_default_reporter(replacement.clone());
        let observed = set_default_reporter(original);
        assert!(Arc::ptr_eq(&observed, &replacement));
    }
}
