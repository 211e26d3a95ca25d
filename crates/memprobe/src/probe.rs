//! The instrumented memory resource.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::blocks::BlockList;
use crate::error::{AllocError, ResourceId};
use crate::layout::{
    block_layout, resolve_alignment, scan_front_guard, scan_trailing_guard, write_guards,
    Header, ALLOCATED_MAGIC, DEALLOCATED_MAGIC, GUARD_SIZE, SCRIBBLE_BYTE,
};
use crate::report::{default_reporter, InvalidBlockReport, ProbeReporter, StatsSnapshot};
use crate::resource::MemoryResource;
use crate::system::system_resource;

/// A thread-safe, instrumented [`MemoryResource`] that forwards every
/// request to an upstream resource while tracking usage statistics and
/// detecting misuse.
///
/// Detected at deallocation time: leaks (at release), double frees,
/// frees routed to the wrong resource, mismatched size/alignment
/// parameters, and writes into the guard zones before or after the
/// payload. Freed payloads are scribbled so dangling reads are
/// recognizable. An adjustable allocation limit injects
/// [`AllocError::LimitExceeded`] failures for failure-safety testing;
/// see [`check_allocation_failures`](crate::check_allocation_failures).
///
/// # Examples
///
/// ```rust
/// use memprobe::{MemoryResource, ProbeResource};
///
/// let probe = ProbeResource::new("example");
/// probe.set_no_abort(true);
///
/// let ptr = probe.allocate(64, 8).unwrap();
/// assert_eq!(probe.blocks_in_use(), 1);
/// assert_eq!(probe.bytes_in_use(), 64);
///
/// unsafe { probe.deallocate(ptr.as_ptr(), 64, 8).unwrap() };
/// assert_eq!(probe.status(), 0);
/// ```
pub struct ProbeResource<'up> {
    name: String,
    upstream: &'up dyn MemoryResource,
    reporter: Arc<dyn ProbeReporter>,

    verbose: AtomicBool,
    no_abort: AtomicBool,
    quiet: AtomicBool,
    allocation_limit: AtomicI64,

    allocations: AtomicI64,
    deallocations: AtomicI64,
    blocks_in_use: AtomicI64,
    max_blocks: AtomicI64,
    total_blocks: AtomicI64,
    bytes_in_use: AtomicI64,
    max_bytes: AtomicI64,
    total_bytes: AtomicI64,
    bounds_errors: AtomicI64,
    bad_deallocate_params: AtomicI64,
    mismatches: AtomicI64,

    last_allocated_address: AtomicUsize,
    last_allocated_bytes: AtomicUsize,
    last_allocated_alignment: AtomicUsize,
    last_allocated_index: AtomicI64,
    last_deallocated_address: AtomicUsize,
    last_deallocated_bytes: AtomicUsize,
    last_deallocated_alignment: AtomicUsize,
    last_deallocated_index: AtomicI64,

    /// Live-block list, allocated from the upstream at construction.
    /// Its address doubles as this resource's identity token, which is
    /// what block headers record as their owner (stable across moves of
    /// this struct, unlike `self`'s own address).
    list: NonNull<BlockList>,
    /// Guards the list and serializes allocate/deallocate/release.
    lock: Mutex<()>,
}

// All shared state is either atomic or only reached while `lock` is
// held; `list` nodes are uniquely owned behind that lock.
unsafe impl Send for ProbeResource<'_> {}
unsafe impl Sync for ProbeResource<'_> {}

/// Configures and builds a [`ProbeResource`].
///
/// ```rust
/// use memprobe::{NullReporter, ProbeResource};
/// use std::sync::Arc;
///
/// let probe = ProbeResource::builder()
///     .name("quiet-probe")
///     .reporter(Arc::new(NullReporter))
///     .build();
/// assert_eq!(probe.name(), "quiet-probe");
/// ```
#[must_use = "builder is discarded without creating a resource"]
pub struct ProbeResourceBuilder<'up> {
    name: String,
    verbose: bool,
    upstream: Option<&'up dyn MemoryResource>,
    reporter: Option<Arc<dyn ProbeReporter>>,
}

impl<'up> ProbeResourceBuilder<'up> {
    fn new() -> Self {
        Self {
            name: String::new(),
            verbose: false,
            upstream: None,
            reporter: None,
        }
    }

    /// Names the resource; the name shows up in every report line.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reports every allocation and deallocation as it happens.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Forwards real memory requests to `upstream` instead of the
    /// process-wide system resource. Probes stack: an upstream may
    /// itself be a [`ProbeResource`].
    pub fn upstream(mut self, upstream: &'up dyn MemoryResource) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Sends events to `reporter` instead of the process-wide default.
    pub fn reporter(mut self, reporter: Arc<dyn ProbeReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Builds the resource.
    ///
    /// # Panics
    ///
    /// Panics if the upstream cannot supply the live-block list
    /// storage; a resource that cannot track blocks is unusable.
    pub fn build(self) -> ProbeResource<'up> {
        let upstream = self.upstream.unwrap_or_else(|| system_resource());
        let reporter = self.reporter.unwrap_or_else(default_reporter);

        let list = upstream
            .allocate(mem::size_of::<BlockList>(), mem::align_of::<BlockList>())
            .unwrap_or_else(|err| {
                panic!("memprobe: upstream refused the block list storage: {err}")
            })
            .cast::<BlockList>();
        unsafe { list.as_ptr().write(BlockList::new()) };

        ProbeResource {
            name: self.name,
            upstream,
            reporter,
            verbose: AtomicBool::new(self.verbose),
            no_abort: AtomicBool::new(false),
            quiet: AtomicBool::new(false),
            allocation_limit: AtomicI64::new(-1),
            allocations: AtomicI64::new(0),
            deallocations: AtomicI64::new(0),
            blocks_in_use: AtomicI64::new(0),
            max_blocks: AtomicI64::new(0),
            total_blocks: AtomicI64::new(0),
            bytes_in_use: AtomicI64::new(0),
            max_bytes: AtomicI64::new(0),
            total_bytes: AtomicI64::new(0),
            bounds_errors: AtomicI64::new(0),
            bad_deallocate_params: AtomicI64::new(0),
            mismatches: AtomicI64::new(0),
            last_allocated_address: AtomicUsize::new(0),
            last_allocated_bytes: AtomicUsize::new(0),
            last_allocated_alignment: AtomicUsize::new(0),
            last_allocated_index: AtomicI64::new(0),
            last_deallocated_address: AtomicUsize::new(0),
            last_deallocated_bytes: AtomicUsize::new(0),
            last_deallocated_alignment: AtomicUsize::new(0),
            last_deallocated_index: AtomicI64::new(0),
            list,
            lock: Mutex::new(()),
        }
    }
}

impl<'up> ProbeResource<'up> {
    /// Creates a named resource over the system upstream with the
    /// process-wide default reporter.
    pub fn new(name: impl Into<String>) -> ProbeResource<'static> {
        ProbeResource::builder().name(name).build()
    }

    pub fn builder() -> ProbeResourceBuilder<'up> {
        ProbeResourceBuilder::new()
    }

    /// This resource's identity token, as recorded in the headers of
    /// the blocks it produces.
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.list.as_ptr() as usize)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upstream_resource(&self) -> &'up dyn MemoryResource {
        self.upstream
    }

    pub fn reporter(&self) -> &Arc<dyn ProbeReporter> {
        &self.reporter
    }

    /// Number of further successful allocations before a
    /// [`AllocError::LimitExceeded`] is injected; negative means
    /// unlimited.
    pub fn allocation_limit(&self) -> i64 {
        self.allocation_limit.load(Ordering::Relaxed)
    }

    pub fn set_allocation_limit(&self, limit: i64) {
        self.allocation_limit.store(limit, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    /// When set, detected errors are reported but the process is not
    /// aborted.
    pub fn is_no_abort(&self) -> bool {
        self.no_abort.load(Ordering::Relaxed)
    }

    pub fn set_no_abort(&self, no_abort: bool) {
        self.no_abort.store(no_abort, Ordering::Relaxed);
    }

    /// When set, detected errors are not reported at all; implies the
    /// no-abort behavior.
    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::Relaxed)
    }

    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::Relaxed);
    }

    /// Total allocation requests, including failed ones.
    pub fn allocations(&self) -> i64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Total deallocation requests, including failed ones.
    pub fn deallocations(&self) -> i64 {
        self.deallocations.load(Ordering::Relaxed)
    }

    pub fn blocks_in_use(&self) -> i64 {
        self.blocks_in_use.load(Ordering::Relaxed)
    }

    /// Largest number of blocks simultaneously in use so far.
    pub fn max_blocks(&self) -> i64 {
        self.max_blocks.load(Ordering::Relaxed)
    }

    /// Total blocks ever successfully allocated.
    pub fn total_blocks(&self) -> i64 {
        self.total_blocks.load(Ordering::Relaxed)
    }

    pub fn bytes_in_use(&self) -> i64 {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> i64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Guard-zone overruns and underruns detected so far.
    pub fn bounds_errors(&self) -> i64 {
        self.bounds_errors.load(Ordering::Relaxed)
    }

    /// Deallocations whose size or alignment did not match the header.
    pub fn bad_deallocate_params(&self) -> i64 {
        self.bad_deallocate_params.load(Ordering::Relaxed)
    }

    /// Deallocations of blocks this resource never produced (or no
    /// longer owns: double frees land here too).
    pub fn mismatches(&self) -> i64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    pub fn last_allocated_address(&self) -> *const u8 {
        self.last_allocated_address.load(Ordering::Relaxed) as *const u8
    }

    pub fn last_allocated_bytes(&self) -> usize {
        self.last_allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn last_allocated_alignment(&self) -> usize {
        self.last_allocated_alignment.load(Ordering::Relaxed)
    }

    pub fn last_allocated_index(&self) -> i64 {
        self.last_allocated_index.load(Ordering::Relaxed)
    }

    pub fn last_deallocated_address(&self) -> *const u8 {
        self.last_deallocated_address.load(Ordering::Relaxed) as *const u8
    }

    pub fn last_deallocated_bytes(&self) -> usize {
        self.last_deallocated_bytes.load(Ordering::Relaxed)
    }

    pub fn last_deallocated_alignment(&self) -> usize {
        self.last_deallocated_alignment.load(Ordering::Relaxed)
    }

    pub fn last_deallocated_index(&self) -> i64 {
        self.last_deallocated_index.load(Ordering::Relaxed)
    }

    pub fn has_errors(&self) -> bool {
        self.mismatches() != 0 || self.bounds_errors() != 0 || self.bad_deallocate_params() != 0
    }

    pub fn has_allocations(&self) -> bool {
        self.blocks_in_use() > 0 || self.bytes_in_use() > 0
    }

    /// `0` when no errors were detected and nothing is outstanding,
    /// `-1` when allocations remain live (a leak, unless they are still
    /// wanted), otherwise the number of detected errors.
    pub fn status(&self) -> i64 {
        let _guard = self.lock();
        let errors = self.mismatches() + self.bounds_errors() + self.bad_deallocate_params();
        if errors > 0 {
            return errors;
        }
        if self.has_allocations() {
            return -1;
        }
        0
    }

    /// Sends the print event (a statistics table plus outstanding
    /// allocation indices) to this resource's reporter.
    pub fn print(&self) {
        let _guard = self.lock();
        let view = ResourceView {
            resource: self,
            list: unsafe { &*self.list.as_ptr() },
        };
        self.reporter.on_print(&view);
    }

    /// Visits the sequence number of every outstanding allocation,
    /// oldest first.
    pub fn visit_outstanding(&self, f: impl FnMut(i64)) {
        let _guard = self.lock();
        unsafe { &*self.list.as_ptr() }.for_each_index(f);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // A panic mid-operation (e.g. from a reporter) must not wedge
        // every later call; the statistics stay usable regardless.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryResource for ProbeResource<'_> {
    fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let _guard = self.lock();

        let seq = self.allocations.fetch_add(1, Ordering::Relaxed);
        if self.allocation_limit.load(Ordering::Relaxed) >= 0 {
            // The request that finds the limit at zero fails; counters
            // updated so far are deliberately kept.
            if self.allocation_limit.fetch_sub(1, Ordering::Relaxed) <= 0 {
                return Err(AllocError::LimitExceeded {
                    owner: self.id(),
                    bytes,
                    align,
                });
            }
        }

        let align = resolve_alignment(bytes, align);
        let layout =
            block_layout(align).ok_or(AllocError::UnsupportedAlignment { bytes, align })?;
        let total = layout
            .stride
            .checked_add(bytes)
            .and_then(|n| n.checked_add(GUARD_SIZE))
            .ok_or(AllocError::OutOfMemory { bytes, align })?;

        let base = self.upstream.allocate(total, layout.effective_align)?;
        let base_ptr = base.as_ptr();
        let payload = unsafe { base_ptr.add(layout.stride) };

        unsafe { write_guards(base_ptr, layout.stride, bytes) };

        let node = {
            let list = unsafe { &mut *self.list.as_ptr() };
            match list.push_back(seq, self.upstream) {
                Ok(node) => node,
                Err(err) => {
                    // No record, no block: hand the memory straight back.
                    unsafe {
                        let _ = self.upstream.deallocate(base_ptr, total, layout.effective_align);
                    }
                    return Err(err);
                }
            }
        };

        unsafe {
            base_ptr.cast::<Header>().write(Header {
                magic: ALLOCATED_MAGIC,
                bytes,
                alignment: align,
                index: seq,
                block: node.as_ptr(),
                owner: self.id().as_usize(),
            });
        }

        let in_use = self.blocks_in_use.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_blocks.load(Ordering::Relaxed) < in_use {
            self.max_blocks.store(in_use, Ordering::Relaxed);
        }
        self.total_blocks.fetch_add(1, Ordering::Relaxed);

        let bytes_in_use = self.bytes_in_use.fetch_add(bytes as i64, Ordering::Relaxed) + bytes as i64;
        if self.max_bytes.load(Ordering::Relaxed) < bytes_in_use {
            self.max_bytes.store(bytes_in_use, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(bytes as i64, Ordering::Relaxed);

        self.last_allocated_address
            .store(payload as usize, Ordering::Relaxed);
        self.last_allocated_bytes.store(bytes, Ordering::Relaxed);
        self.last_allocated_alignment.store(align, Ordering::Relaxed);
        self.last_allocated_index.store(seq, Ordering::Relaxed);

        if self.is_verbose() {
            let view = ResourceView {
                resource: self,
                list: unsafe { &*self.list.as_ptr() },
            };
            self.reporter.on_allocation(&view);
        }

        Ok(unsafe { NonNull::new_unchecked(payload) })
    }

    unsafe fn deallocate(
        &self,
        ptr: *mut u8,
        bytes: usize,
        align: usize,
    ) -> Result<(), AllocError> {
        let _guard = self.lock();

        self.deallocations.fetch_add(1, Ordering::Relaxed);
        self.last_deallocated_address
            .store(ptr as usize, Ordering::Relaxed);

        if ptr.is_null() {
            if bytes != 0 {
                self.bad_deallocate_params.fetch_add(1, Ordering::Relaxed);
                if !self.is_quiet() {
                    self.reporter.on_log(format_args!(
                        "*** Freeing a null pointer using non-zero size ({bytes}) with alignment ({align}). ***"
                    ));
                    if !self.is_no_abort() {
                        std::process::abort();
                    }
                }
            } else {
                self.last_deallocated_bytes.store(0, Ordering::Relaxed);
                self.last_deallocated_alignment
                    .store(align, Ordering::Relaxed);
            }
            return Ok(());
        }

        let align = resolve_alignment(bytes, align);
        let layout =
            block_layout(align).ok_or(AllocError::UnsupportedAlignment { bytes, align })?;
        let base = ptr.sub(layout.stride);
        let header = base.cast::<Header>();

        // The checks run in this order on purpose. If the pointer (or
        // the claimed alignment) is bogus, the recovered header may be
        // misaligned, and reading its wider fields would trap on
        // strict-alignment targets; the magic decides whether the rest
        // of the header can be trusted at all.
        let magic = ptr::addr_of!((*header).magic).read_unaligned();
        let mut misc_error = false;
        let mut wrong_owner = false;
        let mut recorded_bytes = 0usize;
        if magic != ALLOCATED_MAGIC {
            misc_error = true;
        } else if ptr::addr_of!((*header).owner).read_unaligned() != self.id().as_usize() {
            misc_error = true;
            wrong_owner = true;
        } else {
            recorded_bytes = ptr::addr_of!((*header).bytes).read_unaligned();
        }

        // A block with corruption evidence may already have been freed,
        // and freed memory may have been scribbled by the upstream, so
        // the guard zones are only meaningful when the header is ours.
        let mut underrun_by = 0usize;
        let mut overrun_by = 0usize;
        let mut param_error = false;
        let mut recorded_alignment = 0usize;
        if !misc_error {
            recorded_alignment = ptr::addr_of!((*header).alignment).read_unaligned();
            underrun_by = scan_front_guard(base, layout.stride);
            if underrun_by == 0 {
                overrun_by = scan_trailing_guard(ptr.add(recorded_bytes));
            }
            if bytes != recorded_bytes || align != recorded_alignment {
                param_error = true;
            }
        }

        if misc_error || param_error || underrun_by != 0 || overrun_by != 0 {
            if misc_error {
                self.mismatches.fetch_add(1, Ordering::Relaxed);
            }
            if param_error {
                self.bad_deallocate_params.fetch_add(1, Ordering::Relaxed);
            }
            if underrun_by != 0 || overrun_by != 0 {
                self.bounds_errors.fetch_add(1, Ordering::Relaxed);
            }

            if self.is_quiet() {
                return Ok(());
            }

            let trailing_dump = if misc_error {
                None
            } else {
                Some(std::slice::from_raw_parts(ptr.add(recorded_bytes), GUARD_SIZE).to_vec())
            };
            let report = InvalidBlockReport {
                payload_address: ptr as usize,
                claimed_bytes: bytes,
                claimed_alignment: align,
                magic,
                wrong_owner,
                recorded_bytes: (!misc_error).then_some(recorded_bytes),
                recorded_alignment: (!misc_error).then_some(recorded_alignment),
                underrun_by,
                overrun_by,
                header_address: base as usize,
                header_dump: std::slice::from_raw_parts(base, layout.stride).to_vec(),
                payload_dump: std::slice::from_raw_parts(ptr, bytes.min(64)).to_vec(),
                trailing_dump,
            };
            let view = ResourceView {
                resource: self,
                list: &*self.list.as_ptr(),
            };
            self.reporter.on_invalid_block(&view, &report);

            if !self.is_no_abort() {
                std::process::abort();
            }
            // The block's ownership is no longer trustworthy; leak it
            // rather than hand corrupted memory back to the upstream.
            return Ok(());
        }

        let node = (*header).block;
        let index = (*header).index;
        {
            let list = &mut *self.list.as_ptr();
            list.remove(node, self.upstream);
        }

        self.last_deallocated_bytes
            .store(recorded_bytes, Ordering::Relaxed);
        self.last_deallocated_alignment
            .store(align, Ordering::Relaxed);
        self.last_deallocated_index.store(index, Ordering::Relaxed);
        self.blocks_in_use.fetch_sub(1, Ordering::Relaxed);
        self.bytes_in_use
            .fetch_sub(recorded_bytes as i64, Ordering::Relaxed);

        (*header).magic = DEALLOCATED_MAGIC;
        ptr::write_bytes(ptr, SCRIBBLE_BYTE, recorded_bytes);

        if self.is_verbose() {
            let view = ResourceView {
                resource: self,
                list: &*self.list.as_ptr(),
            };
            self.reporter.on_deallocation(&view);
        }

        let total = layout.stride + recorded_bytes + GUARD_SIZE;
        let _ = self
            .upstream
            .deallocate(base, total, layout.effective_align);
        Ok(())
    }
}

impl Drop for ProbeResource<'_> {
    fn drop(&mut self) {
        {
            let _guard = self.lock();
            if self.is_verbose() {
                let view = ResourceView {
                    resource: self,
                    list: unsafe { &*self.list.as_ptr() },
                };
                self.reporter.on_print(&view);
            }
            unsafe {
                let list = &mut *self.list.as_ptr();
                list.clear(self.upstream);
                let _ = self.upstream.deallocate(
                    self.list.as_ptr().cast::<u8>(),
                    mem::size_of::<BlockList>(),
                    mem::align_of::<BlockList>(),
                );
            }
        }
        // Leaked payloads are not reclaimed here; only their callers
        // know their addresses. The release event is where default
        // reporters complain (and abort, unless no-abort is set).
        if !self.is_quiet() {
            let empty = BlockList::new();
            let view = ResourceView {
                resource: self,
                list: &empty,
            };
            self.reporter.on_release(&view);
        }
    }
}

impl std::fmt::Debug for ProbeResource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeResource")
            .field("name", &self.name)
            .field("blocks_in_use", &self.blocks_in_use())
            .field("bytes_in_use", &self.bytes_in_use())
            .field("allocations", &self.allocations())
            .field("has_errors", &self.has_errors())
            .finish_non_exhaustive()
    }
}

/// Read-only window onto a [`ProbeResource`] handed to reporter
/// callbacks.
///
/// Reporter events fire while the resource's lock is held; the view
/// gives reporters the statistics accessors plus a walk over the
/// outstanding allocation indices without re-entering the lock.
pub struct ResourceView<'a> {
    resource: &'a ProbeResource<'a>,
    list: &'a BlockList,
}

impl<'a> ResourceView<'a> {
    pub fn resource(&self) -> &'a ProbeResource<'a> {
        self.resource
    }

    pub fn has_outstanding(&self) -> bool {
        !self.list.is_empty()
    }

    /// Visits the sequence number of every outstanding allocation,
    /// oldest first.
    pub fn visit_outstanding(&self, f: impl FnMut(i64)) {
        self.list.for_each_index(f);
    }

    /// Copies the current statistics into a serializable snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        let r = self.resource;
        StatsSnapshot {
            name: r.name().to_string(),
            allocations: r.allocations(),
            deallocations: r.deallocations(),
            blocks_in_use: r.blocks_in_use(),
            max_blocks: r.max_blocks(),
            total_blocks: r.total_blocks(),
            bytes_in_use: r.bytes_in_use(),
            max_bytes: r.max_bytes(),
            total_bytes: r.total_bytes(),
            mismatches: r.mismatches(),
            bounds_errors: r.bounds_errors(),
            bad_deallocate_params: r.bad_deallocate_params(),
        }
    }
}
