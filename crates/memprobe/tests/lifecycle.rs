//! End-to-end allocation lifecycle scenarios: leaks, mismatched
//! deallocation parameters, double frees and guard-zone corruption.

mod common;

use common::RetainingResource;
use memprobe::{MemoryResource, ProbeResource, SCRIBBLE_BYTE};

fn probe(name: &str) -> ProbeResource<'static> {
    let probe = ProbeResource::new(name);
    probe.set_no_abort(true);
    probe
}

#[test]
fn leak_detection() {
    let tpmr = probe("s1");

    // Allocated through a wrapper that never frees.
    let ptr = tpmr.allocate(6, 1).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(b"foobar".as_ptr(), ptr.as_ptr(), 6) };

    assert!(tpmr.has_allocations());
    assert!(!tpmr.has_errors());
    assert_eq!(tpmr.status(), -1);
    assert_eq!(tpmr.bytes_in_use(), 6);
    assert_eq!(tpmr.blocks_in_use(), 1);
}

#[test]
fn alignment_mismatch_on_free() {
    let tpmr = probe("s2");

    // A C-string style off-by-one: six bytes requested, seven written
    // (the terminator lands in the trailing guard), then freed with the
    // wrong alignment.
    let ptr = tpmr.allocate(6, 1).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(b"foobar\0".as_ptr(), ptr.as_ptr(), 7) };
    unsafe { tpmr.deallocate(ptr.as_ptr(), 6, 2).unwrap() };

    assert!(tpmr.has_allocations());
    assert!(tpmr.has_errors());
    assert_eq!(tpmr.bounds_errors(), 1);
    assert_eq!(tpmr.bad_deallocate_params(), 1);
    // The block is not reclaimed once its bookkeeping is suspect.
    assert_eq!(tpmr.bytes_in_use(), 6);
    assert_eq!(tpmr.status(), 2);
}

#[test]
fn size_mismatch_on_free() {
    let tpmr = probe("s3");

    // Seven bytes allocated (six plus a terminator), six claimed on free.
    let ptr = tpmr.allocate(7, 1).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(b"foobar".as_ptr(), ptr.as_ptr(), 6) };
    unsafe { tpmr.deallocate(ptr.as_ptr(), 6, 1).unwrap() };

    assert!(tpmr.has_allocations());
    assert!(tpmr.has_errors());
    assert_eq!(tpmr.bad_deallocate_params(), 1);
    assert_eq!(tpmr.bounds_errors(), 0);
    assert_eq!(tpmr.bytes_in_use(), 7);
}

#[test]
fn double_free_is_a_mismatch() {
    let upstream = RetainingResource::new();
    let tpmr = ProbeResource::builder()
        .name("s4")
        .upstream(&upstream)
        .build();
    tpmr.set_no_abort(true);

    let ptr = tpmr.allocate(7, 1).unwrap();
    unsafe {
        tpmr.deallocate(ptr.as_ptr(), 7, 1).unwrap();
        tpmr.deallocate(ptr.as_ptr(), 7, 1).unwrap();
    }

    assert!(!tpmr.has_allocations());
    assert!(tpmr.has_errors());
    assert_eq!(tpmr.mismatches(), 1);
    assert_eq!(tpmr.bytes_in_use(), 0);
    assert_eq!(tpmr.status(), 1);
}

#[test]
fn freed_payloads_are_scribbled() {
    let upstream = RetainingResource::new();
    let tpmr = ProbeResource::builder()
        .name("scribble")
        .upstream(&upstream)
        .build();
    tpmr.set_no_abort(true);

    let ptr = tpmr.allocate(32, 8).unwrap();
    unsafe {
        std::ptr::write_bytes(ptr.as_ptr(), 0x11, 32);
        tpmr.deallocate(ptr.as_ptr(), 32, 8).unwrap();
        // The upstream quarantines freed blocks, so the bytes are still
        // there to inspect.
        let payload = std::slice::from_raw_parts(ptr.as_ptr(), 32);
        assert!(payload.iter().all(|&byte| byte == SCRIBBLE_BYTE));
    }
    assert_eq!(tpmr.status(), 0);
}

#[test]
fn overrun_into_the_trailing_guard() {
    let tpmr = probe("s5");

    let ptr = tpmr.allocate(6, 1).unwrap();
    // Third byte of the trailing guard.
    unsafe { *ptr.as_ptr().add(6 + 2) = 0x65 };
    unsafe { tpmr.deallocate(ptr.as_ptr(), 6, 1).unwrap() };

    assert_eq!(tpmr.bounds_errors(), 1);
    assert_eq!(tpmr.bad_deallocate_params(), 0);
    assert_eq!(tpmr.mismatches(), 0);
    assert_eq!(tpmr.bytes_in_use(), 6);
}

#[test]
fn underrun_into_the_front_guard() {
    let tpmr = probe("underrun");

    let ptr = tpmr.allocate(6, 1).unwrap();
    unsafe { *ptr.as_ptr().sub(4) = 0x65 };
    unsafe { tpmr.deallocate(ptr.as_ptr(), 6, 1).unwrap() };

    assert_eq!(tpmr.bounds_errors(), 1);
    assert_eq!(tpmr.bytes_in_use(), 6);
}

#[test]
fn cross_resource_free_is_a_mismatch() {
    let upstream = RetainingResource::new();
    let owner = ProbeResource::builder()
        .name("owner")
        .upstream(&upstream)
        .build();
    let stranger = ProbeResource::builder()
        .name("stranger")
        .upstream(&upstream)
        .build();
    owner.set_no_abort(true);
    stranger.set_no_abort(true);

    let ptr = owner.allocate(16, 8).unwrap();
    unsafe { stranger.deallocate(ptr.as_ptr(), 16, 8).unwrap() };

    assert_eq!(stranger.mismatches(), 1);
    assert_eq!(owner.mismatches(), 0);
    // The rightful owner still considers the block live and can
    // release it normally.
    assert_eq!(owner.bytes_in_use(), 16);
    unsafe { owner.deallocate(ptr.as_ptr(), 16, 8).unwrap() };
    assert_eq!(owner.status(), 0);
}

#[test]
fn probes_stack_on_each_other() {
    let base = probe("base");
    {
        let top = ProbeResource::builder().name("top").upstream(&base).build();
        top.set_no_abort(true);

        // The top resource's own bookkeeping (list storage) already
        // lives in `base`.
        assert!(base.blocks_in_use() > 0);

        let ptr = top.allocate(40, 8).unwrap();
        assert_eq!(top.bytes_in_use(), 40);
        // Payload block plus a list node on top of the list storage.
        assert_eq!(base.blocks_in_use(), 3);

        unsafe { top.deallocate(ptr.as_ptr(), 40, 8).unwrap() };
        assert_eq!(top.status(), 0);
    }
    assert_eq!(base.blocks_in_use(), 0);
    assert_eq!(base.status(), 0);
}

#[test]
fn well_paired_sequences_leave_status_clean() {
    let tpmr = probe("paired");
    let mut live = Vec::new();
    for round in 0..8usize {
        let bytes = 16 + round * 3;
        let ptr = tpmr.allocate(bytes, 8).unwrap();
        live.push((ptr, bytes));
        if round % 2 == 1 {
            let (ptr, bytes) = live.remove(0);
            unsafe { tpmr.deallocate(ptr.as_ptr(), bytes, 8).unwrap() };
        }
    }
    for (ptr, bytes) in live {
        unsafe { tpmr.deallocate(ptr.as_ptr(), bytes, 8).unwrap() };
    }
    assert!(!tpmr.has_allocations());
    assert!(!tpmr.has_errors());
    assert_eq!(tpmr.status(), 0);
    assert_eq!(tpmr.allocations(), 8);
    assert_eq!(tpmr.deallocations(), 8);
}
