//! Concurrent use of a shared probe resource.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use memprobe::{MemoryResource, NullReporter, ProbeResource};

fn shared_probe(name: &str) -> ProbeResource<'static> {
    let probe = ProbeResource::builder()
        .name(name)
        .reporter(Arc::new(NullReporter))
        .build();
    probe.set_no_abort(true);
    probe
}

#[test]
fn parallel_allocate_free_keeps_the_books_straight() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let probe = shared_probe("parallel");

    thread::scope(|scope| {
        for thread_index in 0..THREADS {
            let probe = &probe;
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    let bytes = 1 + (thread_index * 31 + round) % 97;
                    let ptr = probe.allocate(bytes, 8).unwrap();
                    unsafe {
                        std::ptr::write_bytes(ptr.as_ptr(), thread_index as u8, bytes);
                        probe.deallocate(ptr.as_ptr(), bytes, 8).unwrap();
                    }
                }
            });
        }
    });

    assert_eq!(probe.allocations(), (THREADS * ROUNDS) as i64);
    assert_eq!(probe.deallocations(), (THREADS * ROUNDS) as i64);
    assert_eq!(probe.blocks_in_use(), 0);
    assert_eq!(probe.bytes_in_use(), 0);
    assert!(!probe.has_errors());
    assert_eq!(probe.status(), 0);
}

struct SendBlock {
    ptr: *mut u8,
    bytes: usize,
}

// Raw block handles cross threads through the channel below; the
// resource itself is Sync and every block is freed exactly once.
unsafe impl Send for SendBlock {}

#[test]
fn blocks_may_be_freed_on_another_thread() {
    const BLOCKS: usize = 500;

    let probe = shared_probe("cross-thread");
    let (tx, rx) = bounded::<SendBlock>(16);

    thread::scope(|scope| {
        let producer_probe = &probe;
        scope.spawn(move || {
            for index in 0..BLOCKS {
                let bytes = 1 + index % 61;
                let ptr = producer_probe.allocate(bytes, 16).unwrap();
                tx.send(SendBlock {
                    ptr: ptr.as_ptr(),
                    bytes,
                })
                .unwrap();
            }
            drop(tx);
        });

        let consumer_probe = &probe;
        scope.spawn(move || {
            for block in rx.iter() {
                unsafe {
                    consumer_probe
                        .deallocate(block.ptr, block.bytes, 16)
                        .unwrap();
                }
            }
        });
    });

    assert_eq!(probe.allocations(), BLOCKS as i64);
    assert_eq!(probe.blocks_in_use(), 0);
    assert_eq!(probe.bytes_in_use(), 0);
    assert_eq!(probe.status(), 0);
}

#[test]
fn relaxed_readers_do_not_need_the_lock() {
    let probe = shared_probe("readers");

    thread::scope(|scope| {
        let writer_probe = &probe;
        let writer = scope.spawn(move || {
            for _ in 0..100 {
                let ptr = writer_probe.allocate(64, 8).unwrap();
                unsafe { writer_probe.deallocate(ptr.as_ptr(), 64, 8).unwrap() };
            }
        });

        let reader_probe = &probe;
        scope.spawn(move || {
            // Statistics reads are plain atomic loads, eventually
            // consistent with the structural state. Each individual
            // counter still only takes sane values.
            let mut last_total = 0;
            while !writer.is_finished() {
                let in_use = reader_probe.blocks_in_use();
                assert!((0..=1).contains(&in_use));
                let total = reader_probe.total_blocks();
                assert!(total >= last_total);
                last_total = total;
            }
        });
    });

    assert_eq!(probe.status(), 0);
}
