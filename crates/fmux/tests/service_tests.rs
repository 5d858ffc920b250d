//! End-to-end service scenarios
//!
//! Exercises the public surface the way an embedding application would:
//! cross-thread posts, deadline-bounded runs, file reads and writes with
//! completion hooks, and cancellation.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fmux::{AsyncFile, Deadline, FmuxError, IoService, OpenMode, Transfer};

const DRAIN_LIMIT: Duration = Duration::from_secs(10);

fn service() -> IoService {
    IoService::new().expect("service construction")
}

/// Drives the service until `done` flips, with a hard wall-clock bound.
fn drain_until(service: &IoService, done: &Cell<bool>) {
    let start = Instant::now();
    while !done.get() {
        assert!(start.elapsed() < DRAIN_LIMIT, "service never completed");
        service.run().expect("run");
    }
}

#[test]
fn test_empty_run_returns_no_work() {
    let service = service();
    let start = Instant::now();
    assert!(!service.run().expect("run"));
    // Bookkeeping only; nothing should have blocked.
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_single_cross_thread_post() {
    let service = service();
    let slot = Arc::new(AtomicUsize::new(0));

    let cross = Arc::clone(&slot);
    thread::scope(|s| {
        let service = &service;
        s.spawn(move || {
            service.post(move |_| {
                cross.store(42, Ordering::SeqCst);
            });
        });
    });

    assert_eq!(service.outstanding_work(), 1);
    assert!(service.run().expect("first run"));
    assert_eq!(slot.load(Ordering::SeqCst), 42);
    assert!(!service.run().expect("second run"));
}

#[test]
fn test_thousand_cross_thread_posts() {
    let service = service();
    let counter = Arc::new(AtomicUsize::new(0));

    thread::scope(|s| {
        let service = &service;
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            s.spawn(move || {
                for _ in 0..250 {
                    let counter = Arc::clone(&counter);
                    service.post(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }
    });

    assert_eq!(service.outstanding_work(), 1000);
    let mut ticks = 0usize;
    while service.run().expect("run") {
        ticks += 1;
    }
    assert_eq!(ticks, 1000);
    assert_eq!(counter.load(Ordering::SeqCst), 1000);
    assert_eq!(service.outstanding_work(), 0);
}

#[test]
fn test_posts_keep_per_producer_order() {
    let service = service();
    let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    thread::scope(|s| {
        let service = &service;
        for producer in 0..2 {
            let seen = Arc::clone(&seen);
            s.spawn(move || {
                for seq in 0..100 {
                    let seen = Arc::clone(&seen);
                    service.post(move |_| {
                        seen.lock().unwrap().push((producer, seq));
                    });
                }
            });
        }
    });

    while service.run().expect("run") {}

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 200);
    for producer in 0..2 {
        let sequence: Vec<usize> = seen
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(sequence, (0..100).collect::<Vec<_>>(), "producer {producer} reordered");
    }
}

#[test]
fn test_deadline_expires_on_idle_service() {
    let service = service();
    let start = Instant::now();
    let err = service
        .run_until(Deadline::relative(Duration::from_millis(50)))
        .expect_err("deadline should expire");
    let elapsed = start.elapsed();

    assert!(matches!(err, FmuxError::TimedOut { .. }), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(50), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "overslept: {elapsed:?}");
}

#[test]
fn test_post_interrupts_deadline_wait() {
    let service = service();
    let hit = Arc::new(AtomicUsize::new(0));

    thread::scope(|s| {
        let service = &service;
        let cross = Arc::clone(&hit);
        s.spawn(move || {
            thread::sleep(Duration::from_millis(100));
            service.post(move |_| {
                cross.store(1, Ordering::SeqCst);
            });
        });

        let start = Instant::now();
        let progressed = service
            .run_until(Deadline::relative(Duration::from_secs(5)))
            .expect("run_until");
        assert!(progressed);
        assert!(start.elapsed() < Duration::from_secs(5));
    });

    assert_eq!(hit.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wrong_thread_is_refused() {
    let service = service();
    service.post(|_| {});

    thread::scope(|s| {
        let service = &service;
        let joined = s.spawn(move || service.run()).join().expect("join");
        assert!(matches!(joined.unwrap_err(), FmuxError::WrongThread));
    });

    // The foreign call must not have consumed the post.
    assert_eq!(service.outstanding_work(), 1);
    assert!(service.run().expect("run"));
}

#[test]
fn test_malformed_deadline_is_rejected() {
    let err = Deadline::from_parts(true, 1, 1_000_000_000).unwrap_err();
    assert!(matches!(err, FmuxError::InvalidDeadline { .. }));
}

fn write_fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut fixture = tempfile::NamedTempFile::new().expect("temp file");
    fixture.write_all(bytes).expect("fixture write");
    fixture.flush().expect("fixture flush");
    fixture
}

#[test]
fn test_read_completion_delivers_file_contents() {
    let contents: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let fixture = write_fixture(&contents);

    let service = service();
    let file = AsyncFile::open(&service, fixture.path(), OpenMode::Read).expect("open");
    assert_eq!(file.length().expect("length"), 4096);

    let done = Rc::new(Cell::new(false));
    let result: Rc<RefCell<Option<Transfer>>> = Rc::new(RefCell::new(None));
    let (seen, slot) = (done.clone(), result.clone());
    file.begin_read(0, vec![vec![0u8; 4096]], move |outcome| {
        *slot.borrow_mut() = Some(outcome.expect("read outcome"));
        seen.set(true);
    })
    .expect("begin_read");

    drain_until(&service, &done);

    let transfer = result.borrow_mut().take().expect("transfer");
    assert_eq!(transfer.total(), 4096);
    assert_eq!(transfer.buffers[0], contents);
    assert_eq!(service.outstanding_work(), 0);
    assert!(!service.run().expect("drained"));
}

#[test]
fn test_scatter_read_splits_across_buffers() {
    let contents: Vec<u8> = (0..2048u32).map(|i| (i % 239) as u8).collect();
    let fixture = write_fixture(&contents);

    let service = service();
    let file = AsyncFile::open(&service, fixture.path(), OpenMode::Read).expect("open");

    let done = Rc::new(Cell::new(false));
    let result: Rc<RefCell<Option<Transfer>>> = Rc::new(RefCell::new(None));
    let (seen, slot) = (done.clone(), result.clone());
    file.begin_read(0, vec![vec![0u8; 1024], vec![0u8; 1024]], move |outcome| {
        *slot.borrow_mut() = Some(outcome.expect("read outcome"));
        seen.set(true);
    })
    .expect("begin_read");

    drain_until(&service, &done);

    let transfer = result.borrow_mut().take().expect("transfer");
    assert_eq!(transfer.bytes, vec![1024, 1024]);
    assert_eq!(transfer.buffers[0], contents[..1024]);
    assert_eq!(transfer.buffers[1], contents[1024..]);
}

#[test]
fn test_write_then_truncate_round_trip() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("scratch.bin");

    let service = service();
    let file = AsyncFile::open(&service, &path, OpenMode::CreateTruncate).expect("open");

    let done = Rc::new(Cell::new(false));
    let seen = done.clone();
    file.begin_write(0, vec![b"hello, multiplexer".to_vec()], move |outcome| {
        let transfer = outcome.expect("write outcome");
        assert_eq!(transfer.total(), 18);
        seen.set(true);
    })
    .expect("begin_write");

    drain_until(&service, &done);

    assert_eq!(file.length().expect("length"), 18);
    assert_eq!(file.truncate(5).expect("truncate"), 5);
    assert_eq!(file.length().expect("length after truncate"), 5);
    assert_eq!(std::fs::read(&path).expect("readback"), b"hello");
}

#[test]
fn test_cancel_completes_exactly_once() {
    let contents = vec![7u8; 64 * 1024];
    let fixture = write_fixture(&contents);

    let service = service();
    let file = AsyncFile::open(&service, fixture.path(), OpenMode::Read).expect("open");

    let fired = Rc::new(Cell::new(0u32));
    let outcome_was_cancel = Rc::new(Cell::new(false));
    let (count, cancelled) = (fired.clone(), outcome_was_cancel.clone());
    let request = file
        .begin_read(0, vec![vec![0u8; 64 * 1024]], move |outcome| {
            count.set(count.get() + 1);
            match outcome {
                Err(FmuxError::Cancelled) => cancelled.set(true),
                Err(e) => panic!("unexpected completion error: {e:?}"),
                Ok(_) => {}
            }
        })
        .expect("begin_read");

    // Race the kernel: either the cancel wins or the read finishes first.
    request.cancel().expect("cancel");

    let start = Instant::now();
    while !request.is_done() {
        assert!(start.elapsed() < DRAIN_LIMIT, "request never completed");
        service.run().expect("run");
    }
    // A few extra ticks must not re-fire the hook.
    assert!(!service.run().expect("drained"));
    assert_eq!(fired.get(), 1);
    assert_eq!(service.outstanding_work(), 0);
    // Either outcome is legal; the hook firing once is the contract.
    let _ = outcome_was_cancel.get();
}

#[cfg(unix)]
#[test]
fn test_kqueues_reserved_and_locked_after_submission() {
    let fixture = write_fixture(&[1, 2, 3, 4]);

    let service = service();
    assert!(!service.using_kqueues());
    service.disable_kqueues().expect("disable before I/O");

    let file = AsyncFile::open(&service, fixture.path(), OpenMode::Read).expect("open");
    let done = Rc::new(Cell::new(false));
    let seen = done.clone();
    file.begin_read(0, vec![vec![0u8; 4]], move |outcome| {
        outcome.expect("read outcome");
        seen.set(true);
    })
    .expect("begin_read");

    let err = service.disable_kqueues().unwrap_err();
    assert!(matches!(err, FmuxError::InvalidState { .. }));

    drain_until(&service, &done);
}
