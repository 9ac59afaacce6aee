// Create / attach / teardown behaviour of ShmemQueue over real shared memory
mod common;

use std::ffi::CString;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{cleanup, fresh_name, value};
use serial_test::serial;
use shmemq::Core::SharedMemory::{resize, shm_create_exclusive};
use shmemq::Queue::Buffer::QueueHeader;
use shmemq::{QueueBuilder, QueueConfig, ShmemQueue, ShmemqError};

#[test]
#[serial]
fn bench_q_scenario() {
    cleanup("bench_q");
    let q = ShmemQueue::create_or_attach("bench_q", 4, 8).unwrap();
    assert!(q.created());
    assert_eq!(q.name(), "/bench_q");
    assert_eq!(q.max_size(), 32);

    for i in 1..=4 {
        assert!(q.try_enqueue(&value(i)));
    }
    assert!(!q.try_enqueue(&value(5)));
    assert_eq!(q.try_dequeue_vec().unwrap(), value(1));
    assert!(q.try_enqueue(&value(5)));
    for i in 2..=4 {
        assert_eq!(q.try_dequeue_vec().unwrap(), value(i));
    }
    assert_eq!(q.len(), 1);
    assert_eq!(q.try_dequeue_vec().unwrap(), value(5));
    assert!(q.try_dequeue_vec().is_none());

    q.destroy(true).unwrap();
}

#[test]
#[serial]
fn leading_slash_is_optional() {
    cleanup("bench_q");
    let a = ShmemQueue::create_or_attach("bench_q", 4, 8).unwrap();
    let b = ShmemQueue::create_or_attach("/bench_q", 4, 8).unwrap();
    assert!(a.created());
    assert!(!b.created());
    assert!(a.try_enqueue(&value(9)));
    assert_eq!(b.try_dequeue_vec().unwrap(), value(9));
    b.destroy(false).unwrap();
    a.destroy(true).unwrap();
}

#[test]
fn attach_reuses_existing_content() {
    let name = fresh_name("reuse");
    let q = ShmemQueue::create_or_attach(&name, 8, 8).unwrap();
    for i in 0..5 {
        assert!(q.try_enqueue(&value(i)));
    }
    q.destroy(false).unwrap();

    let q = ShmemQueue::create_or_attach(&name, 8, 8).unwrap();
    assert!(!q.created());
    assert_eq!(q.len(), 5);
    for i in 0..5 {
        assert_eq!(q.try_dequeue_vec().unwrap(), value(i));
    }
    assert!(q.is_empty());
    q.destroy(true).unwrap();
}

#[test]
fn unlink_gives_a_fresh_queue() {
    let name = fresh_name("unlink");
    let q = ShmemQueue::create_or_attach(&name, 4, 8).unwrap();
    assert!(q.try_enqueue(&value(1)));
    assert!(q.try_enqueue(&value(2)));
    q.destroy(true).unwrap();

    let q = ShmemQueue::create_or_attach(&name, 4, 8).unwrap();
    assert!(q.created());
    assert!(q.is_empty());
    assert!(q.try_dequeue_vec().is_none());
    q.destroy(true).unwrap();
}

#[test]
fn unlinked_segment_keeps_serving_existing_handles() {
    let name = fresh_name("orphan");
    let a = ShmemQueue::create_or_attach(&name, 4, 8).unwrap();
    let b = ShmemQueue::create_or_attach(&name, 4, 8).unwrap();
    assert!(ShmemQueue::unlink(&name).unwrap());
    assert!(!ShmemQueue::unlink(&name).unwrap());

    assert!(a.try_enqueue(&value(3)));
    assert_eq!(b.try_dequeue_vec().unwrap(), value(3));

    // a new create under the name no longer sees the old segment
    let c = ShmemQueue::create_or_attach(&name, 4, 8).unwrap();
    assert!(c.created());
    assert!(a.try_enqueue(&value(4)));
    assert!(c.is_empty());

    a.destroy(false).unwrap();
    b.destroy(false).unwrap();
    c.destroy(true).unwrap();
}

#[test]
fn mismatched_geometry_is_refused() {
    let name = fresh_name("geometry");
    let q = ShmemQueue::create_or_attach(&name, 4, 8).unwrap();

    let err = ShmemQueue::create_or_attach(&name, 4, 16).unwrap_err();
    assert!(
        matches!(
            err,
            ShmemqError::GeometryMismatch {
                expected_element_size: 16,
                found_element_size: 8,
                ..
            }
        ),
        "{err}"
    );
    let err = ShmemQueue::create_or_attach(&name, 5, 8).unwrap_err();
    assert!(
        matches!(
            err,
            ShmemqError::GeometryMismatch {
                expected_capacity: 5,
                found_capacity: 4,
                ..
            }
        ),
        "{err}"
    );

    // the refused attach left the queue alone
    assert!(q.try_enqueue(&value(1)));
    assert_eq!(q.try_dequeue_vec().unwrap(), value(1));
    q.destroy(true).unwrap();
}

#[test]
fn concurrent_create_has_one_creator() {
    let name = fresh_name("race");
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let name = name.clone();
            thread::spawn(move || {
                barrier.wait();
                ShmemQueue::create_or_attach(&name, 16, 8).unwrap()
            })
        })
        .collect();
    let queues: Vec<ShmemQueue> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(queues.iter().filter(|q| q.created()).count(), 1);
    for (i, q) in queues.iter().enumerate() {
        assert!(q.try_enqueue(&value(i as u64)));
    }
    for i in 0..threads {
        assert_eq!(queues[0].try_dequeue_vec().unwrap(), value(i as u64));
    }

    for q in queues {
        q.destroy(false).unwrap();
    }
    cleanup(&name);
}

#[test]
fn shared_handle_across_threads() {
    let name = fresh_name("threads");
    let q = Arc::new(ShmemQueue::create_or_attach(&name, 4, 8).unwrap());

    let producer = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            for i in 0..1_000 {
                assert!(q.enqueue_timeout(&value(i), Duration::from_secs(10)));
            }
        })
    };

    let mut out = [0u8; 8];
    for i in 0..1_000 {
        assert!(q.dequeue_timeout(&mut out, Duration::from_secs(10)));
        assert_eq!(out, value(i));
    }
    producer.join().unwrap();

    assert!(!q.dequeue_timeout(&mut out, Duration::from_millis(10)));
    assert!(!q.enqueue_timeout(&[0u8; 3], Duration::from_secs(10)));
    Arc::try_unwrap(q).unwrap().destroy(true).unwrap();
}

#[test]
fn builder_opens_queue() {
    let name = fresh_name("builder");
    let q = QueueBuilder::new()
        .with_name(name.clone())
        .with_capacity(3)
        .with_element_size(5)
        .with_attach_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    assert_eq!(q.capacity(), 3);
    assert_eq!(q.element_size(), 5);
    assert_eq!(q.config().attach_timeout(), Duration::from_millis(200));

    let dbg = format!("{q:?}");
    assert!(dbg.contains(&name), "{dbg}");
    assert!(dbg.contains("created: true"), "{dbg}");
    assert!(dbg.contains("handle: Fd("), "{dbg}");
    q.destroy(true).unwrap();
}

#[test]
fn uninitialized_segment_times_out() {
    // an object whose creator never finished: unsized, then sized but unpublished
    let name = fresh_name("stale");
    let c_name = CString::new(name.clone()).unwrap();
    let fd = shm_create_exclusive(&c_name).unwrap().unwrap();
    let config = QueueConfig::new(&name, 4, 8)
        .unwrap()
        .with_attach_timeout(Duration::from_millis(50));

    let err = ShmemQueue::create_or_attach_with(&config).unwrap_err();
    assert!(matches!(err, ShmemqError::AttachTimeout { .. }), "{err}");

    resize(&fd, config.segment_size()).unwrap();
    let err = ShmemQueue::create_or_attach_with(&config).unwrap_err();
    assert!(matches!(err, ShmemqError::AttachTimeout { .. }), "{err}");

    let io: std::io::Error = err.into();
    assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);

    // unlinking the wedged name lets the next caller start over
    assert!(ShmemQueue::unlink(&name).unwrap());
    let q = ShmemQueue::create_or_attach_with(&config).unwrap();
    assert!(q.created());
    assert!(q.try_enqueue(&value(1)));
    assert_eq!(q.try_dequeue_vec().unwrap(), value(1));
    drop(fd);
    q.destroy(true).unwrap();
}

#[test]
fn undersized_segment_is_refused() {
    let name = fresh_name("small");
    let c_name = CString::new(name.clone()).unwrap();
    let fd = shm_create_exclusive(&c_name).unwrap().unwrap();
    resize(&fd, QueueHeader::data_offset() / 2).unwrap();

    let err = ShmemQueue::create_or_attach(&name, 4, 8).unwrap_err();
    assert!(matches!(err, ShmemqError::SegmentTooSmall { .. }), "{err}");
    cleanup(&name);
}

#[test]
fn invalid_arguments_create_nothing() {
    assert!(matches!(
        ShmemQueue::create_or_attach("a/b", 4, 8),
        Err(ShmemqError::InvalidName { .. })
    ));
    let name = fresh_name("zero");
    assert!(matches!(
        ShmemQueue::create_or_attach(&name, 0, 8),
        Err(ShmemqError::InvalidConfig(_))
    ));
    // nothing was left behind under the name
    assert!(!ShmemQueue::unlink(&name).unwrap());
}
