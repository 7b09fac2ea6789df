// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::poll;
use parking_lot::Mutex;
use tokio::time::Instant;

use coraldb_reader_semaphore::{
    far_future, make_tracked_file, Error, EvictReason, FileBuffer, PermitState, Reader,
    ReaderConcurrencySemaphore, ReaderPermit, ReadableFile, ReaderResources, Schema, SchemaRef,
};

const MIB: i64 = 1024 * 1024;

fn far() -> Instant {
    far_future()
}

fn new_sem(count: i32, memory: i64) -> ReaderConcurrencySemaphore {
    ReaderConcurrencySemaphore::new(count, memory, "test", 100, u32::MAX, u32::MAX)
}

/// Spins until `cond` holds, yielding to let background tasks run.
async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

struct MockReader {
    permit: ReaderPermit,
    schema: SchemaRef,
    closed: Arc<AtomicBool>,
}

impl MockReader {
    fn new(permit: ReaderPermit, schema: SchemaRef) -> (Box<Self>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Box::new(Self {
                permit,
                schema,
                closed: closed.clone(),
            }),
            closed,
        )
    }
}

#[async_trait]
impl Reader for MockReader {
    fn permit(&self) -> ReaderPermit {
        self.permit.clone()
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn simple_admission() {
    let sem = new_sem(2, 2 * MIB);

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let b = sem.obtain_permit(None, "b", 0, far()).await.unwrap();
    assert_eq!(a.state(), PermitState::ActiveUnused);
    assert_eq!(sem.available_resources(), ReaderResources::new(0, 2 * MIB));

    a.mark_used();
    b.mark_used();
    assert_eq!(a.state(), PermitState::ActiveUsed);
    assert_eq!(sem.stats().used_permits, 2);

    a.mark_unused();
    b.mark_unused();
    assert_eq!(sem.stats().used_permits, 0);

    drop(a);
    drop(b);
    let stats = sem.stats();
    assert_eq!(stats.current_permits, 0);
    assert_eq!(stats.reads_admitted, 2);
    assert_eq!(sem.available_resources(), ReaderResources::new(2, 2 * MIB));

    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_mark_used_pairs_are_idempotent() {
    let sem = new_sem(2, MIB);
    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();

    for _ in 0..3 {
        a.mark_used();
        a.mark_used();
        assert_eq!(sem.stats().used_permits, 1);
        a.mark_unused();
        assert_eq!(sem.stats().used_permits, 1);
        a.mark_unused();
        assert_eq!(sem.stats().used_permits, 0);
    }

    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn blocked_implies_used() {
    let sem = new_sem(2, MIB);
    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();

    // Blocking an unused permit does not count it anywhere yet.
    a.mark_blocked();
    assert_eq!(a.state(), PermitState::ActiveUnused);
    assert_eq!(sem.stats().blocked_permits, 0);

    // Marking it used surfaces both counts.
    a.mark_used();
    assert_eq!(a.state(), PermitState::ActiveBlocked);
    let stats = sem.stats();
    assert_eq!(stats.used_permits, 1);
    assert_eq!(stats.blocked_permits, 1);
    assert!(stats.used_permits >= stats.blocked_permits);

    a.mark_unblocked();
    assert_eq!(a.state(), PermitState::ActiveUsed);
    a.mark_unused();
    assert_eq!(a.state(), PermitState::ActiveUnused);

    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn queue_and_timeout() {
    let sem = new_sem(1, MIB);

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();

    let deadline = Instant::now() + Duration::from_millis(50);
    let err = sem
        .obtain_permit(None, "b", 0, deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    // The holder is untouched.
    assert_eq!(a.state(), PermitState::ActiveUnused);
    assert_eq!(sem.available_resources(), ReaderResources::new(0, MIB));
    let stats = sem.stats();
    assert_eq!(stats.reads_enqueued_for_admission, 1);
    assert_eq!(stats.reads_admitted, 1);
    assert_eq!(stats.current_permits, 1);

    drop(a);
    sem.stop().await;
    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB));
}

#[tokio::test(start_paused = true)]
async fn admission_waits_for_used_permits_to_stall() {
    let sem = Arc::new(new_sem(2, MIB));

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    a.mark_used();

    // Count and memory are available, but a used permit is making progress,
    // so the new read must wait.
    let waiter = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.obtain_permit(None, "b", 0, far()).await })
    };
    {
        let sem = sem.clone();
        eventually(move || sem.stats().reads_enqueued_for_admission == 1).await;
    }
    assert!(!waiter.is_finished());

    // Once every used permit is blocked on I/O, the read is admitted.
    a.mark_blocked();
    let b = waiter.await.unwrap().unwrap();
    assert_eq!(b.state(), PermitState::ActiveUnused);

    a.mark_unblocked();
    a.mark_unused();
    drop(a);
    drop(b);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn inactive_read_evicted_for_admission() {
    let sem = Arc::new(new_sem(1, MIB));
    let schema = Schema::new("ks", "t");

    let a = sem
        .obtain_permit(Some(schema.clone()), "a", 0, far())
        .await
        .unwrap();
    let (reader, closed) = MockReader::new(a.clone(), schema.clone());
    let evicted_as = Arc::new(Mutex::new(None));

    let handle = sem.register_inactive_read(reader);
    assert!(handle.is_attached());
    assert_eq!(a.state(), PermitState::Inactive);
    assert_eq!(sem.stats().inactive_reads, 1);

    {
        let evicted_as = evicted_as.clone();
        sem.set_notify_handler(
            &handle,
            move |reason| {
                *evicted_as.lock() = Some(reason);
            },
            None,
        );
    }

    // The new read needs the count the parked read holds.
    let b = sem
        .obtain_permit(Some(schema.clone()), "b", 0, far())
        .await
        .unwrap();

    {
        let closed = closed.clone();
        eventually(move || closed.load(Ordering::SeqCst)).await;
    }
    assert_eq!(a.state(), PermitState::Evicted);
    assert_eq!(*evicted_as.lock(), Some(EvictReason::Permit));
    let stats = sem.stats();
    assert_eq!(stats.permit_based_evictions, 1);
    assert_eq!(stats.inactive_reads, 0);
    assert_eq!(stats.reads_admitted, 2);

    drop(b);
    drop(a);
    drop(handle);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn readmission_after_eviction() {
    let sem = Arc::new(new_sem(1, MIB));
    let schema = Schema::new("ks", "t");

    let a = sem
        .obtain_permit(Some(schema.clone()), "a", 0, far())
        .await
        .unwrap();
    let (reader, _closed) = MockReader::new(a.clone(), schema.clone());
    let _handle = sem.register_inactive_read(reader);

    let b = sem
        .obtain_permit(Some(schema), "b", 0, far())
        .await
        .unwrap();
    assert!(a.needs_readmission());

    drop(b);
    a.wait_readmission().await.unwrap();
    assert_eq!(a.state(), PermitState::ActiveUnused);
    assert_eq!(sem.available_resources(), ReaderResources::new(0, MIB));

    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn registration_with_waiters_evicts_immediately() {
    let sem = Arc::new(new_sem(1, MIB));
    let schema = Schema::new("ks", "t");

    let a = sem
        .obtain_permit(Some(schema.clone()), "a", 0, far())
        .await
        .unwrap();
    let waiter = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.obtain_permit(None, "b", 0, far()).await })
    };
    {
        let sem = sem.clone();
        eventually(move || sem.stats().reads_enqueued_for_admission == 1).await;
    }

    // With a waiter queued the reader is not cached: it is evicted on the
    // spot and its resources admit the waiter.
    let (reader, closed) = MockReader::new(a.clone(), schema);
    let handle = sem.register_inactive_read(reader);
    assert!(!handle.is_attached());
    assert_eq!(a.state(), PermitState::Evicted);

    let b = waiter.await.unwrap().unwrap();
    {
        let closed = closed.clone();
        eventually(move || closed.load(Ordering::SeqCst)).await;
    }
    assert_eq!(sem.stats().permit_based_evictions, 1);
    assert_eq!(sem.stats().inactive_reads, 0);

    drop(b);
    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn memory_serialization() {
    // Serialize limit: 1 MiB * 2 = 2 MiB, kill limit disabled.
    let sem = ReaderConcurrencySemaphore::new(8, MIB, "test", 100, 2, u32::MAX);

    let mut permits = Vec::new();
    for i in 0..7 {
        permits.push(
            sem.obtain_permit(None, format!("p{i}"), 0, far())
                .await
                .unwrap(),
        );
    }

    let chunk: u64 = 400 * 1024;
    // The first four stay under the serialize limit (three on free memory,
    // one on over-commit below the limit).
    let u1 = permits[0].request_memory(chunk).await.unwrap();
    let u2 = permits[1].request_memory(chunk).await.unwrap();
    let u3 = permits[2].request_memory(chunk).await.unwrap();
    let u4 = permits[3].request_memory(chunk).await.unwrap();
    // The fifth crosses the limit and becomes the blessed permit.
    let u5 = permits[4].request_memory(chunk).await.unwrap();

    {
        // Everyone else queues.
        let mut f6 = std::pin::pin!(permits[5].request_memory(chunk));
        assert!(poll!(f6.as_mut()).is_pending());
        let mut f7 = std::pin::pin!(permits[6].request_memory(chunk));
        assert!(poll!(f7.as_mut()).is_pending());
        assert_eq!(sem.stats().reads_enqueued_for_memory, 2);

        // Returning the blessed permit's memory drains the queue in FIFO
        // order.
        drop(u5);
        let u6 = match poll!(f6.as_mut()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("front memory waiter was not granted"),
        };
        assert!(poll!(f7.as_mut()).is_pending());

        drop(u6);
        let u7 = match poll!(f7.as_mut()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("second memory waiter was not granted"),
        };
        drop(u7);
    }

    drop(u1);
    drop(u2);
    drop(u3);
    drop(u4);
    drop(permits);
    sem.stop().await;
    assert_eq!(sem.available_resources(), ReaderResources::new(8, MIB));
}

#[tokio::test(start_paused = true)]
async fn blessed_permit_destruction_drains_memory_queue() {
    // Serialize limit: 1 MiB * 2 = 2 MiB, kill limit disabled.
    let sem = ReaderConcurrencySemaphore::new(3, MIB, "test", 100, 2, u32::MAX);

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let b = sem.obtain_permit(None, "b", 0, far()).await.unwrap();
    let c = sem.obtain_permit(None, "c", 0, far()).await.unwrap();

    // Pin memory well past the serialize limit; consume() only enforces the
    // kill limit, which is disabled here.
    let pinned = c.consume_memory(3 * MIB as u64).unwrap();

    // First requester past the limit gets blessed, second queues.
    let ua = a.request_memory(10 * 1024).await.unwrap();
    {
        let mut fb = std::pin::pin!(b.request_memory(10 * 1024));
        assert!(poll!(fb.as_mut()).is_pending());

        // Returning the blessed permit's units is not enough: the blessed
        // slot is only cleared when the permit itself goes away.
        drop(ua);
        assert!(poll!(fb.as_mut()).is_pending());

        drop(a);
        let ub = match poll!(fb.as_mut()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("memory waiter not granted after blessed permit destruction"),
        };
        drop(ub);
    }

    drop(pinned);
    drop(b);
    drop(c);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn coalesced_memory_requests_share_one_grant() {
    // Serialize limit: 64 KiB * 1 = 64 KiB.
    let sem = ReaderConcurrencySemaphore::new(2, 64 * 1024, "test", 100, 1, u32::MAX);

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let b = sem.obtain_permit(None, "b", 0, far()).await.unwrap();

    let ua1 = a.request_memory(100 * 1024).await.unwrap();
    let ua2 = a.request_memory(10 * 1024).await.unwrap();

    {
        let mut fb1 = std::pin::pin!(b.request_memory(5 * 1024));
        assert!(poll!(fb1.as_mut()).is_pending());
        let mut fb2 = std::pin::pin!(b.request_memory(7 * 1024));
        assert!(poll!(fb2.as_mut()).is_pending());
        // The second request coalesced with the first.
        assert_eq!(sem.stats().reads_enqueued_for_memory, 1);
        assert_eq!(b.state(), PermitState::WaitingForMemory);

        // Freeing memory grants the coalesced requests together.
        drop(ua1);
        let ub1 = match poll!(fb1.as_mut()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("coalesced waiter not granted"),
        };
        let ub2 = match poll!(fb2.as_mut()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("coalesced waiter not granted"),
        };
        assert_eq!(
            b.consumed_resources(),
            ReaderResources::new(1, (5 + 7) * 1024)
        );

        drop(ub1);
        drop(ub2);
    }

    drop(ua2);
    drop(a);
    drop(b);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn kill_limit_fails_consume_and_counts_once() {
    // Kill limit: 1 MiB * 4 = 4 MiB.
    let sem = ReaderConcurrencySemaphore::new(1, MIB, "test", 100, u32::MAX, 4);

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let units = a.consume_memory(4 * MIB as u64).unwrap();

    let err = a.consume_memory(1).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { .. }));
    assert_eq!(sem.stats().total_reads_killed_due_to_kill_limit, 1);

    // Repeat kills on the same permit are not re-counted.
    let err = a.consume_memory(1).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { .. }));
    assert_eq!(sem.stats().total_reads_killed_due_to_kill_limit, 1);

    drop(units);
    drop(a);
    sem.stop().await;
    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB));
}

#[tokio::test(start_paused = true)]
async fn per_table_eviction() {
    let sem = Arc::new(new_sem(10, 10 * MIB));
    let t1 = Schema::new("ks", "t1");
    let t2 = Schema::new("ks", "t2");

    let p1 = sem
        .obtain_permit(Some(t1.clone()), "r1", 0, far())
        .await
        .unwrap();
    let p2 = sem
        .obtain_permit(Some(t2.clone()), "r2", 0, far())
        .await
        .unwrap();
    let p3 = sem
        .obtain_permit(Some(t1.clone()), "r3", 0, far())
        .await
        .unwrap();

    let (r1, c1) = MockReader::new(p1.clone(), t1.clone());
    let (r2, c2) = MockReader::new(p2.clone(), t2.clone());
    let (r3, c3) = MockReader::new(p3.clone(), t1.clone());
    let _h1 = sem.register_inactive_read(r1);
    let _h2 = sem.register_inactive_read(r2);
    let _h3 = sem.register_inactive_read(r3);
    assert_eq!(sem.stats().inactive_reads, 3);

    sem.evict_inactive_reads_for_table(t1.id()).await;

    assert!(c1.load(Ordering::SeqCst));
    assert!(!c2.load(Ordering::SeqCst));
    assert!(c3.load(Ordering::SeqCst));
    assert_eq!(p1.state(), PermitState::Evicted);
    assert_eq!(p2.state(), PermitState::Inactive);
    assert_eq!(p3.state(), PermitState::Evicted);
    let stats = sem.stats();
    assert_eq!(stats.inactive_reads, 1);
    // Manual evictions do not count as permit- or time-based.
    assert_eq!(stats.permit_based_evictions, 0);
    assert_eq!(stats.time_based_evictions, 0);

    drop(p1);
    drop(p2);
    drop(p3);
    sem.stop().await;
    assert!(c2.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn ttl_evicts_inactive_read() {
    let sem = Arc::new(new_sem(2, MIB));
    let schema = Schema::new("ks", "t");

    let a = sem
        .obtain_permit(Some(schema.clone()), "a", 0, far())
        .await
        .unwrap();
    let (reader, closed) = MockReader::new(a.clone(), schema);
    let handle = sem.register_inactive_read(reader);
    let evicted_as = Arc::new(Mutex::new(None));
    {
        let evicted_as = evicted_as.clone();
        sem.set_notify_handler(
            &handle,
            move |reason| {
                *evicted_as.lock() = Some(reason);
            },
            Some(Duration::from_secs(1)),
        );
    }

    tokio::time::advance(Duration::from_secs(2)).await;
    {
        let closed = closed.clone();
        eventually(move || closed.load(Ordering::SeqCst)).await;
    }
    assert_eq!(*evicted_as.lock(), Some(EvictReason::Time));
    assert_eq!(a.state(), PermitState::Evicted);
    let stats = sem.stats();
    assert_eq!(stats.time_based_evictions, 1);
    assert_eq!(stats.inactive_reads, 0);

    drop(a);
    drop(handle);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn register_unregister_round_trip() {
    let sem = new_sem(2, MIB);
    let schema = Schema::new("ks", "t");

    let a = sem
        .obtain_permit(Some(schema.clone()), "a", 0, far())
        .await
        .unwrap();
    let (reader, closed) = MockReader::new(a.clone(), schema);

    let handle = sem.register_inactive_read(reader);
    assert_eq!(a.state(), PermitState::Inactive);

    let reader = sem.unregister_inactive_read(handle).unwrap();
    let mut reader = reader.expect("read was not evicted");
    assert_eq!(a.state(), PermitState::ActiveUnused);
    assert_eq!(sem.stats().inactive_reads, 0);
    assert!(!closed.load(Ordering::SeqCst));

    reader.close().await;
    drop(reader);
    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unregister_with_foreign_handle_is_an_error() {
    let sem1 = Arc::new(ReaderConcurrencySemaphore::new(
        2,
        MIB,
        "sem1",
        100,
        u32::MAX,
        u32::MAX,
    ));
    let sem2 = ReaderConcurrencySemaphore::new(2, MIB, "sem2", 100, u32::MAX, u32::MAX);
    let schema = Schema::new("ks", "t");

    let a = sem1
        .obtain_permit(Some(schema.clone()), "a", 0, far())
        .await
        .unwrap();
    let (reader, closed) = MockReader::new(a.clone(), schema);
    let handle = sem1.register_inactive_read(reader);

    let err = match sem2.unregister_inactive_read(handle) {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(matches!(err, Error::WrongSemaphore { .. }));
    {
        let closed = closed.clone();
        eventually(move || closed.load(Ordering::SeqCst)).await;
    }
    assert_eq!(sem1.stats().inactive_reads, 0);

    drop(a);
    sem1.stop().await;
    sem2.stop().await;
}

#[tokio::test(start_paused = true)]
async fn queue_overload_sheds_reads() {
    let sem = Arc::new(ReaderConcurrencySemaphore::new(
        1,
        MIB,
        "test",
        2,
        u32::MAX,
        u32::MAX,
    ));

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let mut waiters = Vec::new();
    for i in 0..2 {
        let sem = sem.clone();
        waiters.push(tokio::spawn(async move {
            sem.obtain_permit(None, format!("w{i}"), 0, far()).await
        }));
    }
    {
        let sem = sem.clone();
        eventually(move || sem.stats().reads_enqueued_for_admission == 2).await;
    }

    let err = sem
        .obtain_permit(None, "overflow", 0, far())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueOverload { queue: "wait", .. }));
    assert_eq!(sem.stats().total_reads_shed_due_to_overload, 1);

    // The queued reads are served as the holder goes away.
    drop(a);
    let w0 = waiters.remove(0).await.unwrap().unwrap();
    drop(w0);
    let w1 = waiters.remove(0).await.unwrap().unwrap();
    drop(w1);

    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn large_read_admitted_when_no_reader_is_active() {
    let sem = new_sem(1, MIB);

    // Needs 16x the memory budget, but with no reader active it must be
    // admitted, or it could never run.
    let a = sem
        .obtain_permit(None, "big", 16 * MIB as u64, far())
        .await
        .unwrap();
    assert_eq!(
        sem.available_resources(),
        ReaderResources::new(0, MIB - 16 * MIB)
    );

    drop(a);
    sem.stop().await;
    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB));
}

#[tokio::test(start_paused = true)]
async fn stop_breaks_waiters() {
    let sem = Arc::new(new_sem(1, MIB));

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let mut waiters = Vec::new();
    for i in 0..3 {
        let sem = sem.clone();
        waiters.push(tokio::spawn(async move {
            sem.obtain_permit(None, format!("w{i}"), 0, far()).await
        }));
    }
    {
        let sem = sem.clone();
        eventually(move || sem.stats().reads_enqueued_for_admission == 3).await;
    }

    let stopper = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.stop().await })
    };

    for waiter in waiters {
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Stopped { .. })));
    }

    drop(a);
    stopper.await.unwrap();
    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB));

    // Acquisition after stop fails immediately.
    let err = sem.obtain_permit(None, "late", 0, far()).await.unwrap_err();
    assert!(matches!(err, Error::Stopped { .. }));
}

#[tokio::test(start_paused = true)]
async fn broken_fails_waiters() {
    let sem = Arc::new(new_sem(1, MIB));

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let waiter = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.obtain_permit(None, "w", 0, far()).await })
    };
    {
        let sem = sem.clone();
        eventually(move || sem.stats().reads_enqueued_for_admission == 1).await;
    }

    sem.broken(None);
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Broken { .. })));

    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_hooks_run_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let sem = {
        let pre = order.clone();
        let post = order.clone();
        new_sem(1, MIB)
            .with_pre_stop_hook(move || async move {
                pre.lock().push("pre");
            })
            .with_post_stop_hook(move || async move {
                post.lock().push("post");
            })
    };

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    drop(a);
    sem.stop().await;

    assert_eq!(*order.lock(), vec!["pre", "post"]);
}

#[tokio::test(start_paused = true)]
async fn execution_loop_runs_continuations_in_fifo_order() {
    let sem = Arc::new(new_sem(2, MIB));
    let order = Arc::new(Mutex::new(Vec::new()));

    let permit = sem.obtain_permit(None, "reads", 0, far()).await.unwrap();

    let order1 = order.clone();
    let mut f1 = std::pin::pin!(sem.with_ready_permit(permit.clone(), move |_permit| async move {
        order1.lock().push(1);
        Ok(())
    }));
    assert!(poll!(f1.as_mut()).is_pending());
    let order2 = order.clone();
    let mut f2 = std::pin::pin!(sem.with_ready_permit(permit.clone(), move |_permit| async move {
        order2.lock().push(2);
        Ok(())
    }));
    assert!(poll!(f2.as_mut()).is_pending());

    f1.as_mut().await.unwrap();
    f2.as_mut().await.unwrap();
    assert_eq!(*order.lock(), vec![1, 2]);

    drop(permit);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn with_permit_runs_the_read_and_routes_errors() {
    let sem = Arc::new(new_sem(2, MIB));
    let ran = Arc::new(AtomicBool::new(false));

    {
        let ran = ran.clone();
        sem.with_permit(None, "ok", 0, far(), move |permit| async move {
            let units = permit.consume_memory(1024)?;
            drop(units);
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    }
    assert!(ran.load(Ordering::SeqCst));

    // A failing continuation surfaces its error; the loop survives.
    let err = sem
        .with_permit(None, "fail", 0, far(), |_permit| async move {
            Err(anyhow::anyhow!("boom").into())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadFailed(_)));

    sem.with_permit(None, "after", 0, far(), |_permit| async move { Ok(()) })
        .await
        .unwrap();

    sem.stop().await;
    assert_eq!(sem.available_resources(), ReaderResources::new(2, MIB));
}

#[tokio::test(start_paused = true)]
async fn tracking_only_permit_skips_admission() {
    let sem = new_sem(1, MIB);

    // The only count is taken, yet a tracking permit can still be made.
    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let t = sem
        .make_tracking_only_permit(None, "tracking", far())
        .unwrap();
    assert_eq!(t.state(), PermitState::ActiveUnused);
    assert_eq!(t.base_resources(), ReaderResources::default());
    assert_eq!(sem.stats().reads_admitted, 1);

    let units = t.consume_memory(2048).unwrap();
    assert_eq!(t.consumed_resources(), ReaderResources::new(0, 2048));
    drop(units);
    assert_eq!(t.consumed_resources(), ReaderResources::default());

    drop(t);
    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn release_base_resources_keeps_permit_alive() {
    let sem = new_sem(1, MIB);

    let a = sem.obtain_permit(None, "a", 1024, far()).await.unwrap();
    assert_eq!(sem.available_resources(), ReaderResources::new(0, MIB - 1024));

    a.release_base_resources();
    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB));
    assert_eq!(a.state(), PermitState::ActiveUnused);

    // No double refund on drop.
    drop(a);
    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB));
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn leaked_resources_are_refunded_on_destruction() {
    let sem = new_sem(1, MIB);

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    // Consume without a matching signal; the destructor repairs the books.
    a.consume(ReaderResources::with_memory(4096)).unwrap();
    drop(a);

    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB));
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn consume_and_signal_move_in_step_with_the_semaphore() {
    let sem = new_sem(2, MIB);

    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    a.consume(ReaderResources::with_memory(1000)).unwrap();
    a.consume(ReaderResources::with_memory(500)).unwrap();
    assert_eq!(a.consumed_resources(), ReaderResources::new(1, 1500));
    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB - 1500));

    a.signal(ReaderResources::with_memory(1500));
    assert_eq!(a.consumed_resources(), ReaderResources::new(1, 0));
    assert_eq!(sem.available_resources(), ReaderResources::new(1, MIB));

    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn diagnostics_dump_lists_permits() {
    let sem = new_sem(4, 4 * MIB);
    let schema = Schema::new("ks", "t");

    let a = sem
        .obtain_permit(Some(schema.clone()), "scan", 0, far())
        .await
        .unwrap();
    let _units = a.consume_memory(2048).unwrap();
    let _t = sem
        .make_tracking_only_permit(None, "tracking", far())
        .unwrap();

    let dump = sem.dump_diagnostics(20);
    assert!(dump.starts_with("Semaphore test with"));
    assert!(dump.contains("ks.t/scan/active/unused"));
    assert!(dump.contains("*.*/tracking/active/unused"));
    assert!(dump.contains("\ttotal"));

    drop(_units);
    drop(_t);
    drop(a);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn foreach_permit_sees_every_permit() {
    let sem = new_sem(4, MIB);
    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();
    let b = sem.obtain_permit(None, "b", 0, far()).await.unwrap();

    let mut names = Vec::new();
    sem.foreach_permit(|snapshot| names.push(snapshot.op_name.to_string()));
    names.sort();
    assert_eq!(names, vec!["a", "b"]);

    drop(a);
    drop(b);
    sem.stop().await;
}

struct MockFile {
    data: Bytes,
}

#[async_trait]
impl ReadableFile for MockFile {
    async fn read_bulk(&self, offset: u64, range_size: usize) -> io::Result<FileBuffer> {
        let start = offset as usize;
        Ok(FileBuffer::untracked(self.data.slice(start..start + range_size)))
    }

    async fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn tracked_file_charges_reads_to_the_permit() {
    let sem = ReaderConcurrencySemaphore::new_unlimited("test");
    assert!(sem.is_unlimited());

    let permit = sem.obtain_permit(None, "scan", 0, far()).await.unwrap();
    let file = make_tracked_file(
        MockFile {
            data: Bytes::from_static(b"0123456789"),
        },
        permit.clone(),
    );

    let buffer = file.read_bulk(2, 3).await.unwrap();
    assert_eq!(&*buffer, b"234");
    assert_eq!(permit.consumed_resources(), ReaderResources::new(1, 3));

    // Dropping the buffer releases the charge.
    drop(buffer);
    assert_eq!(permit.consumed_resources(), ReaderResources::new(1, 0));

    assert_eq!(file.size().await.unwrap(), 10);
    file.close().await.unwrap();

    drop(file);
    drop(permit);
    sem.stop().await;
}

#[tokio::test(start_paused = true)]
async fn sstable_read_accounting() {
    let sem = new_sem(2, MIB);
    let a = sem.obtain_permit(None, "a", 0, far()).await.unwrap();

    a.on_start_sstable_read();
    a.on_start_sstable_read();
    let stats = sem.stats();
    assert_eq!(stats.sstables_read, 2);
    assert_eq!(stats.disk_reads, 1);

    a.on_finish_sstable_read();
    let stats = sem.stats();
    assert_eq!(stats.sstables_read, 1);
    assert_eq!(stats.disk_reads, 1);

    a.on_finish_sstable_read();
    let stats = sem.stats();
    assert_eq!(stats.sstables_read, 0);
    assert_eq!(stats.disk_reads, 0);

    drop(a);
    sem.stop().await;
}
