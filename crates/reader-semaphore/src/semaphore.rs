// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytestring::ByteString;
use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::diagnostics::{format_permit_diagnostics, DumpKind, DumpRateLimiter};
use crate::error::{Error, Result};
use crate::inactive::{DetachedRead, EvictReason, InactiveRead, InactiveReadHandle, NotifyHandler};
use crate::metric_definitions::{
    BLOCKED_PERMITS, CURRENT_PERMITS, DISK_READS, INACTIVE_READS, PERMIT_BASED_EVICTIONS,
    READS_ADMITTED, READS_ENQUEUED_FOR_ADMISSION, READS_ENQUEUED_FOR_MEMORY,
    READS_KILLED_DUE_TO_KILL_LIMIT, READS_SHED_DUE_TO_OVERLOAD, SSTABLES_READ,
    TIME_BASED_EVICTIONS, USED_PERMITS,
};
use crate::permit::{
    MaxResultSize, MemoryWait, PermitHandle, PermitId, PermitRecord, PermitSnapshot, PermitState,
    ReaderPermit,
};
use crate::reader::Reader;
use crate::resources::ReaderResources;

/// An `Instant` far enough in the future to act as a "no timeout" sentinel.
/// `tokio::time::Instant::far_future` is not public, so this mirrors it.
pub fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}
use crate::schema::{SchemaRef, TableId};
use crate::wait_list::{WaitEntry, WaitList};

/// A read continuation, scheduled through the ready list and driven by the
/// execution loop.
pub type ReadFunc = Box<dyn FnOnce(ReaderPermit) -> BoxFuture<'static, Result<()>> + Send>;

type StopHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct StopHooks {
    pre: Option<StopHook>,
    post: Option<StopHook>,
}

/// Counters kept by the semaphore. Snapshots are obtained with
/// [`ReaderConcurrencySemaphore::stats`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SemaphoreStats {
    pub total_permits: u64,
    pub current_permits: u64,
    pub reads_admitted: u64,
    pub reads_enqueued_for_admission: u64,
    pub reads_enqueued_for_memory: u64,
    pub used_permits: u64,
    pub blocked_permits: u64,
    pub inactive_reads: u64,
    pub permit_based_evictions: u64,
    pub time_based_evictions: u64,
    pub total_reads_killed_due_to_kill_limit: u64,
    pub total_reads_shed_due_to_overload: u64,
    pub sstables_read: u64,
    pub disk_reads: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CanAdmit {
    Yes,
    No,
    Maybe,
}

/// Waiter resolutions accumulated while the state lock is held.
///
/// Sending a resolution drops the wait entry, and dropping the entry can
/// drop the last handle of its permit, which re-enters the semaphore. So
/// resolutions are collected under the lock and delivered after it is
/// released.
#[must_use]
pub(crate) struct Completions(Vec<(WaitEntry, Result<()>)>);

impl Completions {
    fn none() -> Self {
        Self(Vec::new())
    }

    fn push(&mut self, entry: WaitEntry, result: Result<()>) {
        self.0.push((entry, result));
    }

    fn append(&mut self, mut other: Completions) {
        self.0.append(&mut other.0);
    }

    pub(crate) fn complete(self) {
        for (entry, result) in self.0 {
            let _ = entry.tx.send(result);
        }
    }
}

pub(crate) struct State {
    pub(crate) initial_resources: ReaderResources,
    pub(crate) resources: ReaderResources,
    stopped: bool,
    evicting: bool,
    blessed_permit: Option<PermitId>,
    next_permit_id: PermitId,
    next_inactive_seq: u64,
    pub(crate) permits: HashMap<PermitId, PermitRecord>,
    pub(crate) wait_list: WaitList,
    pub(crate) ready_list: VecDeque<WaitEntry>,
    pub(crate) inactive_reads: BTreeMap<u64, InactiveRead>,
    pub(crate) stats: SemaphoreStats,
    execution_loop: Option<JoinHandle<()>>,
    expiry_loop: Option<JoinHandle<()>>,
}

pub(crate) struct SemaphoreInner {
    me: Weak<SemaphoreInner>,
    pub(crate) name: String,
    max_queue_length: usize,
    serialize_limit_multiplier: AtomicU32,
    kill_limit_multiplier: AtomicU32,
    pub(crate) state: Mutex<State>,
    ready_list_signal: Notify,
    wait_list_signal: Notify,
    permit_gate: Notify,
    close_readers: TaskTracker,
    shutdown: CancellationToken,
    dump_rate_limiter: DumpRateLimiter,
    stop_hooks: Mutex<StopHooks>,
}

impl SemaphoreInner {
    fn arc(&self) -> Arc<SemaphoreInner> {
        self.me.upgrade().expect("semaphore inner is alive")
    }

    fn stopped_error(&self) -> Error {
        Error::Stopped {
            semaphore: self.name.clone(),
        }
    }

    fn is_unlimited(&self, st: &State) -> bool {
        st.initial_resources == ReaderResources::new(i32::MAX, i64::MAX)
    }

    fn limit(&self, st: &State, multiplier: u32) -> Option<i128> {
        if multiplier == 0 || multiplier == u32::MAX || self.is_unlimited(st) {
            return None;
        }
        Some(st.initial_resources.memory.max(0) as i128 * multiplier as i128)
    }

    fn serialize_limit(&self, st: &State) -> Option<i128> {
        self.limit(st, self.serialize_limit_multiplier.load(Ordering::Relaxed))
    }

    fn kill_limit(&self, st: &State) -> Option<i128> {
        self.limit(st, self.kill_limit_multiplier.load(Ordering::Relaxed))
    }

    fn consumed(st: &State) -> ReaderResources {
        st.initial_resources - st.resources
    }

    fn has_available_units(st: &State, base: &ReaderResources) -> bool {
        // Special case: with no reader active (based on count), admit one
        // regardless of memory, or a single large read could deadlock the
        // semaphore.
        (st.resources.non_zero() && st.resources.covers(base))
            || st.resources.count == st.initial_resources.count
    }

    fn all_used_permits_are_stalled(st: &State) -> bool {
        st.stats.used_permits == st.stats.blocked_permits
    }

    fn format_dump(&self, st: &State, problem: &str, max_lines: usize) -> String {
        format_permit_diagnostics(
            &self.name,
            st.initial_resources,
            st.resources,
            st.permits
                .values()
                .map(|r| (r.schema.clone(), r.op_name.clone(), r.state, r.resources)),
            problem,
            max_lines,
        )
    }

    fn maybe_dump_locked(&self, st: &State, kind: DumpKind, problem: &str) {
        if self.dump_rate_limiter.allow(kind) {
            info!("{}", self.format_dump(st, problem, 20));
        }
    }

    fn check_queue_size(&self, st: &mut State, queue: &'static str) -> Result<()> {
        if st.wait_list.len() + st.ready_list.len() >= self.max_queue_length {
            st.stats.total_reads_shed_due_to_overload += 1;
            counter!(READS_SHED_DUE_TO_OVERLOAD).increment(1);
            self.maybe_dump_locked(
                st,
                DumpKind::QueueOverload,
                &format!("{queue} queue overload"),
            );
            return Err(Error::QueueOverload {
                semaphore: self.name.clone(),
                queue,
            });
        }
        Ok(())
    }

    /// Charges `r` against the pool and the permit, killing the read when
    /// consumed memory would cross the kill limit.
    fn consume_locked(&self, st: &mut State, id: PermitId, r: ReaderResources) -> Result<()> {
        // Only consult the kill limit once the pool is exhausted; the common
        // case short-circuits.
        if st.resources.memory <= 0 {
            if let Some(limit) = self.kill_limit(st) {
                let consumed_memory = Self::consumed(st).memory as i128;
                if consumed_memory + r.memory as i128 >= limit {
                    let first_kill = st
                        .permits
                        .get_mut(&id)
                        .expect("live permits are registered")
                        .on_oom_kill();
                    if first_kill {
                        st.stats.total_reads_killed_due_to_kill_limit += 1;
                        counter!(READS_KILLED_DUE_TO_KILL_LIMIT).increment(1);
                    }
                    self.maybe_dump_locked(st, DumpKind::KillLimit, "kill limit triggered");
                    return Err(Error::OutOfMemory {
                        semaphore: self.name.clone(),
                    });
                }
            }
        }
        st.resources -= r;
        st.permits
            .get_mut(&id)
            .expect("live permits are registered")
            .resources += r;
        Ok(())
    }

    fn signal_locked(&self, st: &mut State, r: ReaderResources) -> Completions {
        st.resources += r;
        self.maybe_admit_waiters_locked(st)
    }

    fn can_admit_read(&self, st: &State, id: PermitId) -> CanAdmit {
        let state = st.permits[&id].state;

        if st.resources.memory < 0 {
            let consumed_memory = Self::consumed(st).memory as i128;
            if self.kill_limit(st).is_some_and(|limit| consumed_memory >= limit) {
                return CanAdmit::No;
            }
            if self
                .serialize_limit(st)
                .is_some_and(|limit| consumed_memory >= limit)
            {
                if st.blessed_permit.is_some() {
                    // The blessed permit is never in the wait list.
                    return CanAdmit::No;
                }
                return if state == PermitState::WaitingForMemory {
                    CanAdmit::Yes
                } else {
                    CanAdmit::No
                };
            }
        }

        if state == PermitState::WaitingForMemory {
            return CanAdmit::Yes;
        }

        if !st.ready_list.is_empty() {
            return CanAdmit::No;
        }

        if !Self::all_used_permits_are_stalled(st) {
            return CanAdmit::No;
        }

        if !Self::has_available_units(st, &st.permits[&id].base_resources) {
            return if st.inactive_reads.is_empty() {
                CanAdmit::No
            } else {
                CanAdmit::Maybe
            };
        }

        CanAdmit::Yes
    }

    /// Admits a permit: re-derives its active state and consumes its base
    /// resources. Returns whether admission should re-run (the permit
    /// re-activated with blocked branches).
    fn admit_locked(&self, st: &mut State, id: PermitId) -> Result<bool> {
        let needs_recheck = {
            let rec = st.permits.get_mut(&id).expect("live permits are registered");
            assert!(rec.state != PermitState::ActiveBlocked);
            rec.on_permit_active(&mut st.stats)
        };
        let base = st.permits[&id].base_resources;
        self.consume_locked(st, id, base)?;
        st.permits
            .get_mut(&id)
            .expect("live permits are registered")
            .base_resources_consumed = true;
        Ok(needs_recheck)
    }

    /// Grants a pending memory request: consumes everything the permit has
    /// accumulated in `requested_memory`.
    fn grant_memory_locked(&self, st: &mut State, id: PermitId) -> Result<()> {
        let requested = {
            let rec = st.permits.get_mut(&id).expect("live permits are registered");
            if rec.state == PermitState::WaitingForMemory {
                let _ = rec.on_permit_active(&mut st.stats);
                rec.memory_wait = None;
            }
            std::mem::take(&mut rec.requested_memory)
        };
        self.consume_locked(st, id, ReaderResources::with_memory(requested))
    }

    /// Walks the wait list from the front, admitting as long as the
    /// admission predicate says yes. A `maybe` launches background eviction
    /// of inactive reads, which re-runs admission as resources return.
    fn maybe_admit_waiters_locked(&self, st: &mut State) -> Completions {
        let mut completions = Completions::none();
        let mut admit = CanAdmit::No;
        loop {
            let front_id = match st.wait_list.front() {
                Some(entry) => entry.permit.id(),
                None => break,
            };
            admit = self.can_admit_read(st, front_id);
            if admit != CanAdmit::Yes {
                break;
            }
            let entry = st.wait_list.pop_front().expect("wait list has a front entry");
            let id = entry.permit.id();
            let result = if st.permits[&id].state == PermitState::WaitingForMemory {
                st.blessed_permit = Some(id);
                self.grant_memory_locked(st, id)
            } else {
                let admitted = self.admit_locked(st, id).map(|_| ());
                if admitted.is_ok() {
                    st.stats.reads_admitted += 1;
                    counter!(READS_ADMITTED).increment(1);
                }
                admitted
            };
            match result {
                Ok(()) => {
                    if entry.func.is_some() {
                        st.ready_list.push_back(entry);
                        self.ready_list_signal.notify_one();
                    } else {
                        completions.push(entry, Ok(()));
                    }
                }
                Err(err) => completions.push(entry, Err(err)),
            }
        }
        if admit == CanAdmit::Maybe {
            self.evict_readers_in_background(st);
        }
        completions
    }

    /// Evicts inactive reads one at a time, closing each, until either the
    /// inactive list or the wait list runs empty. Eviction returns resources
    /// to the pool, which re-runs admission.
    fn evict_readers_in_background(&self, st: &mut State) {
        if st.evicting {
            return;
        }
        st.evicting = true;
        let inner = self.arc();
        self.close_readers.spawn(async move {
            loop {
                let detached = {
                    let mut guard = inner.state.lock();
                    let st = &mut *guard;
                    if st.wait_list.is_empty() || st.inactive_reads.is_empty() {
                        st.evicting = false;
                        return;
                    }
                    let (_, read) = st
                        .inactive_reads
                        .pop_first()
                        .expect("inactive read list is non-empty");
                    inner.detach_inactive_locked(st, read, EvictReason::Permit)
                };
                let (detached, completions) = detached;
                completions.complete();
                let mut reader = detached.finish();
                reader.close().await;
            }
        });
    }

    /// Pulls an inactive read out of the cache: cancels its TTL timer,
    /// transitions its permit to evicted (refunding base resources), and
    /// records the eviction. The returned [`DetachedRead`] carries the
    /// pending eviction notification.
    fn detach_inactive_locked(
        &self,
        st: &mut State,
        mut read: InactiveRead,
        reason: EvictReason,
    ) -> (DetachedRead, Completions) {
        if let Some(timer) = read.ttl_timer.take() {
            timer.abort();
        }
        let completions = self.evict_permit_locked(st, read.permit.id());
        match reason {
            EvictReason::Permit => {
                st.stats.permit_based_evictions += 1;
                counter!(PERMIT_BASED_EVICTIONS).increment(1);
            }
            EvictReason::Time => {
                st.stats.time_based_evictions += 1;
                counter!(TIME_BASED_EVICTIONS).increment(1);
            }
            EvictReason::Manual => {}
        }
        st.stats.inactive_reads -= 1;
        gauge!(INACTIVE_READS).set(st.stats.inactive_reads as f64);
        let notify = read.notify_handler.take().map(|handler| (handler, reason));
        (
            DetachedRead {
                reader: read.reader,
                permit: read.permit,
                notify,
            },
            completions,
        )
    }

    /// Moves an inactive permit to evicted, refunding its base resources.
    fn evict_permit_locked(&self, st: &mut State, id: PermitId) -> Completions {
        let base = {
            let rec = st.permits.get_mut(&id).expect("live permits are registered");
            assert_eq!(rec.state, PermitState::Inactive);
            rec.state = PermitState::Evicted;
            if rec.base_resources_consumed {
                rec.base_resources_consumed = false;
                rec.resources -= rec.base_resources;
                Some(rec.base_resources)
            } else {
                None
            }
        };
        match base {
            Some(base) => self.signal_locked(st, base),
            None => Completions::none(),
        }
    }

    fn close_reader(&self, mut reader: Box<dyn Reader>) {
        // The close is awaited indirectly: stop() closes and waits on the
        // tracker.
        self.close_readers.spawn(async move {
            reader.close().await;
        });
    }

    fn ensure_execution_loop(&self, st: &mut State) {
        if st.execution_loop.is_none() {
            let inner = self.arc();
            st.execution_loop = Some(tokio::spawn(inner.execution_loop()));
        }
    }

    fn ensure_expiry_loop(&self, st: &mut State) {
        if st.expiry_loop.is_none() {
            let inner = self.arc();
            st.expiry_loop = Some(tokio::spawn(inner.expiry_loop()));
        }
    }

    /// Cooperative consumer of the ready list: runs continuations one at a
    /// time, in FIFO order, forwarding each result to its waiter.
    async fn execution_loop(self: Arc<Self>) {
        loop {
            let entry = loop {
                let mut notified = std::pin::pin!(self.ready_list_signal.notified());
                notified.as_mut().enable();
                if let Some(entry) = self.state.lock().ready_list.pop_front() {
                    break entry;
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = notified.as_mut() => {}
                }
            };
            let WaitEntry {
                permit, tx, func, ..
            } = entry;
            let func = func.expect("ready entries carry a continuation");
            let result = func(permit).await;
            let _ = tx.send(result);
            tokio::task::yield_now().await;
        }
    }

    /// Fails wait-list entries whose deadline passed. One task serves both
    /// queues, sleeping until the earliest pending deadline.
    async fn expiry_loop(self: Arc<Self>) {
        loop {
            let mut notified = std::pin::pin!(self.wait_list_signal.notified());
            notified.as_mut().enable();
            let deadline = self.state.lock().wait_list.next_deadline();
            match deadline {
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = notified.as_mut() => {}
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(deadline) => self.expire_due_waiters(),
                    }
                }
            }
        }
    }

    fn expire_due_waiters(&self) {
        let expired = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let expired = st.wait_list.drain_expired(Instant::now());
            if !expired.is_empty() {
                self.maybe_dump_locked(st, DumpKind::TimedOut, "timed out");
            }
            expired
        };
        for entry in expired {
            let _ = entry.tx.send(Err(Error::Timeout {
                semaphore: self.name.clone(),
            }));
        }
    }

    pub(crate) fn create_permit(
        &self,
        schema: Option<SchemaRef>,
        op_name: ByteString,
        base_resources: ReaderResources,
        timeout: Instant,
    ) -> Result<ReaderPermit> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.stopped {
            return Err(self.stopped_error());
        }
        let id = st.next_permit_id;
        st.next_permit_id += 1;
        st.permits.insert(
            id,
            PermitRecord::new(schema.clone(), op_name.clone(), base_resources, timeout),
        );
        st.stats.total_permits += 1;
        st.stats.current_permits += 1;
        gauge!(CURRENT_PERMITS).set(st.stats.current_permits as f64);
        Ok(ReaderPermit::from_handle(PermitHandle {
            semaphore: self.arc(),
            id,
            schema,
            op_name,
        }))
    }

    pub(crate) fn on_permit_destroyed(&self, id: PermitId) {
        let completions = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut rec = st
                .permits
                .remove(&id)
                .expect("live permits are registered");
            let mut refund = ReaderResources::default();
            if rec.base_resources_consumed {
                rec.resources -= rec.base_resources;
                refund += rec.base_resources;
            }
            if rec.resources.non_zero() {
                error!(
                    "permit {} destroyed with a leak of {} resources",
                    rec.description(),
                    rec.resources
                );
                self.maybe_dump_locked(
                    st,
                    DumpKind::InvariantViolation,
                    "permit destroyed with leaked resources",
                );
                refund += rec.resources;
            }
            if rec.used_branches > 0 {
                error!(
                    "permit {} destroyed with {} used branches",
                    rec.description(),
                    rec.used_branches
                );
                self.maybe_dump_locked(
                    st,
                    DumpKind::InvariantViolation,
                    "permit destroyed with used branches",
                );
                if rec.marked_as_used {
                    st.stats.used_permits -= 1;
                    gauge!(USED_PERMITS).set(st.stats.used_permits as f64);
                }
            }
            if rec.blocked_branches > 0 {
                error!(
                    "permit {} destroyed with {} blocked branches",
                    rec.description(),
                    rec.blocked_branches
                );
                if rec.marked_as_blocked {
                    st.stats.blocked_permits -= 1;
                    gauge!(BLOCKED_PERMITS).set(st.stats.blocked_permits as f64);
                }
            }
            st.stats.sstables_read -= rec.sstables_read;
            gauge!(SSTABLES_READ).set(st.stats.sstables_read as f64);
            if rec.sstables_read > 0 {
                st.stats.disk_reads -= 1;
                gauge!(DISK_READS).set(st.stats.disk_reads as f64);
            }
            st.stats.current_permits -= 1;
            gauge!(CURRENT_PERMITS).set(st.stats.current_permits as f64);

            let was_blessed = st.blessed_permit == Some(id);
            if was_blessed {
                st.blessed_permit = None;
            }
            let completions = if refund.non_zero() {
                self.signal_locked(st, refund)
            } else if was_blessed {
                self.maybe_admit_waiters_locked(st)
            } else {
                Completions::none()
            };
            if st.permits.is_empty() {
                self.permit_gate.notify_waiters();
            }
            completions
        };
        completions.complete();
    }

    pub(crate) async fn do_wait_admission(
        &self,
        permit: ReaderPermit,
        func: Option<ReadFunc>,
    ) -> Result<()> {
        enum Outcome {
            Done,
            Failed(Error),
            Wait(oneshot::Receiver<Result<()>>),
        }

        let id = permit.id();
        let (outcome, completions) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.stopped {
                return Err(self.stopped_error());
            }
            self.ensure_execution_loop(st);

            let admit = self.can_admit_read(st, id);
            if admit != CanAdmit::Yes || !st.wait_list.is_empty() {
                self.check_queue_size(st, "wait")?;
                self.ensure_expiry_loop(st);
                let needs_recheck = {
                    let rec = st.permits.get_mut(&id).expect("live permits are registered");
                    rec.on_permit_inactive(PermitState::WaitingForAdmission, &mut st.stats)
                };
                let mut completions = if needs_recheck {
                    self.maybe_admit_waiters_locked(st)
                } else {
                    Completions::none()
                };
                let (tx, rx) = oneshot::channel();
                let timeout = st.permits[&id].timeout;
                st.wait_list.push_admission(WaitEntry {
                    permit,
                    tx,
                    func,
                    timeout,
                });
                st.stats.reads_enqueued_for_admission += 1;
                counter!(READS_ENQUEUED_FOR_ADMISSION).increment(1);
                self.wait_list_signal.notify_one();

                if admit == CanAdmit::Yes {
                    // Contradiction: the semaphore can admit, yet reads are
                    // queued. Log it and self-heal by re-running admission.
                    self.maybe_dump_locked(
                        st,
                        DumpKind::Contradiction,
                        "semaphore could admit new reads yet there are waiters",
                    );
                    completions.append(self.maybe_admit_waiters_locked(st));
                } else if admit == CanAdmit::Maybe {
                    self.evict_readers_in_background(st);
                }
                (Outcome::Wait(rx), completions)
            } else {
                let needs_recheck = self.admit_locked(st, id)?;
                st.stats.reads_admitted += 1;
                counter!(READS_ADMITTED).increment(1);
                let completions = if needs_recheck {
                    self.maybe_admit_waiters_locked(st)
                } else {
                    Completions::none()
                };
                match func {
                    None => (Outcome::Done, completions),
                    Some(func) => match self.check_queue_size(st, "ready") {
                        Ok(()) => {
                            let (tx, rx) = oneshot::channel();
                            let timeout = st.permits[&id].timeout;
                            st.ready_list.push_back(WaitEntry {
                                permit,
                                tx,
                                func: Some(func),
                                timeout,
                            });
                            self.ready_list_signal.notify_one();
                            (Outcome::Wait(rx), completions)
                        }
                        Err(err) => (Outcome::Failed(err), completions),
                    },
                }
            }
        };
        completions.complete();

        match outcome {
            Outcome::Done => Ok(()),
            Outcome::Failed(err) => Err(err),
            Outcome::Wait(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(self.stopped_error()),
            },
        }
    }

    pub(crate) async fn with_ready_permit(
        &self,
        permit: ReaderPermit,
        func: ReadFunc,
    ) -> Result<()> {
        let rx = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.stopped {
                return Err(self.stopped_error());
            }
            self.ensure_execution_loop(st);
            self.check_queue_size(st, "ready")?;
            let (tx, rx) = oneshot::channel();
            let timeout = st.permits[&permit.id()].timeout;
            st.ready_list.push_back(WaitEntry {
                permit,
                tx,
                func: Some(func),
                timeout,
            });
            self.ready_list_signal.notify_one();
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.stopped_error()),
        }
    }

    pub(crate) async fn request_memory(&self, permit: &ReaderPermit, memory: u64) -> Result<()> {
        let id = permit.id();
        let (wait, completions): (MemoryWait, Completions) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.stopped {
                return Err(self.stopped_error());
            }
            st.permits
                .get_mut(&id)
                .expect("live permits are registered")
                .requested_memory += memory as i64;

            if st.permits[&id].state == PermitState::WaitingForMemory {
                // Already blocked on memory: coalesce with the pending grant.
                let wait = st.permits[&id]
                    .memory_wait
                    .clone()
                    .expect("memory waiters have a pending grant");
                (wait, Completions::none())
            } else {
                let within_serialize_limit = match self.serialize_limit(st) {
                    None => true,
                    Some(limit) => Self::consumed(st).memory as i128 + (memory as i128) < limit,
                };
                if st.resources.memory > 0 || within_serialize_limit {
                    return self.grant_memory_locked(st, id);
                }

                if st.blessed_permit.is_none() {
                    st.blessed_permit = Some(id);
                }
                if st.blessed_permit == Some(id) {
                    return self.grant_memory_locked(st, id);
                }

                self.check_queue_size(st, "wait")?;
                self.ensure_expiry_loop(st);
                let (tx, rx) = oneshot::channel();
                let name = self.name.clone();
                let wait: MemoryWait = async move {
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Stopped { semaphore: name }),
                    }
                }
                .boxed()
                .shared();
                let needs_recheck = {
                    let rec = st.permits.get_mut(&id).expect("live permits are registered");
                    let needs =
                        rec.on_permit_inactive(PermitState::WaitingForMemory, &mut st.stats);
                    rec.memory_wait = Some(wait.clone());
                    needs
                };
                let completions = if needs_recheck {
                    self.maybe_admit_waiters_locked(st)
                } else {
                    Completions::none()
                };
                let timeout = st.permits[&id].timeout;
                st.wait_list.push_memory(WaitEntry {
                    permit: permit.clone(),
                    tx,
                    func: None,
                    timeout,
                });
                st.stats.reads_enqueued_for_memory += 1;
                counter!(READS_ENQUEUED_FOR_MEMORY).increment(1);
                self.wait_list_signal.notify_one();
                (wait, completions)
            }
        };
        completions.complete();
        wait.await
    }

    pub(crate) fn register_inactive_read(&self, reader: Box<dyn Reader>) -> InactiveReadHandle {
        let permit = reader.permit();
        let id = permit.id();
        let (handle, evicted_reader, completions) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let needs_recheck = {
                let rec = st.permits.get_mut(&id).expect("live permits are registered");
                assert!(
                    matches!(rec.state, PermitState::ActiveUnused | PermitState::ActiveUsed),
                    "register_inactive_read() called on a permit in state {}",
                    rec.state
                );
                rec.on_permit_inactive(PermitState::Inactive, &mut st.stats)
            };
            let mut completions = if needs_recheck {
                self.maybe_admit_waiters_locked(st)
            } else {
                Completions::none()
            };
            // Don't cache new readers before all waiters are served: the
            // wait list covers the count dimension, the memory check covers
            // the rest.
            if st.wait_list.is_empty() && st.resources.memory > 0 {
                let seq = st.next_inactive_seq;
                st.next_inactive_seq += 1;
                st.inactive_reads.insert(
                    seq,
                    InactiveRead {
                        reader,
                        permit: permit.clone(),
                        notify_handler: None,
                        ttl_timer: None,
                    },
                );
                st.stats.inactive_reads += 1;
                gauge!(INACTIVE_READS).set(st.stats.inactive_reads as f64);
                (InactiveReadHandle::attached(self.arc(), seq), None, completions)
            } else {
                // Treated as evicted on the spot; registration never fails.
                completions.append(self.evict_permit_locked(st, id));
                st.stats.permit_based_evictions += 1;
                counter!(PERMIT_BASED_EVICTIONS).increment(1);
                (InactiveReadHandle::empty(), Some(reader), completions)
            }
        };
        completions.complete();
        if let Some(reader) = evicted_reader {
            self.close_reader(reader);
        }
        handle
    }

    pub(crate) fn set_notify_handler(
        &self,
        handle: &InactiveReadHandle,
        handler: NotifyHandler,
        ttl: Option<Duration>,
    ) {
        let Some((sem, seq)) = handle.inner.as_ref() else {
            // The reader was evicted at registration; nothing to notify.
            return;
        };
        let seq = *seq;
        let mut guard = sem.state.lock();
        if let Some(read) = guard.inactive_reads.get_mut(&seq) {
            read.notify_handler = Some(handler);
            if let Some(ttl) = ttl {
                let inner = sem.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    inner.evict_inactive_by_seq(seq, EvictReason::Time);
                });
                read.ttl_timer = Some(task.abort_handle());
            }
        }
    }

    fn evict_inactive_by_seq(&self, seq: u64, reason: EvictReason) {
        let detached = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.inactive_reads
                .remove(&seq)
                .map(|read| self.detach_inactive_locked(st, read, reason))
        };
        if let Some((detached, completions)) = detached {
            completions.complete();
            self.close_reader(detached.finish());
        }
    }

    pub(crate) fn unregister_inactive_read(
        &self,
        mut handle: InactiveReadHandle,
    ) -> Result<Option<Box<dyn Reader>>> {
        let Some((sem, seq)) = handle.inner.take() else {
            return Ok(None);
        };
        if !Arc::ptr_eq(&sem, &self.arc()) {
            // Unhook from the other semaphore and close the reader through
            // it, then surface the mis-routing.
            let removed = {
                let mut guard = sem.state.lock();
                let st = &mut *guard;
                st.inactive_reads.remove(&seq).inspect(|_| {
                    st.stats.inactive_reads -= 1;
                    gauge!(INACTIVE_READS).set(st.stats.inactive_reads as f64);
                })
            };
            if let Some(mut read) = removed {
                if let Some(timer) = read.ttl_timer.take() {
                    timer.abort();
                }
                sem.close_reader(read.reader);
            }
            error!(
                "unregister_inactive_read(): attempted to unregister an inactive read \
                 with a handle belonging to another semaphore: this is {} but the handle \
                 belongs to {}",
                self.name, sem.name
            );
            return Err(Error::WrongSemaphore {
                semaphore: self.name.clone(),
                handle_semaphore: sem.name.clone(),
            });
        }

        let (read, completions) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(mut read) = st.inactive_reads.remove(&seq) else {
                return Ok(None);
            };
            if let Some(timer) = read.ttl_timer.take() {
                timer.abort();
            }
            st.stats.inactive_reads -= 1;
            gauge!(INACTIVE_READS).set(st.stats.inactive_reads as f64);
            let needs_recheck = {
                let rec = st
                    .permits
                    .get_mut(&read.permit.id())
                    .expect("live permits are registered");
                assert_eq!(rec.state, PermitState::Inactive);
                rec.on_permit_active(&mut st.stats)
            };
            let completions = if needs_recheck {
                self.maybe_admit_waiters_locked(st)
            } else {
                Completions::none()
            };
            (read, completions)
        };
        completions.complete();
        let InactiveRead { reader, .. } = read;
        Ok(Some(reader))
    }

    pub(crate) fn try_evict_one_inactive_read(&self, reason: EvictReason) -> bool {
        let detached = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.inactive_reads
                .pop_first()
                .map(|(_, read)| self.detach_inactive_locked(st, read, reason))
        };
        match detached {
            Some((detached, completions)) => {
                completions.complete();
                self.close_reader(detached.finish());
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear_inactive_reads(&self) {
        let detached = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut detached = Vec::new();
            while let Some((_, read)) = st.inactive_reads.pop_first() {
                detached.push(self.detach_inactive_locked(st, read, EvictReason::Manual));
            }
            detached
        };
        for (read, completions) in detached {
            completions.complete();
            self.close_reader(read.finish());
        }
    }

    pub(crate) async fn evict_inactive_reads_for_table(&self, table: TableId) {
        let detached = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let matching: Vec<u64> = st
                .inactive_reads
                .iter()
                .filter(|(_, read)| read.reader.schema().id() == table)
                .map(|(seq, _)| *seq)
                .collect();
            let mut detached = Vec::new();
            for seq in matching {
                let read = st
                    .inactive_reads
                    .remove(&seq)
                    .expect("matching inactive read is present");
                detached.push(self.detach_inactive_locked(st, read, EvictReason::Manual));
            }
            detached
        };
        for (read, completions) in detached {
            completions.complete();
            let mut reader = read.finish();
            reader.close().await;
        }
    }

    pub(crate) async fn stop(&self) {
        let pre = {
            let mut guard = self.state.lock();
            assert!(!guard.stopped, "reader concurrency semaphore stopped twice");
            guard.stopped = true;
            self.stop_hooks.lock().pre.take()
        };
        if let Some(hook) = pre {
            hook().await;
        }

        self.clear_inactive_reads();
        self.close_readers.close();
        self.close_readers.wait().await;

        // Break queued work first: wait and ready entries hold permit
        // clones, and the permit gate below cannot clear while they do.
        let broken_entries = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut entries = st.wait_list.drain_all();
            entries.extend(st.ready_list.drain(..));
            entries
        };
        for entry in broken_entries {
            let _ = entry.tx.send(Err(self.stopped_error()));
        }

        self.shutdown.cancel();
        let (execution_loop, expiry_loop) = {
            let mut guard = self.state.lock();
            (guard.execution_loop.take(), guard.expiry_loop.take())
        };
        if let Some(handle) = execution_loop {
            let _ = handle.await;
        }
        if let Some(handle) = expiry_loop {
            let _ = handle.await;
        }

        // Permit gate: all permits must be destroyed before stop completes.
        loop {
            let mut notified = std::pin::pin!(self.permit_gate.notified());
            notified.as_mut().enable();
            if self.state.lock().permits.is_empty() {
                break;
            }
            notified.await;
        }

        let post = self.stop_hooks.lock().post.take();
        if let Some(hook) = post {
            hook().await;
        }
    }

    pub(crate) fn broken(&self, error: Option<Error>) {
        let error = error.unwrap_or(Error::Broken {
            semaphore: self.name.clone(),
        });
        let entries = { self.state.lock().wait_list.drain_all() };
        for entry in entries {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    // Permit-facing operations. All take the permit's registry id; a live
    // handle guarantees the record exists.

    pub(crate) fn permit_state(&self, id: PermitId) -> PermitState {
        self.state.lock().permits[&id].state
    }

    pub(crate) fn permit_consume(&self, id: PermitId, r: ReaderResources) -> Result<()> {
        let mut guard = self.state.lock();
        self.consume_locked(&mut guard, id, r)
    }

    pub(crate) fn permit_signal(&self, id: PermitId, r: ReaderResources) {
        let completions = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.permits
                .get_mut(&id)
                .expect("live permits are registered")
                .resources -= r;
            self.signal_locked(st, r)
        };
        completions.complete();
    }

    pub(crate) fn permit_mark_used(&self, id: PermitId) {
        let completions = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let needs_recheck = st
                .permits
                .get_mut(&id)
                .expect("live permits are registered")
                .mark_used(&mut st.stats);
            if needs_recheck {
                self.maybe_admit_waiters_locked(st)
            } else {
                Completions::none()
            }
        };
        completions.complete();
    }

    pub(crate) fn permit_mark_unused(&self, id: PermitId) {
        let completions = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let needs_recheck = st
                .permits
                .get_mut(&id)
                .expect("live permits are registered")
                .mark_unused(&mut st.stats);
            if needs_recheck {
                self.maybe_admit_waiters_locked(st)
            } else {
                Completions::none()
            }
        };
        completions.complete();
    }

    pub(crate) fn permit_mark_blocked(&self, id: PermitId) {
        let completions = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let needs_recheck = st
                .permits
                .get_mut(&id)
                .expect("live permits are registered")
                .mark_blocked(&mut st.stats);
            if needs_recheck {
                self.maybe_admit_waiters_locked(st)
            } else {
                Completions::none()
            }
        };
        completions.complete();
    }

    pub(crate) fn permit_mark_unblocked(&self, id: PermitId) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let _ = st
            .permits
            .get_mut(&id)
            .expect("live permits are registered")
            .mark_unblocked(&mut st.stats);
    }

    pub(crate) fn permit_consumed_resources(&self, id: PermitId) -> ReaderResources {
        self.state.lock().permits[&id].resources
    }

    pub(crate) fn permit_base_resources(&self, id: PermitId) -> ReaderResources {
        self.state.lock().permits[&id].base_resources
    }

    pub(crate) fn permit_release_base_resources(&self, id: PermitId) {
        let completions = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let released = {
                let rec = st.permits.get_mut(&id).expect("live permits are registered");
                let base = std::mem::take(&mut rec.base_resources);
                if rec.base_resources_consumed {
                    rec.base_resources_consumed = false;
                    rec.resources -= base;
                    Some(base)
                } else {
                    None
                }
            };
            match released {
                Some(base) => self.signal_locked(st, base),
                None => Completions::none(),
            }
        };
        completions.complete();
    }

    pub(crate) fn permit_timeout(&self, id: PermitId) -> Instant {
        self.state.lock().permits[&id].timeout
    }

    pub(crate) fn permit_set_timeout(&self, id: PermitId, timeout: Instant) {
        let mut guard = self.state.lock();
        let rec = guard
            .permits
            .get_mut(&id)
            .expect("live permits are registered");
        if rec.timeout != far_future() && timeout < rec.timeout {
            let skew = rec.timeout - timeout;
            if skew > Duration::from_millis(100) {
                warn!(
                    "Detected timeout skew of {}ms, please check time skew between nodes in the cluster",
                    skew.as_millis()
                );
            }
        }
        rec.timeout = timeout;
    }

    pub(crate) fn permit_max_result_size(&self, id: PermitId) -> MaxResultSize {
        self.state.lock().permits[&id].max_result_size
    }

    pub(crate) fn permit_set_max_result_size(&self, id: PermitId, size: MaxResultSize) {
        self.state
            .lock()
            .permits
            .get_mut(&id)
            .expect("live permits are registered")
            .max_result_size = size;
    }

    pub(crate) fn permit_on_start_sstable_read(&self, id: PermitId) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let rec = st.permits.get_mut(&id).expect("live permits are registered");
        if rec.sstables_read == 0 {
            st.stats.disk_reads += 1;
            gauge!(DISK_READS).set(st.stats.disk_reads as f64);
        }
        rec.sstables_read += 1;
        st.stats.sstables_read += 1;
        gauge!(SSTABLES_READ).set(st.stats.sstables_read as f64);
    }

    pub(crate) fn permit_on_finish_sstable_read(&self, id: PermitId) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let rec = st.permits.get_mut(&id).expect("live permits are registered");
        assert!(rec.sstables_read > 0);
        rec.sstables_read -= 1;
        st.stats.sstables_read -= 1;
        gauge!(SSTABLES_READ).set(st.stats.sstables_read as f64);
        if rec.sstables_read == 0 {
            st.stats.disk_reads -= 1;
            gauge!(DISK_READS).set(st.stats.disk_reads as f64);
        }
    }
}

/// Admission control and resource accounting for the reads of one shard.
///
/// Every logical read holds a [`ReaderPermit`] that tracks the resources
/// charged to it. The semaphore admits, defers, or sheds reads to keep the
/// total in-flight footprint within the configured envelope, serializes
/// memory growth past the serialize limit behind a single blessed permit,
/// and kills reads whose consumption would cross the kill limit.
///
/// The semaphore is shard-local: one instance per shard, used from within a
/// tokio runtime. It must be [`stop`](Self::stop)ped before being dropped
/// once it has issued any permit.
pub struct ReaderConcurrencySemaphore {
    inner: Arc<SemaphoreInner>,
}

impl ReaderConcurrencySemaphore {
    pub fn new(
        count: i32,
        memory: i64,
        name: impl Into<String>,
        max_queue_length: usize,
        serialize_limit_multiplier: u32,
        kill_limit_multiplier: u32,
    ) -> Self {
        let name = name.into();
        let inner = Arc::new_cyclic(|me| SemaphoreInner {
            me: me.clone(),
            name,
            max_queue_length,
            serialize_limit_multiplier: AtomicU32::new(serialize_limit_multiplier),
            kill_limit_multiplier: AtomicU32::new(kill_limit_multiplier),
            state: Mutex::new(State {
                initial_resources: ReaderResources::new(count, memory),
                resources: ReaderResources::new(count, memory),
                stopped: false,
                evicting: false,
                blessed_permit: None,
                next_permit_id: 0,
                next_inactive_seq: 0,
                permits: HashMap::new(),
                wait_list: WaitList::default(),
                ready_list: VecDeque::new(),
                inactive_reads: BTreeMap::new(),
                stats: SemaphoreStats::default(),
                execution_loop: None,
                expiry_loop: None,
            }),
            ready_list_signal: Notify::new(),
            wait_list_signal: Notify::new(),
            permit_gate: Notify::new(),
            close_readers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            dump_rate_limiter: DumpRateLimiter::new(Duration::from_secs(30)),
            stop_hooks: Mutex::new(StopHooks::default()),
        });
        Self { inner }
    }

    /// A semaphore with all limits saturated, admitting everything.
    pub fn new_unlimited(name: impl Into<String>) -> Self {
        Self::new(i32::MAX, i64::MAX, name, usize::MAX, u32::MAX, u32::MAX)
    }

    /// Registers a hook run at the start of [`stop`](Self::stop), before any
    /// teardown.
    pub fn with_pre_stop_hook<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.stop_hooks.lock().pre = Some(Box::new(move || hook().boxed()));
        self
    }

    /// Registers a hook run at the end of [`stop`](Self::stop), after all
    /// teardown.
    pub fn with_post_stop_hook<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.stop_hooks.lock().post = Some(Box::new(move || hook().boxed()));
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn initial_resources(&self) -> ReaderResources {
        self.inner.state.lock().initial_resources
    }

    pub fn available_resources(&self) -> ReaderResources {
        self.inner.state.lock().resources
    }

    pub fn consumed_resources(&self) -> ReaderResources {
        let guard = self.inner.state.lock();
        guard.initial_resources - guard.resources
    }

    pub fn is_unlimited(&self) -> bool {
        let guard = self.inner.state.lock();
        self.inner.is_unlimited(&guard)
    }

    pub fn stats(&self) -> SemaphoreStats {
        self.inner.state.lock().stats.clone()
    }

    /// Live-resizes the pool: the delta against the previous initial
    /// resources is applied to the available resources and admission
    /// re-runs.
    pub fn set_resources(&self, resources: ReaderResources) {
        let completions = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let delta = resources - st.initial_resources;
            st.initial_resources = resources;
            st.resources += delta;
            self.inner.maybe_admit_waiters_locked(st)
        };
        completions.complete();
    }

    /// Live-updates the serialize limit multiplier. `0` and `u32::MAX`
    /// disable the limit.
    pub fn set_serialize_limit_multiplier(&self, multiplier: u32) {
        self.inner
            .serialize_limit_multiplier
            .store(multiplier, Ordering::Relaxed);
    }

    /// Live-updates the kill limit multiplier. `0` and `u32::MAX` disable
    /// the limit.
    pub fn set_kill_limit_multiplier(&self, multiplier: u32) {
        self.inner
            .kill_limit_multiplier
            .store(multiplier, Ordering::Relaxed);
    }

    /// Obtains a permit for a read, waiting for admission if the read
    /// cannot be admitted right away. The permit charges `(1, memory)` base
    /// resources for its lifetime.
    pub async fn obtain_permit(
        &self,
        schema: Option<SchemaRef>,
        op_name: impl Into<ByteString>,
        memory: u64,
        timeout: Instant,
    ) -> Result<ReaderPermit> {
        let permit = self.inner.create_permit(
            schema,
            op_name.into(),
            ReaderResources::new(1, memory as i64),
            timeout,
        )?;
        self.inner.do_wait_admission(permit.clone(), None).await?;
        Ok(permit)
    }

    /// A permit that tracks resource usage without being admitted; its base
    /// resources are zero. For instrumentation of operations that bypass
    /// admission.
    pub fn make_tracking_only_permit(
        &self,
        schema: Option<SchemaRef>,
        op_name: impl Into<ByteString>,
        timeout: Instant,
    ) -> Result<ReaderPermit> {
        self.inner.create_permit(
            schema,
            op_name.into(),
            ReaderResources::default(),
            timeout,
        )
    }

    /// Obtains a permit and runs `func` with it through the execution loop.
    pub async fn with_permit<F, Fut>(
        &self,
        schema: Option<SchemaRef>,
        op_name: impl Into<ByteString>,
        memory: u64,
        timeout: Instant,
        func: F,
    ) -> Result<()>
    where
        F: FnOnce(ReaderPermit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = self.inner.create_permit(
            schema,
            op_name.into(),
            ReaderResources::new(1, memory as i64),
            timeout,
        )?;
        let func: ReadFunc = Box::new(move |permit| func(permit).boxed());
        self.inner.do_wait_admission(permit, Some(func)).await
    }

    /// Runs `func` with an already admitted permit, scheduled through the
    /// ready list in FIFO order.
    pub async fn with_ready_permit<F, Fut>(&self, permit: ReaderPermit, func: F) -> Result<()>
    where
        F: FnOnce(ReaderPermit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let func: ReadFunc = Box::new(move |permit| func(permit).boxed());
        self.inner.with_ready_permit(permit, func).await
    }

    /// Parks a paused reader in the inactive-read cache.
    ///
    /// Registration never fails: when the reader cannot be cached (waiters
    /// are queued, or no memory is available) it is evicted on the spot,
    /// closed in the background, and an empty handle is returned.
    pub fn register_inactive_read(&self, reader: Box<dyn Reader>) -> InactiveReadHandle {
        self.inner.register_inactive_read(reader)
    }

    /// Attaches an eviction notification, and optionally a TTL after which
    /// the read is evicted with reason [`EvictReason::Time`].
    pub fn set_notify_handler(
        &self,
        handle: &InactiveReadHandle,
        handler: impl FnOnce(EvictReason) + Send + 'static,
        ttl: Option<Duration>,
    ) {
        self.inner
            .set_notify_handler(handle, Box::new(handler), ttl);
    }

    /// Takes a parked reader back out of the cache, transitioning its permit
    /// back to active. Returns `None` when the read was evicted in the
    /// meantime. A handle issued by a different semaphore is an internal
    /// error: the reader is closed and [`Error::WrongSemaphore`] returned.
    pub fn unregister_inactive_read(
        &self,
        handle: InactiveReadHandle,
    ) -> Result<Option<Box<dyn Reader>>> {
        self.inner.unregister_inactive_read(handle)
    }

    /// Evicts the oldest inactive read, if any.
    pub fn try_evict_one_inactive_read(&self, reason: EvictReason) -> bool {
        self.inner.try_evict_one_inactive_read(reason)
    }

    /// Evicts every inactive read.
    pub fn clear_inactive_reads(&self) {
        self.inner.clear_inactive_reads();
    }

    /// Evicts all inactive reads opened against `table`, waiting for their
    /// readers to close.
    pub async fn evict_inactive_reads_for_table(&self, table: TableId) {
        self.inner.evict_inactive_reads_for_table(table).await;
    }

    /// Gracefully shuts the semaphore down: drains the inactive-read cache,
    /// waits for background closes, fails the remaining waiters with
    /// [`Error::Stopped`], stops the execution loop, and waits for all
    /// permits to be destroyed.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Fails all waiters with `error`, or [`Error::Broken`] when `None`.
    pub fn broken(&self, error: Option<Error>) {
        self.inner.broken(error);
    }

    /// Renders the permit table, grouped by (schema, op name, state) and
    /// sorted by consumed memory. Rows past `max_lines` collapse into an
    /// "omitted" row; `0` disables the collapse.
    pub fn dump_diagnostics(&self, max_lines: usize) -> String {
        let guard = self.inner.state.lock();
        self.inner.format_dump(&guard, "user request", max_lines)
    }

    /// Calls `f` with a snapshot of every live permit.
    pub fn foreach_permit(&self, mut f: impl FnMut(&PermitSnapshot)) {
        let snapshots: Vec<PermitSnapshot> = {
            let guard = self.inner.state.lock();
            guard
                .permits
                .values()
                .map(|rec| PermitSnapshot {
                    schema: rec.schema.clone(),
                    op_name: rec.op_name.clone(),
                    state: rec.state,
                    resources: rec.resources,
                    base_resources: rec.base_resources,
                })
                .collect()
        };
        for snapshot in &snapshots {
            f(snapshot);
        }
    }
}

impl fmt::Debug for ReaderConcurrencySemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderConcurrencySemaphore")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Drop for ReaderConcurrencySemaphore {
    fn drop(&mut self) {
        let entries = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            if st.stats.total_permits == 0 {
                // Destroy without stop() is fine for a semaphore that never
                // issued a permit.
                Vec::new()
            } else if !st.stopped {
                error!(
                    "semaphore '{}' destroyed without being stopped",
                    self.inner.name
                );
                st.wait_list.drain_all()
            } else {
                Vec::new()
            }
        };
        for entry in entries {
            let _ = entry.tx.send(Err(Error::Broken {
                semaphore: self.inner.name.clone(),
            }));
        }
        self.inner.shutdown.cancel();
        let (execution_loop, expiry_loop) = {
            let mut guard = self.inner.state.lock();
            (guard.execution_loop.take(), guard.expiry_loop.take())
        };
        if let Some(handle) = execution_loop {
            handle.abort();
        }
        if let Some(handle) = expiry_loop {
            handle.abort();
        }
    }
}
