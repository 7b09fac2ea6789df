// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::sync::Arc;

use bytestring::ByteString;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use crate::error::Result;
use crate::metric_definitions::{BLOCKED_PERMITS, USED_PERMITS};
use crate::resources::ReaderResources;
use crate::schema::SchemaRef;
use crate::semaphore::{SemaphoreInner, SemaphoreStats};

pub(crate) type PermitId = u64;

/// The coalescable future a permit waits on while queued for memory.
pub(crate) type MemoryWait = Shared<BoxFuture<'static, Result<()>>>;

/// Where a permit is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermitState {
    WaitingForAdmission,
    WaitingForMemory,
    ActiveUnused,
    ActiveUsed,
    ActiveBlocked,
    Inactive,
    Evicted,
}

impl fmt::Display for PermitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermitState::WaitingForAdmission => "waiting_for_admission",
            PermitState::WaitingForMemory => "waiting_for_memory",
            PermitState::ActiveUnused => "active/unused",
            PermitState::ActiveUsed => "active/used",
            PermitState::ActiveBlocked => "active/blocked",
            PermitState::Inactive => "inactive",
            PermitState::Evicted => "evicted",
        };
        f.write_str(s)
    }
}

/// Soft/hard cap on the size of a single query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxResultSize {
    pub soft_limit: u64,
    pub hard_limit: u64,
}

impl MaxResultSize {
    pub const fn new(soft_limit: u64, hard_limit: u64) -> Self {
        Self {
            soft_limit,
            hard_limit,
        }
    }

    pub const fn unlimited() -> Self {
        Self::new(u64::MAX, u64::MAX)
    }
}

impl Default for MaxResultSize {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// The mutable side of a permit, owned by the semaphore's registry and only
/// ever touched under the semaphore's state lock. The registry entry is
/// non-owning: the handles hold the semaphore alive, not the other way
/// around.
pub(crate) struct PermitRecord {
    pub(crate) schema: Option<SchemaRef>,
    pub(crate) op_name: ByteString,
    pub(crate) base_resources: ReaderResources,
    pub(crate) base_resources_consumed: bool,
    pub(crate) resources: ReaderResources,
    pub(crate) state: PermitState,
    pub(crate) used_branches: u64,
    pub(crate) marked_as_used: bool,
    pub(crate) blocked_branches: u64,
    pub(crate) marked_as_blocked: bool,
    pub(crate) timeout: Instant,
    pub(crate) max_result_size: MaxResultSize,
    pub(crate) sstables_read: u64,
    pub(crate) requested_memory: i64,
    pub(crate) memory_wait: Option<MemoryWait>,
    pub(crate) oom_kills: u64,
}

impl PermitRecord {
    pub(crate) fn new(
        schema: Option<SchemaRef>,
        op_name: ByteString,
        base_resources: ReaderResources,
        timeout: Instant,
    ) -> Self {
        Self {
            schema,
            op_name,
            base_resources,
            base_resources_consumed: false,
            resources: ReaderResources::default(),
            state: PermitState::ActiveUnused,
            used_branches: 0,
            marked_as_used: false,
            blocked_branches: 0,
            marked_as_blocked: false,
            timeout,
            max_result_size: MaxResultSize::unlimited(),
            sstables_read: 0,
            requested_memory: 0,
            memory_wait: None,
            oom_kills: 0,
        }
    }

    fn on_permit_used(&mut self, stats: &mut SemaphoreStats) {
        stats.used_permits += 1;
        metrics::gauge!(USED_PERMITS).set(stats.used_permits as f64);
        self.marked_as_used = true;
    }

    /// Returns true when the semaphore should re-run admission.
    fn on_permit_unused(&mut self, stats: &mut SemaphoreStats) -> bool {
        assert!(stats.used_permits > 0);
        stats.used_permits -= 1;
        assert!(stats.used_permits >= stats.blocked_permits);
        metrics::gauge!(USED_PERMITS).set(stats.used_permits as f64);
        self.marked_as_used = false;
        true
    }

    /// Returns true when the semaphore should re-run admission.
    fn on_permit_blocked(&mut self, stats: &mut SemaphoreStats) -> bool {
        stats.blocked_permits += 1;
        assert!(stats.used_permits >= stats.blocked_permits);
        metrics::gauge!(BLOCKED_PERMITS).set(stats.blocked_permits as f64);
        self.marked_as_blocked = true;
        true
    }

    fn on_permit_unblocked(&mut self, stats: &mut SemaphoreStats) {
        assert!(stats.blocked_permits > 0);
        stats.blocked_permits -= 1;
        metrics::gauge!(BLOCKED_PERMITS).set(stats.blocked_permits as f64);
        self.marked_as_blocked = false;
    }

    /// Re-derives the active state from the branch counters, updating the
    /// semaphore-wide totals. Returns true when admission should re-run.
    pub(crate) fn on_permit_active(&mut self, stats: &mut SemaphoreStats) -> bool {
        if self.used_branches > 0 {
            self.state = PermitState::ActiveUsed;
            self.on_permit_used(stats);
            if self.blocked_branches > 0 {
                self.state = PermitState::ActiveBlocked;
                return self.on_permit_blocked(stats);
            }
        } else {
            self.state = PermitState::ActiveUnused;
        }
        false
    }

    /// Leaves the active states, unmarking the permit from the semaphore's
    /// totals. Returns true when admission should re-run.
    pub(crate) fn on_permit_inactive(
        &mut self,
        state: PermitState,
        stats: &mut SemaphoreStats,
    ) -> bool {
        self.state = state;
        if self.marked_as_blocked {
            self.on_permit_unblocked(stats);
        }
        if self.marked_as_used {
            return self.on_permit_unused(stats);
        }
        false
    }

    pub(crate) fn mark_used(&mut self, stats: &mut SemaphoreStats) -> bool {
        self.used_branches += 1;
        if !self.marked_as_used && self.state == PermitState::ActiveUnused {
            self.state = PermitState::ActiveUsed;
            self.on_permit_used(stats);
            if self.blocked_branches > 0 && !self.marked_as_blocked {
                self.state = PermitState::ActiveBlocked;
                return self.on_permit_blocked(stats);
            }
        }
        false
    }

    pub(crate) fn mark_unused(&mut self, stats: &mut SemaphoreStats) -> bool {
        assert!(self.used_branches > 0);
        self.used_branches -= 1;
        if self.marked_as_used && self.used_branches == 0 {
            // When a read bails out, blocked and used guards can unwind
            // out-of-order. Force an unblock here so that used >= blocked
            // holds.
            if self.marked_as_blocked {
                self.on_permit_unblocked(stats);
            }
            self.state = PermitState::ActiveUnused;
            return self.on_permit_unused(stats);
        }
        false
    }

    pub(crate) fn mark_blocked(&mut self, stats: &mut SemaphoreStats) -> bool {
        self.blocked_branches += 1;
        if self.blocked_branches == 1 && self.state == PermitState::ActiveUsed {
            self.state = PermitState::ActiveBlocked;
            return self.on_permit_blocked(stats);
        }
        false
    }

    pub(crate) fn mark_unblocked(&mut self, stats: &mut SemaphoreStats) -> bool {
        assert!(self.blocked_branches > 0);
        self.blocked_branches -= 1;
        if self.marked_as_blocked && self.blocked_branches == 0 {
            self.state = PermitState::ActiveUsed;
            self.on_permit_unblocked(stats);
        }
        false
    }

    pub(crate) fn description(&self) -> String {
        format!(
            "{}.{}:{}",
            self.schema.as_deref().map_or("*", |s| s.keyspace()),
            self.schema.as_deref().map_or("*", |s| s.table()),
            self.op_name
        )
    }

    /// First kill reports true; repeat kills are not re-counted.
    pub(crate) fn on_oom_kill(&mut self) -> bool {
        self.oom_kills += 1;
        self.oom_kills == 1
    }
}

pub(crate) struct PermitHandle {
    pub(crate) semaphore: Arc<SemaphoreInner>,
    pub(crate) id: PermitId,
    pub(crate) schema: Option<SchemaRef>,
    pub(crate) op_name: ByteString,
}

impl Drop for PermitHandle {
    fn drop(&mut self) {
        self.semaphore.on_permit_destroyed(self.id);
    }
}

/// A per-read admission permit.
///
/// Cheap to clone; the read, the wait-list entry, and the inactive-read
/// cache can all hold the same permit. When the last handle drops, base
/// resources (and any leaked consumption, with an internal-error log) are
/// returned to the semaphore.
#[derive(Clone)]
pub struct ReaderPermit {
    inner: Arc<PermitHandle>,
}

impl ReaderPermit {
    pub(crate) fn from_handle(handle: PermitHandle) -> Self {
        Self {
            inner: Arc::new(handle),
        }
    }

    pub(crate) fn id(&self) -> PermitId {
        self.inner.id
    }

    pub fn schema(&self) -> Option<&SchemaRef> {
        self.inner.schema.as_ref()
    }

    pub fn op_name(&self) -> &ByteString {
        &self.inner.op_name
    }

    pub fn state(&self) -> PermitState {
        self.inner.semaphore.permit_state(self.id())
    }

    /// Charges `resources` to this permit and the semaphore.
    ///
    /// Fails with [`Error::OutOfMemory`](crate::Error::OutOfMemory) when the
    /// charge would push consumed memory past the kill limit.
    pub fn consume(&self, resources: ReaderResources) -> Result<()> {
        self.inner.semaphore.permit_consume(self.id(), resources)
    }

    /// Returns `resources` to the semaphore. Must pair with an earlier
    /// [`consume`](Self::consume).
    pub fn signal(&self, resources: ReaderResources) {
        self.inner.semaphore.permit_signal(self.id(), resources);
    }

    /// Scoped variant of [`consume`](Self::consume) for memory; the guard
    /// releases the charge on drop.
    pub fn consume_memory(&self, memory: u64) -> Result<ResourceUnits> {
        self.consume_resources(ReaderResources::with_memory(memory as i64))
    }

    pub fn consume_resources(&self, resources: ReaderResources) -> Result<ResourceUnits> {
        ResourceUnits::consume(self, resources)
    }

    /// Asynchronously charges `memory` to this permit, waiting on the memory
    /// queue when the semaphore is past its serialize limit. Concurrent
    /// requests on the same permit coalesce into one grant.
    pub async fn request_memory(&self, memory: u64) -> Result<ResourceUnits> {
        self.inner.semaphore.request_memory(self, memory).await?;
        Ok(ResourceUnits::already_consumed(
            self.clone(),
            ReaderResources::with_memory(memory as i64),
        ))
    }

    pub fn consumed_resources(&self) -> ReaderResources {
        self.inner.semaphore.permit_consumed_resources(self.id())
    }

    pub fn base_resources(&self) -> ReaderResources {
        self.inner.semaphore.permit_base_resources(self.id())
    }

    /// Returns the admission charge early while keeping the permit alive.
    /// Used by readers that have finished but are kept around for
    /// diagnostics.
    pub fn release_base_resources(&self) {
        self.inner.semaphore.permit_release_base_resources(self.id());
    }

    pub fn mark_used(&self) {
        self.inner.semaphore.permit_mark_used(self.id());
    }

    pub fn mark_unused(&self) {
        self.inner.semaphore.permit_mark_unused(self.id());
    }

    pub fn mark_blocked(&self) {
        self.inner.semaphore.permit_mark_blocked(self.id());
    }

    pub fn mark_unblocked(&self) {
        self.inner.semaphore.permit_mark_unblocked(self.id());
    }

    pub fn timeout(&self) -> Instant {
        self.inner.semaphore.permit_timeout(self.id())
    }

    pub fn set_timeout(&self, timeout: Instant) {
        self.inner.semaphore.permit_set_timeout(self.id(), timeout);
    }

    pub fn max_result_size(&self) -> MaxResultSize {
        self.inner.semaphore.permit_max_result_size(self.id())
    }

    pub fn set_max_result_size(&self, size: MaxResultSize) {
        self.inner
            .semaphore
            .permit_set_max_result_size(self.id(), size);
    }

    /// `"{keyspace}.{table}:{op_name}"`, with `*` standing in for a missing
    /// schema.
    pub fn description(&self) -> String {
        format!(
            "{}.{}:{}",
            self.inner.schema.as_deref().map_or("*", |s| s.keyspace()),
            self.inner.schema.as_deref().map_or("*", |s| s.table()),
            self.inner.op_name
        )
    }

    pub fn on_start_sstable_read(&self) {
        self.inner.semaphore.permit_on_start_sstable_read(self.id());
    }

    pub fn on_finish_sstable_read(&self) {
        self.inner
            .semaphore
            .permit_on_finish_sstable_read(self.id());
    }

    /// True when the permit was evicted and must be re-admitted before the
    /// read can continue.
    pub fn needs_readmission(&self) -> bool {
        self.state() == PermitState::Evicted
    }

    /// Re-enters the admission queue after an eviction.
    pub async fn wait_readmission(&self) -> Result<()> {
        self.inner
            .semaphore
            .do_wait_admission(self.clone(), None)
            .await
    }
}

impl PartialEq for ReaderPermit {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ReaderPermit {}

impl fmt::Debug for ReaderPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderPermit")
            .field("description", &self.description())
            .field("state", &self.state())
            .finish()
    }
}

/// RAII guard over resources consumed through a permit; returns them on
/// drop.
#[must_use]
pub struct ResourceUnits {
    permit: ReaderPermit,
    resources: ReaderResources,
}

impl ResourceUnits {
    pub(crate) fn already_consumed(permit: ReaderPermit, resources: ReaderResources) -> Self {
        Self { permit, resources }
    }

    pub(crate) fn consume(permit: &ReaderPermit, resources: ReaderResources) -> Result<Self> {
        permit.consume(resources)?;
        Ok(Self::already_consumed(permit.clone(), resources))
    }

    pub fn permit(&self) -> &ReaderPermit {
        &self.permit
    }

    pub fn resources(&self) -> ReaderResources {
        self.resources
    }

    /// Folds `other` into this guard. Both must charge the same permit.
    pub fn add(&mut self, mut other: ResourceUnits) {
        debug_assert!(
            self.permit == other.permit,
            "cannot merge resource units of different permits"
        );
        self.resources += std::mem::take(&mut other.resources);
    }

    /// Returns all held resources to the semaphore.
    pub fn reset(&mut self) {
        if self.resources.non_zero() {
            self.permit.signal(self.resources);
            self.resources = ReaderResources::default();
        }
    }

    /// Replaces the held resources with `resources`, consuming the new
    /// amount before releasing the old.
    pub fn reset_to(&mut self, resources: ReaderResources) -> Result<()> {
        if resources.non_zero() {
            self.permit.consume(resources)?;
        }
        if self.resources.non_zero() {
            self.permit.signal(self.resources);
        }
        self.resources = resources;
        Ok(())
    }
}

impl Drop for ResourceUnits {
    fn drop(&mut self) {
        if self.resources.non_zero() {
            self.permit.signal(self.resources);
        }
    }
}

impl fmt::Debug for ResourceUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceUnits")
            .field("resources", &self.resources)
            .finish()
    }
}

/// Point-in-time view of a permit, handed out by
/// [`foreach_permit`](crate::ReaderConcurrencySemaphore::foreach_permit).
#[derive(Debug, Clone)]
pub struct PermitSnapshot {
    pub schema: Option<SchemaRef>,
    pub op_name: ByteString,
    pub state: PermitState,
    pub resources: ReaderResources,
    pub base_resources: ReaderResources,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(PermitState::WaitingForAdmission.to_string(), "waiting_for_admission");
        assert_eq!(PermitState::WaitingForMemory.to_string(), "waiting_for_memory");
        assert_eq!(PermitState::ActiveUnused.to_string(), "active/unused");
        assert_eq!(PermitState::ActiveUsed.to_string(), "active/used");
        assert_eq!(PermitState::ActiveBlocked.to_string(), "active/blocked");
        assert_eq!(PermitState::Inactive.to_string(), "inactive");
        assert_eq!(PermitState::Evicted.to_string(), "evicted");
    }

    #[test]
    fn max_result_size_defaults_to_unlimited() {
        assert_eq!(MaxResultSize::default(), MaxResultSize::unlimited());
        assert_eq!(MaxResultSize::new(1, 2).soft_limit, 1);
    }
}
