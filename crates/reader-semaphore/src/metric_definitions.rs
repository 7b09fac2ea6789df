// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{describe_counter, describe_gauge, Unit};

pub const READS_ADMITTED: &str = "coraldb.reader_semaphore.reads_admitted.total";
pub const READS_ENQUEUED_FOR_ADMISSION: &str =
    "coraldb.reader_semaphore.reads_enqueued_for_admission.total";
pub const READS_ENQUEUED_FOR_MEMORY: &str =
    "coraldb.reader_semaphore.reads_enqueued_for_memory.total";
pub const READS_SHED_DUE_TO_OVERLOAD: &str =
    "coraldb.reader_semaphore.reads_shed_due_to_overload.total";
pub const READS_KILLED_DUE_TO_KILL_LIMIT: &str =
    "coraldb.reader_semaphore.reads_killed_due_to_kill_limit.total";
pub const PERMIT_BASED_EVICTIONS: &str = "coraldb.reader_semaphore.permit_based_evictions.total";
pub const TIME_BASED_EVICTIONS: &str = "coraldb.reader_semaphore.time_based_evictions.total";

pub const CURRENT_PERMITS: &str = "coraldb.reader_semaphore.current_permits";
pub const USED_PERMITS: &str = "coraldb.reader_semaphore.used_permits";
pub const BLOCKED_PERMITS: &str = "coraldb.reader_semaphore.blocked_permits";
pub const INACTIVE_READS: &str = "coraldb.reader_semaphore.inactive_reads";
pub const DISK_READS: &str = "coraldb.reader_semaphore.disk_reads";
pub const SSTABLES_READ: &str = "coraldb.reader_semaphore.sstables_read";

pub fn describe_metrics() {
    describe_counter!(
        READS_ADMITTED,
        Unit::Count,
        "Number of reads admitted past the reader semaphore"
    );

    describe_counter!(
        READS_ENQUEUED_FOR_ADMISSION,
        Unit::Count,
        "Number of reads that had to queue for admission"
    );

    describe_counter!(
        READS_ENQUEUED_FOR_MEMORY,
        Unit::Count,
        "Number of admitted reads that had to queue for memory"
    );

    describe_counter!(
        READS_SHED_DUE_TO_OVERLOAD,
        Unit::Count,
        "Number of reads shed because the wait/ready queues were full"
    );

    describe_counter!(
        READS_KILLED_DUE_TO_KILL_LIMIT,
        Unit::Count,
        "Number of reads killed because consumed memory crossed the kill limit"
    );

    describe_counter!(
        PERMIT_BASED_EVICTIONS,
        Unit::Count,
        "Number of inactive reads evicted to make room for admissions"
    );

    describe_counter!(
        TIME_BASED_EVICTIONS,
        Unit::Count,
        "Number of inactive reads evicted because their TTL expired"
    );

    describe_gauge!(
        CURRENT_PERMITS,
        Unit::Count,
        "Number of permits currently alive"
    );

    describe_gauge!(
        USED_PERMITS,
        Unit::Count,
        "Number of permits belonging to reads actively producing output"
    );

    describe_gauge!(
        BLOCKED_PERMITS,
        Unit::Count,
        "Number of used permits additionally blocked on I/O"
    );

    describe_gauge!(
        INACTIVE_READS,
        Unit::Count,
        "Number of paused readers parked in the inactive-read cache"
    );

    describe_gauge!(
        DISK_READS,
        Unit::Count,
        "Number of permits with at least one sstable read in flight"
    );

    describe_gauge!(
        SSTABLES_READ,
        Unit::Count,
        "Number of sstable reads in flight across all permits"
    );
}
