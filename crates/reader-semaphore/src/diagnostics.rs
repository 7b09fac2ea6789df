// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use bytestring::ByteString;
use enum_map::{Enum, EnumMap};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::permit::PermitState;
use crate::resources::ReaderResources;
use crate::schema::{SchemaRef, TableId};

/// The event kinds that trigger an automatic diagnostics dump. Each kind is
/// rate-limited separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub(crate) enum DumpKind {
    TimedOut,
    QueueOverload,
    KillLimit,
    Contradiction,
    InvariantViolation,
}

/// Allows one dump per `period` per event kind, no matter how many events
/// fire.
pub(crate) struct DumpRateLimiter {
    period: Duration,
    last: Mutex<EnumMap<DumpKind, Option<Instant>>>,
}

impl DumpRateLimiter {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period,
            last: Mutex::new(EnumMap::default()),
        }
    }

    pub(crate) fn allow(&self, kind: DumpKind) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match last[kind] {
            Some(at) if now.duration_since(at) < self.period => false,
            _ => {
                last[kind] = Some(now);
                true
            }
        }
    }
}

pub(crate) fn human_readable_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let sign = if bytes < 0 { "-" } else { "" };
    let mut value = bytes.unsigned_abs() as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{sign}{}B", bytes.unsigned_abs())
    } else {
        format!("{sign}{value:.1}{}", UNITS[unit])
    }
}

#[derive(Default, Clone, Copy)]
struct PermitGroupStats {
    permits: u64,
    resources: ReaderResources,
}

impl PermitGroupStats {
    fn add(&mut self, resources: ReaderResources) {
        self.permits += 1;
        self.resources += resources;
    }
}

/// Builds the tabular permit dump: rows grouped by (schema, op name, state),
/// sorted by consumed memory descending, rows beyond `max_lines` collapsed
/// into an "omitted" row, followed by a total. `max_lines == 0` disables the
/// collapse.
pub(crate) fn format_permit_diagnostics(
    name: &str,
    initial: ReaderResources,
    available: ReaderResources,
    permits: impl Iterator<Item = (Option<SchemaRef>, ByteString, PermitState, ReaderResources)>,
    problem: &str,
    max_lines: usize,
) -> String {
    type GroupKey = (Option<TableId>, ByteString, PermitState);
    let mut groups: HashMap<GroupKey, (Option<SchemaRef>, PermitGroupStats)> = HashMap::new();
    for (schema, op_name, state, resources) in permits {
        let key = (schema.as_deref().map(|s| s.id()), op_name, state);
        let slot = groups.entry(key).or_insert_with(|| (schema, PermitGroupStats::default()));
        slot.1.add(resources);
    }

    let mut summaries: Vec<_> = groups
        .into_iter()
        .map(|((_, op_name, state), (schema, stats))| (schema, op_name, state, stats))
        .collect();
    summaries.sort_by(|a, b| b.3.resources.memory.cmp(&a.3.resources.memory));

    let consumed = initial - available;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Semaphore {} with {}/{} count and {}/{} memory resources: {}, dumping permit diagnostics:",
        name, consumed.count, initial.count, consumed.memory, initial.memory, problem
    );
    let _ = writeln!(out, "permits\tcount\tmemory\ttable/description/state");

    let mut total = PermitGroupStats::default();
    let mut omitted = PermitGroupStats::default();
    for (line, (schema, op_name, state, stats)) in summaries.iter().enumerate() {
        total.permits += stats.permits;
        total.resources += stats.resources;
        if max_lines == 0 || line < max_lines {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}.{}/{}/{}",
                stats.permits,
                stats.resources.count,
                human_readable_bytes(stats.resources.memory),
                schema.as_deref().map_or("*", |s| s.keyspace()),
                schema.as_deref().map_or("*", |s| s.table()),
                op_name,
                state
            );
        } else {
            omitted.permits += stats.permits;
            omitted.resources += stats.resources;
        }
    }
    if omitted.permits > 0 {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\tpermits omitted for brevity",
            omitted.permits,
            omitted.resources.count,
            human_readable_bytes(omitted.resources.memory)
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}\t{}\t{}\ttotal",
        total.permits,
        total.resources.count,
        human_readable_bytes(total.resources.memory)
    );
    out
}
