/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Per-thread timing for the handful of phases the refresh loop actually
//! has: scan, dispatch, drain, and the disk stats a freshness check makes.
//! Unlike an open-ended named-metric namespace, the scheduler's phases are
//! a closed, known set, so they're a fixed enum rather than an interned
//! string table.

use std::{
    cell::RefCell,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    thread_local,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Scan,
    Dispatch,
    Drain,
    DiskStat,
}

const KINDS: [MetricKind; 4] = [
    MetricKind::Scan,
    MetricKind::Dispatch,
    MetricKind::Drain,
    MetricKind::DiskStat,
];

impl MetricKind {
    fn index(self) -> usize {
        KINDS.iter().position(|k| *k == self).expect("MetricKind is in KINDS")
    }

    fn label(self) -> &'static str {
        match self {
            MetricKind::Scan => "scan",
            MetricKind::Dispatch => "dispatch",
            MetricKind::Drain => "drain",
            MetricKind::DiskStat => "disk_stat",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    count: usize,
    sum_micros: u128,
}

impl Tally {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.sum_micros += elapsed.as_micros();
    }
}

pub struct ScopedMetric {
    kind: MetricKind,
    start: Instant,
}

impl ScopedMetric {
    pub fn new(kind: MetricKind) -> Self {
        ScopedMetric {
            kind,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedMetric {
    fn drop(&mut self) {
        TALLIES.with(|t| t.borrow_mut()[self.kind.index()].record(self.start.elapsed()));
    }
}

struct Tallies<'a>(&'a [Tally; KINDS.len()]);

impl fmt::Display for Tallies<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_width = KINDS.iter().map(|k| k.label().len()).max().unwrap_or(0).max(7);
        writeln!(
            f,
            "{:name_width$} {:>6} {:>9} {:>11}",
            "metric ",
            "count",
            "avg (us)",
            "total (us)",
            name_width = name_width
        )?;
        writeln!(
            f,
            "{:-<name_width$} {:-^6} {:-^9} {:-^11}",
            "",
            "",
            "",
            "",
            name_width = name_width
        )?;
        for kind in KINDS {
            let tally = &self.0[kind.index()];
            if tally.count == 0 {
                continue;
            }
            writeln!(
                f,
                "{:name_width$} {: >6} {:>9.3} {:>11}",
                kind.label(),
                tally.count,
                tally.sum_micros as f64 / tally.count as f64,
                tally.sum_micros,
                name_width = name_width
            )?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! scoped_metric {
    ($kind:expr) => {
        let _scoped_metric = if $crate::is_enabled() {
            ::core::option::Option::Some($crate::ScopedMetric::new($kind))
        } else {
            ::core::option::Option::None
        };
    };
}

thread_local! {
    static TALLIES: RefCell<[Tally; 4]> = RefCell::new([Tally::default(); 4]);
}
static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Emits the current thread's accumulated metrics as a single structured
/// log event, table-formatted in the message body.
pub fn dump() {
    TALLIES.with(|t| {
        tracing::info!(metrics = %Tallies(&t.borrow()), "scheduler metrics");
    })
}

fn count_for(kind: MetricKind) -> usize {
    TALLIES.with(|t| t.borrow()[kind.index()].count)
}
