// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use tracing::info;

use crate::procfs::{self, SelfStat};

/// Per-cycle worker counters, cleared after each export.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub event_count: u64,
    pub sample_count: u64,
    pub lost_total: u64,
    pub unwind_ns_total: u64,
    pub aggregation_ns_total: u64,
    pub stack_bytes_total: u64,
}

impl CycleStats {
    pub fn reset(&mut self) {
        *self = CycleStats::default();
    }

    pub fn avg_unwind_ns(&self) -> i64 {
        if self.sample_count == 0 {
            return -1;
        }

        (self.unwind_ns_total / self.sample_count) as i64
    }

    pub fn avg_stack_bytes(&self) -> i64 {
        if self.sample_count == 0 {
            return -1;
        }

        (self.stack_bytes_total / self.sample_count) as i64
    }
}

/// The profiler's own footprint, scraped each cycle from procfs and
/// logged alongside the pipeline counters.
pub struct WorkerStats {
    pub cycle: CycleStats,
    last_self_stat: SelfStat,
    clock_ticks_per_sec: u64,
    page_size: u64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        let clock_ticks_per_sec = unsafe {
            libc::sysconf(libc::_SC_CLK_TCK) as u64
        };

        let page_size = unsafe {
            libc::sysconf(libc::_SC_PAGE_SIZE) as u64
        };

        Self {
            cycle: CycleStats::default(),
            last_self_stat: procfs::read_self_stat().unwrap_or_default(),
            clock_ticks_per_sec,
            page_size,
        }
    }

    /// Scrapes procfs, logs the cycle summary and resets the counters.
    pub fn log_cycle(
        &mut self,
        cycle_duration_ns: u64,
        dso_count: usize,
        symbol_cache_hits: u64,
        symbol_cache_calls: u64) {
        let current = procfs::read_self_stat().unwrap_or_default();

        let cpu_ticks = (current.utime + current.stime)
            .saturating_sub(
                self.last_self_stat.utime + self.last_self_stat.stime);

        self.last_self_stat = current;

        let millicores = if cycle_duration_ns > 0 {
            cpu_ticks
                .saturating_mul(1_000_000_000_000)
                / self.clock_ticks_per_sec
                / cycle_duration_ns
        } else {
            0
        };

        info!(
            "cycle: events={} samples={} lost={} avg_unwind_ns={} \
             avg_stack_bytes={} dsos={} symcache={}/{} rss_mib={} \
             self_millicores={}",
            self.cycle.event_count,
            self.cycle.sample_count,
            self.cycle.lost_total,
            self.cycle.avg_unwind_ns(),
            self.cycle.avg_stack_bytes(),
            dso_count,
            symbol_cache_hits,
            symbol_cache_calls,
            current.rss_pages * self.page_size / (1024 * 1024),
            millicores);

        self.cycle.reset();
    }
}
