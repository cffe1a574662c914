// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{ProfError, ProfResult, What, check_warn};
use crate::aggregate::{LiveAllocations, ProfileBuilder};
use crate::alloc::protocol::RingBufferInfo;
use crate::clock::TscClock;
use crate::dso::Dso;
use crate::export::{ExportCycle, Exporter, ExporterConfig, DEFAULT_UPLOAD_PERIOD};
use crate::perf_event::{abi, cpu_count, PerfEvent};
use crate::pprof;
use crate::ringbuf::{MpscRing, PerfRingReader, RingCursor, RingKind};
use crate::stats::WorkerStats;
use crate::symbols::Symbolizer;
use crate::unwind::{FunLoc, MapInfoLookup, UnwindOutput, UnwindState};
use crate::watcher::{ValueSource, Watcher, AGG_POS_SUM};

/// Cycles between backpopulate / process-cache resets.
pub const DEFAULT_CACHE_RESET_PERIOD: u32 = 5;

const POLL_TIMEOUT_MS: i32 = 100;

/// Ring sizes: perf rings per event, data pages as a power of two.
pub const DEFAULT_PERF_PAGE_ORDER: u32 = 6;
pub const DEFAULT_MPSC_PAGE_ORDER: u32 = 8;

#[derive(Clone)]
pub struct WorkerConfig {
    pub watchers: Vec<Watcher>,
    /// `None` profiles system wide.
    pub target_pid: Option<i32>,
    pub upload_period: Duration,
    pub exporter: ExporterConfig,
    pub perf_page_order: u32,
    pub cache_reset_period: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            watchers: Vec::new(),
            target_pid: None,
            upload_period: DEFAULT_UPLOAD_PERIOD,
            exporter: ExporterConfig::default(),
            perf_page_order: DEFAULT_PERF_PAGE_ORDER,
            cache_reset_period: DEFAULT_CACHE_RESET_PERIOD,
        }
    }
}

enum SourceKind {
    Perf {
        event: PerfEvent,
        reader: PerfRingReader,
    },
    Custom {
        ring: Arc<MpscRing>,
    },
}

/// One pollable event stream bound to a watcher.
struct EventSource {
    kind: SourceKind,
    watcher_index: usize,
    cursor: RingCursor,
    temp: Vec<u8>,
}

impl EventSource {
    fn poll_fd(&self) -> i32 {
        match &self.kind {
            SourceKind::Perf { event, .. } => event.fd(),
            SourceKind::Custom { ring } => ring.event_fd(),
        }
    }
}

/// The profiler worker: single-threaded loop draining every ring,
/// unwinding samples, aggregating them and cutting profiles on the
/// upload cadence.
pub struct Worker {
    watchers: Vec<Watcher>,
    sources: Vec<EventSource>,
    state: UnwindState,
    builders: Vec<ProfileBuilder>,
    i_current_profile: usize,
    live: LiveAllocations,
    cycle: ExportCycle,
    symbolizer: Symbolizer,
    stats: WorkerStats,
    clock: TscClock,
    lost_per_watcher: Vec<u64>,
    cache_reset_period: u32,
    stop: Arc<AtomicBool>,
}

impl Worker {
    /// Opens every kernel event (one per watcher per CPU, perf sources
    /// strictly before custom ones) and readies the pipeline.
    pub fn new(
        mut config: WorkerConfig) -> ProfResult<Self> {
        if config.watchers.is_empty() {
            return Err(ProfError::fatal(
                What::Worker,
                "no watchers configured"));
        }

        let clock = TscClock::calibrate();

        let builder_a = ProfileBuilder::new(&mut config.watchers);
        let builder_b = ProfileBuilder::new(&mut config.watchers);

        let mut sources = Vec::new();
        let pid = config.target_pid.unwrap_or(-1);

        /* Perf-backed watchers first: custom events may depend on the
         * mmap/comm records the perf side emits */
        let mut first_perf = true;

        for (watcher_index, watcher) in config.watchers.iter().enumerate() {
            if watcher.is_custom() {
                continue;
            }

            for cpu in 0..cpu_count() {
                let mut event = PerfEvent::open(
                    watcher,
                    watcher_index,
                    pid,
                    cpu,
                    first_perf)?;

                event.mmap(config.perf_page_order)?;

                let reader = event.reader()?;

                sources.push(
                    EventSource {
                        kind: SourceKind::Perf {
                            event,
                            reader,
                        },
                        watcher_index,
                        cursor: RingCursor::default(),
                        temp: Vec::new(),
                    });
            }

            first_perf = false;
        }

        for (watcher_index, watcher) in config.watchers.iter().enumerate() {
            if !watcher.is_custom() {
                continue;
            }

            let ring = MpscRing::create(DEFAULT_MPSC_PAGE_ORDER)
                .map_err(|error| ProfError::fatal(
                    What::RingBuffer,
                    format!("mpsc ring creation failed: {}", error)))?;

            sources.push(
                EventSource {
                    kind: SourceKind::Custom {
                        ring: Arc::new(ring),
                    },
                    watcher_index,
                    cursor: RingCursor::default(),
                    temp: Vec::new(),
                });
        }

        let exporter = Exporter::new(config.exporter.clone())
            .map_err(|error| ProfError::fatal(
                What::Exporter,
                format!("exporter init failed: {}", error)))?;

        let lost_per_watcher = vec![0u64; config.watchers.len()];

        info!(
            "worker ready: {} watchers, {} event sources",
            config.watchers.len(),
            sources.len());

        Ok(Self {
            watchers: config.watchers,
            sources,
            state: UnwindState::new(),
            builders: vec![builder_a, builder_b],
            i_current_profile: 0,
            live: LiveAllocations::new(),
            cycle: ExportCycle::new(exporter, config.upload_period),
            symbolizer: Symbolizer::default(),
            stats: WorkerStats::new(),
            clock,
            lost_per_watcher,
            cache_reset_period: config.cache_reset_period.max(1),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle the caller flips from a signal context to stop the loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn clock(&self) -> &TscClock {
        &self.clock
    }

    /// Ring bindings for allocation watchers, used to hand fds to the
    /// in-process tracker through the handshake socket.
    pub fn allocation_rings(&self) -> Vec<(usize, RingBufferInfo)> {
        self.sources
            .iter()
            .filter_map(|source| {
                match &source.kind {
                    SourceKind::Custom { ring } => Some((
                        source.watcher_index,
                        RingBufferInfo {
                            ring_fd: ring.ring_fd(),
                            event_fd: ring.event_fd(),
                            mem_size: ring.total_size() as u64,
                            kind: RingKind::Mpsc,
                        })),
                    _ => None,
                }
            })
            .collect()
    }

    /// Shared handle to an allocation ring, for running the tracker in
    /// the same process (preloaded library mode).
    pub fn allocation_ring(
        &self,
        watcher_index: usize) -> Option<Arc<MpscRing>> {
        self.sources
            .iter()
            .find_map(|source| {
                match &source.kind {
                    SourceKind::Custom { ring }
                        if source.watcher_index == watcher_index =>
                        Some(ring.clone()),
                    _ => None,
                }
            })
    }

    pub fn enable(&mut self) -> ProfResult<()> {
        for source in &self.sources {
            if let SourceKind::Perf { event, .. } = &source.kind {
                event.enable().map_err(|error| ProfError::fatal(
                    What::PerfOpen,
                    format!("enable failed: {}", error)))?;
            }
        }

        Ok(())
    }

    /// The main loop: cadence check, poll, drain. Returns when stopped
    /// or on a fatal error after teardown.
    pub fn run(&mut self) -> ProfResult<()> {
        let result = self.run_inner();

        self.teardown();

        result
    }

    fn run_inner(&mut self) -> ProfResult<()> {
        while !self.stop.load(Ordering::Acquire) {
            let now = Instant::now();

            if self.cycle.should_export(now) {
                self.export_cycle(now)?;
            }

            self.poll_and_drain()?;
        }

        info!("worker stopping");

        Ok(())
    }

    fn poll_and_drain(&mut self) -> ProfResult<()> {
        let mut poll_fds: Vec<libc::pollfd> = self.sources
            .iter()
            .map(|source| libc::pollfd {
                fd: source.poll_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let ready = unsafe {
            libc::poll(
                poll_fds.as_mut_ptr(),
                poll_fds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS)
        };

        if ready == -1 {
            let error = std::io::Error::last_os_error();

            if error.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }

            return Err(ProfError::fatal(
                What::Worker,
                format!("poll failed: {}", error)));
        }

        /* Drain every readable fd to empty before moving on; order
         * within one ring is preserved, order across rings is best
         * effort. Custom rings are always swept so a missed wakeup
         * cannot strand events. */
        for (index, poll_fd) in poll_fds.iter().enumerate() {
            let custom = matches!(
                self.sources[index].kind,
                SourceKind::Custom { .. });

            if custom || poll_fd.revents & libc::POLLIN != 0 {
                self.drain_source(index)?;
            }
        }

        Ok(())
    }

    /// One drain sweep with no poll wait, used by tests and teardown.
    pub fn drain_all(&mut self) -> ProfResult<()> {
        for index in 0..self.sources.len() {
            self.drain_source(index)?;
        }

        Ok(())
    }

    fn drain_source(
        &mut self,
        index: usize) -> ProfResult<()> {
        let watcher_index = self.sources[index].watcher_index;

        if let SourceKind::Custom { ring } = &self.sources[index].kind {
            /* Acknowledge the pending wakeups once per sweep */
            ring.consume_notification();
        }

        /* Records are copied out so the source borrow does not pin
         * `self` while dispatching */
        let mut record_buf = Vec::new();

        loop {
            record_buf.clear();

            {
                let source = &mut self.sources[index];

                match &mut source.kind {
                    SourceKind::Perf { reader, .. } => {
                        reader.begin_reading(&mut source.cursor);

                        match reader.read(&mut source.cursor, &mut source.temp) {
                            Ok(record) if !record.is_empty() => {
                                record_buf.extend_from_slice(record);
                            },
                            _ => {},
                        }

                        reader.end_reading(&source.cursor);
                    },
                    SourceKind::Custom { ring } => {
                        ring.begin_reading(&mut source.cursor);

                        if let Some(record) = ring.read(&mut source.cursor) {
                            record_buf.extend_from_slice(record);
                        }

                        ring.end_reading(&source.cursor);
                    },
                }
            }

            if record_buf.is_empty() {
                return Ok(());
            }

            check_warn(self.dispatch_record(watcher_index, &record_buf))?;
        }
    }

    /// Routes one framed record to its handler.
    fn dispatch_record(
        &mut self,
        watcher_index: usize,
        record: &[u8]) -> ProfResult<()> {
        let header = abi::Header::from_slice(record)
            .map_err(|_| ProfError::warn(
                What::RingBuffer,
                "short record header"))?;

        self.stats.cycle.event_count += 1;

        match header.entry_type {
            abi::PERF_RECORD_SAMPLE => {
                let custom = self.watchers[watcher_index].is_custom();

                let sample = abi::SampleRecord::parse(
                    record,
                    sample_mask(custom))
                    .ok_or_else(|| ProfError::warn(
                        What::RingBuffer,
                        "malformed sample record"))?;

                if sample.pid != 0 {
                    self.process_sample(watcher_index, &sample)?;
                }
            },
            abi::PERF_RECORD_MMAP2 => {
                if let Some(map) = abi::Mmap2Record::parse(record) {
                    if map.pid != 0 {
                        self.handle_mmap(&map);
                    }
                }
            },
            abi::PERF_RECORD_COMM => {
                if let Some(comm) = abi::CommRecord::parse(record) {
                    if comm.pid != 0 &&
                       header.misc & abi::PERF_RECORD_MISC_COMM_EXEC != 0 {
                        /* exec wipes the old image */
                        debug!("(COMM){} -> {}", comm.pid, comm.comm);
                        self.free_pid(comm.pid);
                    }
                }
            },
            abi::PERF_RECORD_FORK => {
                if let Some(task) = abi::TaskRecord::parse(record) {
                    if task.pid != task.ppid {
                        debug!("(FORK){} -> {}", task.ppid, task.pid);
                        self.free_pid(task.pid);
                        self.state.pid_fork(task.pid, task.ppid);
                    }
                }
            },
            abi::PERF_RECORD_EXIT => {
                if let Some(task) = abi::TaskRecord::parse(record) {
                    /* Cleanup is deferred to the unvisited sweep */
                    if task.pid == task.tid {
                        debug!("(EXIT){}", task.pid);
                    }
                }
            },
            abi::PERF_RECORD_LOST => {
                if let Some(lost) = abi::LostRecord::parse(record) {
                    self.stats.cycle.lost_total += lost.lost;
                    self.lost_per_watcher[watcher_index] += lost.lost;
                }
            },
            abi::CUSTOM_RECORD_DEALLOCATION => {
                if record.len() >= 24 {
                    let pid = u32::from_ne_bytes(
                        record[8..12].try_into().unwrap());
                    let addr = u64::from_ne_bytes(
                        record[16..24].try_into().unwrap());

                    self.live.register_deallocation(
                        watcher_index,
                        pid,
                        addr);
                }
            },
            abi::CUSTOM_RECORD_CLEAR_LIVE => {
                if record.len() >= 12 {
                    let pid = u32::from_ne_bytes(
                        record[8..12].try_into().unwrap());

                    debug!("(CLEAR LIVE){}", pid);

                    /* Fold what we know into the current profile, then
                     * restart tracking for the PID */
                    self.live.aggregate_pid_into(
                        &mut self.builders[self.i_current_profile],
                        &self.watchers,
                        pid);

                    self.live.clear_pid_for_watcher(watcher_index, pid);
                }
            },
            _ => {},
        }

        Ok(())
    }

    fn handle_mmap(
        &mut self,
        map: &abi::Mmap2Record<'_>) {
        debug!(
            "(MAP){}: {} ({:#x}/{:#x}/{:#x})",
            map.pid, map.filename, map.addr, map.len, map.pgoff);

        let dso = Dso::new(
            map.pid,
            map.addr,
            map.addr + map.len,
            map.pgoff,
            map.filename,
            map.ino,
            map.prot & 7)
            .with_dev(map.maj, map.min);

        self.state.registry.insert_erase_overlap(dso);
    }

    fn process_sample(
        &mut self,
        watcher_index: usize,
        sample: &abi::SampleRecord<'_>) -> ProfResult<()> {
        self.stats.cycle.sample_count += 1;
        self.stats.cycle.stack_bytes_total += sample.stack.len() as u64;

        let unwind_start = self.clock.now_ns();

        self.state.unwind_sample(sample)?;

        let unwind_end = self.clock.now_ns();
        self.stats.cycle.unwind_ns_total +=
            unwind_end.saturating_sub(unwind_start);

        let watcher = &self.watchers[watcher_index];
        let value = value_from_sample(watcher, sample);

        if watcher.aggregation.has_live_sum() {
            self.live.register_allocation(
                watcher_index,
                sample.pid,
                sample.addr,
                value as i64,
                &self.state.output);
        }

        if watcher.aggregation.has_sum() {
            self.builders[self.i_current_profile].add(
                &self.state.output,
                watcher,
                AGG_POS_SUM,
                value,
                1);
        }

        self.stats.cycle.aggregation_ns_total +=
            self.clock.now_ns().saturating_sub(unwind_end);

        Ok(())
    }

    /// Flushes per-watcher lost counters as tagged profile entries so
    /// dropped volume stays visible.
    fn report_lost_events(&mut self) {
        for watcher_index in 0..self.watchers.len() {
            let lost = self.lost_per_watcher[watcher_index];

            if lost == 0 {
                continue;
            }

            self.lost_per_watcher[watcher_index] = 0;

            let watcher = &self.watchers[watcher_index];
            let value = watcher.period_value() * lost;

            warn!(
                "reporting {} lost samples (value {}) for watcher {}",
                lost, value, watcher.name);

            let output = UnwindOutput {
                pid: 0,
                tid: 0,
                locs: vec![FunLoc {
                    ip: 0,
                    elf_pc: 0,
                    file_info_id: crate::dso::FILE_INFO_ERROR,
                    symbol_idx: self.state.labels.lost,
                    mapinfo_idx: MapInfoLookup::anonymous(),
                }],
                is_incomplete: false,
                container_id: None,
            };

            self.builders[self.i_current_profile].add(
                &output,
                watcher,
                AGG_POS_SUM,
                value,
                lost);
        }
    }

    /// Frees every piece of per-PID state, folding its live
    /// allocations into the profile being built first.
    fn free_pid(
        &mut self,
        pid: u32) {
        self.live.aggregate_pid_into(
            &mut self.builders[self.i_current_profile],
            &self.watchers,
            pid);

        self.live.clear_pid(pid);
        self.state.pid_free(pid);
    }

    /// Cuts the active profile and ships it: rotate builders, fold the
    /// live view, symbolize, serialize, then upload off-thread.
    fn export_cycle(
        &mut self,
        now: Instant) -> ProfResult<()> {
        /* Unvisited PIDs go first so they stop holding memory */
        for pid in self.state.cycle() {
            debug!("freeing unvisited PID {}", pid);
            self.free_pid(pid);
        }

        self.report_lost_events();

        self.live.aggregate_into(
            &mut self.builders[self.i_current_profile],
            &self.watchers);

        let cycle_duration = self.cycle.rotate_cycle_clock();

        /* Rotate: the closed builder belongs to serialization now */
        let closed = self.i_current_profile;
        self.i_current_profile = 1 - self.i_current_profile;
        self.builders[self.i_current_profile].reset();

        self.builders[closed].symbolize_locations(
            &mut self.symbolizer,
            &self.state.registry);

        let mut payload = Vec::with_capacity(256 * 1024);

        match pprof::write_profile_gz(
            &self.builders[closed],
            &self.state.symbol_table,
            &self.state.mapinfo,
            cycle_duration.as_nanos() as u64,
            &mut payload) {
            Ok(()) => {
                self.cycle.export(payload, now)?;
            },
            Err(error) => {
                /* One bad profile is not worth the run */
                warn!("profile serialization failed: {}", error);
            },
        }

        /* Cycle maintenance */
        self.symbolizer.sweep_unvisited();

        if self.cycle.count_worker() % self.cache_reset_period == 0 {
            self.state.registry.reset_backpopulate_state(
                crate::dso::registry::BACKPOPULATE_RESET_THRESHOLD);
            self.state.reset_process_caches();
        }

        let cache_stats = self.state.dwarf_cache.stats();

        self.stats.log_cycle(
            cycle_duration.as_nanos() as u64,
            self.state.registry.dso_count(),
            cache_stats.hits,
            cache_stats.calls);

        self.state.dwarf_cache.reset_stats();

        Ok(())
    }

    /// Teardown order: disable, unmap, close (by drop), join exporter.
    fn teardown(&mut self) {
        for source in &mut self.sources {
            if let SourceKind::Perf { event, .. } = &mut source.kind {
                let _ = event.disable();
            }
        }

        self.sources.clear();
        self.cycle.shutdown();
    }
}

fn sample_mask(
    custom: bool) -> u64 {
    let mut mask = abi::PERF_SAMPLE_IDENTIFIER |
        abi::PERF_SAMPLE_TID |
        abi::PERF_SAMPLE_TIME |
        abi::PERF_SAMPLE_PERIOD |
        abi::PERF_SAMPLE_REGS_USER |
        abi::PERF_SAMPLE_STACK_USER;

    if custom {
        mask |= abi::PERF_SAMPLE_ADDR;
    }

    mask
}

/// Extracts a sample's numeric value per the watcher's source.
fn value_from_sample(
    watcher: &Watcher,
    sample: &abi::SampleRecord<'_>) -> u64 {
    match watcher.value_source {
        ValueSource::Sample => sample.period,
        ValueSource::Register(regno) => {
            sample.regs
                .get(regno as usize)
                .copied()
                .unwrap_or(0)
        },
        ValueSource::Raw { offset, size } => {
            let start = offset as usize;
            let end = start + size as usize;

            if end > sample.raw.len() || size > 8 {
                return 0;
            }

            let mut bytes = [0u8; 8];
            bytes[..size as usize]
                .copy_from_slice(&sample.raw[start..end]);

            u64::from_ne_bytes(bytes)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AllocationTracker, TrackerSettings};
    use crate::watcher::{watcher_from_str, AGG_POS_LIVE};

    fn alloc_only_config() -> WorkerConfig {
        WorkerConfig {
            watchers: vec![watcher_from_str("sALLOC").unwrap()],
            target_pid: None,
            upload_period: Duration::from_secs(3600),
            exporter: ExporterConfig::default(),
            perf_page_order: 1,
            cache_reset_period: 2,
        }
    }

    #[test]
    fn value_sources() {
        let mut watcher = watcher_from_str("sCPU").unwrap();

        let raw = [0u8, 1, 2, 3, 4, 5, 6, 7];

        let sample = abi::SampleRecord {
            pid: 1,
            tid: 1,
            time: 0,
            addr: 0,
            period: 777,
            regs: [10, 20, 30],
            stack: &[],
            raw: &raw,
        };

        assert_eq!(777, value_from_sample(&watcher, &sample));

        watcher.value_source = ValueSource::Register(1);
        assert_eq!(20, value_from_sample(&watcher, &sample));

        watcher.value_source = ValueSource::Register(9);
        assert_eq!(0, value_from_sample(&watcher, &sample));

        watcher.value_source = ValueSource::Raw { offset: 2, size: 2 };
        assert_eq!(
            u16::from_ne_bytes([2, 3]) as u64,
            value_from_sample(&watcher, &sample));

        watcher.value_source = ValueSource::Raw { offset: 6, size: 4 };
        assert_eq!(0, value_from_sample(&watcher, &sample));
    }

    #[test]
    fn custom_pipeline_end_to_end() {
        /* Allocation watcher only: no perf permissions needed. The
         * tracker samples this test process and the worker unwinds it
         * for real. */
        let mut worker = Worker::new(alloc_only_config()).unwrap();

        let ring = worker.allocation_ring(0).unwrap();

        let tracker = AllocationTracker::new(
            ring,
            &TrackerSettings {
                allocation_profiling_rate: -(64 * 1024),
                allocation_flags: 0,
                stack_sample_size: 2048,
                initial_libs_delay_ms: 0,
                libs_interval_ms: 0,
                pid: 0,
            });

        /* 1 MiB in 1 KiB chunks at a 64 KiB deterministic interval */
        for i in 0..1024u64 {
            tracker.track_allocation(0x100000 + i * 0x400, 1024);
        }

        worker.drain_all().unwrap();

        let builder = &worker.builders[worker.i_current_profile];

        assert!(builder.entry_count() >= 1);

        /* Every sampled byte is accounted: sum of alloc-space equals
         * the allocated megabyte */
        let indices = &worker.watchers[0].profile_indices[AGG_POS_SUM];

        let total: i64 = builder.entries()
            .map(|entry| entry.values[indices.value_index as usize])
            .sum();

        assert_eq!(1024 * 1024, total);

        /* The live view tracks the same stacks */
        let live_indices = &worker.watchers[0].profile_indices[AGG_POS_LIVE];
        assert!(live_indices.value_index >= 0);
    }

    #[test]
    fn deallocation_records_flow() {
        let mut worker = Worker::new(alloc_only_config()).unwrap();

        let ring = worker.allocation_ring(0).unwrap();

        let tracker = AllocationTracker::new(
            ring,
            &TrackerSettings {
                allocation_profiling_rate: -1024,
                allocation_flags: crate::alloc::FLAG_TRACK_DEALLOCATIONS,
                stack_sample_size: 1024,
                initial_libs_delay_ms: 0,
                libs_interval_ms: 0,
                pid: 0,
            });

        tracker.track_allocation(0xAB000, 8192);
        worker.drain_all().unwrap();

        let pid = std::process::id();
        assert_eq!(1, worker.live.tracked_count(0, pid));

        tracker.track_deallocation(0xAB000);
        worker.drain_all().unwrap();

        assert_eq!(0, worker.live.tracked_count(0, pid));
    }

    #[test]
    fn export_cycle_rotates_and_counts() {
        let mut worker = Worker::new(alloc_only_config()).unwrap();

        let before = worker.i_current_profile;

        worker.export_cycle(Instant::now()).unwrap();

        assert_ne!(before, worker.i_current_profile);
        assert_eq!(1, worker.cycle.count_worker());

        /* The fresh active builder is empty */
        assert_eq!(
            0,
            worker.builders[worker.i_current_profile].entry_count());

        worker.export_cycle(Instant::now()).unwrap();
        assert_eq!(2, worker.cycle.count_worker());

        worker.teardown();
    }

    #[test]
    fn lost_events_become_profile_entries() {
        let mut worker = Worker::new(alloc_only_config()).unwrap();

        worker.lost_per_watcher[0] = 4;
        worker.report_lost_events();

        let builder = &worker.builders[worker.i_current_profile];
        assert_eq!(1, builder.entry_count());

        let entry = builder.entries().next().unwrap();
        let lost_label = worker.state.labels.lost;

        assert_eq!(lost_label, entry.stack.locs[0].symbol_idx);

        /* Counter was flushed */
        assert_eq!(0, worker.lost_per_watcher[0]);
    }

    #[test]
    fn mmap_records_update_registry() {
        let mut worker = Worker::new(alloc_only_config()).unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&77u32.to_ne_bytes());
        payload.extend_from_slice(&77u32.to_ne_bytes());
        payload.extend_from_slice(&0x7000u64.to_ne_bytes());
        payload.extend_from_slice(&0x1000u64.to_ne_bytes());
        payload.extend_from_slice(&0u64.to_ne_bytes());
        payload.extend_from_slice(&8u32.to_ne_bytes());
        payload.extend_from_slice(&1u32.to_ne_bytes());
        payload.extend_from_slice(&99u64.to_ne_bytes());
        payload.extend_from_slice(&0u64.to_ne_bytes());
        payload.extend_from_slice(&5u32.to_ne_bytes());
        payload.extend_from_slice(&0u32.to_ne_bytes());
        payload.extend_from_slice(b"/usr/lib/fake.so\0");

        let mut record = Vec::new();
        abi::Header::write(abi::PERF_RECORD_MMAP2, 0, &payload, &mut record);

        worker.dispatch_record(0, &record).unwrap();

        let (found, hit) = worker.state.registry.find_closest(77, 0x7800);

        assert!(hit);
        assert_eq!("/usr/lib/fake.so", found.unwrap().filename);

        /* An exec comm record frees the PID */
        let mut payload = Vec::new();
        payload.extend_from_slice(&77u32.to_ne_bytes());
        payload.extend_from_slice(&77u32.to_ne_bytes());
        payload.extend_from_slice(b"newname\0");

        let mut record = Vec::new();
        abi::Header::write(
            abi::PERF_RECORD_COMM,
            abi::PERF_RECORD_MISC_COMM_EXEC,
            &payload,
            &mut record);

        worker.dispatch_record(0, &record).unwrap();

        let (_, hit) = worker.state.registry.find_closest(77, 0x7800);
        assert!(!hit);
    }
}
