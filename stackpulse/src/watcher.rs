// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::perf_event::abi;

/// How the numeric value of a sample is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// The sample's period field.
    Sample,
    /// A sampled user register.
    Register(u8),
    /// Bytes inside the raw record.
    Raw { offset: u8, size: u8 },
}

/// Which aggregations a watcher feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    Sum,
    LiveSum,
    Both,
}

impl AggregationMode {
    pub fn has_sum(self) -> bool {
        matches!(self, AggregationMode::Sum | AggregationMode::Both)
    }

    pub fn has_live_sum(self) -> bool {
        matches!(self, AggregationMode::LiveSum | AggregationMode::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseKernel {
    Off,
    /// On when the system allows it, silently off otherwise.
    Try,
    /// Open failure is fatal.
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Period(u64),
    Frequency(u64),
}

/// Profile sample types understood by the collector backend. Each type
/// may imply a dependent count type aggregated alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTypeId {
    NoCount,
    Tracepoint,
    CpuNanos,
    CpuSample,
    AllocSample,
    AllocSpace,
}

impl SampleTypeId {
    pub fn name(self) -> &'static str {
        match self {
            SampleTypeId::NoCount => "nocount",
            SampleTypeId::Tracepoint => "tracepoint",
            SampleTypeId::CpuNanos => "cpu-time",
            SampleTypeId::CpuSample => "cpu-samples",
            SampleTypeId::AllocSample => "alloc-samples",
            SampleTypeId::AllocSpace => "alloc-space",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SampleTypeId::NoCount => "nocount",
            SampleTypeId::Tracepoint => "events",
            SampleTypeId::CpuNanos => "nanoseconds",
            SampleTypeId::CpuSample => "count",
            SampleTypeId::AllocSample => "count",
            SampleTypeId::AllocSpace => "bytes",
        }
    }

    /// Name used when the type feeds the live (in-use) aggregation.
    pub fn live_name(self) -> Option<&'static str> {
        match self {
            SampleTypeId::AllocSample => Some("inuse-objects"),
            SampleTypeId::AllocSpace => Some("inuse-space"),
            _ => None,
        }
    }

    /// The dependent count type always aggregated with this type.
    pub fn count_type(self) -> Option<SampleTypeId> {
        match self {
            SampleTypeId::CpuNanos => Some(SampleTypeId::CpuSample),
            SampleTypeId::AllocSpace => Some(SampleTypeId::AllocSample),
            _ => None,
        }
    }
}

/// Indices into the serialized profile's sample-type table, one pair
/// per aggregation position (standard and live).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileIndices {
    pub value_index: i32,
    pub count_index: i32,
}

impl ProfileIndices {
    pub fn unset() -> Self {
        Self {
            value_index: -1,
            count_index: -1,
        }
    }
}

pub const AGG_POS_SUM: usize = 0;
pub const AGG_POS_LIVE: usize = 1;
pub const NB_AGG_POS: usize = 2;

/// A configured sampling source, immutable for the length of a run.
#[derive(Debug, Clone)]
pub struct Watcher {
    pub name: &'static str,
    pub desc: &'static str,
    pub event_type: u32,
    pub config: u64,
    pub cadence: Cadence,
    pub sample_type_id: SampleTypeId,
    pub value_source: ValueSource,
    pub value_scale: f64,
    pub aggregation: AggregationMode,
    pub use_kernel: UseKernel,
    pub stack_sample_size: u32,
    pub profile_indices: [ProfileIndices; NB_AGG_POS],
}

pub const DEFAULT_STACK_SAMPLE_SIZE: u32 = 32 * 1024;
pub const DEFAULT_ALLOC_INTERVAL: u64 = 524288;

impl Watcher {
    fn preset(
        name: &'static str,
        desc: &'static str,
        event_type: u32,
        config: u64,
        cadence: Cadence,
        sample_type_id: SampleTypeId,
        use_kernel: UseKernel) -> Self {
        Self {
            name,
            desc,
            event_type,
            config,
            cadence,
            sample_type_id,
            value_source: ValueSource::Sample,
            value_scale: 1.0,
            aggregation: AggregationMode::Sum,
            use_kernel,
            stack_sample_size: DEFAULT_STACK_SAMPLE_SIZE,
            profile_indices: [ProfileIndices::unset(); NB_AGG_POS],
        }
    }

    pub fn is_custom(&self) -> bool {
        self.event_type == abi::CUSTOM_TYPE_ALLOCATION
    }

    pub fn is_freq(&self) -> bool {
        matches!(self.cadence, Cadence::Frequency(_))
    }

    /// Value of one period at this cadence, used to account lost
    /// events.
    pub fn period_value(&self) -> u64 {
        match self.cadence {
            Cadence::Period(period) => period,
            Cadence::Frequency(freq) => {
                if freq == 0 {
                    0
                } else {
                    1_000_000_000 / freq
                }
            },
        }
    }

    pub fn with_cadence(
        mut self,
        cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_stack_sample_size(
        mut self,
        bytes: u32) -> Self {
        self.stack_sample_size = bytes;
        self
    }
}

/// The preset event table. Tracepoint-style extras aggregate as plain
/// event counts; the well-known profiling types carry richer units.
pub fn event_table() -> Vec<Watcher> {
    vec![
        Watcher::preset(
            "sCPU",
            "CPU Time",
            abi::PERF_TYPE_SOFTWARE,
            abi::PERF_COUNT_SW_TASK_CLOCK,
            Cadence::Frequency(99),
            SampleTypeId::CpuNanos,
            UseKernel::Try),
        Watcher::preset(
            "hCPU",
            "CPU Cycles",
            abi::PERF_TYPE_HARDWARE,
            abi::PERF_COUNT_HW_CPU_CYCLES,
            Cadence::Frequency(99),
            SampleTypeId::Tracepoint,
            UseKernel::Off),
        Watcher::preset(
            "hINST",
            "Instr. Count",
            abi::PERF_TYPE_HARDWARE,
            abi::PERF_COUNT_HW_INSTRUCTIONS,
            Cadence::Frequency(1000),
            SampleTypeId::Tracepoint,
            UseKernel::Off),
        Watcher::preset(
            "hCMISS",
            "Cache Miss",
            abi::PERF_TYPE_HARDWARE,
            abi::PERF_COUNT_HW_CACHE_MISSES,
            Cadence::Period(999),
            SampleTypeId::Tracepoint,
            UseKernel::Off),
        Watcher::preset(
            "sPF",
            "Page Faults",
            abi::PERF_TYPE_SOFTWARE,
            abi::PERF_COUNT_SW_PAGE_FAULTS,
            Cadence::Period(1),
            SampleTypeId::Tracepoint,
            UseKernel::Required),
        Watcher::preset(
            "sCS",
            "Con. Switch",
            abi::PERF_TYPE_SOFTWARE,
            abi::PERF_COUNT_SW_CONTEXT_SWITCHES,
            Cadence::Period(1),
            SampleTypeId::Tracepoint,
            UseKernel::Required),
        {
            let mut alloc = Watcher::preset(
                "sALLOC",
                "Allocations",
                abi::CUSTOM_TYPE_ALLOCATION,
                0,
                Cadence::Period(DEFAULT_ALLOC_INTERVAL),
                SampleTypeId::AllocSpace,
                UseKernel::Off);

            alloc.aggregation = AggregationMode::Both;
            alloc
        },
    ]
}

pub fn watcher_from_str(
    name: &str) -> Option<Watcher> {
    event_table()
        .into_iter()
        .find(|watcher| watcher.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        let watcher = watcher_from_str("scpu").unwrap();

        assert_eq!("sCPU", watcher.name);
        assert_eq!(SampleTypeId::CpuNanos, watcher.sample_type_id);
        assert!(watcher.is_freq());
        assert!(!watcher.is_custom());

        assert!(watcher_from_str("nothere").is_none());
    }

    #[test]
    fn alloc_is_custom() {
        let watcher = watcher_from_str("sALLOC").unwrap();

        assert!(watcher.is_custom());
        assert!(watcher.aggregation.has_sum());
        assert!(watcher.aggregation.has_live_sum());
        assert_eq!(
            Cadence::Period(DEFAULT_ALLOC_INTERVAL),
            watcher.cadence);
    }

    #[test]
    fn period_value() {
        let cpu = watcher_from_str("sCPU").unwrap();

        /* 99 Hz expressed in nanoseconds */
        assert_eq!(1_000_000_000 / 99, cpu.period_value());

        let faults = watcher_from_str("sPF").unwrap();
        assert_eq!(1, faults.period_value());
    }

    #[test]
    fn count_types() {
        assert_eq!(
            Some(SampleTypeId::CpuSample),
            SampleTypeId::CpuNanos.count_type());
        assert_eq!(
            Some(SampleTypeId::AllocSample),
            SampleTypeId::AllocSpace.count_type());
        assert_eq!(None, SampleTypeId::CpuSample.count_type());
        assert_eq!(Some("inuse-space"), SampleTypeId::AllocSpace.live_name());
    }
}
