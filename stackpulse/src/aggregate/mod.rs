// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use tracing::debug;
use twox_hash::XxHash64;

use crate::dso::{DsoRegistry, FileInfoId, FILE_INFO_ERROR};
use crate::symbols::Symbolizer;
use crate::symbols::symbolizer::SymbolizedLocation;
use crate::unwind::UnwindOutput;
use crate::watcher::{
    ProfileIndices,
    SampleTypeId,
    Watcher,
    AGG_POS_LIVE,
    AGG_POS_SUM,
};

/// Stable structural fingerprint of `(pid, tid, frames)`, the
/// aggregation key. XxHash64 with a fixed seed keeps it reproducible
/// across restarts.
pub fn stack_fingerprint(
    output: &UnwindOutput) -> u64 {
    let mut hasher = XxHash64::with_seed(0);

    output.pid.hash(&mut hasher);
    output.tid.hash(&mut hasher);

    for loc in &output.locs {
        loc.ip.hash(&mut hasher);
        loc.symbol_idx.hash(&mut hasher);
        loc.mapinfo_idx.hash(&mut hasher);
    }

    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleType {
    pub name: String,
    pub unit: String,
}

/// One aggregated bucket: a stack plus a value per sample type.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub stack: UnwindOutput,
    pub values: Vec<i64>,
}

/// Accumulates unwound stacks into buckets keyed by fingerprint. Two
/// builders exist per worker (active and standby) and rotate at cut
/// time.
pub struct ProfileBuilder {
    sample_types: Vec<SampleType>,
    entries: HashMap<u64, ProfileEntry>,
    symbolized: HashMap<(FileInfoId, u64), SymbolizedLocation>,
    start_time: DateTime<Utc>,
    period_ns: u64,
}

impl ProfileBuilder {
    /// Builds the sample-type table from the watcher set and writes
    /// each watcher's value/count indices back into it.
    pub fn new(
        watchers: &mut [Watcher]) -> Self {
        let mut sample_types = Vec::new();

        let mut intern = |sample_types: &mut Vec<SampleType>,
                          name: &str,
                          unit: &str| -> i32 {
            let found = sample_types.iter().position(
                |st| st.name == name && st.unit == unit);

            match found {
                Some(index) => index as i32,
                None => {
                    sample_types.push(
                        SampleType {
                            name: name.to_owned(),
                            unit: unit.to_owned(),
                        });

                    (sample_types.len() - 1) as i32
                },
            }
        };

        for watcher in watchers.iter_mut() {
            let type_id = watcher.sample_type_id;

            if type_id == SampleTypeId::NoCount {
                continue;
            }

            if watcher.aggregation.has_sum() {
                let mut indices = ProfileIndices::unset();

                indices.value_index = intern(
                    &mut sample_types,
                    type_id.name(),
                    type_id.unit());

                if let Some(count_type) = type_id.count_type() {
                    indices.count_index = intern(
                        &mut sample_types,
                        count_type.name(),
                        count_type.unit());
                }

                watcher.profile_indices[AGG_POS_SUM] = indices;
            }

            if watcher.aggregation.has_live_sum() {
                if let Some(live_name) = type_id.live_name() {
                    let mut indices = ProfileIndices::unset();

                    indices.value_index = intern(
                        &mut sample_types,
                        live_name,
                        type_id.unit());

                    if let Some(count_type) = type_id.count_type() {
                        if let Some(live_count) = count_type.live_name() {
                            indices.count_index = intern(
                                &mut sample_types,
                                live_count,
                                count_type.unit());
                        }
                    }

                    watcher.profile_indices[AGG_POS_LIVE] = indices;
                }
            }
        }

        Self {
            sample_types,
            entries: HashMap::new(),
            symbolized: HashMap::new(),
            start_time: Utc::now(),
            period_ns: 0,
        }
    }

    pub fn sample_types(&self) -> &[SampleType] {
        &self.sample_types
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProfileEntry> {
        self.entries.values()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn set_period_ns(
        &mut self,
        period_ns: u64) {
        self.period_ns = period_ns;
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn symbolized(
        &self,
        file_info_id: FileInfoId,
        elf_pc: u64) -> Option<&SymbolizedLocation> {
        self.symbolized.get(&(file_info_id, elf_pc))
    }

    /// Adds one sample's value (scaled per the watcher) and implied
    /// count under the stack's fingerprint.
    pub fn add(
        &mut self,
        output: &UnwindOutput,
        watcher: &Watcher,
        agg_pos: usize,
        value: u64,
        count: u64) {
        let indices = &watcher.profile_indices[agg_pos];

        if indices.value_index < 0 {
            return;
        }

        let scaled = (value as f64 * watcher.value_scale) as i64;

        let fingerprint = stack_fingerprint(output);
        let type_count = self.sample_types.len();

        let entry = self.entries
            .entry(fingerprint)
            .or_insert_with(|| ProfileEntry {
                stack: output.clone(),
                values: vec![0; type_count],
            });

        entry.values[indices.value_index as usize] += scaled;

        if indices.count_index >= 0 {
            entry.values[indices.count_index as usize] += count as i64;
        }
    }

    /// Second-pass symbolization: every unique `(file, elf_pc)` in the
    /// profile is resolved once and the records kept for serialization.
    pub fn symbolize_locations(
        &mut self,
        symbolizer: &mut Symbolizer,
        registry: &DsoRegistry) {
        let mut per_file: HashMap<FileInfoId, Vec<u64>> = HashMap::new();

        for entry in self.entries.values() {
            for loc in &entry.stack.locs {
                if loc.file_info_id == FILE_INFO_ERROR {
                    continue;
                }

                if self.symbolized
                    .contains_key(&(loc.file_info_id, loc.elf_pc)) {
                    continue;
                }

                per_file
                    .entry(loc.file_info_id)
                    .or_default()
                    .push(loc.elf_pc);
            }
        }

        for (file_info_id, mut addrs) in per_file {
            addrs.sort_unstable();
            addrs.dedup();

            let file_info = match registry.file_info(file_info_id) {
                Some(file_info) if !file_info.errored => file_info,
                _ => { continue; },
            };

            let records = symbolizer.symbolize_batch(
                file_info_id,
                file_info,
                &addrs);

            for (addr, record) in addrs.iter().zip(records) {
                self.symbolized.insert((file_info_id, *addr), record);
            }
        }

        debug!(
            "symbolized {} unique locations",
            self.symbolized.len());
    }

    /// Empties the builder for reuse as the next cycle's active half.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.symbolized.clear();
        self.start_time = Utc::now();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AddressValue {
    value: i64,
    fingerprint: u64,
}

#[derive(Debug, Default)]
struct StackBucket {
    stack: UnwindOutput,
    value: i64,
    count: u64,
}

#[derive(Debug, Default)]
struct PidLedger {
    address_map: HashMap<u64, AddressValue>,
    stacks: HashMap<u64, StackBucket>,
}

/// Live-allocation bookkeeping for `live-sum` watchers: per address the
/// most recent allocation wins, deallocations decrement their bucket.
/// Buckets that reach zero count disappear.
#[derive(Default)]
pub struct LiveAllocations {
    watchers: HashMap<usize, HashMap<u32, PidLedger>>,
}

impl LiveAllocations {
    pub fn new() -> Self { Self::default() }

    pub fn register_allocation(
        &mut self,
        watcher_index: usize,
        pid: u32,
        address: u64,
        value: i64,
        output: &UnwindOutput) {
        if output.locs.is_empty() {
            /* Avoid registering empty stacks */
            debug!("(LIVE_ALLOC) skipping empty stack");
            return;
        }

        let ledger = self.watchers
            .entry(watcher_index)
            .or_default()
            .entry(pid)
            .or_default();

        let fingerprint = stack_fingerprint(output);

        if let Some(stale) = ledger.address_map.get(&address).copied() {
            /* A missed free left an entry here; undo it first */
            debug!("(LIVE_ALLOC) existing allocation at {:#x}", address);
            Self::decrement(ledger, &stale);
        }

        let bucket = ledger.stacks
            .entry(fingerprint)
            .or_insert_with(|| StackBucket {
                stack: output.clone(),
                value: 0,
                count: 0,
            });

        bucket.value += value;
        bucket.count += 1;

        ledger.address_map.insert(
            address,
            AddressValue {
                value,
                fingerprint,
            });
    }

    pub fn register_deallocation(
        &mut self,
        watcher_index: usize,
        pid: u32,
        address: u64) {
        let ledger = match self.watchers
            .get_mut(&watcher_index)
            .and_then(|pids| pids.get_mut(&pid)) {
            Some(ledger) => ledger,
            None => { return; },
        };

        let entry = match ledger.address_map.remove(&address) {
            Some(entry) => entry,
            None => {
                /* Lost events de-synced us from the tracker */
                debug!("(LIVE_ALLOC) unmatched free at {:#x}", address);
                return;
            },
        };

        Self::decrement(ledger, &entry);
    }

    fn decrement(
        ledger: &mut PidLedger,
        entry: &AddressValue) {
        if let Some(bucket) = ledger.stacks.get_mut(&entry.fingerprint) {
            bucket.value -= entry.value;

            if bucket.count > 0 {
                bucket.count -= 1;
            }

            if bucket.count == 0 {
                ledger.stacks.remove(&entry.fingerprint);
            }
        }
    }

    /// Folds the current ledger into a profile builder. Called at cut
    /// time so the cycle's profile reports what is still alive.
    pub fn aggregate_into(
        &self,
        builder: &mut ProfileBuilder,
        watchers: &[Watcher]) {
        for (watcher_index, pids) in &self.watchers {
            let watcher = &watchers[*watcher_index];

            for ledger in pids.values() {
                for bucket in ledger.stacks.values() {
                    builder.add(
                        &bucket.stack,
                        watcher,
                        AGG_POS_LIVE,
                        bucket.value as u64,
                        bucket.count);
                }
            }
        }
    }

    /// Folds and forgets one PID (exit and exec paths).
    pub fn aggregate_pid_into(
        &self,
        builder: &mut ProfileBuilder,
        watchers: &[Watcher],
        pid: u32) {
        for (watcher_index, pids) in &self.watchers {
            let watcher = &watchers[*watcher_index];

            if let Some(ledger) = pids.get(&pid) {
                for bucket in ledger.stacks.values() {
                    builder.add(
                        &bucket.stack,
                        watcher,
                        AGG_POS_LIVE,
                        bucket.value as u64,
                        bucket.count);
                }
            }
        }
    }

    pub fn clear_pid(
        &mut self,
        pid: u32) {
        for pids in self.watchers.values_mut() {
            pids.remove(&pid);
        }
    }

    pub fn clear_pid_for_watcher(
        &mut self,
        watcher_index: usize,
        pid: u32) {
        if let Some(pids) = self.watchers.get_mut(&watcher_index) {
            pids.remove(&pid);
        }
    }

    pub fn tracked_count(
        &self,
        watcher_index: usize,
        pid: u32) -> usize {
        self.watchers
            .get(&watcher_index)
            .and_then(|pids| pids.get(&pid))
            .map(|ledger| ledger.address_map.len())
            .unwrap_or(0)
    }
}
