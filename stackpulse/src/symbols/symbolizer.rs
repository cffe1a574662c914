// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;

use tracing::debug;

use crate::dso::{FileInfo, FileInfoId};
use super::module::ModuleHandle;

/// Output record of the second-pass symbolization: one per address,
/// empty function name when the file could not name it (the collector
/// side symbolizes those later).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SymbolizedLocation {
    pub function: String,
    pub file: String,
    pub line: u32,
}

struct CachedModule {
    module: Option<ModuleHandle>,
    visited: bool,
    last_used: u64,
}

/// Full-text symbolizer used right before serialization. Modules are
/// retained across cycles in an LRU keyed by file id; entries not
/// visited during a cycle are swept, and past the retention cap the
/// least recently used entries are evicted first.
pub struct Symbolizer {
    cache: HashMap<FileInfoId, CachedModule>,
    max_cached: usize,
    tick: u64,
}

const DEFAULT_MAX_CACHED: usize = 64;

impl Default for Symbolizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHED)
    }
}

impl Symbolizer {
    pub fn new(
        max_cached: usize) -> Self {
        Self {
            cache: HashMap::new(),
            max_cached: max_cached.max(1),
            tick: 0,
        }
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn load_module(
        file_info: &FileInfo) -> Option<ModuleHandle> {
        match ModuleHandle::open(&file_info.path, 0, true) {
            Ok(module) => Some(module),
            Err(error) => {
                /* Retry once without debug information */
                debug!(
                    "symbolizer falling back to no-debug for {}: {}",
                    file_info.path, error);

                ModuleHandle::open(&file_info.path, 0, false).ok()
            },
        }
    }

    /// Symbolizes one batch of ELF addresses belonging to a single
    /// file. Always yields one record per input address.
    pub fn symbolize_batch(
        &mut self,
        file_info_id: FileInfoId,
        file_info: &FileInfo,
        elf_addrs: &[u64]) -> Vec<SymbolizedLocation> {
        self.tick += 1;
        let tick = self.tick;

        let entry = self.cache
            .entry(file_info_id)
            .or_insert_with(|| CachedModule {
                module: Self::load_module(file_info),
                visited: true,
                last_used: tick,
            });

        entry.visited = true;
        entry.last_used = tick;

        let mut output = Vec::with_capacity(elf_addrs.len());

        match &entry.module {
            Some(module) => {
                for elf_addr in elf_addrs {
                    let mut location = SymbolizedLocation::default();

                    if let Some(function) = module.find_function(*elf_addr) {
                        location.function = function.name;
                    }

                    if let Some(source) = module.find_source(*elf_addr) {
                        location.file = source.file;
                        location.line = source.line;
                    }

                    output.push(location);
                }
            },
            None => {
                /* Unreadable file: emit empty records so the remote
                 * side can fill them in */
                output.resize(
                    elf_addrs.len(),
                    SymbolizedLocation::default());
            },
        }

        output
    }

    /// Cycle maintenance: drop unvisited entries, rearm flags and
    /// evict the least recently used entries down to the cap.
    pub fn sweep_unvisited(&mut self) {
        self.cache.retain(|_, entry| entry.visited);

        for entry in self.cache.values_mut() {
            entry.visited = false;
        }

        while self.cache.len() > self.max_cached {
            let oldest = self.cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(file_info_id, _)| *file_info_id);

            match oldest {
                Some(file_info_id) => {
                    debug!(
                        "symbolizer cache over cap, evicting file {}",
                        file_info_id);
                    self.cache.remove(&file_info_id);
                },
                None => { break; },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_file_info() -> FileInfo {
        let exe = std::env::current_exe().unwrap();

        FileInfo {
            path: exe.to_str().unwrap().to_owned(),
            size: 1,
            inode: 1,
            errored: false,
        }
    }

    #[test]
    fn batch_shape() {
        let mut symbolizer = Symbolizer::default();
        let file_info = own_file_info();

        let addrs = [0x1000u64, 0x2000, 0x3000];

        let records = symbolizer.symbolize_batch(1, &file_info, &addrs);

        /* One record per address no matter what resolved */
        assert_eq!(addrs.len(), records.len());
        assert_eq!(1, symbolizer.cached_count());
    }

    #[test]
    fn unreadable_file_yields_empty_records() {
        let mut symbolizer = Symbolizer::default();

        let file_info = FileInfo {
            path: String::from("/does/not/exist"),
            size: 1,
            inode: 1,
            errored: false,
        };

        let records = symbolizer.symbolize_batch(5, &file_info, &[0x10, 0x20]);

        assert_eq!(2, records.len());
        assert!(records[0].function.is_empty());
        assert!(records[1].function.is_empty());
    }

    #[test]
    fn sweep_semantics() {
        let mut symbolizer = Symbolizer::default();
        let file_info = own_file_info();

        symbolizer.symbolize_batch(1, &file_info, &[0x1000]);

        /* Visited this cycle: survives the sweep */
        symbolizer.sweep_unvisited();
        assert_eq!(1, symbolizer.cached_count());

        /* Untouched next cycle: swept */
        symbolizer.sweep_unvisited();
        assert_eq!(0, symbolizer.cached_count());
    }

    #[test]
    fn over_cap_evicts_least_recently_used() {
        let mut symbolizer = Symbolizer::new(2);
        let file_info = own_file_info();

        symbolizer.symbolize_batch(1, &file_info, &[0x1000]);
        symbolizer.symbolize_batch(2, &file_info, &[0x1000]);
        symbolizer.symbolize_batch(3, &file_info, &[0x1000]);

        /* All three were visited; only the oldest goes */
        symbolizer.sweep_unvisited();

        assert_eq!(2, symbolizer.cached_count());
        assert!(!symbolizer.cache.contains_key(&1));
        assert!(symbolizer.cache.contains_key(&2));
        assert!(symbolizer.cache.contains_key(&3));

        /* Re-touching file 2 makes file 3 the next victim */
        symbolizer.symbolize_batch(2, &file_info, &[0x1000]);
        symbolizer.symbolize_batch(4, &file_info, &[0x1000]);
        symbolizer.sweep_unvisited();

        assert_eq!(2, symbolizer.cached_count());
        assert!(symbolizer.cache.contains_key(&2));
        assert!(!symbolizer.cache.contains_key(&3));
        assert!(symbolizer.cache.contains_key(&4));
    }
}
