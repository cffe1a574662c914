// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::dso::FileInfoId;
use super::{Symbol, SymbolIdx, SymbolMap, SymbolSpan, SymbolTable};
use super::module::ModuleHandle;

/// Cache behavior, selected through `DDPROF_CACHE_SETTING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSetting {
    On,
    /// Every hit re-runs the underlying lookup and compares names.
    Validate,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub calls: u64,
    pub hits: u64,
    pub no_symbols: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn reset(&mut self) {
        *self = CacheStats::default();
    }
}

/// Per-file symbol span cache in front of the DWARF/ELF module lookup.
/// Spans are keyed by ELF address; misses consult the module and insert
/// a span so the module is touched once per function.
pub struct DwarfCache {
    file_map: HashMap<FileInfoId, SymbolMap>,
    dso_symbols: HashMap<FileInfoId, SymbolIdx>,
    visited: HashSet<FileInfoId>,
    setting: CacheSetting,
    stats: CacheStats,
}

impl Default for DwarfCache {
    fn default() -> Self {
        Self::new(CacheSetting::On)
    }
}

impl DwarfCache {
    pub fn new(
        setting: CacheSetting) -> Self {
        if setting == CacheSetting::Validate {
            warn!("symbol cache validation enabled, expect slow lookups");
        }

        Self {
            file_map: HashMap::new(),
            dso_symbols: HashMap::new(),
            visited: HashSet::new(),
            setting,
            stats: CacheStats::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(crate::env::cache_setting())
    }

    pub fn stats(&self) -> CacheStats { self.stats }

    pub fn reset_stats(&mut self) { self.stats.reset(); }

    pub fn span_count(&self) -> usize {
        self.file_map
            .values()
            .map(SymbolMap::len)
            .sum()
    }

    /// Resolves `elf_pc` inside the file behind `file_info_id`. The DSO
    /// short name backs a synthetic symbol when the module cannot name
    /// the address, so repeated misses stay cheap.
    pub fn get_or_insert(
        &mut self,
        module: &ModuleHandle,
        file_info_id: FileInfoId,
        elf_pc: u64,
        dso_name: &str,
        dso_path: &str,
        table: &mut SymbolTable) -> SymbolIdx {
        self.stats.calls += 1;
        self.visited.insert(file_info_id);

        let map = self.file_map.entry(file_info_id).or_default();

        let (found, hit) = map.find_closest(elf_pc);

        if hit {
            let symbol_idx = found.unwrap().1.symbol_idx();

            self.stats.hits += 1;

            if self.setting == CacheSetting::Validate &&
               !Self::validate_hit(module, elf_pc, &table[symbol_idx]) {
                self.stats.errors += 1;
            }

            return symbol_idx;
        }

        match module.find_function(elf_pc) {
            Some(function) => {
                let symbol_idx = table.len();

                let src_path = if dso_path.is_empty() {
                    String::new()
                } else {
                    dso_path.to_owned()
                };

                table.push(Symbol::new(
                    function.name,
                    src_path,
                    0));

                let (start, end) = if function.end >= function.start {
                    (function.start, function.end)
                } else {
                    /* Range does not add up; pin the single address */
                    (elf_pc, elf_pc)
                };

                map.insert(start, SymbolSpan::new(end, symbol_idx));

                symbol_idx
            },
            None => {
                self.stats.no_symbols += 1;

                /* One synthetic symbol per file, named for the DSO */
                let symbol_idx = match self.dso_symbols.get(&file_info_id) {
                    Some(symbol_idx) => *symbol_idx,
                    None => {
                        let symbol_idx = table.len();

                        table.push(Symbol::new(
                            format!("[{}]", dso_name),
                            dso_path.to_owned(),
                            0));

                        self.dso_symbols.insert(file_info_id, symbol_idx);

                        symbol_idx
                    },
                };

                map.insert(elf_pc, SymbolSpan::new(elf_pc, symbol_idx));

                symbol_idx
            },
        }
    }

    fn validate_hit(
        module: &ModuleHandle,
        elf_pc: u64,
        cached: &Symbol) -> bool {
        match module.find_function(elf_pc) {
            Some(function) => {
                if function.name != cached.name {
                    warn!(
                        "cache validation mismatch at {:#x}: {} != {}",
                        elf_pc, function.name, cached.name);
                    return false;
                }

                true
            },
            /* Nothing to compare against */
            None => true,
        }
    }

    /// Drops every file entry not visited since the previous sweep and
    /// rearms the visited flags. Called once per export cycle.
    pub fn sweep_unvisited(&mut self) {
        let before = self.file_map.len();

        self.file_map.retain(
            |file_info_id, _| self.visited.contains(file_info_id));
        self.dso_symbols.retain(
            |file_info_id, _| self.visited.contains(file_info_id));

        if before != self.file_map.len() {
            debug!(
                "symbol cache swept: {} -> {} files",
                before,
                self.file_map.len());
        }

        self.visited.clear();
    }
}
