// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::debug;

use super::{Symbol, SymbolIdx, SymbolMap, SymbolSpan, SymbolTable};

#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeSymbolStats {
    pub jit_reads: u64,
    pub failed_lookups: u64,
    pub symbol_count: u64,
}

/// Per-PID lookup over `perf-<pid>.map` files that JIT runtimes write.
/// The whole file is loaded on first miss and cached; an absent file is
/// remembered with a sentinel span so lookups do not bounce.
#[derive(Default)]
pub struct RuntimeSymbolLookup {
    pid_map: HashMap<u32, SymbolMap>,
    stats: RuntimeSymbolStats,
}

/// Helper stubs some runtimes emit in bulk; they carry no value for
/// profiles and bloat the map.
fn should_skip_symbol(symbol: &str) -> bool {
    symbol.contains("GenerateResolveStub") ||
    symbol.contains("GenerateDispatchStub") ||
    symbol.contains("GenerateLookupStub") ||
    symbol.contains("AllocateTemporaryEntryPoints")
}

impl RuntimeSymbolLookup {
    pub fn new() -> Self { Self::default() }

    pub fn stats(&self) -> RuntimeSymbolStats { self.stats }

    fn perfmap_open(
        pid: u32) -> Option<File> {
        /* Target namespace first, then our own */
        let in_target = format!("/proc/{}/root/tmp/perf-{}.map", pid, pid);

        if let Ok(file) = File::open(Path::new(&in_target)) {
            return Some(file);
        }

        File::open(format!("/tmp/perf-{}.map", pid)).ok()
    }

    fn fill_from_file(
        &mut self,
        pid: u32,
        table: &mut SymbolTable) {
        let map = self.pid_map.entry(pid).or_default();
        map.clear();

        let file = match Self::perfmap_open(pid) {
            Some(file) => file,
            None => {
                /* Single fake entry to avoid re-reading every sample */
                map.insert(0, SymbolSpan::new(0, usize::MAX));
                debug!("no runtime symbols (PID{})", pid);
                return;
            },
        };

        debug!("loading runtime symbols (PID{})", pid);
        self.stats.jit_reads += 1;

        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => { break; },
            };

            if let Some((start, end, name)) = Self::parse_line(&line) {
                if should_skip_symbol(name) {
                    continue;
                }

                map.insert(
                    start,
                    SymbolSpan::new(end, table.len()));

                table.push(Symbol::new(
                    name.to_owned(),
                    String::from("unknown"),
                    0));

                self.stats.symbol_count += 1;
            }
        }
    }

    /// `hex_addr hex_size name with possible spaces`
    fn parse_line(
        line: &str) -> Option<(u64, u64, &str)> {
        let mut parts = line.splitn(3, ' ');

        let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
        let size = u64::from_str_radix(parts.next()?, 16).ok()?;
        let name = parts.next()?.trim();

        if addr == 0 || size == 0 || name.is_empty() {
            return None;
        }

        /* Reject overflowing ranges */
        let end = addr.checked_add(size - 1)?;

        Some((addr, end, name))
    }

    /// Resolves a runtime symbol. Returns `None` when the PID has no
    /// usable map or the PC is not covered.
    pub fn get_or_insert(
        &mut self,
        pid: u32,
        pc: u64,
        table: &mut SymbolTable) -> Option<SymbolIdx> {
        if self.pid_map
            .get(&pid)
            .map(SymbolMap::is_empty)
            .unwrap_or(true) {
            self.fill_from_file(pid, table);
        }

        let map = self.pid_map.get(&pid)?;

        let (found, hit) = map.find_closest(pc);

        if hit {
            let symbol_idx = found.unwrap().1.symbol_idx();

            if symbol_idx == usize::MAX {
                /* Sentinel from a missing file */
                self.stats.failed_lookups += 1;
                return None;
            }

            return Some(symbol_idx);
        }

        self.stats.failed_lookups += 1;

        None
    }

    pub fn pid_free(
        &mut self,
        pid: u32) {
        self.pid_map.remove(&pid);
    }

    #[cfg(test)]
    fn fill_from_reader(
        &mut self,
        pid: u32,
        reader: impl BufRead,
        table: &mut SymbolTable) {
        let map = self.pid_map.entry(pid).or_default();
        map.clear();

        for line in reader.lines().map_while(Result::ok) {
            if let Some((start, end, name)) = Self::parse_line(&line) {
                if should_skip_symbol(name) {
                    continue;
                }

                map.insert(start, SymbolSpan::new(end, table.len()));
                table.push(Symbol::new(name.to_owned(), "unknown".into(), 0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lines() {
        assert_eq!(
            Some((0x7f10, 0x7f1F, "Interpreter::run")),
            RuntimeSymbolLookup::parse_line("7f10 10 Interpreter::run"));

        /* Names keep embedded spaces */
        assert_eq!(
            Some((0x100, 0x1FF, "jit method (inlined)")),
            RuntimeSymbolLookup::parse_line("100 100 jit method (inlined)"));

        assert!(RuntimeSymbolLookup::parse_line("zzz 10 name").is_none());
        assert!(RuntimeSymbolLookup::parse_line("100 0 name").is_none());
        assert!(RuntimeSymbolLookup::parse_line("0 10 name").is_none());
        assert!(RuntimeSymbolLookup::parse_line("100").is_none());

        /* Overflowing range */
        assert!(
            RuntimeSymbolLookup::parse_line(
                "ffffffffffffffff 10 wrap").is_none());
    }

    #[test]
    fn lookup_from_map() {
        let mut lookup = RuntimeSymbolLookup::new();
        let mut table = SymbolTable::new();

        let content = "\
1000 100 php_execute\n\
2000 80 GenerateResolveStub helper\n\
3000 40 zend_call\n";

        lookup.fill_from_reader(
            55,
            content.as_bytes(),
            &mut table);

        let idx = lookup.get_or_insert(55, 0x1080, &mut table).unwrap();
        assert_eq!("php_execute", table[idx].name);

        let idx = lookup.get_or_insert(55, 0x3010, &mut table).unwrap();
        assert_eq!("zend_call", table[idx].name);

        /* Skipped stub never lands in the map */
        assert!(lookup.get_or_insert(55, 0x2010, &mut table).is_none());

        /* Gap */
        assert!(lookup.get_or_insert(55, 0x1200, &mut table).is_none());

        lookup.pid_free(55);
        assert!(lookup.pid_map.get(&55).is_none());
    }
}
