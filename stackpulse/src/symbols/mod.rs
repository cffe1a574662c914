// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::BTreeMap;
use std::ops::Bound::{Included, Unbounded};

pub mod dwarf_cache;
pub mod jitdump;
pub mod module;
pub mod runtime;
pub mod symbolizer;

pub use dwarf_cache::DwarfCache;
pub use module::ModuleHandle;
pub use runtime::RuntimeSymbolLookup;
pub use symbolizer::Symbolizer;

pub type SymbolIdx = usize;

/// One resolved symbol, stored once in the session table and referenced
/// by index everywhere else.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub src_path: String,
    pub line: u32,
}

impl Symbol {
    pub fn new(
        name: String,
        src_path: String,
        line: u32) -> Self {
        Self {
            name,
            src_path,
            line,
        }
    }
}

pub type SymbolTable = Vec<Symbol>;

/// Value half of a symbol span: `[start, end]` maps to `symbol_idx`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolSpan {
    end: u64,
    symbol_idx: SymbolIdx,
}

impl SymbolSpan {
    pub fn new(
        end: u64,
        symbol_idx: SymbolIdx) -> Self {
        Self {
            end,
            symbol_idx,
        }
    }

    pub fn end(&self) -> u64 { self.end }

    pub fn symbol_idx(&self) -> SymbolIdx { self.symbol_idx }
}

/// Ordered span map within one file, keyed by span start.
#[derive(Debug, Default)]
pub struct SymbolMap {
    map: BTreeMap<u64, SymbolSpan>,
}

impl SymbolMap {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn clear(&mut self) { self.map.clear(); }

    pub fn insert(
        &mut self,
        start: u64,
        span: SymbolSpan) {
        self.map.insert(start, span);
    }

    /// Closest span at or below `addr`; hit when `addr` is inside it.
    pub fn find_closest(
        &self,
        addr: u64) -> (Option<(u64, &SymbolSpan)>, bool) {
        let mut range = self.map.range((Unbounded, Included(addr)));

        match range.next_back() {
            Some((start, span)) => {
                let hit = addr <= span.end;
                (Some((*start, span)), hit)
            },
            None => (None, false),
        }
    }
}

/// Demangles through the Rust mangler first, then the Itanium C++ one.
/// Unmangled input comes back unchanged.
pub fn demangle(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }

    if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
        if let Ok(demangled) = symbol.demangle(
            &cpp_demangle::DemangleOptions::default()) {
            return demangled;
        }
    }

    name.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_lookup() {
        let mut map = SymbolMap::new();

        map.insert(0x100, SymbolSpan::new(0x1FF, 0));
        map.insert(0x200, SymbolSpan::new(0x2FF, 1));
        map.insert(0x400, SymbolSpan::new(0x4FF, 2));

        let (found, hit) = map.find_closest(0x150);
        assert!(hit);
        assert_eq!(0, found.unwrap().1.symbol_idx());

        let (found, hit) = map.find_closest(0x2FF);
        assert!(hit);
        assert_eq!(1, found.unwrap().1.symbol_idx());

        /* Gap between spans: closest below, no hit */
        let (found, hit) = map.find_closest(0x300);
        assert!(!hit);
        assert_eq!(1, found.unwrap().1.symbol_idx());

        /* Below every span */
        let (found, hit) = map.find_closest(0x50);
        assert!(found.is_none());
        assert!(!hit);
    }

    #[test]
    fn demangles() {
        /* Itanium C++ */
        assert_eq!(
            "bar()",
            demangle("_Z3barv"));

        /* Legacy Rust */
        assert_eq!(
            "std::panicking::try",
            demangle("_ZN3std9panicking3try17h0f1a2b3c4d5e6f7aE"));

        /* Plain C stays as is */
        assert_eq!("malloc", demangle("malloc"));
    }
}
