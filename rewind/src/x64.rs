// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;

use super::*;
use crate::frame_table::{CfaBase, FrameTable};
use tracing::{debug, trace};

/// Cached per-file table state. A failed load is remembered so the file
/// is opened at most once per walker lifetime.
#[derive(Default)]
struct CachedTable {
    table: FrameTable,
    filled: bool,
}

impl CachedTable {
    fn get(
        &mut self,
        key: &RegionKey,
        accessor: &dyn RegionAccessor) -> &FrameTable {
        if !self.filled {
            if let Some(file) = accessor.open(key) {
                match FrameTable::parse(&file) {
                    Ok(table) => { self.table = table; },
                    Err(_) => {
                        debug!(
                            "frame table load failed: dev={}, ino={}",
                            key.dev(), key.ino());
                    },
                }
            }

            self.filled = true;
        }

        &self.table
    }
}

#[derive(Default)]
pub struct Walker {
    tables: HashMap<RegionKey, CachedTable>,
    ip: u64,
    bp: u64,
    sp: u64,
    start_sp: u64,
}

impl Walker {
    pub fn new() -> Self { Self::default() }

    /// Reads one word of the sampled stack. Addresses outside the copied
    /// window are unreadable by construction.
    fn stack_value(
        start_sp: u64,
        addr: u64,
        stack_data: &[u8]) -> Option<u64> {
        if addr < start_sp {
            return None;
        }

        let offset = (addr - start_sp) as usize;

        if stack_data.len() < 8 || offset > stack_data.len() - 8 {
            return None;
        }

        Some(u64::from_ne_bytes(
            stack_data[offset..offset + 8]
            .try_into()
            .unwrap()))
    }

    /// Return-address scan for regions without call-frame information.
    /// Walks the stack looking for a (new_sp, code_address) pair, the
    /// pattern a call instruction leaves behind.
    fn walk_scan(
        &mut self,
        space: &dyn AddressSpace,
        stack_data: &[u8],
        result: &mut WalkResult) -> Option<u64> {
        let len = stack_data.len();

        if self.sp < self.start_sp || len < 16 {
            return None;
        }

        let max_sp = self.sp + len as u64;

        let mut offset = (self.sp - self.start_sp) as usize;
        let max_offset = len - 8;

        if offset > max_offset {
            return None;
        }

        /* Bound the scan so a hostile stack cannot stall the worker */
        let mut count = 0;
        let max_count = 64;

        let mut first = u64::from_ne_bytes(
            stack_data[offset..offset + 8]
            .try_into()
            .unwrap());

        offset += 8;

        while offset <= max_offset && count < max_count {
            let second = u64::from_ne_bytes(
                stack_data[offset..offset + 8]
                .try_into()
                .unwrap());

            if first > self.sp && first <= max_sp &&
               space.find(second).is_some() {
                trace!(
                    "scan hit: sp={:#x}, ret={:#x}, steps={}",
                    first, second, count);

                self.sp = first;
                self.bp = first;

                return Some(second);
            }

            first = second;

            offset += 8;
            count += 1;
        }

        result.error = Some("Return address scan exhausted");

        None
    }

    /// One CFI step: resolve the frame row for the current IP, compute
    /// the CFA and read the return address from it.
    fn walk_cfi(
        &mut self,
        key: &RegionKey,
        accessor: &dyn RegionAccessor,
        file_offset: u64,
        stack_data: &[u8],
        result: &mut WalkResult) -> Option<u64> {
        let table = self.tables
            .entry(*key)
            .or_default()
            .get(key, accessor);

        if table.is_empty() {
            result.error = Some("No unwind information");
            return None;
        }

        let vaddr = match table.to_vaddr(file_offset) {
            Some(vaddr) => vaddr,
            None => {
                result.error = Some("Offset outside load segments");
                return None;
            },
        };

        let row = match table.find(vaddr) {
            Some(row) => *row,
            None => {
                result.error = Some("No frame row");
                return None;
            },
        };

        let base = match row.cfa_base {
            CfaBase::Sp => self.sp,
            CfaBase::Bp => self.bp,
        };

        let cfa = (base as i64 + row.cfa_off as i64) as u64;

        /* The stack grows down; a CFA at or below the current SP means
         * the row cannot describe this frame. */
        if cfa <= self.sp {
            result.error = Some("CFA did not advance");
            return None;
        }

        if let Some(bp_off) = row.bp_off {
            match Self::stack_value(
                self.start_sp,
                (cfa as i64 + bp_off as i64) as u64,
                stack_data) {
                Some(value) => { self.bp = value; },
                None => {
                    result.truncated = true;
                    result.error = Some("Saved frame pointer unreadable");
                    return None;
                },
            }
        }

        self.sp = cfa;

        match Self::stack_value(
            self.start_sp,
            (cfa as i64 + row.ra_off as i64) as u64,
            stack_data) {
            Some(value) => Some(value),
            None => {
                result.truncated = true;
                result.error = Some("Return address unreadable");
                None
            },
        }
    }
}

impl StackWalker for Walker {
    fn reset(
        &mut self,
        ip: u64,
        bp: u64,
        sp: u64) {
        self.ip = ip;
        self.bp = bp;
        self.sp = sp;
        self.start_sp = sp;
    }

    fn walk(
        &mut self,
        space: &dyn AddressSpace,
        accessor: &dyn RegionAccessor,
        stack_data: &[u8],
        frames: &mut Vec<u64>,
        result: &mut WalkResult) {
        while let Some(region) = space.find(self.ip) {
            let ip = if region.unwind_kind() == UnwindKind::Scan {
                self.walk_scan(
                    space,
                    stack_data,
                    result)
            } else {
                let file_offset = region.file_offset(self.ip);
                let key = region.key();

                self.walk_cfi(
                    &key,
                    accessor,
                    file_offset,
                    stack_data,
                    result)
            };

            match ip {
                Some(next_ip) => {
                    self.ip = next_ip;

                    /* IP of 0 marks the outermost frame */
                    if self.ip == 0 {
                        break;
                    }

                    frames.push(self.ip);
                    result.frames_pushed += 1;

                    if result.frames_pushed >= MAX_WALK_FRAMES {
                        result.truncated = true;
                        break;
                    }
                },
                None => {
                    return;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_value_bounds() {
        let start_sp: u64 = 0x1000;
        let mut data = Vec::new();

        for i in 0..4u64 {
            data.extend_from_slice(&i.to_ne_bytes());
        }

        /* Below the window */
        assert_eq!(None, Walker::stack_value(start_sp, 0xFF8, &data));

        /* Window contents */
        assert_eq!(Some(0), Walker::stack_value(start_sp, 0x1000, &data));
        assert_eq!(Some(3), Walker::stack_value(start_sp, 0x1018, &data));

        /* Past the window */
        assert_eq!(None, Walker::stack_value(start_sp, 0x1020, &data));

        /* Empty window */
        assert_eq!(None, Walker::stack_value(start_sp, 0x1000, &[]));
    }
}
