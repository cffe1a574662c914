// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::fs::File;

use gimli::{
    BaseAddresses,
    CfaRule,
    EhFrame,
    NativeEndian,
    Register,
    RegisterRule,
    UnwindSection,
};

use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSegment};
use tracing::debug;

/* DWARF register numbers on x86-64 */
pub const REG_BP: Register = Register(6);
pub const REG_SP: Register = Register(7);
pub const REG_RA: Register = Register(16);

/// Base register a frame's CFA is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaBase {
    Sp,
    Bp,
}

/// One resolved call-frame row: for PCs in `[start, end)` the CFA is
/// `base_reg + cfa_off`, the return address sits at `CFA + ra_off` and
/// the caller's frame pointer (when saved) at `CFA + bp_off`.
#[derive(Debug, Clone, Copy)]
pub struct FrameRow {
    pub start: u64,
    pub end: u64,
    pub cfa_base: CfaBase,
    pub cfa_off: i32,
    pub ra_off: i16,
    pub bp_off: Option<i16>,
}

/// Maps a file offset range to the virtual address it loads at.
#[derive(Debug, Clone, Copy)]
struct LoadSegment {
    file_start: u64,
    file_end: u64,
    vaddr: u64,
}

/// Per-file unwind table parsed once from the .eh_frame section and
/// queried by file-relative offset for every sampled frame.
#[derive(Default)]
pub struct FrameTable {
    rows: Vec<FrameRow>,
    segments: Vec<LoadSegment>,
}

impl FrameTable {
    /// Parses the file's program headers and .eh_frame into a sorted row
    /// table. Files without usable unwind information yield an empty
    /// table, which the walker treats as a terminal condition.
    pub fn parse(
        file: &File) -> std::io::Result<Self> {
        /* Safety: mapping is private and read-only */
        let data = unsafe { Mmap::map(file)? };

        let mut table = Self::default();
        table.parse_bytes(&data);

        Ok(table)
    }

    fn parse_bytes(
        &mut self,
        data: &[u8]) {
        let obj = match object::File::parse(data) {
            Ok(obj) => obj,
            Err(_) => { return; },
        };

        for segment in obj.segments() {
            let (file_start, file_len) = segment.file_range();

            if file_len == 0 {
                continue;
            }

            self.segments.push(
                LoadSegment {
                    file_start,
                    file_end: file_start + file_len,
                    vaddr: segment.address(),
                });
        }

        let section = match obj.section_by_name(".eh_frame") {
            Some(section) => section,
            None => { return; },
        };

        let section_data = match section.data() {
            Ok(section_data) => section_data,
            Err(_) => { return; },
        };

        let eh_frame = EhFrame::new(section_data, NativeEndian);

        let bases = BaseAddresses::default()
            .set_eh_frame(section.address());

        let mut ctx = gimli::UnwindContext::new();
        let mut cies = HashMap::new();
        let mut iter = eh_frame.entries(&bases);

        while let Ok(Some(entry)) = iter.next() {
            match entry {
                gimli::CieOrFde::Cie(cie) => {
                    cies.insert(cie.offset(), cie);
                },
                gimli::CieOrFde::Fde(partial) => {
                    let fde = match partial.parse(|_, bases, offset| {
                        if let Some(cie) = cies.get(&offset.0) {
                            Ok(cie.clone())
                        } else {
                            eh_frame.cie_from_offset(bases, offset)
                        }
                    }) {
                        Ok(fde) => fde,
                        Err(_) => { continue; },
                    };

                    let mut rows = match fde.rows(
                        &eh_frame,
                        &bases,
                        &mut ctx) {
                        Ok(rows) => rows,
                        Err(_) => { continue; },
                    };

                    while let Ok(Some(row)) = rows.next_row() {
                        self.push_row(row);
                    }
                },
            }
        }

        self.rows.sort_by_key(|row| row.start);

        debug!(
            "frame table ready: rows={}, segments={}",
            self.rows.len(),
            self.segments.len());
    }

    fn push_row(
        &mut self,
        row: &gimli::UnwindTableRow<gimli::EndianSlice<'_, NativeEndian>>) {
        let (cfa_base, cfa_off) = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = if *register == REG_SP {
                    CfaBase::Sp
                } else if *register == REG_BP {
                    CfaBase::Bp
                } else {
                    return;
                };

                let offset = match i32::try_from(*offset) {
                    Ok(offset) => offset,
                    Err(_) => { return; },
                };

                (base, offset)
            },
            /* Expression CFAs (signal frames, PLT stubs) are skipped;
             * the walker falls back to scanning past them. */
            CfaRule::Expression(_) => { return; },
        };

        let ra_off = match row.register(REG_RA) {
            RegisterRule::Offset(offset) => {
                match i16::try_from(offset) {
                    Ok(offset) => offset,
                    Err(_) => { return; },
                }
            },
            _ => { return; },
        };

        let bp_off = match row.register(REG_BP) {
            RegisterRule::Offset(offset) => i16::try_from(offset).ok(),
            _ => None,
        };

        self.rows.push(
            FrameRow {
                start: row.start_address(),
                end: row.end_address(),
                cfa_base,
                cfa_off,
                ra_off,
                bp_off,
            });
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Translates a file offset (as derived from a process mapping) into
    /// the virtual address space the rows are keyed by.
    pub fn to_vaddr(
        &self,
        file_offset: u64) -> Option<u64> {
        for segment in &self.segments {
            if file_offset >= segment.file_start &&
               file_offset < segment.file_end {
                return Some(
                    (file_offset - segment.file_start) + segment.vaddr);
            }
        }

        None
    }

    pub fn find(
        &self,
        vaddr: u64) -> Option<&FrameRow> {
        if self.rows.is_empty() {
            return None;
        }

        let mut index = self.rows.partition_point(
            |row| row.start <= vaddr );

        index = index.checked_sub(1)?;

        let row = &self.rows[index];

        if vaddr >= row.start && vaddr < row.end {
            return Some(row);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        start: u64,
        end: u64) -> FrameRow {
        FrameRow {
            start,
            end,
            cfa_base: CfaBase::Sp,
            cfa_off: 8,
            ra_off: -8,
            bp_off: None,
        }
    }

    #[test]
    fn lookup() {
        let mut table = FrameTable::default();

        table.rows.push(row(0x1000, 0x1010));
        table.rows.push(row(0x1010, 0x1040));
        table.rows.push(row(0x2000, 0x2100));

        assert!(table.find(0xFFF).is_none());
        assert_eq!(0x1000, table.find(0x1000).unwrap().start);
        assert_eq!(0x1000, table.find(0x100F).unwrap().start);
        assert_eq!(0x1010, table.find(0x1010).unwrap().start);
        assert_eq!(0x1010, table.find(0x103F).unwrap().start);

        /* Gap between FDEs */
        assert!(table.find(0x1040).is_none());
        assert!(table.find(0x1FFF).is_none());

        assert_eq!(0x2000, table.find(0x2050).unwrap().start);
        assert!(table.find(0x2100).is_none());
    }

    #[test]
    fn segment_translation() {
        let mut table = FrameTable::default();

        table.segments.push(
            LoadSegment {
                file_start: 0x0,
                file_end: 0x1000,
                vaddr: 0x0,
            });

        table.segments.push(
            LoadSegment {
                file_start: 0x1000,
                file_end: 0x5000,
                vaddr: 0x401000,
            });

        assert_eq!(Some(0x500), table.to_vaddr(0x500));
        assert_eq!(Some(0x401234), table.to_vaddr(0x1234));
        assert_eq!(None, table.to_vaddr(0x6000));
    }

    #[test]
    fn self_parse() {
        /* The test binary itself always carries .eh_frame */
        let exe = std::env::current_exe().unwrap();
        let file = File::open(exe).unwrap();

        let table = FrameTable::parse(&file).unwrap();

        assert!(!table.is_empty());
    }
}
