// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::rc::Rc;

use addr2line::Context;
use anyhow::Context as _;
use gimli::{EndianRcSlice, RunTimeEndian};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};
use tracing::debug;

use super::demangle;

/// File offset range and the virtual address it loads at.
#[derive(Debug, Clone, Copy)]
struct LoadSegment {
    file_start: u64,
    file_end: u64,
    vaddr: u64,
}

/// A function range from the file's symbol tables, addresses in ELF
/// (file-relative virtual) space.
#[derive(Debug, Clone)]
pub struct ElfFunction {
    pub start: u64,
    pub end: u64,
    pub name: String,
}

/// Resolved source location for one address.
#[derive(Debug, Default, Clone)]
pub struct SourceInfo {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// DWARF-capable handle for one backing file, bound to the symbol bias
/// of the process that mapped it. Owns its parsed state; the source
/// bytes are released once parsing completes.
pub struct ModuleHandle {
    functions: Vec<ElfFunction>,
    segments: Vec<LoadSegment>,
    context: Option<Context<EndianRcSlice<RunTimeEndian>>>,
    build_id: String,
    bias: u64,
    with_debug: bool,
}

impl ModuleHandle {
    /// Parses the file at `path`. `with_debug` controls whether DWARF
    /// line information is loaded alongside the symbol tables.
    pub fn open(
        path: &str,
        bias: u64,
        with_debug: bool) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("unable to open {}", path))?;

        /* Safety: mapping is private and read-only */
        let data = unsafe { Mmap::map(&file) }
            .with_context(|| format!("unable to map {}", path))?;

        let obj = object::File::parse(&*data)
            .with_context(|| format!("unable to parse {}", path))?;

        let mut functions: Vec<ElfFunction> = Vec::new();

        for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
            if symbol.kind() != object::SymbolKind::Text ||
               symbol.size() == 0 {
                continue;
            }

            if let Ok(name) = symbol.name() {
                functions.push(
                    ElfFunction {
                        start: symbol.address(),
                        end: symbol.address() + symbol.size() - 1,
                        name: name.to_owned(),
                    });
            }
        }

        functions.sort_by_key(|function| function.start);
        functions.dedup_by_key(|function| function.start);

        let mut segments = Vec::new();

        for segment in obj.segments() {
            let (file_start, file_len) = segment.file_range();

            if file_len == 0 {
                continue;
            }

            segments.push(
                LoadSegment {
                    file_start,
                    file_end: file_start + file_len,
                    vaddr: segment.address(),
                });
        }

        let build_id = match Self::extract_build_id(&obj) {
            Some(bytes) => {
                bytes.iter()
                    .map(|b| format!("{:02x}", b))
                    .collect()
            },
            None => String::new(),
        };

        let context = if with_debug {
            match Self::load_context(&obj) {
                Ok(context) => Some(context),
                Err(error) => {
                    debug!("no line info for {}: {}", path, error);
                    None
                },
            }
        } else {
            None
        };

        Ok(Self {
            functions,
            segments,
            context,
            build_id,
            bias,
            with_debug,
        })
    }

    /// ELF note format: namesz, descsz, type, then "GNU\0" and the id
    /// bytes, each 4-byte aligned. Type 3 is NT_GNU_BUILD_ID.
    fn extract_build_id(
        obj: &object::File<'_>) -> Option<Vec<u8>> {
        let section = obj.section_by_name(".note.gnu.build-id")?;
        let note = section.data().ok()?;

        if note.len() < 16 {
            return None;
        }

        let namesz = u32::from_ne_bytes(note[0..4].try_into().ok()?) as usize;
        let descsz = u32::from_ne_bytes(note[4..8].try_into().ok()?) as usize;
        let note_type = u32::from_ne_bytes(note[8..12].try_into().ok()?);

        if note_type != 3 || namesz < 4 {
            return None;
        }

        let name_aligned = (namesz + 3) & !3;
        let desc_offset = 12 + name_aligned;

        if note.len() < desc_offset + descsz {
            return None;
        }

        Some(note[desc_offset..desc_offset + descsz].to_vec())
    }

    fn load_context(
        obj: &object::File<'_>) -> anyhow::Result<Context<EndianRcSlice<RunTimeEndian>>> {
        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));

                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;

        Context::from_dwarf(dwarf)
            .context("unable to load debug information")
    }

    pub fn bias(&self) -> u64 { self.bias }

    pub fn with_debug(&self) -> bool { self.with_debug }

    pub fn has_functions(&self) -> bool { !self.functions.is_empty() }

    pub fn build_id(&self) -> &str { &self.build_id }

    /// Translates a mapping-derived file offset into the ELF virtual
    /// address space function ranges are keyed by. Identity when no
    /// segment covers the offset.
    pub fn elf_vaddr(
        &self,
        file_offset: u64) -> u64 {
        for segment in &self.segments {
            if file_offset >= segment.file_start &&
               file_offset < segment.file_end {
                return (file_offset - segment.file_start) + segment.vaddr;
            }
        }

        file_offset
    }

    /// Finds the function covering an ELF address. The name comes back
    /// demangled; the range bounds the cacheable span.
    pub fn find_function(
        &self,
        elf_pc: u64) -> Option<ElfFunction> {
        if self.functions.is_empty() {
            return None;
        }

        let mut index = self.functions.partition_point(
            |function| function.start <= elf_pc );

        index = index.checked_sub(1)?;

        let function = &self.functions[index];

        if elf_pc > function.end {
            return None;
        }

        Some(ElfFunction {
            start: function.start,
            end: function.end,
            name: demangle(&function.name),
        })
    }

    /// Source file and line for an ELF address, when debug information
    /// is present.
    pub fn find_source(
        &self,
        elf_pc: u64) -> Option<SourceInfo> {
        let context = self.context.as_ref()?;

        let location = context.find_location(elf_pc).ok()??;

        Some(SourceInfo {
            function: String::new(),
            file: location.file.unwrap_or("").to_owned(),
            line: location.line.unwrap_or(0),
        })
    }
}
