// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

use super::{Symbol, SymbolIdx, SymbolMap, SymbolSpan, SymbolTable};

const JITDUMP_MAGIC: u32 = 0x4A69_5444;
const JITDUMP_MAGIC_REV: u32 = 0x4454_694A;
const JITDUMP_VERSION: u32 = 1;

const JIT_CODE_LOAD: u32 = 0;
const JIT_CODE_MOVE: u32 = 1;
const JIT_CODE_DEBUG_INFO: u32 = 2;
const JIT_CODE_CLOSE: u32 = 3;
const JIT_CODE_MAX: u32 = 7;

const HEADER_SIZE: u64 = 40;
const PREFIX_SIZE: u64 = 16;
const CODE_LOAD_FIXED_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 8;

fn read_u32(
    reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

fn read_u64(
    reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// One function announcement from a jitdump stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitFunction {
    pub code_addr: u64,
    pub code_size: u64,
    pub name: String,
}

/// Streaming jitdump reader. The file may be mid-write by the runtime;
/// a short read simply terminates the stream with what was parsed.
pub fn read_jitdump(
    mut reader: impl Read + Seek) -> io::Result<Vec<JitFunction>> {
    let magic = read_u32(&mut reader)?;

    if magic == JITDUMP_MAGIC_REV {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "byte-swapped jitdump not handled"));
    }

    if magic != JITDUMP_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unknown jitdump magic"));
    }

    let version = read_u32(&mut reader)?;

    if version != JITDUMP_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "jitdump version not handled"));
    }

    let total_size = read_u32(&mut reader)? as u64;

    /* Skip the rest of the header (elf_mach, pad, pid, time, flags) */
    if total_size < HEADER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "jitdump header too small"));
    }

    reader.seek(SeekFrom::Start(total_size))?;

    let mut functions = Vec::new();

    loop {
        /* Record prefix: id, total_size, timestamp */
        let id = match read_u32(&mut reader) {
            Ok(id) => id,
            /* EOF between records is the normal end */
            Err(_) => { break; },
        };

        let record_size = match read_u32(&mut reader) {
            Ok(size) => size as u64,
            Err(_) => { break; },
        };

        let _timestamp = match read_u64(&mut reader) {
            Ok(timestamp) => timestamp,
            Err(_) => { break; },
        };

        if id == JIT_CODE_CLOSE || id >= JIT_CODE_MAX {
            break;
        }

        if record_size < PREFIX_SIZE {
            break;
        }

        let payload_size = (record_size - PREFIX_SIZE) as usize;

        match id {
            JIT_CODE_LOAD => {
                if payload_size < CODE_LOAD_FIXED_SIZE {
                    break;
                }

                let mut payload = vec![0u8; payload_size];

                if reader.read_exact(&mut payload).is_err() {
                    /* Mid-write truncation */
                    break;
                }

                let mut cursor = io::Cursor::new(&payload[..]);

                let _pid = read_u32(&mut cursor)?;
                let _tid = read_u32(&mut cursor)?;
                let _vma = read_u64(&mut cursor)?;
                let code_addr = read_u64(&mut cursor)?;
                let code_size = read_u64(&mut cursor)?;
                let _code_index = read_u64(&mut cursor)?;

                let name_bytes = &payload[CODE_LOAD_FIXED_SIZE..];
                let name_end = name_bytes.iter()
                    .position(|b| *b == 0)
                    .unwrap_or(name_bytes.len());

                let name = String::from_utf8_lossy(
                    &name_bytes[..name_end]).into_owned();

                if code_addr != 0 && code_size != 0 {
                    functions.push(
                        JitFunction {
                            code_addr,
                            code_size,
                            name,
                        });
                }
            },
            JIT_CODE_MOVE | JIT_CODE_DEBUG_INFO => {
                /* Not needed for symbolization; skip the payload */
                reader.seek(SeekFrom::Current(payload_size as i64))?;
            },
            _ => {
                reader.seek(SeekFrom::Current(payload_size as i64))?;
            },
        }
    }

    Ok(functions)
}

/// Per-PID lookup over jitdump files referenced by a marker mapping.
#[derive(Default)]
pub struct JitdumpLookup {
    pid_map: HashMap<u32, SymbolMap>,
}

impl JitdumpLookup {
    pub fn new() -> Self { Self::default() }

    fn fill(
        &mut self,
        pid: u32,
        path: &str,
        table: &mut SymbolTable) {
        let map = self.pid_map.entry(pid).or_default();
        map.clear();

        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(_) => {
                /* Sentinel so the file is not retried per sample */
                map.insert(0, SymbolSpan::new(0, usize::MAX));
                return;
            },
        };

        match read_jitdump(file) {
            Ok(functions) => {
                debug!(
                    "jitdump loaded (PID{}): {} functions",
                    pid,
                    functions.len());

                for function in functions {
                    map.insert(
                        function.code_addr,
                        SymbolSpan::new(
                            function.code_addr + function.code_size - 1,
                            table.len()));

                    table.push(Symbol::new(
                        function.name,
                        String::from("jit"),
                        0));
                }
            },
            Err(error) => {
                debug!("jitdump parse failed (PID{}): {}", pid, error);
                map.insert(0, SymbolSpan::new(0, usize::MAX));
            },
        }
    }

    /// Resolves a PC against the PID's jitdump, loading it on first
    /// use. `path` locates the dump file in the target namespace.
    pub fn get_or_insert(
        &mut self,
        pid: u32,
        path: &str,
        pc: u64,
        table: &mut SymbolTable) -> Option<SymbolIdx> {
        if self.pid_map
            .get(&pid)
            .map(SymbolMap::is_empty)
            .unwrap_or(true) {
            self.fill(pid, path, table);
        }

        let map = self.pid_map.get(&pid)?;

        let (found, hit) = map.find_closest(pc);

        if hit {
            let symbol_idx = found.unwrap().1.symbol_idx();

            if symbol_idx == usize::MAX {
                return None;
            }

            return Some(symbol_idx);
        }

        None
    }

    pub fn pid_free(
        &mut self,
        pid: u32) {
        self.pid_map.remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_dump(
        functions: &[(u64, u64, &str)]) -> Vec<u8> {
        let mut data = Vec::new();

        /* Header */
        data.extend_from_slice(&JITDUMP_MAGIC.to_ne_bytes());
        data.extend_from_slice(&JITDUMP_VERSION.to_ne_bytes());
        data.extend_from_slice(&(HEADER_SIZE as u32).to_ne_bytes());
        data.extend_from_slice(&62u32.to_ne_bytes());   /* elf_mach */
        data.extend_from_slice(&0u32.to_ne_bytes());    /* pad */
        data.extend_from_slice(&123u32.to_ne_bytes());  /* pid */
        data.extend_from_slice(&0u64.to_ne_bytes());    /* timestamp */
        data.extend_from_slice(&0u64.to_ne_bytes());    /* flags */

        for (index, (addr, size, name)) in functions.iter().enumerate() {
            let payload_len = CODE_LOAD_FIXED_SIZE + name.len() + 1;
            let record_len = PREFIX_SIZE as usize + payload_len;

            data.extend_from_slice(&JIT_CODE_LOAD.to_ne_bytes());
            data.extend_from_slice(&(record_len as u32).to_ne_bytes());
            data.extend_from_slice(&0u64.to_ne_bytes());

            data.extend_from_slice(&123u32.to_ne_bytes());
            data.extend_from_slice(&124u32.to_ne_bytes());
            data.extend_from_slice(&0u64.to_ne_bytes());
            data.extend_from_slice(&addr.to_ne_bytes());
            data.extend_from_slice(&size.to_ne_bytes());
            data.extend_from_slice(&(index as u64).to_ne_bytes());
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }

        data
    }

    #[test]
    fn reads_code_loads() {
        let data = build_dump(&[
            (0x7000, 0x100, "jit::first"),
            (0x8000, 0x200, "jit::second"),
        ]);

        let functions = read_jitdump(io::Cursor::new(data)).unwrap();

        assert_eq!(2, functions.len());
        assert_eq!(0x7000, functions[0].code_addr);
        assert_eq!("jit::first", functions[0].name);
        assert_eq!(0x8000, functions[1].code_addr);
        assert_eq!(0x200, functions[1].code_size);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_dump(&[(0x7000, 0x100, "f")]);
        data[0] = 0xFF;

        assert!(read_jitdump(io::Cursor::new(data)).is_err());
    }

    #[test]
    fn truncated_stream_keeps_parsed() {
        let mut data = build_dump(&[
            (0x7000, 0x100, "jit::first"),
            (0x8000, 0x200, "jit::second"),
        ]);

        /* Chop into the middle of the second record */
        data.truncate(data.len() - 10);

        let functions = read_jitdump(io::Cursor::new(data)).unwrap();

        assert_eq!(1, functions.len());
        assert_eq!("jit::first", functions[0].name);
    }

    #[test]
    fn close_record_stops() {
        let mut data = build_dump(&[(0x7000, 0x100, "jit::first")]);

        /* CLOSE record then a trailing LOAD that must be ignored */
        data.extend_from_slice(&JIT_CODE_CLOSE.to_ne_bytes());
        data.extend_from_slice(&(PREFIX_SIZE as u32).to_ne_bytes());
        data.extend_from_slice(&0u64.to_ne_bytes());

        let trailing = build_dump(&[(0x9000, 0x100, "jit::late")]);
        data.extend_from_slice(&trailing[HEADER_SIZE as usize..]);

        let functions = read_jitdump(io::Cursor::new(data)).unwrap();

        assert_eq!(1, functions.len());
    }
}
