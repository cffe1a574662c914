// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use protobuf::CodedOutputStream;
use tracing::debug;

use crate::aggregate::ProfileBuilder;
use crate::symbols::SymbolTable;
use crate::unwind::{FunLoc, MapInfoLookup};

/// Simple string interner for the profile's string table. Index zero
/// is the required empty string.
struct StringTable {
    list: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = Self {
            list: Vec::new(),
            index: HashMap::new(),
        };

        table.to_id("");
        table
    }

    fn to_id(
        &mut self,
        value: &str) -> usize {
        match self.index.get(value) {
            Some(id) => *id,
            None => {
                let id = self.list.len();

                self.list.push(value.to_owned());
                self.index.insert(value.to_owned(), id);

                id
            },
        }
    }
}

fn proto_append(
    field_number: u32,
    input: &mut Vec<u8>,
    output: &mut CodedOutputStream) -> anyhow::Result<()> {
    output.write_bytes(field_number, input)?;
    input.clear();
    Ok(())
}

fn write_value_type(
    field_number: u32,
    buffer: &mut Vec<u8>,
    output: &mut CodedOutputStream,
    type_id: usize,
    unit_id: usize) -> anyhow::Result<()> {
    let mut stream = CodedOutputStream::new(buffer);

    stream.write_int64(1, type_id as i64)?;
    stream.write_int64(2, unit_id as i64)?;
    stream.flush()?;
    drop(stream);

    proto_append(field_number, buffer, output)
}

#[allow(clippy::too_many_arguments)]
fn write_sample(
    buffer: &mut Vec<u8>,
    output: &mut CodedOutputStream,
    location_ids: &[u64],
    values: &[i64],
    pid: u32,
    tid: u32,
    pid_key: usize,
    tid_key: usize) -> anyhow::Result<()> {
    let mut stream = CodedOutputStream::new(buffer);

    stream.write_repeated_packed_uint64(1, location_ids)?;
    stream.write_repeated_packed_int64(2, values)?;
    stream.flush()?;
    drop(stream);

    /* Labels are nested messages; frame them by hand */
    let mut label = Vec::new();

    {
        let mut stream = CodedOutputStream::new(&mut label);
        stream.write_int64(1, pid_key as i64)?;
        stream.write_int64(4, pid as i64)?;
        stream.flush()?;
    }

    {
        let mut stream = CodedOutputStream::new(buffer);
        stream.write_bytes(3, &label)?;
        stream.flush()?;
    }

    label.clear();

    {
        let mut stream = CodedOutputStream::new(&mut label);
        stream.write_int64(1, tid_key as i64)?;
        stream.write_int64(4, tid as i64)?;
        stream.flush()?;
    }

    {
        let mut stream = CodedOutputStream::new(buffer);
        stream.write_bytes(3, &label)?;
        stream.flush()?;
    }

    proto_append(2, buffer, output)
}

#[allow(clippy::too_many_arguments)]
fn write_mapping(
    buffer: &mut Vec<u8>,
    output: &mut CodedOutputStream,
    id: u64,
    mem_start: u64,
    mem_end: u64,
    file_offset: u64,
    filename_id: usize,
    build_id: usize) -> anyhow::Result<()> {
    let mut stream = CodedOutputStream::new(buffer);

    stream.write_uint64(1, id)?;
    stream.write_uint64(2, mem_start)?;
    stream.write_uint64(3, mem_end)?;
    stream.write_uint64(4, file_offset)?;
    stream.write_uint64(5, filename_id as u64)?;

    if build_id != 0 {
        stream.write_uint64(6, build_id as u64)?;
    }

    /* Functions resolved for this mapping */
    stream.write_bool(7, true)?;

    stream.flush()?;
    drop(stream);

    proto_append(3, buffer, output)
}

fn write_location(
    buffer: &mut Vec<u8>,
    output: &mut CodedOutputStream,
    id: u64,
    mapping_id: u64,
    address: u64,
    function_id: u64,
    line: i64) -> anyhow::Result<()> {
    let mut stream = CodedOutputStream::new(buffer);

    stream.write_uint64(1, id)?;
    stream.write_uint64(2, mapping_id)?;
    stream.write_uint64(3, address)?;
    stream.flush()?;
    drop(stream);

    if function_id != 0 {
        let mut line_msg = Vec::new();

        {
            let mut stream = CodedOutputStream::new(&mut line_msg);
            stream.write_uint64(1, function_id)?;

            if line != 0 {
                stream.write_int64(2, line)?;
            }

            stream.flush()?;
        }

        let mut stream = CodedOutputStream::new(buffer);
        stream.write_bytes(4, &line_msg)?;
        stream.flush()?;
    }

    proto_append(4, buffer, output)
}

fn write_function(
    buffer: &mut Vec<u8>,
    output: &mut CodedOutputStream,
    id: u64,
    name_id: usize,
    filename_id: usize) -> anyhow::Result<()> {
    let mut stream = CodedOutputStream::new(buffer);

    stream.write_uint64(1, id)?;
    stream.write_int64(2, name_id as i64)?;

    if filename_id != 0 {
        stream.write_int64(4, filename_id as i64)?;
    }

    stream.flush()?;
    drop(stream);

    proto_append(5, buffer, output)
}

struct FunctionRecord {
    id: u64,
    name_id: usize,
    filename_id: usize,
}

struct LocationRecord {
    id: u64,
    mapping_id: u64,
    address: u64,
    function_id: u64,
    line: i64,
}

/// Serializes a cut profile into uncompressed pprof bytes. Locations,
/// functions, mappings and strings are interned here, walking every
/// aggregated entry once.
pub fn write_profile(
    builder: &ProfileBuilder,
    symbols: &SymbolTable,
    mapinfo: &MapInfoLookup,
    duration_ns: u64,
    writer: &mut impl Write) -> anyhow::Result<()> {
    let mut strings = StringTable::new();
    let mut buffer = Vec::with_capacity(64 * 1024);
    let mut output = CodedOutputStream::new(writer);

    /* Sample types */
    for sample_type in builder.sample_types() {
        let type_id = strings.to_id(&sample_type.name);
        let unit_id = strings.to_id(&sample_type.unit);

        write_value_type(
            1,
            &mut buffer,
            &mut output,
            type_id,
            unit_id)?;
    }

    let pid_key = strings.to_id("pid");
    let tid_key = strings.to_id("tid");

    /* Walk entries, interning everything a sample references */
    let mut functions: HashMap<usize, FunctionRecord> = HashMap::new();
    let mut locations: HashMap<FunLoc, LocationRecord> = HashMap::new();
    let mut mappings: HashMap<usize, u64> = HashMap::new();
    let mut mapping_records: Vec<(u64, usize)> = Vec::new();
    let mut location_ids = Vec::new();

    for entry in builder.entries() {
        location_ids.clear();

        for loc in &entry.stack.locs {
            let next_location = locations.len() as u64 + 1;

            let record = locations.entry(*loc).or_insert_with(|| {
                /* Mapping */
                let next_mapping = mappings.len() as u64 + 1;

                let mapping_id = *mappings
                    .entry(loc.mapinfo_idx)
                    .or_insert_with(|| {
                        mapping_records.push(
                            (next_mapping, loc.mapinfo_idx));
                        next_mapping
                    });

                /* Function, one per symbol */
                let next_function = functions.len() as u64 + 1;
                let symbol = &symbols[loc.symbol_idx];

                let symbolized = builder.symbolized(
                    loc.file_info_id,
                    loc.elf_pc);

                let name = match symbolized {
                    Some(record) if !record.function.is_empty() =>
                        record.function.as_str(),
                    _ => symbol.name.as_str(),
                };

                let filename = match symbolized {
                    Some(record) if !record.file.is_empty() =>
                        record.file.as_str(),
                    _ => symbol.src_path.as_str(),
                };

                let line = match symbolized {
                    Some(record) => record.line as i64,
                    None => symbol.line as i64,
                };

                let name_id = strings.to_id(name);
                let filename_id = strings.to_id(filename);

                let function_id = match functions.get(&loc.symbol_idx) {
                    Some(function) => function.id,
                    None => {
                        functions.insert(
                            loc.symbol_idx,
                            FunctionRecord {
                                id: next_function,
                                name_id,
                                filename_id,
                            });

                        next_function
                    },
                };

                LocationRecord {
                    id: next_location,
                    mapping_id,
                    address: loc.ip,
                    function_id,
                    line,
                }
            });

            location_ids.push(record.id);
        }

        write_sample(
            &mut buffer,
            &mut output,
            &location_ids,
            &entry.values,
            entry.stack.pid,
            entry.stack.tid,
            pid_key,
            tid_key)?;
    }

    /* Mappings */
    for (mapping_id, mapinfo_idx) in &mapping_records {
        let info = mapinfo.get(*mapinfo_idx);

        let filename_id = strings.to_id(&info.short_name);
        let build_id = strings.to_id(&info.build_id);

        write_mapping(
            &mut buffer,
            &mut output,
            *mapping_id,
            info.start,
            info.end,
            info.page_offset,
            filename_id,
            build_id)?;
    }

    /* Locations */
    for record in locations.values() {
        write_location(
            &mut buffer,
            &mut output,
            record.id,
            record.mapping_id,
            record.address,
            record.function_id,
            record.line)?;
    }

    /* Functions */
    for function in functions.values() {
        write_function(
            &mut buffer,
            &mut output,
            function.id,
            function.name_id,
            function.filename_id)?;
    }

    /* Strings */
    for value in &strings.list {
        output.write_string(6, value)?;
    }

    /* Times: start, duration, period */
    let start_ns = builder.start_time()
        .timestamp_nanos_opt()
        .unwrap_or(0);

    output.write_int64(9, start_ns)?;
    output.write_int64(10, duration_ns as i64)?;

    if builder.period_ns() != 0 {
        output.write_int64(12, builder.period_ns() as i64)?;
    }

    output.flush()?;
    drop(output);

    debug!(
        "profile serialized: {} entries, {} strings",
        builder.entry_count(),
        strings.list.len());

    Ok(())
}

/// The gzip-framed form uploads and debug copies use.
pub fn write_profile_gz(
    builder: &ProfileBuilder,
    symbols: &SymbolTable,
    mapinfo: &MapInfoLookup,
    duration_ns: u64,
    writer: impl Write) -> anyhow::Result<()> {
    let mut gzip = GzEncoder::new(writer, Compression::default());

    write_profile(
        builder,
        symbols,
        mapinfo,
        duration_ns,
        &mut gzip)?;

    gzip.finish()?;

    Ok(())
}

#[cfg(test)]
pub mod reader {
    //! Minimal pprof reader used to check the writer against itself.

    use std::collections::HashMap;

    #[derive(Default, Debug)]
    pub struct ReadProfile {
        pub strings: Vec<String>,
        pub samples: Vec<(Vec<u64>, Vec<i64>)>,
        pub locations: HashMap<u64, (u64, u64)>,
        pub functions: HashMap<u64, usize>,
        pub sample_types: Vec<(usize, usize)>,
        pub duration_ns: i64,
    }

    impl ReadProfile {
        /// Function names of one sample's stack, leaf first.
        pub fn stack_names(
            &self,
            location_ids: &[u64]) -> Vec<String> {
            location_ids.iter()
                .map(|id| {
                    let (_, function_id) = self.locations[id];

                    match self.functions.get(&function_id) {
                        Some(name_id) => self.strings[*name_id].clone(),
                        None => String::new(),
                    }
                })
                .collect()
        }
    }

    fn read_varint(
        data: &[u8],
        offset: &mut usize) -> u64 {
        let mut value = 0u64;
        let mut shift = 0;

        loop {
            let byte = data[*offset];
            *offset += 1;

            value |= u64::from(byte & 0x7F) << shift;

            if byte & 0x80 == 0 {
                break;
            }

            shift += 7;
        }

        value
    }

    fn read_message(
        data: &[u8]) -> Vec<(u32, Vec<u8>, u64)> {
        let mut fields = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let tag = read_varint(data, &mut offset);
            let field = (tag >> 3) as u32;
            let wire = tag & 7;

            match wire {
                0 => {
                    let value = read_varint(data, &mut offset);
                    fields.push((field, Vec::new(), value));
                },
                2 => {
                    let len = read_varint(data, &mut offset) as usize;
                    let bytes = data[offset..offset + len].to_vec();
                    offset += len;
                    fields.push((field, bytes, 0));
                },
                _ => panic!("unexpected wire type {}", wire),
            }
        }

        fields
    }

    fn read_packed_u64(data: &[u8]) -> Vec<u64> {
        let mut values = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            values.push(read_varint(data, &mut offset));
        }

        values
    }

    pub fn parse(data: &[u8]) -> ReadProfile {
        let mut profile = ReadProfile::default();

        for (field, bytes, value) in read_message(data) {
            match field {
                1 => {
                    let mut type_id = 0;
                    let mut unit_id = 0;

                    for (f, _b, v) in read_message(&bytes) {
                        match f {
                            1 => { type_id = v as usize; },
                            2 => { unit_id = v as usize; },
                            _ => {},
                        }
                    }

                    profile.sample_types.push((type_id, unit_id));
                },
                2 => {
                    let mut location_ids = Vec::new();
                    let mut values = Vec::new();

                    for (f, b, _v) in read_message(&bytes) {
                        match f {
                            1 => { location_ids = read_packed_u64(&b); },
                            2 => {
                                values = read_packed_u64(&b)
                                    .into_iter()
                                    .map(|raw| raw as i64)
                                    .collect();
                            },
                            _ => {},
                        }
                    }

                    profile.samples.push((location_ids, values));
                },
                4 => {
                    let mut id = 0;
                    let mut function_id = 0;
                    let mut address = 0;

                    for (f, b, v) in read_message(&bytes) {
                        match f {
                            1 => { id = v; },
                            3 => { address = v; },
                            4 => {
                                for (lf, _lb, lv) in read_message(&b) {
                                    if lf == 1 {
                                        function_id = lv;
                                    }
                                }
                            },
                            _ => {},
                        }
                    }

                    profile.locations.insert(id, (address, function_id));
                },
                5 => {
                    let mut id = 0;
                    let mut name_id = 0;

                    for (f, _b, v) in read_message(&bytes) {
                        match f {
                            1 => { id = v; },
                            2 => { name_id = v as usize; },
                            _ => {},
                        }
                    }

                    profile.functions.insert(id, name_id);
                },
                6 => {
                    profile.strings.push(
                        String::from_utf8(bytes).unwrap());
                },
                10 => {
                    profile.duration_ns = value as i64;
                },
                _ => {},
            }
        }

        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::aggregate::{LiveAllocations, ProfileBuilder};
    use crate::dso::FILE_INFO_ERROR;
    use crate::symbols::Symbol;
    use crate::unwind::{FunLoc, UnwindOutput};
    use crate::watcher::{watcher_from_str, Watcher, AGG_POS_SUM};

    fn symbols() -> SymbolTable {
        vec![
            Symbol::new("busy_spin".into(), "/src/spin.c".into(), 10),
            Symbol::new("f3".into(), "/src/spin.c".into(), 20),
            Symbol::new("f2".into(), "/src/spin.c".into(), 30),
            Symbol::new("f1".into(), "/src/spin.c".into(), 40),
            Symbol::new("_start".into(), String::new(), 0),
        ]
    }

    fn stack_of(
        symbol_idxs: &[usize]) -> UnwindOutput {
        UnwindOutput {
            pid: 1000,
            tid: 1001,
            locs: symbol_idxs.iter()
                .enumerate()
                .map(|(depth, symbol_idx)| FunLoc {
                    ip: 0x1000 + depth as u64 * 0x10,
                    elf_pc: 0x1000 + depth as u64 * 0x10,
                    file_info_id: FILE_INFO_ERROR,
                    symbol_idx: *symbol_idx,
                    mapinfo_idx: 0,
                })
                .collect(),
            is_incomplete: false,
            container_id: None,
        }
    }

    fn build_profile() -> (ProfileBuilder, Vec<Watcher>) {
        let mut watchers = vec![watcher_from_str("sCPU").unwrap()];
        let mut builder = ProfileBuilder::new(&mut watchers);

        builder.add(
            &stack_of(&[0, 1, 2, 3, 4]),
            &watchers[0],
            AGG_POS_SUM,
            10_101_010,
            1);

        builder.add(
            &stack_of(&[1, 2, 3, 4]),
            &watchers[0],
            AGG_POS_SUM,
            20_202_020,
            2);

        (builder, watchers)
    }

    #[test]
    fn round_trip_stack_sets() {
        let (builder, _watchers) = build_profile();
        let symbols = symbols();
        let mapinfo = MapInfoLookup::new();

        let mut first = Vec::new();

        write_profile(
            &builder,
            &symbols,
            &mapinfo,
            60_000_000_000,
            &mut first).unwrap();

        /* Parse back and compare the stack sets */
        let parsed = reader::parse(&first);

        assert_eq!(2, parsed.samples.len());
        assert_eq!(60_000_000_000, parsed.duration_ns);

        let stacks: HashSet<Vec<String>> = parsed.samples
            .iter()
            .map(|(location_ids, _)| parsed.stack_names(location_ids))
            .collect();

        let expected: HashSet<Vec<String>> = [
            vec!["busy_spin", "f3", "f2", "f1", "_start"],
            vec!["f3", "f2", "f1", "_start"],
        ]
            .iter()
            .map(|stack| {
                stack.iter().map(|s| s.to_string()).collect()
            })
            .collect();

        assert_eq!(expected, stacks);

        /* Serialize again from the reread data's source builder: the
         * writer is deterministic in content (sets, not order) */
        let mut second = Vec::new();

        write_profile(
            &builder,
            &symbols,
            &mapinfo,
            60_000_000_000,
            &mut second).unwrap();

        let reparsed = reader::parse(&second);

        let second_stacks: HashSet<Vec<String>> = reparsed.samples
            .iter()
            .map(|(location_ids, _)| reparsed.stack_names(location_ids))
            .collect();

        assert_eq!(stacks, second_stacks);
    }

    #[test]
    fn values_survive() {
        let (builder, watchers) = build_profile();
        let symbols = symbols();
        let mapinfo = MapInfoLookup::new();

        let mut data = Vec::new();

        write_profile(
            &builder,
            &symbols,
            &mapinfo,
            1,
            &mut data).unwrap();

        let parsed = reader::parse(&data);

        let indices = &watchers[0].profile_indices[AGG_POS_SUM];
        let value_index = indices.value_index as usize;
        let count_index = indices.count_index as usize;

        let total_value: i64 = parsed.samples
            .iter()
            .map(|(_, values)| values[value_index])
            .sum();

        let total_count: i64 = parsed.samples
            .iter()
            .map(|(_, values)| values[count_index])
            .sum();

        assert_eq!(10_101_010 + 20_202_020, total_value);
        assert_eq!(3, total_count);
    }

    #[test]
    fn sample_types_in_table() {
        let (builder, _watchers) = build_profile();
        let symbols = symbols();
        let mapinfo = MapInfoLookup::new();

        let mut data = Vec::new();

        write_profile(
            &builder,
            &symbols,
            &mapinfo,
            1,
            &mut data).unwrap();

        let parsed = reader::parse(&data);

        let names: Vec<&str> = parsed.sample_types
            .iter()
            .map(|(type_id, _)| parsed.strings[*type_id].as_str())
            .collect();

        assert!(names.contains(&"cpu-time"));
        assert!(names.contains(&"cpu-samples"));
    }

    #[test]
    fn live_entries_serialize() {
        let mut watchers = vec![watcher_from_str("sALLOC").unwrap()];
        let mut builder = ProfileBuilder::new(&mut watchers);
        let mut live = LiveAllocations::new();

        live.register_allocation(
            0,
            1000,
            0xAAAA,
            4096,
            &stack_of(&[0, 4]));

        live.aggregate_into(&mut builder, &watchers);

        let symbols = symbols();
        let mapinfo = MapInfoLookup::new();
        let mut data = Vec::new();

        write_profile(
            &builder,
            &symbols,
            &mapinfo,
            1,
            &mut data).unwrap();

        let parsed = reader::parse(&data);

        assert_eq!(1, parsed.samples.len());

        /* inuse types present */
        let names: Vec<&str> = parsed.sample_types
            .iter()
            .map(|(type_id, _)| parsed.strings[*type_id].as_str())
            .collect();

        assert!(names.contains(&"inuse-space"));
    }

    #[test]
    fn gzip_frame() {
        let (builder, _watchers) = build_profile();
        let symbols = symbols();
        let mapinfo = MapInfoLookup::new();

        let mut data = Vec::new();

        write_profile_gz(
            &builder,
            &symbols,
            &mapinfo,
            1,
            &mut data).unwrap();

        /* Standard gzip magic */
        assert_eq!(0x1F, data[0]);
        assert_eq!(0x8B, data[1]);
    }
}
