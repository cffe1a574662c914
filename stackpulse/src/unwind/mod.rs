// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::{HashMap, HashSet};
use std::fs::File;

use rewind::{
    Machine,
    Process,
    Region,
    RegionAccessor,
    RegionKey,
    StackWalker,
    UnwindKind,
};

use tracing::{debug, trace};

use crate::ProfResult;
use crate::dso::{DsoRegistry, DsoType, FileInfoId, FILE_INFO_ERROR};
use crate::perf_event::abi::{SampleRecord, REG_POS_BP, REG_POS_IP, REG_POS_SP};
use crate::procfs;
use crate::symbols::{
    DwarfCache,
    ModuleHandle,
    RuntimeSymbolLookup,
    Symbol,
    SymbolIdx,
    SymbolTable,
};
use crate::symbols::jitdump::JitdumpLookup;

pub mod mapinfo;

pub use mapinfo::{MapInfo, MapInfoIdx, MapInfoLookup};

/// One frame of an unwound stack. Structural equality and hashing make
/// the frame list usable as an aggregation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunLoc {
    pub ip: u64,
    pub elf_pc: u64,
    pub file_info_id: FileInfoId,
    pub symbol_idx: SymbolIdx,
    pub mapinfo_idx: MapInfoIdx,
}

/// The unwinder's product for one sample.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct UnwindOutput {
    pub pid: u32,
    pub tid: u32,
    pub locs: Vec<FunLoc>,
    pub is_incomplete: bool,
    pub container_id: Option<String>,
}

impl UnwindOutput {
    pub fn clear(&mut self) {
        self.pid = 0;
        self.tid = 0;
        self.locs.clear();
        self.is_incomplete = false;
        self.container_id = None;
    }
}

/// Symbols for synthetic frames, interned once per session so error
/// stacks aggregate naturally.
#[derive(Debug, Clone, Copy)]
pub struct CommonLabels {
    pub truncated: SymbolIdx,
    pub unknown_dso: SymbolIdx,
    pub lost: SymbolIdx,
    pub frame_error: SymbolIdx,
    pub incomplete: SymbolIdx,
    pub max_pids: SymbolIdx,
    pub anonymous: SymbolIdx,
}

impl CommonLabels {
    fn intern(
        table: &mut SymbolTable) -> Self {
        let mut push = |name: &str| {
            let idx = table.len();
            table.push(Symbol::new(name.to_owned(), String::new(), 0));
            idx
        };

        Self {
            truncated: push("[truncated]"),
            unknown_dso: push("[unknown_dso]"),
            lost: push("[lost]"),
            frame_error: push("[frame_error]"),
            incomplete: push("[incomplete]"),
            max_pids: push("[max_pids]"),
            anonymous: push("[anon]"),
        }
    }
}

/// Opens backing files for the stack walker, resolving region keys to
/// the host-visible paths the registry discovered.
#[derive(Default)]
struct RegistryAccessor {
    paths: HashMap<(u64, u64), String>,
}

impl RegionAccessor for RegistryAccessor {
    fn open(
        &self,
        key: &RegionKey) -> Option<File> {
        let path = self.paths.get(&(key.dev(), key.ino()))?;

        File::open(path).ok()
    }
}

/// Upper bound on concurrently profiled processes; beyond it samples
/// degrade to a tagged synthetic stack.
const MAX_PROFILED_PIDS: usize = 512;

/// Copy of the mapping fields a frame resolution needs, detached from
/// the registry borrow.
#[derive(Clone, Copy)]
struct FrameDso {
    start: u64,
    end: u64,
    page_offset: u64,
    dso_type: DsoType,
}

/// Everything one worker needs to turn `(pid, regs, stack bytes)` into
/// a symbolized frame list.
pub struct UnwindState {
    machine: Machine,
    walker: Box<dyn StackWalker>,
    accessor: RegistryAccessor,
    frames: Vec<u64>,

    pub registry: DsoRegistry,
    pub dwarf_cache: DwarfCache,
    pub runtime_symbols: RuntimeSymbolLookup,
    pub jitdump: JitdumpLookup,
    pub symbol_table: SymbolTable,
    pub mapinfo: MapInfoLookup,
    pub labels: CommonLabels,
    pub output: UnwindOutput,

    modules: HashMap<(u32, FileInfoId), ModuleHandle>,
    module_failures: HashSet<(u32, FileInfoId)>,
    dso_fallback_symbols: HashMap<String, SymbolIdx>,
    exe_symbols: HashMap<u32, SymbolIdx>,
    container_ids: HashMap<u32, Option<String>>,
    synced_revisions: HashMap<u32, u64>,
    known_pids: HashSet<u32>,
    visited_pids: HashSet<u32>,
}

impl Default for UnwindState {
    fn default() -> Self {
        Self::new()
    }
}

impl UnwindState {
    pub fn new() -> Self {
        let mut symbol_table = SymbolTable::new();
        let labels = CommonLabels::intern(&mut symbol_table);

        Self {
            machine: Machine::new(),
            walker: Box::new(rewind::default_walker()),
            accessor: RegistryAccessor::default(),
            frames: Vec::new(),
            registry: DsoRegistry::new(),
            dwarf_cache: DwarfCache::from_env(),
            runtime_symbols: RuntimeSymbolLookup::new(),
            jitdump: JitdumpLookup::new(),
            symbol_table,
            mapinfo: MapInfoLookup::new(),
            labels,
            output: UnwindOutput::default(),
            modules: HashMap::new(),
            module_failures: HashSet::new(),
            dso_fallback_symbols: HashMap::new(),
            exe_symbols: HashMap::new(),
            container_ids: HashMap::new(),
            synced_revisions: HashMap::new(),
            known_pids: HashSet::new(),
            visited_pids: HashSet::new(),
        }
    }

    /// Unwinds one sample into `self.output`.
    pub fn unwind_sample(
        &mut self,
        sample: &SampleRecord<'_>) -> ProfResult<()> {
        let pid = sample.pid;

        self.output.clear();
        self.output.pid = pid;
        self.output.tid = sample.tid;

        self.visited_pids.insert(pid);

        let ip = sample.regs[REG_POS_IP];
        let bp = sample.regs[REG_POS_BP];
        let sp = sample.regs[REG_POS_SP];

        if !self.known_pids.contains(&pid) {
            if self.known_pids.len() >= MAX_PROFILED_PIDS {
                self.push_label_frame(ip, self.labels.max_pids);
                self.output.is_incomplete = true;
                self.append_base_frame(pid);
                return Ok(());
            }

            self.known_pids.insert(pid);
        }

        self.sync_process(pid);

        self.frames.clear();

        let walk = {
            let mut frames = std::mem::take(&mut self.frames);

            let walk = self.machine.walk_process(
                pid,
                self.walker.as_mut(),
                &self.accessor,
                ip,
                bp,
                sp,
                sample.stack,
                &mut frames);

            self.frames = frames;
            walk
        };

        let raw = std::mem::take(&mut self.frames);
        let completed = self.materialize_frames(pid, &raw);
        self.frames = raw;

        if !completed {
            /* Loop guard fired; the stack is already tagged */
            return Ok(());
        }

        if sample.stack.is_empty() {
            self.push_label_frame(ip, self.labels.incomplete);
            self.output.is_incomplete = true;
        } else if walk.truncated {
            self.output.is_incomplete = true;
        }

        if walk.error.is_some() && self.output.locs.len() <= 1 {
            trace!("walk error: {}", walk.error.unwrap());
            self.push_label_frame(ip, self.labels.frame_error);
            self.output.is_incomplete = true;
        }

        self.output.container_id = self.container_id(pid);

        self.append_base_frame(pid);

        Ok(())
    }

    /// Resolves raw IPs into located frames. Returns false when the
    /// infinite-loop guard aborted the stack (the truncation marker is
    /// appended and no base frame follows).
    fn materialize_frames(
        &mut self,
        pid: u32,
        raw_frames: &[u64]) -> bool {
        let mut repeats = 0;
        let mut prev_ip = 0u64;

        for (index, ip) in raw_frames.iter().enumerate() {
            let ip = *ip;

            if index > 0 && ip == prev_ip {
                repeats += 1;
            } else {
                repeats = 0;
            }

            prev_ip = ip;

            /* Callers sit one byte before their return site so the PC
             * lands inside the call instruction */
            let pc = if index == 0 { ip } else { ip.wrapping_sub(1) };

            self.resolve_frame(pid, ip, pc);

            if repeats >= 2 {
                /* Three identical frames in a row */
                debug!("loop detected in PID {} at {:#x}", pid, ip);
                self.push_label_frame(ip, self.labels.truncated);
                self.output.is_incomplete = true;
                return false;
            }
        }

        if raw_frames.len() >= rewind::MAX_WALK_FRAMES {
            self.push_label_frame(prev_ip, self.labels.truncated);
            self.output.is_incomplete = true;
        }

        true
    }

    fn resolve_frame(
        &mut self,
        pid: u32,
        ip: u64,
        pc: u64) {
        let frame_dso = {
            let (found, hit) = self.registry.find_or_backpopulate(pid, pc);

            match found {
                Some(dso) if hit => Some(FrameDso {
                    start: dso.start,
                    end: dso.end,
                    page_offset: dso.page_offset,
                    dso_type: dso.dso_type,
                }),
                _ => None,
            }
        };

        let frame_dso = match frame_dso {
            Some(frame_dso) => frame_dso,
            None => {
                self.push_label_frame(ip, self.labels.unknown_dso);
                return;
            },
        };

        match frame_dso.dso_type {
            DsoType::Anonymous | DsoType::JitPerfMap | DsoType::Vdso => {
                self.resolve_runtime_frame(pid, ip, pc, &frame_dso);
            },
            DsoType::Standard => {
                self.resolve_standard_frame(pid, ip, pc, &frame_dso);
            },
            _ => {
                self.push_label_frame(ip, self.labels.unknown_dso);
            },
        }
    }

    /// JIT and anonymous regions: jitdump first when the process
    /// announced one, then perf-map symbols, then a tagged frame.
    fn resolve_runtime_frame(
        &mut self,
        pid: u32,
        ip: u64,
        pc: u64,
        frame_dso: &FrameDso) {
        let mapinfo_idx = self.intern_mapinfo(pid, frame_dso, "");

        if let Some(marker_addr) = self.registry.jitdump_addr(pid) {
            let dump_path = {
                let (found, hit) = self.registry.find_closest(pid, marker_addr);

                match found {
                    Some(dso) if hit => {
                        Some(procfs::root_path(pid, &dso.filename))
                    },
                    _ => None,
                }
            };

            if let Some(dump_path) = dump_path {
                if let Some(symbol_idx) = self.jitdump.get_or_insert(
                    pid,
                    &dump_path,
                    pc,
                    &mut self.symbol_table) {
                    self.push_frame(
                        ip, pc, FILE_INFO_ERROR, symbol_idx, mapinfo_idx);
                    return;
                }
            }
        }

        if let Some(symbol_idx) = self.runtime_symbols.get_or_insert(
            pid,
            pc,
            &mut self.symbol_table) {
            self.push_frame(ip, pc, FILE_INFO_ERROR, symbol_idx, mapinfo_idx);
            return;
        }

        self.push_frame(
            ip, pc, FILE_INFO_ERROR, self.labels.anonymous, mapinfo_idx);
    }

    fn resolve_standard_frame(
        &mut self,
        pid: u32,
        ip: u64,
        pc: u64,
        frame_dso: &FrameDso) {
        let file_info_id = self.registry.resolve_file_info(pid, frame_dso.start);

        if file_info_id == FILE_INFO_ERROR {
            /* No readable backing file; name the frame after the DSO */
            let short_name = self.short_name_at(pid, frame_dso.start);
            let symbol_idx = self.dso_fallback_symbol(&short_name);
            let mapinfo_idx = self.intern_mapinfo(pid, frame_dso, "");

            self.push_frame(
                ip, pc, FILE_INFO_ERROR, symbol_idx, mapinfo_idx);
            return;
        }

        match self.ensure_module(pid, file_info_id) {
            Some(key) => {
                let elf_pc;
                let build_id;

                {
                    let module = &self.modules[&key];

                    elf_pc = module.elf_vaddr(
                        (pc - frame_dso.start) + frame_dso.page_offset);
                    build_id = module.build_id().to_owned();
                }

                let short_name = self.short_name_at(pid, frame_dso.start);

                let path = self.registry
                    .file_info(file_info_id)
                    .map(|file_info| file_info.path.clone())
                    .unwrap_or_default();

                let module = &self.modules[&key];

                let symbol_idx = self.dwarf_cache.get_or_insert(
                    module,
                    file_info_id,
                    elf_pc,
                    &short_name,
                    &path,
                    &mut self.symbol_table);

                let mapinfo_idx = self.intern_mapinfo(pid, frame_dso, &build_id);

                self.push_frame(
                    ip, elf_pc, file_info_id, symbol_idx, mapinfo_idx);
            },
            None => {
                let short_name = self.short_name_at(pid, frame_dso.start);
                let symbol_idx = self.dso_fallback_symbol(&short_name);
                let mapinfo_idx = self.intern_mapinfo(pid, frame_dso, "");

                self.push_frame(
                    ip, pc, FILE_INFO_ERROR, symbol_idx, mapinfo_idx);
            },
        }
    }

    /// Loads the module handle for a file once per PID. A failed load
    /// is retried exactly once after a forced mapping refresh, then
    /// remembered as failed.
    fn ensure_module(
        &mut self,
        pid: u32,
        file_info_id: FileInfoId) -> Option<(u32, FileInfoId)> {
        let key = (pid, file_info_id);

        if self.modules.contains_key(&key) {
            return Some(key);
        }

        if self.module_failures.contains(&key) {
            return None;
        }

        let path = self.registry.file_info(file_info_id)?.path.clone();

        match ModuleHandle::open(&path, 0, false) {
            Ok(module) => {
                self.modules.insert(key, module);
                Some(key)
            },
            Err(error) => {
                debug!(
                    "module load failed for {}: {}, refreshing maps",
                    path, error);

                /* The mapping may be stale; refresh and retry once */
                self.registry.pid_backpopulate(pid);

                let path = self.registry
                    .file_info(file_info_id)
                    .map(|file_info| file_info.path.clone())
                    .unwrap_or(path);

                match ModuleHandle::open(&path, 0, false) {
                    Ok(module) => {
                        self.modules.insert(key, module);
                        Some(key)
                    },
                    Err(_) => {
                        if let Some(file_info) =
                            self.registry.file_info_mut(file_info_id) {
                            file_info.errored = true;
                        }

                        self.module_failures.insert(key);
                        None
                    },
                }
            },
        }
    }

    fn short_name_at(
        &self,
        pid: u32,
        start: u64) -> String {
        let (found, hit) = self.registry.find_closest(pid, start);

        match found {
            Some(dso) if hit => dso.short_name().to_owned(),
            _ => String::from("<anonymous>"),
        }
    }

    fn intern_mapinfo(
        &mut self,
        pid: u32,
        frame_dso: &FrameDso,
        build_id: &str) -> MapInfoIdx {
        let short_name = self.short_name_at(pid, frame_dso.start);

        self.mapinfo.get_or_intern(
            pid,
            frame_dso.start,
            || MapInfo {
                start: frame_dso.start,
                end: frame_dso.end,
                page_offset: frame_dso.page_offset,
                short_name,
                build_id: build_id.to_owned(),
            })
    }

    fn dso_fallback_symbol(
        &mut self,
        short_name: &str) -> SymbolIdx {
        match self.dso_fallback_symbols.get(short_name) {
            Some(symbol_idx) => *symbol_idx,
            None => {
                let symbol_idx = self.symbol_table.len();

                self.symbol_table.push(Symbol::new(
                    format!("[{}]", short_name),
                    String::new(),
                    0));

                self.dso_fallback_symbols.insert(
                    short_name.to_owned(),
                    symbol_idx);

                symbol_idx
            },
        }
    }

    fn push_frame(
        &mut self,
        ip: u64,
        elf_pc: u64,
        file_info_id: FileInfoId,
        symbol_idx: SymbolIdx,
        mapinfo_idx: MapInfoIdx) {
        self.output.locs.push(
            FunLoc {
                ip,
                elf_pc,
                file_info_id,
                symbol_idx,
                mapinfo_idx,
            });
    }

    fn push_label_frame(
        &mut self,
        ip: u64,
        symbol_idx: SymbolIdx) {
        self.push_frame(
            ip,
            ip,
            FILE_INFO_ERROR,
            symbol_idx,
            MapInfoLookup::anonymous());
    }

    /// Every stack ends with a virtual frame naming the executable so
    /// the collector can group by process.
    fn append_base_frame(
        &mut self,
        pid: u32) {
        let symbol_idx = match self.exe_symbols.get(&pid) {
            Some(symbol_idx) => *symbol_idx,
            None => {
                let name = procfs::find_exe_name(pid)
                    .map(|path| {
                        match path.rfind('/') {
                            Some(index) => path[index + 1..].to_owned(),
                            None => path,
                        }
                    })
                    .or_else(|| procfs::get_comm(pid))
                    .unwrap_or_else(|| format!("pid{}", pid));

                let symbol_idx = self.symbol_table.len();

                self.symbol_table.push(
                    Symbol::new(name, String::new(), 0));

                self.exe_symbols.insert(pid, symbol_idx);

                symbol_idx
            },
        };

        self.push_frame(
            0,
            0,
            FILE_INFO_ERROR,
            symbol_idx,
            MapInfoLookup::anonymous());
    }

    fn container_id(
        &mut self,
        pid: u32) -> Option<String> {
        if let Some(cached) = self.container_ids.get(&pid) {
            return cached.clone();
        }

        let id = std::fs::read_to_string(format!("/proc/{}/cgroup", pid))
            .ok()
            .and_then(|content| {
                content.lines().find_map(parse_container_id)
            });

        self.container_ids.insert(pid, id.clone());

        id
    }

    /// Drops all state for a PID. Calling twice equals calling once.
    pub fn pid_free(
        &mut self,
        pid: u32) {
        self.machine.remove_process(pid);
        self.registry.pid_free(pid);
        self.runtime_symbols.pid_free(pid);
        self.jitdump.pid_free(pid);
        self.mapinfo.pid_free(pid);
        self.modules.retain(|(entry_pid, _), _| *entry_pid != pid);
        self.module_failures.retain(|(entry_pid, _)| *entry_pid != pid);
        self.exe_symbols.remove(&pid);
        self.container_ids.remove(&pid);
        self.synced_revisions.remove(&pid);
        self.known_pids.remove(&pid);
        self.visited_pids.remove(&pid);
    }

    /// Reacts to fork: the child starts from a copy of the parent's
    /// mappings and nothing else.
    pub fn pid_fork(
        &mut self,
        pid: u32,
        parent_pid: u32) {
        self.pid_free(pid);
        self.registry.pid_fork(pid, parent_pid);
    }

    /// End-of-cycle maintenance: returns the PIDs unseen this cycle
    /// (callers free them), sweeps the symbol cache and rearms the
    /// visited flags.
    pub fn cycle(&mut self) -> Vec<u32> {
        let unvisited: Vec<u32> = self.known_pids
            .difference(&self.visited_pids)
            .copied()
            .collect();

        self.visited_pids.clear();
        self.dwarf_cache.sweep_unvisited();

        unvisited
    }

    /// Clears per-process caches the worker bounds every N cycles.
    pub fn reset_process_caches(&mut self) {
        self.container_ids.clear();
        self.exe_symbols.clear();
    }

    fn sync_process(
        &mut self,
        pid: u32) {
        let revision = self.registry.revision(pid);

        if self.synced_revisions.get(&pid) == Some(&revision) {
            return;
        }

        self.machine.remove_process(pid);

        struct RegionSpec {
            start: u64,
            end: u64,
            page_offset: u64,
            dev: u64,
            inode: u64,
            dso_type: DsoType,
        }

        let specs: Vec<RegionSpec> = self.registry
            .pid_mapping(pid)
            .map
            .values()
            .filter(|dso| dso.is_executable())
            .map(|dso| RegionSpec {
                start: dso.start,
                end: dso.end,
                page_offset: dso.page_offset,
                dev: dso.dev,
                inode: dso.inode,
                dso_type: dso.dso_type,
            })
            .collect();

        let mut process = Process::new();

        for spec in specs {
            match spec.dso_type {
                DsoType::Standard => {
                    let file_info_id =
                        self.registry.resolve_file_info(pid, spec.start);

                    let cfi_path = self.registry
                        .file_info(file_info_id)
                        .filter(|file_info| !file_info.errored)
                        .map(|file_info| file_info.path.clone());

                    match cfi_path {
                        Some(path) => {
                            self.accessor.paths.insert(
                                (spec.dev, spec.inode),
                                path);

                            process.add_region(Region::new(
                                spec.start,
                                spec.end - 1,
                                spec.page_offset,
                                spec.dev,
                                spec.inode,
                                UnwindKind::Cfi));
                        },
                        None => {
                            /* Unreachable file; scanning is all that
                             * is left */
                            process.add_region(Region::new_anon(
                                spec.start,
                                spec.end - 1));
                        },
                    }
                },
                DsoType::Anonymous |
                DsoType::JitPerfMap |
                DsoType::Vdso => {
                    process.add_region(Region::new_anon(
                        spec.start,
                        spec.end - 1));
                },
                _ => {},
            }
        }

        self.machine.add_process(pid, process);
        self.synced_revisions.insert(pid, revision);
    }
}

/// Extracts a 64-hex container id from one cgroup line.
fn parse_container_id(
    line: &str) -> Option<String> {
    let path = line.rsplit(':').next()?;

    for piece in path.split(&['/', '-', '.'][..]) {
        if piece.len() == 64 &&
           piece.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Some(piece.to_owned());
        }
    }

    None
}
