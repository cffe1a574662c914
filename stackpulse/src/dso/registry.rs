// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Included, Unbounded};

use tracing::{debug, trace};

use crate::procfs;
use super::{Dso, DsoType};

pub type FileInfoId = i32;

/// Id 0 is the error sentinel; real entries start at 1.
pub const FILE_INFO_ERROR: FileInfoId = 0;
pub const FILE_INFO_UNDEF: FileInfoId = -1;

/// Global, content-addressed identity of a file backing one or more
/// mappings, deduplicated across PIDs by `(inode, size)`.
#[derive(Debug, Default, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: i64,
    pub inode: u64,
    pub errored: bool,
}

impl FileInfo {
    fn new(
        path: String,
        size: i64,
        inode: u64) -> Self {
        Self {
            path,
            size,
            inode,
            errored: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackpopulatePermission {
    Allowed,
    Forbidden,
}

#[derive(Debug, Clone, Copy)]
struct BackpopulateState {
    permission: BackpopulatePermission,
    unfound_count: u32,
}

impl Default for BackpopulateState {
    fn default() -> Self {
        Self {
            permission: BackpopulatePermission::Allowed,
            unfound_count: 0,
        }
    }
}

pub type DsoMap = BTreeMap<u64, Dso>;

/// All mappings of one PID plus the jitdump marker address when the
/// runtime announced one. The revision counter ticks on every mutation
/// so downstream views know when to resync.
#[derive(Default)]
pub struct PidMapping {
    pub map: DsoMap,
    pub jitdump_addr: Option<u64>,
    pub revision: u64,
}

/// Registry of every observed mapping, keyed by PID then start address.
/// Ranges within a PID never overlap; inserts erase what they cover.
#[derive(Default)]
pub struct DsoRegistry {
    pid_map: HashMap<u32, PidMapping>,
    backpopulate: HashMap<u32, BackpopulateState>,
    file_infos: Vec<FileInfo>,
    inode_map: HashMap<(u64, i64), FileInfoId>,
}

pub const BACKPOPULATE_RESET_THRESHOLD: u32 = 2;

const ZERO_PAGE_LIMIT: u64 = 4096;

impl DsoRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();

        /* Index 0 is the error element */
        registry.file_infos.push(FileInfo::default());

        registry
    }

    pub fn pid_mapping(
        &mut self,
        pid: u32) -> &mut PidMapping {
        self.pid_map.entry(pid).or_default()
    }

    pub fn jitdump_addr(
        &self,
        pid: u32) -> Option<u64> {
        self.pid_map.get(&pid)?.jitdump_addr
    }

    pub fn revision(
        &self,
        pid: u32) -> u64 {
        self.pid_map
            .get(&pid)
            .map(|pid_mapping| pid_mapping.revision)
            .unwrap_or(0)
    }

    /// Inserts `dso`, erasing any overlapping entries first. An insert
    /// identical to the resident entry is a no-op.
    pub fn insert_erase_overlap(
        &mut self,
        dso: Dso) -> u64 {
        let pid_mapping = self.pid_map.entry(dso.pid).or_default();

        Self::insert_erase_overlap_in(pid_mapping, dso)
    }

    fn insert_erase_overlap_in(
        pid_mapping: &mut PidMapping,
        dso: Dso) -> u64 {
        let map = &mut pid_mapping.map;

        if let Some(existing) = map.get(&dso.start) {
            if existing.end == dso.end &&
               existing.page_offset == dso.page_offset &&
               existing.is_same_file(&dso) {
                /* Same mapping reported again */
                return dso.start;
            }
        }

        /* Collect overlapped starts, then erase */
        let overlapped: Vec<u64> = map
            .range((Unbounded, Included(dso.end)))
            .rev()
            .take_while(|(_, existing)| existing.end > dso.start ||
                existing.is_within(dso.start))
            .filter(|(_, existing)| existing.intersects(&dso))
            .map(|(start, _)| *start)
            .collect();

        for start in overlapped {
            trace!("erasing overlapped mapping at {:#x}", start);
            map.remove(&start);
        }

        if dso.dso_type == DsoType::JitDump {
            pid_mapping.jitdump_addr = Some(dso.start);
        }

        debug!("[DSO] insert {}", dso);

        let start = dso.start;
        map.insert(start, dso);
        pid_mapping.revision += 1;

        start
    }

    /// Finds the entry closest below `addr`; the flag reports whether
    /// `addr` actually falls inside it.
    pub fn find_closest(
        &self,
        pid: u32,
        addr: u64) -> (Option<&Dso>, bool) {
        match self.pid_map.get(&pid) {
            Some(pid_mapping) => Self::find_closest_in(&pid_mapping.map, addr),
            None => (None, false),
        }
    }

    fn find_closest_in(
        map: &DsoMap,
        addr: u64) -> (Option<&Dso>, bool) {
        let mut range = map.range((Unbounded, Included(addr)));

        if let Some((_, dso)) = range.next_back() {
            let hit = dso.is_within(addr);
            return (Some(dso), hit);
        }

        /* Below every entry: report the first one, never a hit */
        match map.range((Included(addr), Unbounded)).next() {
            Some((_, dso)) => (Some(dso), false),
            None => (None, false),
        }
    }

    /// Lookup with one backpopulate retry on miss, throttled per PID.
    pub fn find_or_backpopulate(
        &mut self,
        pid: u32,
        addr: u64) -> (Option<&Dso>, bool) {
        if addr < ZERO_PAGE_LIMIT {
            trace!("[DSO] skipping zero page");
            return (None, false);
        }

        let hit = {
            let pid_mapping = self.pid_map.entry(pid).or_default();
            let (found, hit) = Self::find_closest_in(&pid_mapping.map, addr);
            found.is_some() && hit
        };

        if !hit {
            debug!(
                "[DSO] no mapping for [{}]({:#x}), backpopulate",
                pid, addr);

            self.pid_backpopulate(pid);
        }

        Self::find_closest_in(&self.pid_map.entry(pid).or_default().map, addr)
    }

    /// Re-reads the mapping table of a PID. Returns false when the
    /// table was unreadable or the PID is throttled.
    pub fn pid_backpopulate(
        &mut self,
        pid: u32) -> bool {
        let state = self.backpopulate.entry(pid).or_default();
        state.unfound_count += 1;

        if state.permission != BackpopulatePermission::Allowed {
            return false;
        }

        debug!("[DSO] backpopulating PID {}", pid);

        let mut added = 0;
        let mut parsed: Vec<Dso> = Vec::new();

        let readable = procfs::iter_proc_maps(pid, |line| {
            let path = line.path.unwrap_or("");

            parsed.push(Dso::new(
                pid,
                line.start_addr,
                line.end_addr,
                line.offset,
                path,
                line.ino,
                (line.is_read() as u32) |
                    ((line.is_write() as u32) << 1) |
                    ((line.is_exec() as u32) << 2))
                .with_dev(line.dev_maj, line.dev_min));
        });

        if !readable {
            debug!("[DSO] failed to open procfs for {}", pid);

            if !procfs::process_is_alive(pid) {
                debug!("[DSO] process nonexistent");
            }

            return false;
        }

        let pid_mapping = self.pid_map.entry(pid).or_default();

        for dso in parsed {
            let start = dso.start;
            let existing_hit = pid_mapping.map
                .get(&start)
                .map(|existing| existing.is_same_file(&dso) &&
                     existing.end == dso.end)
                .unwrap_or(false);

            if !existing_hit {
                Self::insert_erase_overlap_in(pid_mapping, dso);
                added += 1;
            }
        }

        if added == 0 {
            /* Nothing new; stop hammering procfs for this PID */
            self.backpopulate.entry(pid).or_default().permission =
                BackpopulatePermission::Forbidden;
        }

        true
    }

    /// Resolves (or remembers failure of) the file identity behind a
    /// mapping. Entries are shared whenever `(inode, size)` matches.
    pub fn get_or_insert_file_info(
        &mut self,
        dso: &mut Dso) -> FileInfoId {
        if dso.file_info_id != FILE_INFO_UNDEF {
            return dso.file_info_id;
        }

        if !dso.dso_type.has_relevant_path() {
            dso.file_info_id = FILE_INFO_ERROR;
            return dso.file_info_id;
        }

        let file_info = Self::find_file_info(dso);

        let file_info = match file_info {
            Some(file_info) => file_info,
            None => {
                dso.file_info_id = FILE_INFO_ERROR;
                return dso.file_info_id;
            },
        };

        let key = (file_info.inode, file_info.size);

        let id = match self.inode_map.get(&key) {
            Some(id) => {
                /* Known binary; refresh the path if it moved */
                if self.file_infos[*id as usize].path != file_info.path {
                    self.file_infos[*id as usize] = file_info;
                }

                *id
            },
            None => {
                let id = self.file_infos.len() as FileInfoId;

                debug!(
                    "[DSO] new file {} - {} - {}",
                    id, file_info.path, file_info.size);

                self.inode_map.insert(key, id);
                self.file_infos.push(file_info);

                id
            },
        };

        dso.file_info_id = id;

        id
    }

    /// `get_or_insert_file_info` for an entry the registry owns,
    /// addressed by `(pid, start)`. The resolved id is written back to
    /// the entry so later samples skip the stat.
    pub fn resolve_file_info(
        &mut self,
        pid: u32,
        start: u64) -> FileInfoId {
        let mut dso = match self.pid_map
            .get(&pid)
            .and_then(|pid_mapping| pid_mapping.map.get(&start)) {
            Some(dso) => {
                if dso.file_info_id != FILE_INFO_UNDEF {
                    return dso.file_info_id;
                }

                dso.clone()
            },
            None => { return FILE_INFO_ERROR; },
        };

        let id = self.get_or_insert_file_info(&mut dso);

        if let Some(slot) = self.pid_map
            .get_mut(&pid)
            .and_then(|pid_mapping| pid_mapping.map.get_mut(&start)) {
            slot.file_info_id = id;
        }

        id
    }

    fn find_file_info(
        dso: &Dso) -> Option<FileInfo> {
        /* Resolve in the target's mount namespace first */
        let proc_path = procfs::root_path(dso.pid, &dso.filename);

        if let Ok(meta) = std::fs::metadata(&proc_path) {
            use std::os::linux::fs::MetadataExt;

            if meta.st_ino() == dso.inode {
                return Some(FileInfo::new(
                    proc_path,
                    meta.st_size() as i64,
                    meta.st_ino()));
            }
        }

        /* Then in the profiler's own namespace */
        if let Ok(meta) = std::fs::metadata(&dso.filename) {
            use std::os::linux::fs::MetadataExt;

            if meta.st_ino() == dso.inode {
                return Some(FileInfo::new(
                    dso.filename.clone(),
                    meta.st_size() as i64,
                    meta.st_ino()));
            }
        }

        debug!("[DSO] unable to find path to {}", dso.filename);

        None
    }

    pub fn file_info(
        &self,
        id: FileInfoId) -> Option<&FileInfo> {
        if id <= FILE_INFO_ERROR {
            return None;
        }

        self.file_infos.get(id as usize)
    }

    pub fn file_info_mut(
        &mut self,
        id: FileInfoId) -> Option<&mut FileInfo> {
        if id <= FILE_INFO_ERROR {
            return None;
        }

        self.file_infos.get_mut(id as usize)
    }

    /// The contiguous run of entries sharing the mapping's backing file
    /// (r-x, r--, rw- segments of one ELF are one logical module).
    pub fn elf_range(
        &self,
        pid: u32,
        start_addr: u64) -> Option<(u64, u64, u64)> {
        let map = &self.pid_map.get(&pid)?.map;
        let anchor = map.get(&start_addr)?;

        let mut range_start = anchor.start;
        let mut range_end = anchor.end;
        let mut min_offset = anchor.page_offset;

        for (_, dso) in map.range((Unbounded, Included(start_addr))).rev() {
            if !dso.is_same_file(anchor) {
                break;
            }

            range_start = dso.start;

            if dso.page_offset < min_offset {
                min_offset = dso.page_offset;
            }
        }

        for (_, dso) in map.range((Included(start_addr), Unbounded)) {
            if !dso.is_same_file(anchor) {
                break;
            }

            range_end = dso.end;

            if dso.page_offset < min_offset {
                min_offset = dso.page_offset;
            }
        }

        Some((range_start, range_end, min_offset))
    }

    /// Drops every piece of state tied to a PID. Idempotent.
    pub fn pid_free(
        &mut self,
        pid: u32) {
        self.pid_map.remove(&pid);
        self.backpopulate.remove(&pid);
    }

    /// Clones the parent's mappings into a forked child.
    pub fn pid_fork(
        &mut self,
        pid: u32,
        parent_pid: u32) {
        let cloned: Vec<Dso> = match self.pid_map.get(&parent_pid) {
            Some(parent) => parent.map.values().cloned().collect(),
            None => { return; },
        };

        let child = self.pid_map.entry(pid).or_default();

        for mut dso in cloned {
            dso.pid = pid;
            let start = dso.start;
            child.map.insert(start, dso);
        }

        child.revision += 1;
    }

    /// Re-allows backpopulation for PIDs that accumulated enough misses
    /// to be throttled. Called once per export cycle.
    pub fn reset_backpopulate_state(
        &mut self,
        threshold: u32) {
        for state in self.backpopulate.values_mut() {
            if state.unfound_count >= threshold {
                *state = BackpopulateState::default();
            }
        }
    }

    pub fn dso_count(&self) -> usize {
        self.pid_map
            .values()
            .map(|pid_mapping| pid_mapping.map.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dso::PROT_EXEC_FLAG;

    fn dso(
        pid: u32,
        start: u64,
        end: u64,
        name: &str,
        inode: u64) -> Dso {
        Dso::new(pid, start, end, 0, name, inode, PROT_EXEC_FLAG)
    }

    #[test]
    fn overlap_erase() {
        let mut registry = DsoRegistry::new();

        registry.insert_erase_overlap(dso(1, 0x1000, 0x2000, "/bin/a", 1));
        registry.insert_erase_overlap(dso(1, 0x1800, 0x2400, "/bin/b", 2));

        /* B wins the overlap */
        let (found, hit) = registry.find_closest(1, 0x1C00);
        assert!(hit);
        assert_eq!("/bin/b", found.unwrap().filename);

        /* A was erased entirely; the closest entry is now B */
        let (found, hit) = registry.find_closest(1, 0x1000);
        assert!(!hit);
        assert_eq!("/bin/b", found.unwrap().filename);
    }

    #[test]
    fn no_overlap_keeps_both() {
        let mut registry = DsoRegistry::new();

        registry.insert_erase_overlap(dso(1, 0x1000, 0x2000, "/bin/a", 1));
        registry.insert_erase_overlap(dso(1, 0x2000, 0x3000, "/bin/b", 2));

        let (found, hit) = registry.find_closest(1, 0x1FFF);
        assert!(hit);
        assert_eq!("/bin/a", found.unwrap().filename);

        let (found, hit) = registry.find_closest(1, 0x2000);
        assert!(hit);
        assert_eq!("/bin/b", found.unwrap().filename);

        /* Pair-wise disjoint */
        assert_eq!(2, registry.dso_count());
    }

    #[test]
    fn same_insert_is_noop() {
        let mut registry = DsoRegistry::new();

        registry.insert_erase_overlap(dso(1, 0x1000, 0x2000, "/bin/a", 1));
        registry.insert_erase_overlap(dso(1, 0x1000, 0x2000, "/bin/a", 1));

        assert_eq!(1, registry.dso_count());
    }

    #[test]
    fn find_misses() {
        let mut registry = DsoRegistry::new();

        let (found, hit) = registry.find_closest(1, 0x5000);
        assert!(found.is_none());
        assert!(!hit);

        registry.insert_erase_overlap(dso(1, 0x1000, 0x2000, "/bin/a", 1));

        /* Below every entry: closest reported, no hit */
        let (found, hit) = registry.find_closest(1, 0x500);
        assert!(found.is_some());
        assert!(!hit);

        /* Past the entry: closest reported, no hit */
        let (found, hit) = registry.find_closest(1, 0x3000);
        assert!(found.is_some());
        assert!(!hit);
    }

    #[test]
    fn pid_free_idempotent() {
        let mut registry = DsoRegistry::new();

        registry.insert_erase_overlap(dso(9, 0x1000, 0x2000, "/bin/a", 1));

        registry.pid_free(9);
        assert_eq!(0, registry.dso_count());

        /* Second free is equivalent to one */
        registry.pid_free(9);
        assert_eq!(0, registry.dso_count());
    }

    #[test]
    fn pid_fork_clones() {
        let mut registry = DsoRegistry::new();

        registry.insert_erase_overlap(dso(9, 0x1000, 0x2000, "/bin/a", 1));
        registry.pid_fork(10, 9);

        let (found, hit) = registry.find_closest(10, 0x1500);
        assert!(hit);
        assert_eq!(10, found.unwrap().pid);
    }

    #[test]
    fn elf_ranges() {
        let mut registry = DsoRegistry::new();

        /* Three segments of one file plus an unrelated mapping */
        let mut seg = dso(1, 0x1000, 0x2000, "/bin/a", 1);
        seg.page_offset = 0;
        registry.insert_erase_overlap(seg);

        let mut seg = dso(1, 0x2000, 0x3000, "/bin/a", 1);
        seg.page_offset = 0x1000;
        registry.insert_erase_overlap(seg);

        let mut seg = dso(1, 0x3000, 0x3800, "/bin/a", 1);
        seg.page_offset = 0x2000;
        registry.insert_erase_overlap(seg);

        registry.insert_erase_overlap(dso(1, 0x4000, 0x5000, "/bin/b", 2));

        let (start, end, offset) = registry.elf_range(1, 0x2000).unwrap();

        assert_eq!(0x1000, start);
        assert_eq!(0x3800, end);
        assert_eq!(0, offset);
    }

    #[test]
    fn backpopulate_throttles() {
        let mut registry = DsoRegistry::new();

        /* A dead PID cannot be populated */
        let dead_pid = 0x7FFF_FFF0;

        assert!(!registry.pid_backpopulate(dead_pid));
        assert!(!registry.pid_backpopulate(dead_pid));

        /* Reset re-allows once the threshold is met */
        registry.reset_backpopulate_state(BACKPOPULATE_RESET_THRESHOLD);

        let state = registry.backpopulate.get(&dead_pid).unwrap();
        assert_eq!(BackpopulatePermission::Allowed, state.permission);
        assert_eq!(0, state.unfound_count);
    }

    #[test]
    fn file_info_dedup() {
        let mut registry = DsoRegistry::new();

        /* Use the test binary as a real backing file */
        let exe = std::env::current_exe().unwrap();
        let exe_str = exe.to_str().unwrap();

        use std::os::linux::fs::MetadataExt;
        let inode = std::fs::metadata(&exe).unwrap().st_ino();

        let mut first = Dso::new(
            std::process::id(), 0x1000, 0x2000, 0, exe_str, inode, 4);
        let mut second = Dso::new(
            std::process::id(), 0x3000, 0x4000, 0, exe_str, inode, 4);

        let id1 = registry.get_or_insert_file_info(&mut first);
        let id2 = registry.get_or_insert_file_info(&mut second);

        assert!(id1 > FILE_INFO_ERROR);
        assert_eq!(id1, id2);

        /* Wrong inode resolves to the error sentinel, sticky on the dso */
        let mut missing = Dso::new(
            std::process::id(), 0x5000, 0x6000, 0, "/not/a/file", 42, 4);

        assert_eq!(FILE_INFO_ERROR, registry.get_or_insert_file_info(&mut missing));
        assert_eq!(FILE_INFO_ERROR, missing.file_info_id);
    }
}
