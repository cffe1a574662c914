// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::collections::hash_map::Entry::{Vacant, Occupied};
use std::fs::File;
use std::hash::{Hash, Hasher};

pub mod frame_table;

mod module;
mod process;
mod machine;

#[cfg(target_arch = "x86_64")]
mod x64;

/// Address space of a single profiled process: resolves an instruction
/// pointer to the code region it falls in.
pub trait AddressSpace {
    fn find<'a>(
        &'a self,
        ip: u64) -> Option<&'a dyn CodeRegion>;
}

pub trait CodeRegion {
    fn anon(&self) -> bool;

    fn unwind_kind(&self) -> UnwindKind;

    /// Translates a process address into a file-relative offset.
    fn file_offset(
        &self,
        ip: u64) -> u64;

    fn key(&self) -> RegionKey;
}

/// Identity of the file backing a code region. Regions mapped from the
/// same file on the same device share unwind tables.
#[derive(Eq, Copy)]
pub struct RegionKey {
    pub dev: u64,
    pub ino: u64,
}

impl Hash for RegionKey {
    fn hash<H: Hasher>(
        &self,
        state: &mut H) {
        self.dev.hash(state);
        self.ino.hash(state);
    }
}

pub struct WalkResult {
    pub frames_pushed: usize,
    pub truncated: bool,
    pub error: Option<&'static str>,
}

impl WalkResult {
    pub fn new() -> Self {
        Self {
            frames_pushed: 0,
            truncated: false,
            error: None,
        }
    }
}

impl Default for WalkResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Architecture specific stack walker. The walker owns per-file frame
/// tables and is reset before each sample.
pub trait StackWalker {
    fn reset(
        &mut self,
        ip: u64,
        bp: u64,
        sp: u64);

    fn walk(
        &mut self,
        space: &dyn AddressSpace,
        accessor: &dyn RegionAccessor,
        stack_data: &[u8],
        frames: &mut Vec<u64>,
        result: &mut WalkResult);
}

/// Opens the backing file of a code region so its unwind information can
/// be parsed. The caller decides how paths are resolved (for foreign
/// mount namespaces this usually goes through /proc/<pid>/root).
pub trait RegionAccessor {
    fn open(
        &self,
        key: &RegionKey) -> Option<File>;
}

#[derive(Debug, Eq, Clone, Copy, PartialEq)]
pub enum UnwindKind {
    /// Call-frame information parsed from the file's .eh_frame section.
    Cfi,
    /// Return-address scan for regions with no backing file.
    Scan,
}

#[derive(Eq, Clone, Copy)]
pub struct Region {
    start: u64,
    end: u64,
    offset: u64,
    key: RegionKey,
    anon: bool,
    unwind_kind: UnwindKind,
}

#[derive(Default)]
pub struct Process {
    regions: Vec<Region>,
    sorted: bool,
}

#[derive(Default)]
pub struct Machine {
    processes: HashMap<u32, Process>,
}

/// Hard cap on frames pushed by a single walk.
pub const MAX_WALK_FRAMES: usize = 128;

#[cfg(target_arch = "x86_64")]
pub fn default_walker() -> impl StackWalker {
    x64::Walker::new()
}
