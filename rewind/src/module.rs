// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::cmp::Ordering;
use super::*;

impl RegionKey {
    pub fn new(
        dev: u64,
        ino: u64) -> Self {
        Self {
            dev,
            ino,
        }
    }

    pub fn from_parts(
        dev_maj: u32,
        dev_min: u32,
        ino: u64) -> Self {
        Self {
            dev: (dev_maj as u64) << 8 | dev_min as u64,
            ino,
        }
    }

    pub fn dev(&self) -> u64 { self.dev }
    pub fn ino(&self) -> u64 { self.ino }
}

#[cfg(target_os = "linux")]
impl From<&std::fs::Metadata> for RegionKey {
    fn from(meta: &std::fs::Metadata) -> Self {
        use std::os::linux::fs::MetadataExt;

        Self {
            dev: meta.st_dev(),
            ino: meta.st_ino(),
        }
    }
}

impl Clone for RegionKey {
    fn clone(&self) -> Self {
        Self {
            dev: self.dev,
            ino: self.ino,
        }
    }
}

impl PartialEq for RegionKey {
    fn eq(&self, other: &Self) -> bool {
        self.dev == other.dev &&
        self.ino == other.ino
    }
}

impl CodeRegion for Region {
    fn anon(&self) -> bool { self.anon }

    fn unwind_kind(&self) -> UnwindKind { self.unwind_kind }

    fn file_offset(
        &self,
        ip: u64) -> u64 {
        (ip - self.start) + self.offset
    }

    fn key(&self) -> RegionKey { self.key }
}

impl Region {
    pub fn new(
        start: u64,
        end: u64,
        offset: u64,
        dev: u64,
        ino: u64,
        unwind_kind: UnwindKind) -> Self {
        Self {
            start,
            end,
            offset,
            key: RegionKey::new(
                dev,
                ino),
            anon: false,
            unwind_kind,
        }
    }

    pub fn new_anon(
        start: u64,
        end: u64) -> Self {
        Self {
            start,
            end,
            offset: 0,
            key: RegionKey::new(
                0,
                0),
            anon: true,
            unwind_kind: UnwindKind::Scan,
        }
    }

    pub fn start(&self) -> u64 { self.start }

    pub fn end(&self) -> u64 { self.end }
}

impl Ord for Region {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start)
    }
}

impl PartialOrd for Region {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start
    }
}
