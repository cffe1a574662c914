// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;
use tracing::trace;

impl AddressSpace for Process {
    fn find<'a>(
        &'a self,
        ip: u64) -> Option<&'a dyn CodeRegion> {
        self.find(ip)
    }
}

impl Process {
    pub fn new() -> Self { Self::default() }

    pub fn add_region(
        &mut self,
        region: Region) {
        self.regions.push(region);
        self.sorted = false;
    }

    pub fn fork(&self) -> Self {
        let mut child = Self::new();

        for region in &self.regions {
            child.regions.push(*region);
        }

        child
    }

    pub fn sort(
        &mut self) {
        if !self.sorted {
            self.regions.sort();
            self.sorted = true;
        }
    }

    pub fn find(
        &self,
        ip: u64) -> Option<&dyn CodeRegion> {
        if self.regions.is_empty() {
            return None;
        }

        let mut index = self.regions.partition_point(
            |region| region.start <= ip );

        index = index.saturating_sub(1);

        let region = &self.regions[index];

        if region.start <= ip &&
           region.end >= ip {
            return Some(region);
        }

        trace!(
            "no region for ip={:#x}, closest=[{:#x},{:#x}]",
            ip, region.start, region.end);

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find() {
        let mut proc = Process::new();
        let first = Region::new(1, 1024, 0, 1, 0, UnwindKind::Cfi);
        let second = Region::new(1025, 2048, 0, 2, 0, UnwindKind::Cfi);
        let third = Region::new(2049, 3072, 0, 3, 0, UnwindKind::Cfi);
        proc.add_region(first);
        proc.add_region(second);
        proc.add_region(third);
        proc.sort();

        /* Entirely out of bounds (Start) */
        assert!(proc.find(0).is_none());

        /* First region case */
        let found = proc.find(1).unwrap();
        assert!(found.key().dev == 1);

        let found = proc.find(1024).unwrap();
        assert!(found.key().dev == 1);

        /* Second region case */
        let found = proc.find(1025).unwrap();
        assert!(found.key().dev == 2);

        let found = proc.find(2048).unwrap();
        assert!(found.key().dev == 2);

        /* Third region case */
        let found = proc.find(2049).unwrap();
        assert!(found.key().dev == 3);

        let found = proc.find(3072).unwrap();
        assert!(found.key().dev == 3);

        /* Entirely out of bounds (End) */
        assert!(proc.find(3073).is_none());
    }
}
