// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;
use tracing::{debug, warn};

impl Machine {
    pub fn new() -> Self { Self::default() }

    pub fn add_process(
        &mut self,
        pid: u32,
        process: Process) -> bool {
        match self.processes.entry(pid) {
            Vacant(entry) => {
                entry.insert(process);
                true
            },
            Occupied(_) => {
                warn!("process {} already mapped", pid);
                false
            }
        }
    }

    pub fn fork_process(
        &mut self,
        pid: u32,
        ppid: u32) -> bool {
        let child: Process;

        match self.find_process(ppid) {
            Some(parent) => {
                child = parent.fork();
            },
            None => {
                debug!("fork of unmapped parent {}", ppid);
                return false
            },
        }

        self.add_process(pid, child)
    }

    pub fn find_process(
        &mut self,
        pid: u32) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub fn remove_process(
        &mut self,
        pid: u32) -> bool {
        self.processes.remove(&pid).is_some()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn walk_process(
        &mut self,
        pid: u32,
        walker: &mut dyn StackWalker,
        accessor: &dyn RegionAccessor,
        ip: u64,
        bp: u64,
        sp: u64,
        stack_data: &[u8],
        frames: &mut Vec<u64>) -> WalkResult {
        let mut result = WalkResult::new();

        walker.reset(
            ip,
            bp,
            sp);

        /* The sampled IP always forms the leaf frame */
        frames.push(ip);
        result.frames_pushed += 1;

        match self.processes.get_mut(&pid) {
            Some(process) => {
                process.sort();

                walker.walk(
                    process,
                    accessor,
                    stack_data,
                    frames,
                    &mut result);
            },
            None => {
                result.error = Some("Process not mapped");
            },
        }

        result
    }
}
