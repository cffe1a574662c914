// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::ptr;

#[cfg(target_os = "linux")]
use libc::*;

use tracing::{debug, warn};

use crate::{IOResult, IOError, ProfError, ProfResult, What};
use crate::procfs;
use crate::ringbuf::PerfRingReader;
use crate::watcher::{UseKernel, Watcher};

pub mod abi;

use abi::perf_event_attr;

const CLOCK_ID_MONOTONIC_RAW: i32 = 4;

pub fn cpu_count() -> u32 {
    unsafe {
        sysconf(_SC_NPROCESSORS_ONLN) as u32
    }
}

fn perf_event_open(
    attr: &perf_event_attr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
    flags: usize) -> IOResult<i32> {
    unsafe {
        match syscall(
            SYS_perf_event_open,
            attr as *const perf_event_attr as usize,
            pid as usize,
            cpu as usize,
            group_fd as usize,
            flags) {
            -1 => Err(IOError::last_os_error()),
            result => Ok(result as i32),
        }
    }
}

/// Builds the attribute block for a watcher. Every sampling source
/// carries the same record payload so the worker parses one layout.
pub fn attr_for_watcher(
    watcher: &Watcher,
    exclude_kernel: bool,
    with_process_records: bool) -> perf_event_attr {
    let mut attr = perf_event_attr {
        event_type: watcher.event_type,
        size: abi::PERF_ATTR_SIZE_VER4,
        config: watcher.config,
        sample_type: abi::PERF_SAMPLE_IDENTIFIER |
            abi::PERF_SAMPLE_TID |
            abi::PERF_SAMPLE_TIME |
            abi::PERF_SAMPLE_PERIOD |
            abi::PERF_SAMPLE_REGS_USER |
            abi::PERF_SAMPLE_STACK_USER,
        flags: abi::FLAG_DISABLED |
            abi::FLAG_EXCLUDE_HV |
            abi::FLAG_EXCLUDE_IDLE |
            abi::FLAG_SAMPLE_ID_ALL |
            abi::FLAG_INHERIT |
            abi::FLAG_USE_CLOCKID,
        clockid: CLOCK_ID_MONOTONIC_RAW,
        sample_regs_user: abi::PERF_REGS_MASK,
        sample_stack_user: watcher.stack_sample_size,
        .. Default::default()
    };

    match watcher.cadence {
        crate::watcher::Cadence::Frequency(freq) => {
            attr.sample_period_freq = freq;
            attr.flags |= abi::FLAG_FREQ;
        },
        crate::watcher::Cadence::Period(period) => {
            attr.sample_period_freq = period;
        },
    }

    if exclude_kernel {
        attr.flags |= abi::FLAG_EXCLUDE_KERNEL;
    }

    if with_process_records {
        attr.flags |= abi::FLAG_MMAP |
            abi::FLAG_MMAP2 |
            abi::FLAG_COMM |
            abi::FLAG_COMM_EXEC |
            abi::FLAG_TASK;
    }

    attr
}

/// One opened kernel event: the fd, the CPU it is pinned to and the
/// watcher it materializes. The ring mapping is created separately so
/// a forked worker can re-mmap inherited fds.
pub struct PerfEvent {
    fd: i32,
    cpu: u32,
    watcher_index: usize,
    attr: perf_event_attr,
    mapping: *mut u8,
    mapping_len: usize,
}

impl PerfEvent {
    pub fn fd(&self) -> i32 { self.fd }

    pub fn cpu(&self) -> u32 { self.cpu }

    pub fn watcher_index(&self) -> usize { self.watcher_index }

    pub fn attr(&self) -> &perf_event_attr { &self.attr }

    pub fn open(
        watcher: &Watcher,
        watcher_index: usize,
        pid: i32,
        cpu: u32,
        with_process_records: bool) -> ProfResult<Self> {
        let try_kernel = watcher.use_kernel == UseKernel::Try;

        let exclude_kernel = watcher.use_kernel == UseKernel::Off;

        let mut attr = attr_for_watcher(
            watcher,
            exclude_kernel,
            with_process_records);

        let fd = match perf_event_open(&attr, pid, cpu as i32, -1, 0) {
            Ok(fd) => fd,
            Err(error) => {
                if try_kernel {
                    /* Retry without kernel visibility */
                    attr.flags |= abi::FLAG_EXCLUDE_KERNEL;

                    match perf_event_open(&attr, pid, cpu as i32, -1, 0) {
                        Ok(fd) => {
                            debug!(
                                "watcher {} opened without kernel events",
                                watcher.name);
                            fd
                        },
                        Err(error) => {
                            return Err(Self::open_error(watcher, &error));
                        },
                    }
                } else {
                    return Err(Self::open_error(watcher, &error));
                }
            },
        };

        Ok(Self {
            fd,
            cpu,
            watcher_index,
            attr,
            mapping: ptr::null_mut(),
            mapping_len: 0,
        })
    }

    fn open_error(
        watcher: &Watcher,
        error: &IOError) -> ProfError {
        if let Some(paranoid) = procfs::perf_event_paranoid() {
            warn!(
                "perf_event_open failed (perf_event_paranoid={})",
                paranoid);
        }

        ProfError::fatal(
            What::PerfOpen,
            format!(
                "open failed for watcher {}: {}",
                watcher.name,
                error))
    }

    /// Maps the ring as `1 + 2^page_order` pages.
    pub fn mmap(
        &mut self,
        page_order: u32) -> ProfResult<()> {
        let page_size = unsafe { sysconf(_SC_PAGE_SIZE) as usize };
        let pages_len = ((1usize << page_order) + 1) * page_size;

        let pages = unsafe {
            mmap(
                std::ptr::null_mut(),
                pages_len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                self.fd,
                0)
        };

        if pages == MAP_FAILED {
            return Err(ProfError::fatal(
                What::RingBuffer,
                format!("ring mmap failed: {}", IOError::last_os_error())));
        }

        self.mapping = pages as *mut u8;
        self.mapping_len = pages_len;

        Ok(())
    }

    /// Hands out a consumer over the mapped ring. The mapping stays
    /// owned by the event and is released in teardown.
    pub fn reader(&self) -> ProfResult<PerfRingReader> {
        if self.mapping.is_null() {
            return Err(ProfError::fatal(
                What::RingBuffer,
                "ring is not mapped"));
        }

        Ok(PerfRingReader::new(
            self.mapping,
            self.mapping_len,
            false))
    }

    pub fn enable(&self) -> IOResult<()> {
        unsafe {
            if ioctl(self.fd, abi::PERF_EVENT_IOC_ENABLE as _) != 0 {
                return Err(IOError::last_os_error());
            }
        }

        Ok(())
    }

    pub fn disable(&self) -> IOResult<()> {
        unsafe {
            if ioctl(self.fd, abi::PERF_EVENT_IOC_DISABLE as _) != 0 {
                return Err(IOError::last_os_error());
            }
        }

        Ok(())
    }

    pub fn munmap(&mut self) {
        if !self.mapping.is_null() {
            unsafe {
                munmap(self.mapping as *mut c_void, self.mapping_len);
            }

            self.mapping = ptr::null_mut();
            self.mapping_len = 0;
        }
    }
}

impl Drop for PerfEvent {
    fn drop(&mut self) {
        self.munmap();

        unsafe {
            close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::{watcher_from_str, Cadence};

    #[test]
    fn attr_masks() {
        let watcher = watcher_from_str("sCPU").unwrap();

        let attr = attr_for_watcher(&watcher, true, true);

        assert!(attr.has_format(abi::PERF_SAMPLE_TID));
        assert!(attr.has_format(abi::PERF_SAMPLE_TIME));
        assert!(attr.has_format(abi::PERF_SAMPLE_PERIOD));
        assert!(attr.has_format(abi::PERF_SAMPLE_REGS_USER));
        assert!(attr.has_format(abi::PERF_SAMPLE_STACK_USER));
        assert!(attr.has_flag(abi::FLAG_EXCLUDE_KERNEL));
        assert!(attr.has_flag(abi::FLAG_FREQ));
        assert!(attr.has_flag(abi::FLAG_MMAP2));
        assert_eq!(watcher.stack_sample_size, attr.sample_stack_user);
        assert_eq!(abi::PERF_REGS_MASK, attr.sample_regs_user);
    }

    #[test]
    fn attr_period() {
        let watcher = watcher_from_str("hCMISS")
            .unwrap()
            .with_cadence(Cadence::Period(1000));

        let attr = attr_for_watcher(&watcher, false, false);

        assert!(!attr.has_flag(abi::FLAG_FREQ));
        assert!(!attr.has_flag(abi::FLAG_MMAP));
        assert_eq!(1000, attr.sample_period_freq);
    }

    #[test]
    #[ignore]
    fn open_self() {
        println!("NOTE: Requires perf_event access.");

        let watcher = watcher_from_str("sCPU").unwrap();

        let mut event = PerfEvent::open(
            &watcher,
            0,
            0,
            0,
            true).unwrap();

        event.mmap(3).unwrap();
        event.enable().unwrap();
        event.disable().unwrap();
    }
}
