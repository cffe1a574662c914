// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#[cfg(target_os = "linux")]
use libc::*;

use tracing::{debug, info, warn};

use crate::perf_event::abi;

const NS_PER_SEC: u64 = 1_000_000_000;
const TEN_MHZ: u64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMethod {
    Perf,
    CpuArch,
    ClockMonotonicRaw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Ok,
    Unavailable,
}

/// Conversion parameters: `ns = ((cycles * mult) >> shift) + offset`.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationParams {
    pub mult: u32,
    pub shift: u16,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub state: ClockState,
    pub method: CalibrationMethod,
    pub params: CalibrationParams,
}

/// Cycle counter to nanosecond conversion. Built once at startup and
/// shared read-only; the hot path is two multiplies and a shift.
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    calibration: Calibration,
}

#[cfg(target_arch = "x86_64")]
pub fn read_cycles() -> u64 {
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

#[cfg(target_arch = "aarch64")]
pub fn read_cycles() -> u64 {
    let cycles: u64;

    unsafe {
        std::arch::asm!("mrs {}, cntvct_el0", out(reg) cycles);
    }

    cycles
}

pub fn monotonic_ns() -> u64 {
    unsafe {
        let mut tp = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        if clock_gettime(CLOCK_MONOTONIC, &mut tp) != 0 {
            return 0;
        }

        (tp.tv_sec as u64) * NS_PER_SEC + tp.tv_nsec as u64
    }
}

fn monotonic_raw_ns() -> u64 {
    unsafe {
        let mut tp = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        if clock_gettime(CLOCK_MONOTONIC_RAW, &mut tp) != 0 {
            return 0;
        }

        (tp.tv_sec as u64) * NS_PER_SEC + tp.tv_nsec as u64
    }
}

/// Reads `time_mult`/`time_shift` from the mmap page of a dummy event
/// when the kernel advertises user-space time conversion.
#[cfg(target_os = "linux")]
fn calibrate_from_perf() -> Option<CalibrationParams> {
    /* perf_event_mmap_page offsets: cap flags at 40, time_shift 44,
     * time_mult 48, time_offset 52, time_zero 928 */
    const CAP_OFFSET: usize = 40;
    const TIME_SHIFT_OFFSET: usize = 44;
    const TIME_MULT_OFFSET: usize = 48;
    const TIME_ZERO_OFFSET: usize = 928;

    const CAP_USER_TIME: u64 = 1 << 1;
    const CAP_USER_TIME_ZERO: u64 = 1 << 2;

    let attr = abi::perf_event_attr {
        event_type: abi::PERF_TYPE_SOFTWARE,
        size: abi::PERF_ATTR_SIZE_VER4,
        config: abi::PERF_COUNT_SW_DUMMY,
        flags: abi::FLAG_DISABLED |
            abi::FLAG_EXCLUDE_KERNEL |
            abi::FLAG_EXCLUDE_HV,
        .. Default::default()
    };

    let fd = unsafe {
        syscall(
            SYS_perf_event_open,
            &attr as *const abi::perf_event_attr as usize,
            0usize,
            usize::MAX, /* cpu = -1 */
            usize::MAX, /* group_fd = -1 */
            0usize)
    };

    if fd == -1 {
        return None;
    }

    let fd = fd as i32;

    let page_size = unsafe { sysconf(_SC_PAGE_SIZE) as usize };

    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            page_size,
            PROT_READ,
            MAP_SHARED,
            fd,
            0)
    };

    if addr == MAP_FAILED {
        unsafe { close(fd); }
        return None;
    }

    let page = unsafe {
        std::slice::from_raw_parts(addr as *const u8, page_size)
    };

    let caps = u64::from_ne_bytes(
        page[CAP_OFFSET..CAP_OFFSET + 8].try_into().unwrap());

    let result = if caps & CAP_USER_TIME != 0 {
        let shift = u16::from_ne_bytes(
            page[TIME_SHIFT_OFFSET..TIME_SHIFT_OFFSET + 2]
                .try_into().unwrap());

        let mult = u32::from_ne_bytes(
            page[TIME_MULT_OFFSET..TIME_MULT_OFFSET + 4]
                .try_into().unwrap());

        let offset = if caps & CAP_USER_TIME_ZERO != 0 {
            u64::from_ne_bytes(
                page[TIME_ZERO_OFFSET..TIME_ZERO_OFFSET + 8]
                    .try_into().unwrap())
        } else {
            0
        };

        Some(CalibrationParams {
            mult,
            shift,
            offset,
        })
    } else {
        None
    };

    unsafe {
        munmap(addr, page_size);
        close(fd);
    }

    result
}

/// TSC frequency straight from the CPU: crystal clock CPUID leaf on
/// x86-64, `CNTFRQ_EL0` on aarch64.
#[cfg(target_arch = "x86_64")]
fn tsc_freq_arch() -> u64 {
    use core::arch::x86_64::__cpuid;

    let max_leaf = unsafe { __cpuid(0) }.eax;

    if max_leaf >= 0x15 {
        let leaf = unsafe { __cpuid(0x15) };

        /* EBX/EAX: TSC to crystal ratio, ECX: crystal Hz */
        if leaf.eax != 0 && leaf.ebx != 0 && leaf.ecx != 0 {
            return (leaf.ecx as u64) * (leaf.ebx as u64) / (leaf.eax as u64);
        }
    }

    0
}

#[cfg(target_arch = "aarch64")]
fn tsc_freq_arch() -> u64 {
    let freq: u64;

    unsafe {
        std::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq);
    }

    freq
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn tsc_freq_arch() -> u64 {
    0
}

/// One 20 ms measurement of cycles against the raw monotonic clock,
/// rounded to the nearest 10 MHz.
fn measure_tsc_freq() -> u64 {
    const SLEEP_NS: u64 = NS_PER_SEC / 50;

    let t_start = monotonic_raw_ns();

    if t_start == 0 {
        return 0;
    }

    let cycles_start = read_cycles();

    std::thread::sleep(std::time::Duration::from_nanos(SLEEP_NS));

    let t_end = monotonic_raw_ns();
    let cycles_end = read_cycles();

    let ns = t_end.saturating_sub(t_start);

    if ns == 0 {
        return 0;
    }

    let tsc_hz = (cycles_end - cycles_start).saturating_mul(NS_PER_SEC) / ns;

    /* Round to 10 MHz */
    ((tsc_hz + TEN_MHZ / 2) / TEN_MHZ) * TEN_MHZ
}

/// Median of three interval measurements.
fn estimate_tsc_freq() -> u64 {
    let mut freqs: Vec<u64> = (0..3)
        .map(|_| measure_tsc_freq())
        .filter(|freq| *freq > 0)
        .collect();

    if freqs.is_empty() {
        return 0;
    }

    freqs.sort_unstable();

    freqs[freqs.len() / 2]
}

fn params_from_freq(
    tsc_hz: u64) -> CalibrationParams {
    let shift: u16 = 31;
    let mult = ((NS_PER_SEC * (1u64 << shift) + tsc_hz / 2) / tsc_hz) as u32;

    CalibrationParams {
        mult,
        shift,
        offset: 0,
    }
}

impl TscClock {
    /// Calibrates in order: perf mmap page, CPU architectural path,
    /// raw monotonic interval sampling. A complete failure leaves the
    /// clock unavailable and timestamps on the monotonic clock.
    pub fn calibrate() -> Self {
        Self::calibrate_skipping_perf(false)
    }

    pub fn calibrate_skipping_perf(
        skip_perf: bool) -> Self {
        if !skip_perf {
            #[cfg(target_os = "linux")]
            if let Some(params) = calibrate_from_perf() {
                info!("tsc calibrated from perf");

                return Self {
                    calibration: Calibration {
                        state: ClockState::Ok,
                        method: CalibrationMethod::Perf,
                        params,
                    },
                };
            }
        }

        let arch_freq = tsc_freq_arch();

        if arch_freq != 0 {
            debug!("tsc calibrated from cpu ({} Hz)", arch_freq);

            return Self {
                calibration: Calibration {
                    state: ClockState::Ok,
                    method: CalibrationMethod::CpuArch,
                    params: params_from_freq(arch_freq),
                },
            };
        }

        let measured = estimate_tsc_freq();

        if measured != 0 {
            debug!("tsc calibrated by measurement ({} Hz)", measured);

            return Self {
                calibration: Calibration {
                    state: ClockState::Ok,
                    method: CalibrationMethod::ClockMonotonicRaw,
                    params: params_from_freq(measured),
                },
            };
        }

        warn!("tsc calibration failed, falling back to monotonic clock");

        Self {
            calibration: Calibration {
                state: ClockState::Unavailable,
                method: CalibrationMethod::ClockMonotonicRaw,
                params: CalibrationParams {
                    mult: 0,
                    shift: 0,
                    offset: 0,
                },
            },
        }
    }

    pub fn state(&self) -> ClockState {
        self.calibration.state
    }

    pub fn method(&self) -> CalibrationMethod {
        self.calibration.method
    }

    pub fn cycles_to_ns(
        &self,
        cycles: u64) -> u64 {
        if self.calibration.state != ClockState::Ok {
            return monotonic_ns();
        }

        let params = &self.calibration.params;

        ((u128::from(cycles) * u128::from(params.mult))
            >> params.shift) as u64 + params.offset
    }

    /// Current time in nanoseconds through the calibrated path, or the
    /// monotonic clock when calibration is unavailable.
    pub fn now_ns(&self) -> u64 {
        if self.calibration.state != ClockState::Ok {
            return monotonic_ns();
        }

        self.cycles_to_ns(read_cycles())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_formula() {
        /* 1 GHz: mult/shift must make cycles == ns */
        let params = params_from_freq(NS_PER_SEC);

        let clock = TscClock {
            calibration: Calibration {
                state: ClockState::Ok,
                method: CalibrationMethod::CpuArch,
                params,
            },
        };

        let ns = clock.cycles_to_ns(1_000_000);
        let error = ns.abs_diff(1_000_000);

        /* Within rounding of the fixed point representation */
        assert!(error <= 1, "error {}", error);
    }

    #[test]
    fn offset_applies() {
        let mut params = params_from_freq(NS_PER_SEC);
        params.offset = 500;

        let clock = TscClock {
            calibration: Calibration {
                state: ClockState::Ok,
                method: CalibrationMethod::Perf,
                params,
            },
        };

        assert!(clock.cycles_to_ns(0) == 500);
    }

    #[test]
    fn fallback_without_perf() {
        /* Forcing the perf path off must still calibrate via the
         * architectural or measured path on supported machines */
        let clock = TscClock::calibrate_skipping_perf(true);

        match clock.state() {
            ClockState::Ok => {
                assert!(matches!(
                    clock.method(),
                    CalibrationMethod::CpuArch |
                    CalibrationMethod::ClockMonotonicRaw));

                /* Monotonic within the calibrated domain */
                let first = clock.now_ns();
                let second = clock.now_ns();
                assert!(second >= first);
            },
            ClockState::Unavailable => {
                /* Still usable through the monotonic fallback */
                assert!(clock.now_ns() > 0);
            },
        }
    }

    #[test]
    fn measured_freq_is_plausible() {
        let freq = estimate_tsc_freq();

        if freq != 0 {
            /* 100 MHz..10 GHz and 10 MHz aligned */
            assert!(freq >= 100_000_000);
            assert!(freq <= 10_000_000_000);
            assert_eq!(0, freq % TEN_MHZ);
        }
    }
}
