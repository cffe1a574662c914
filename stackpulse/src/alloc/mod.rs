// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use tracing::warn;

use crate::clock::monotonic_ns;
use crate::perf_event::abi;
use crate::ringbuf::MpscRing;

pub mod address_set;
pub mod protocol;

pub use address_set::AddressBitset;
pub use protocol::{RingBufferInfo, TrackerSettings};

/// Sampling flags carried in the handshake message.
pub const FLAG_DETERMINISTIC_SAMPLING: u32 = 1 << 0;
pub const FLAG_TRACK_DEALLOCATIONS: u32 = 1 << 1;

/// Live-tracked addresses above this force a resync with the profiler.
pub const MAX_TRACKED_ADDRESSES: usize = 64 * 1024;

/// Ring-buffer failures tolerated before the tracker turns itself off.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

struct ThreadState {
    remaining_bytes: Cell<i64>,
    initialized: Cell<bool>,
    reentry_guard: Cell<bool>,
    tid: Cell<u32>,
    stack_end: Cell<u64>,
    rng: RefCell<Option<SmallRng>>,
}

thread_local! {
    static TL_STATE: ThreadState = const {
        ThreadState {
            remaining_bytes: Cell::new(0),
            initialized: Cell::new(false),
            reentry_guard: Cell::new(false),
            tid: Cell::new(0),
            stack_end: Cell::new(0),
            rng: RefCell::new(None),
        }
    };
}

#[cfg(target_os = "linux")]
fn gettid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Highest stack address of the calling thread, from its pthread
/// attributes. Cached per thread by the caller.
#[cfg(target_os = "linux")]
fn stack_end_addr() -> u64 {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();

        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return 0;
        }

        let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;

        let result = libc::pthread_attr_getstack(
            &attr,
            &mut stack_addr,
            &mut stack_size);

        libc::pthread_attr_destroy(&mut attr);

        if result != 0 {
            return 0;
        }

        stack_addr as u64 + stack_size as u64
    }
}

/// Captures the caller's instruction pointer, frame pointer and stack
/// pointer, the register set samples carry.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn capture_registers() -> [u64; abi::PERF_REGS_COUNT] {
    let ip: u64;
    let bp: u64;
    let sp: u64;

    unsafe {
        std::arch::asm!(
            "lea {ip}, [rip]",
            "mov {sp}, rsp",
            "mov {bp}, rbp",
            ip = out(reg) ip,
            sp = out(reg) sp,
            bp = out(reg) bp,
            options(nostack));
    }

    let mut regs = [0u64; abi::PERF_REGS_COUNT];
    regs[abi::REG_POS_BP] = bp;
    regs[abi::REG_POS_SP] = sp;
    regs[abi::REG_POS_IP] = ip;
    regs
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn capture_registers() -> [u64; abi::PERF_REGS_COUNT] {
    let sp: u64;

    unsafe {
        std::arch::asm!(
            "mov {sp}, sp",
            sp = out(reg) sp,
            options(nostack));
    }

    let mut regs = [0u64; abi::PERF_REGS_COUNT];
    regs[abi::REG_POS_SP] = sp;
    regs
}

struct TrackerState {
    track_allocations: AtomicBool,
    track_deallocations: AtomicBool,
    lost_count: AtomicU64,
    failure_count: AtomicU32,
    pid: AtomicU32,
}

/// In-target-process allocation sampler. Each thread keeps a
/// remaining-bytes reservoir; an allocation that exhausts it emits one
/// sample into the shared ring and redraws the budget. The hot path
/// takes no locks and performs no heap allocation.
pub struct AllocationTracker {
    ring: Arc<MpscRing>,
    sampling_interval: u64,
    deterministic: bool,
    stack_sample_size: u32,
    state: TrackerState,
    address_set: AddressBitset,
}

impl AllocationTracker {
    pub fn new(
        ring: Arc<MpscRing>,
        settings: &TrackerSettings) -> Self {
        let sampling_interval =
            settings.allocation_profiling_rate.unsigned_abs().max(1);

        Self {
            ring,
            sampling_interval,
            deterministic:
                settings.allocation_profiling_rate < 0 ||
                settings.allocation_flags & FLAG_DETERMINISTIC_SAMPLING != 0,
            stack_sample_size: settings.stack_sample_size,
            state: TrackerState {
                track_allocations: AtomicBool::new(true),
                track_deallocations: AtomicBool::new(
                    settings.allocation_flags & FLAG_TRACK_DEALLOCATIONS != 0),
                lost_count: AtomicU64::new(0),
                failure_count: AtomicU32::new(0),
                pid: AtomicU32::new(0),
            },
            address_set: AddressBitset::new(address_set::DEFAULT_BITSET_BITS),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.track_allocations.load(Ordering::Relaxed)
    }

    pub fn lost_count(&self) -> u64 {
        self.state.lost_count.load(Ordering::Relaxed)
    }

    pub fn sampling_interval(&self) -> u64 {
        self.sampling_interval
    }

    fn pid(&self) -> u32 {
        let pid = self.state.pid.load(Ordering::Relaxed);

        if pid != 0 {
            return pid;
        }

        let pid = std::process::id();
        self.state.pid.store(pid, Ordering::Relaxed);
        pid
    }

    /// Next reservoir draw: the exact interval in deterministic mode,
    /// exponential with the interval as mean otherwise, clamped so a
    /// pathological draw cannot stall or flood sampling.
    fn next_sample_interval(
        &self,
        rng: &mut SmallRng) -> u64 {
        if self.sampling_interval == 1 {
            return 1;
        }

        if self.deterministic {
            return self.sampling_interval;
        }

        let uniform: f64 = rng.gen_range(f64::EPSILON..1.0);
        let value = -uniform.ln() * self.sampling_interval as f64;

        let max_value = (self.sampling_interval * 20) as f64;

        (value.clamp(8.0, max_value)) as u64
    }

    /// Turns the tracker off after repeated ring failures, on once a
    /// push works again.
    fn note_push_result(
        &self,
        success: bool) {
        if success {
            if self.state.failure_count.load(Ordering::Relaxed) > 0 {
                self.state.failure_count.store(0, Ordering::Relaxed);
            }
        } else {
            let failures = self.state.failure_count
                .fetch_add(1, Ordering::AcqRel) + 1;

            if failures >= MAX_CONSECUTIVE_FAILURES {
                self.disable();
            }
        }
    }

    pub fn disable(&self) {
        self.state.track_allocations.store(false, Ordering::Release);
        self.state.track_deallocations.store(false, Ordering::Release);
    }

    /// Allocation hook. Must be callable from inside `malloc`.
    pub fn track_allocation(
        &self,
        addr: u64,
        size: u64) {
        if !self.state.track_allocations.load(Ordering::Relaxed) {
            return;
        }

        TL_STATE.with(|tl| {
            if tl.reentry_guard.replace(true) {
                /* Sampling code itself allocated */
                return;
            }

            self.track_allocation_guarded(tl, addr, size);

            tl.reentry_guard.set(false);
        });
    }

    fn track_allocation_guarded(
        &self,
        tl: &ThreadState,
        addr: u64,
        size: u64) {
        let mut remaining = tl.remaining_bytes.get() + size as i64;

        if !tl.initialized.get() {
            let draw = self.with_rng(tl, |this, rng| {
                this.next_sample_interval(rng)
            });

            remaining -= draw as i64;
            tl.initialized.set(true);

            if remaining < 0 {
                tl.remaining_bytes.set(remaining);
                return;
            }
        } else if remaining < 0 {
            tl.remaining_bytes.set(remaining);
            return;
        }

        /* Budget exhausted: figure out how many intervals this
         * allocation spans so huge allocations stay fully accounted */
        let interval = self.sampling_interval as i64;
        let mut nsamples = (remaining / interval) as u64;
        remaining %= interval;

        loop {
            let draw = self.with_rng(tl, |this, rng| {
                this.next_sample_interval(rng)
            });

            remaining -= draw as i64;
            nsamples += 1;

            if remaining < 0 {
                break;
            }
        }

        tl.remaining_bytes.set(remaining);

        let total_size = nsamples * self.sampling_interval;

        let success = self.push_alloc_sample(tl, addr, total_size);
        self.note_push_result(success);

        if success {
            self.ring.notify();
        }

        if success &&
           self.state.track_deallocations.load(Ordering::Relaxed) {
            /* Lock-free membership; a bit collision loses track of
             * one address and its free goes unreported */
            self.address_set.add(addr);

            if self.address_set.count() > MAX_TRACKED_ADDRESSES {
                if self.push_clear_live(tl) {
                    self.ring.notify();
                    self.address_set.clear();
                } else {
                    warn!("unable to resync live allocations, stopping");
                    self.disable();
                }
            }
        }
    }

    /// Deallocation hook, active only with live-heap tracking. Runs
    /// inside `free`; the membership test is one atomic operation.
    pub fn track_deallocation(
        &self,
        addr: u64) {
        if !self.state.track_deallocations.load(Ordering::Relaxed) {
            return;
        }

        if !self.address_set.remove(addr) {
            return;
        }

        TL_STATE.with(|tl| {
            if tl.reentry_guard.replace(true) {
                return;
            }

            let success = self.push_dealloc_sample(tl, addr);
            self.note_push_result(success);

            if success {
                self.ring.notify();
            }

            tl.reentry_guard.set(false);
        });
    }

    fn with_rng<T>(
        &self,
        tl: &ThreadState,
        f: impl FnOnce(&Self, &mut SmallRng) -> T) -> T {
        let mut slot = tl.rng.borrow_mut();

        let rng = slot.get_or_insert_with(|| {
            SmallRng::seed_from_u64(
                u64::from(self.tid(tl)) ^ monotonic_ns())
        });

        f(self, rng)
    }

    fn tid(
        &self,
        tl: &ThreadState) -> u32 {
        let tid = tl.tid.get();

        if tid != 0 {
            return tid;
        }

        let tid = gettid();
        tl.tid.set(tid);
        tid
    }

    /// Flushes the lost counter into the ring ahead of a sample.
    fn flush_lost(&self) {
        let lost = self.state.lost_count.swap(0, Ordering::AcqRel);

        if lost == 0 {
            return;
        }

        let pushed = self.ring.produce(
            abi::PERF_RECORD_LOST,
            16,
            |payload| {
                payload[0..8].copy_from_slice(&0u64.to_ne_bytes());
                payload[8..16].copy_from_slice(&lost.to_ne_bytes());
            });

        if !pushed {
            /* Put them back for the next attempt */
            self.state.lost_count.fetch_add(lost, Ordering::AcqRel);
        }
    }

    fn push_alloc_sample(
        &self,
        tl: &ThreadState,
        addr: u64,
        total_size: u64) -> bool {
        if self.state.lost_count.load(Ordering::Relaxed) != 0 {
            self.flush_lost();
        }

        if tl.stack_end.get() == 0 {
            tl.stack_end.set(stack_end_addr());
        }

        let regs = capture_registers();
        let sp = regs[abi::REG_POS_SP];
        let stack_end = tl.stack_end.get();

        let stack_len = if stack_end > sp {
            ((stack_end - sp) as usize)
                .min(self.stack_sample_size as usize)
        } else {
            0
        };

        /* Fixed sample layout: id, pid/tid, time, addr, period, regs
         * block, stack size + bytes + dyn size */
        let payload_len = 8 + 8 + 8 + 8 + 8 +
            8 + 8 * abi::PERF_REGS_COUNT +
            8 + stack_len + 8;

        let pid = self.pid();
        let tid = self.tid(tl);

        let pushed = self.ring.produce(
            abi::PERF_RECORD_SAMPLE,
            payload_len,
            |payload| {
                let mut offset = 0;

                let mut put = |bytes: &[u8], offset: &mut usize| {
                    payload[*offset..*offset + bytes.len()]
                        .copy_from_slice(bytes);
                    *offset += bytes.len();
                };

                put(&0u64.to_ne_bytes(), &mut offset);
                put(&pid.to_ne_bytes(), &mut offset);
                put(&tid.to_ne_bytes(), &mut offset);
                put(&monotonic_ns().to_ne_bytes(), &mut offset);
                put(&addr.to_ne_bytes(), &mut offset);
                put(&total_size.to_ne_bytes(), &mut offset);
                put(&abi::PERF_SAMPLE_REGS_ABI_64.to_ne_bytes(), &mut offset);

                for reg in &regs {
                    put(&reg.to_ne_bytes(), &mut offset);
                }

                put(&(stack_len as u64).to_ne_bytes(), &mut offset);

                if stack_len != 0 {
                    /* The window [sp, sp+len) is our own live stack */
                    let stack = unsafe {
                        std::slice::from_raw_parts(
                            sp as *const u8,
                            stack_len)
                    };

                    put(stack, &mut offset);
                }

                put(&(stack_len as u64).to_ne_bytes(), &mut offset);
            });

        if !pushed {
            self.state.lost_count.fetch_add(1, Ordering::AcqRel);
        }

        pushed
    }

    fn push_dealloc_sample(
        &self,
        tl: &ThreadState,
        addr: u64) -> bool {
        if self.state.lost_count.load(Ordering::Relaxed) != 0 {
            self.flush_lost();
        }

        let pid = self.pid();
        let tid = self.tid(tl);

        let pushed = self.ring.produce(
            abi::CUSTOM_RECORD_DEALLOCATION,
            16,
            |payload| {
                payload[0..4].copy_from_slice(&pid.to_ne_bytes());
                payload[4..8].copy_from_slice(&tid.to_ne_bytes());
                payload[8..16].copy_from_slice(&addr.to_ne_bytes());
            });

        if !pushed {
            self.state.lost_count.fetch_add(1, Ordering::AcqRel);
        }

        pushed
    }

    fn push_clear_live(
        &self,
        tl: &ThreadState) -> bool {
        let pid = self.pid();
        let tid = self.tid(tl);

        self.ring.produce(
            abi::CUSTOM_RECORD_CLEAR_LIVE,
            8,
            |payload| {
                payload[0..4].copy_from_slice(&pid.to_ne_bytes());
                payload[4..8].copy_from_slice(&tid.to_ne_bytes());
            })
    }

    /// Fork handler body: the child must not inherit the parent's
    /// cached identifiers or counters.
    pub fn handle_fork(&self) {
        self.state.pid.store(0, Ordering::Relaxed);
        self.state.lost_count.store(0, Ordering::Relaxed);

        TL_STATE.with(|tl| {
            tl.tid.set(0);
            tl.stack_end.set(0);
        });
    }
}

/// Library-mode bootstrap: connect to the profiler's handshake socket
/// (usually from `DD_PROFILING_NATIVE_LIB_SOCKET`), adopt the shared
/// ring and start sampling.
#[cfg(target_os = "linux")]
pub fn start_from_socket(
    path: &str) -> crate::IOResult<Arc<AllocationTracker>> {
    let stream = std::os::unix::net::UnixStream::connect(path)?;

    let (settings, info) = protocol::recv_settings(&stream)?;

    let ring = MpscRing::attach(
        info.ring_fd,
        info.event_fd,
        info.mem_size as usize)?;

    let tracker = Arc::new(
        AllocationTracker::new(Arc::new(ring), &settings));

    install_fork_handler(&tracker);

    Ok(tracker)
}

static FORK_TRACKER: OnceLock<Arc<AllocationTracker>> = OnceLock::new();

extern "C" fn atfork_child() {
    if let Some(tracker) = FORK_TRACKER.get() {
        tracker.handle_fork();
    }
}

/// Registers the fork handler once for a tracker instance.
#[cfg(target_os = "linux")]
pub fn install_fork_handler(
    tracker: &Arc<AllocationTracker>) {
    if FORK_TRACKER.set(tracker.clone()).is_ok() {
        unsafe {
            libc::pthread_atfork(None, None, Some(atfork_child));
        }
    }
}
