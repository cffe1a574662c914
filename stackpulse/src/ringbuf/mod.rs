// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_os = "linux")]
use libc::*;

use crate::{IOResult, IOError, io_error};
use crate::perf_event::abi;

/// Ring buffer shape shared through the IPC handshake with the
/// in-process allocation tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// Kernel-produced perf ring (single producer).
    Perf,
    /// Multi-producer ring written by target-process threads.
    Mpsc,
}

impl RingKind {
    pub fn to_wire(self) -> u32 {
        match self {
            RingKind::Perf => 0,
            RingKind::Mpsc => 1,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(RingKind::Perf),
            1 => Some(RingKind::Mpsc),
            _ => None,
        }
    }
}

/// Consumer-side cursor over a framed byte range.
#[derive(Default)]
pub struct RingCursor {
    start: u64,
    end: u64,
}

impl RingCursor {
    pub fn set(
        &mut self,
        start: u64,
        end: u64) {
        self.start = start;
        self.end = end;
    }

    pub fn advance(
        &mut self,
        len: u16) {
        self.start += len as u64;
    }

    pub fn more(&self) -> bool {
        self.start < self.end
    }

    pub fn start(&self) -> u64 {
        self.start
    }
}

/* perf_event_mmap_page field offsets (64-bit layout) */
const PERF_PAGE_DATA_HEAD: usize = 1024;
const PERF_PAGE_DATA_TAIL: usize = 1032;
const PERF_PAGE_DATA_OFFSET: usize = 1040;
const PERF_PAGE_DATA_SIZE: usize = 1048;

unsafe fn atomic_at(
    base: *mut u8,
    offset: usize) -> &'static AtomicU64 {
    &*(base.add(offset) as *const AtomicU64)
}

/// Consumer view of a kernel perf ring: one metadata page followed by a
/// power-of-two data area. The kernel publishes `data_head`; the
/// consumer stores `data_tail` after processing.
pub struct PerfRingReader {
    pages: *mut u8,
    pages_len: usize,
    data_offset: u64,
    data_size: u64,
    data_mask: u64,
    owns_mapping: bool,
}

impl<'a> PerfRingReader {
    /// Takes over an existing mapping of `(1 + 2^k)` pages.
    ///
    /// # Safety requirement
    /// `pages` must point to a live perf mmap of `pages_len` bytes; the
    /// reader unmaps it on drop when `owns_mapping` is set.
    pub fn new(
        pages: *mut u8,
        pages_len: usize,
        owns_mapping: bool) -> Self {
        let slice = unsafe {
            std::slice::from_raw_parts(
                pages,
                pages_len)
        };

        let data_offset = u64::from_ne_bytes(
            slice[PERF_PAGE_DATA_OFFSET..PERF_PAGE_DATA_OFFSET + 8]
                .try_into().unwrap());

        let data_size = u64::from_ne_bytes(
            slice[PERF_PAGE_DATA_SIZE..PERF_PAGE_DATA_SIZE + 8]
                .try_into().unwrap());

        Self {
            pages,
            pages_len,
            data_offset,
            data_size,
            data_mask: data_size - 1,
            owns_mapping,
        }
    }

    fn data_slice(&'a self) -> &'a [u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.pages.add(self.data_offset as usize),
                self.data_size as usize)
        }
    }

    pub fn begin_reading(
        &self,
        cursor: &mut RingCursor) {
        let head = unsafe {
            atomic_at(self.pages, PERF_PAGE_DATA_HEAD)
        }.load(Ordering::Acquire);

        let tail = unsafe {
            atomic_at(self.pages, PERF_PAGE_DATA_TAIL)
        }.load(Ordering::Relaxed);

        cursor.set(tail, head);
    }

    /// Reads the next framed record. Records that wrap the data area
    /// are reassembled into `temp`.
    pub fn read(
        &'a self,
        cursor: &mut RingCursor,
        temp: &'a mut Vec<u8>) -> IOResult<&'a [u8]> {
        let data_slice = self.data_slice();
        let start = (cursor.start() & self.data_mask) as usize;

        if !cursor.more() {
            return Ok(&[]);
        }

        let header_end = start + abi::Header::data_offset();

        if header_end > data_slice.len() {
            /* Header itself wraps; reassemble below */
        } else {
            let header = abi::Header::from_slice(&data_slice[start..header_end])
                .map_err(|_| io_error("Header slice was not large enough."))?;

            let data_size = header.size as usize;
            let data_end = start + data_size;

            cursor.advance(header.size);

            if data_end <= self.data_size as usize {
                /* Fits within slice, no copy */
                return Ok(&data_slice[start..data_end]);
            }

            /* Data wrapped, requires copy */
            temp.clear();
            temp.extend_from_slice(&data_slice[start..]);
            let remaining = data_size - temp.len();
            temp.extend_from_slice(&data_slice[0..remaining]);

            return Ok(&temp[0..]);
        }

        /* Wrapped header: stitch the 8 header bytes manually */
        temp.clear();

        for i in 0..abi::Header::data_offset() {
            temp.push(data_slice[(start + i) & self.data_mask as usize]);
        }

        let size = u16::from_ne_bytes(temp[6..8].try_into().unwrap()) as usize;

        for i in abi::Header::data_offset()..size {
            temp.push(data_slice[(start + i) & self.data_mask as usize]);
        }

        cursor.advance(size as u16);

        Ok(&temp[0..])
    }

    pub fn end_reading(
        &mut self,
        cursor: &RingCursor) {
        unsafe {
            atomic_at(self.pages, PERF_PAGE_DATA_TAIL)
        }.store(cursor.start(), Ordering::Release);
    }
}

impl Drop for PerfRingReader {
    fn drop(&mut self) {
        if self.owns_mapping {
            unsafe {
                munmap(self.pages as *mut c_void, self.pages_len);
            }
        }
    }
}

/* MPSC metadata page layout: fields on separate cache lines */
const MPSC_WRITER_POS: usize = 0;
const MPSC_COMMITTED: usize = 64;
const MPSC_READER_POS: usize = 128;

/// Multi-producer single-consumer ring backed by a memfd. The data area
/// is mapped twice back to back so a record reserved near the end of
/// the area continues into the second mapping and never fragments.
///
/// Producers reserve with a compare-exchange on `writer_pos`, then
/// publish in reservation order through the `committed` watermark. The
/// single consumer reads up to `committed` and advances `reader_pos`.
pub struct MpscRing {
    ring_fd: i32,
    event_fd: i32,
    meta: *mut u8,
    data: *mut u8,
    data_size: u64,
    data_mask: u64,
    owns_fds: bool,
}

/* The mapped region is plain shared memory, safe to hand across
 * threads; all mutation goes through atomics. */
unsafe impl Send for MpscRing {}
unsafe impl Sync for MpscRing {}

pub const MPSC_HEADER_BYTES: usize = 8;

fn page_size() -> usize {
    unsafe { sysconf(_SC_PAGE_SIZE) as usize }
}

impl MpscRing {
    /// Creates a fresh ring of `2^order` data pages plus one metadata
    /// page, plus an eventfd used to wake the consumer.
    #[cfg(target_os = "linux")]
    pub fn create(
        page_order: u32) -> IOResult<Self> {
        let page_size = page_size();
        let data_size = (1usize << page_order) * page_size;
        let total = data_size + page_size;

        let ring_fd = unsafe {
            memfd_create(
                b"stackpulse_alloc_ring\0".as_ptr() as *const c_char,
                MFD_CLOEXEC)
        };

        if ring_fd == -1 {
            return Err(IOError::last_os_error());
        }

        if unsafe { ftruncate(ring_fd, total as off_t) } == -1 {
            let error = IOError::last_os_error();
            unsafe { close(ring_fd); }
            return Err(error);
        }

        let event_fd = unsafe { eventfd(0, EFD_NONBLOCK) };

        if event_fd == -1 {
            let error = IOError::last_os_error();
            unsafe { close(ring_fd); }
            return Err(error);
        }

        let mut ring = Self::map(ring_fd, event_fd, total, true)?;
        ring.owns_fds = true;

        Ok(ring)
    }

    /// Attaches to a ring whose fds were received over the handshake
    /// socket (the tracker side of the shared ring).
    #[cfg(target_os = "linux")]
    pub fn attach(
        ring_fd: i32,
        event_fd: i32,
        total_size: usize) -> IOResult<Self> {
        Self::map(ring_fd, event_fd, total_size, false)
    }

    #[cfg(target_os = "linux")]
    fn map(
        ring_fd: i32,
        event_fd: i32,
        total: usize,
        owns_fds: bool) -> IOResult<Self> {
        let page_size = page_size();

        if total <= page_size ||
           !(total - page_size).is_power_of_two() {
            return Err(io_error("Ring size must be meta page + 2^n pages."));
        }

        let data_size = total - page_size;

        unsafe {
            let meta = mmap(
                std::ptr::null_mut(),
                page_size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                ring_fd,
                0);

            if meta == MAP_FAILED {
                return Err(IOError::last_os_error());
            }

            /* Reserve space for two adjacent data mappings, then map
             * the data pages into both halves. */
            let reservation = mmap(
                std::ptr::null_mut(),
                data_size * 2,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0);

            if reservation == MAP_FAILED {
                let error = IOError::last_os_error();
                munmap(meta, page_size);
                return Err(error);
            }

            for half in 0..2 {
                let target = (reservation as *mut u8)
                    .add(half * data_size) as *mut c_void;

                let mapped = mmap(
                    target,
                    data_size,
                    PROT_READ | PROT_WRITE,
                    MAP_SHARED | MAP_FIXED,
                    ring_fd,
                    page_size as off_t);

                if mapped == MAP_FAILED {
                    let error = IOError::last_os_error();
                    munmap(meta, page_size);
                    munmap(reservation, data_size * 2);
                    return Err(error);
                }
            }

            Ok(Self {
                ring_fd,
                event_fd,
                meta: meta as *mut u8,
                data: reservation as *mut u8,
                data_size: data_size as u64,
                data_mask: (data_size - 1) as u64,
                owns_fds,
            })
        }
    }

    pub fn ring_fd(&self) -> i32 { self.ring_fd }

    pub fn event_fd(&self) -> i32 { self.event_fd }

    pub fn total_size(&self) -> usize {
        self.data_size as usize + page_size()
    }

    fn writer_pos(&self) -> &AtomicU64 {
        unsafe { atomic_at(self.meta, MPSC_WRITER_POS) }
    }

    fn committed(&self) -> &AtomicU64 {
        unsafe { atomic_at(self.meta, MPSC_COMMITTED) }
    }

    fn reader_pos(&self) -> &AtomicU64 {
        unsafe { atomic_at(self.meta, MPSC_READER_POS) }
    }

    /// Producer hot path: frames `payload` under a record header and
    /// publishes it. Returns false when the ring lacks space; the
    /// caller counts the record as lost. No allocation, no syscalls.
    pub fn produce(
        &self,
        entry_type: u32,
        payload_len: usize,
        fill: impl FnOnce(&mut [u8])) -> bool {
        let record_len = (MPSC_HEADER_BYTES + payload_len + 7) & !7;

        if record_len as u64 > self.data_size {
            return false;
        }

        let writer_pos = self.writer_pos();

        let mut pos = writer_pos.load(Ordering::Relaxed);

        loop {
            let reader = self.reader_pos().load(Ordering::Acquire);

            if pos + record_len as u64 - reader > self.data_size {
                /* Insufficient space */
                return false;
            }

            match writer_pos.compare_exchange_weak(
                pos,
                pos + record_len as u64,
                Ordering::AcqRel,
                Ordering::Relaxed) {
                Ok(_) => { break; },
                Err(current) => { pos = current; },
            }
        }

        /* Write through the double mapping; never wraps mid-record */
        let offset = (pos & self.data_mask) as usize;

        let record = unsafe {
            std::slice::from_raw_parts_mut(
                self.data.add(offset),
                record_len)
        };

        record[0..4].copy_from_slice(&entry_type.to_ne_bytes());
        record[4..6].copy_from_slice(&0u16.to_ne_bytes());
        record[6..8].copy_from_slice(&(record_len as u16).to_ne_bytes());

        fill(&mut record[MPSC_HEADER_BYTES..MPSC_HEADER_BYTES + payload_len]);

        /* Publish in reservation order */
        let committed = self.committed();

        while committed.load(Ordering::Acquire) != pos {
            std::hint::spin_loop();
        }

        committed.store(pos + record_len as u64, Ordering::Release);

        true
    }

    pub fn begin_reading(
        &self,
        cursor: &mut RingCursor) {
        let head = self.committed().load(Ordering::Acquire);
        let tail = self.reader_pos().load(Ordering::Relaxed);

        cursor.set(tail, head);
    }

    /// Returns the next record, header included. The double mapping
    /// guarantees the record is contiguous.
    pub fn read(
        &self,
        cursor: &mut RingCursor) -> Option<&[u8]> {
        if !cursor.more() {
            return None;
        }

        let offset = (cursor.start() & self.data_mask) as usize;

        let header = unsafe {
            std::slice::from_raw_parts(
                self.data.add(offset),
                MPSC_HEADER_BYTES)
        };

        let size = u16::from_ne_bytes(header[6..8].try_into().unwrap());

        if (size as usize) < MPSC_HEADER_BYTES {
            return None;
        }

        let record = unsafe {
            std::slice::from_raw_parts(
                self.data.add(offset),
                size as usize)
        };

        cursor.advance(size);

        Some(record)
    }

    pub fn end_reading(
        &self,
        cursor: &RingCursor) {
        self.reader_pos().store(cursor.start(), Ordering::Release);
    }

    /// Wakes the consumer after a commit. Producers call this outside
    /// the reserve/commit fast path.
    pub fn notify(&self) {
        let token: u64 = 1;

        unsafe {
            write(
                self.event_fd,
                &token as *const u64 as *const c_void,
                8);
        }
    }

    /// Drains the wakeup counter before a read sweep.
    pub fn consume_notification(&self) {
        let mut token: u64 = 0;

        unsafe {
            read(
                self.event_fd,
                &mut token as *mut u64 as *mut c_void,
                8);
        }
    }
}

impl Drop for MpscRing {
    fn drop(&mut self) {
        unsafe {
            munmap(self.meta as *mut c_void, page_size());
            munmap(self.data as *mut c_void, (self.data_size * 2) as usize);

            if self.owns_fds {
                close(self.ring_fd);
                close(self.event_fd);
            }
        }
    }
}
