// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::array::TryFromSliceError;

// Sample layout for the mask this profiler always requests:
// u64    id;          /* PERF_SAMPLE_IDENTIFIER */
// u32    pid, tid;    /* PERF_SAMPLE_TID */
// u64    time;        /* PERF_SAMPLE_TIME */
// u64    addr;        /* PERF_SAMPLE_ADDR (allocation watchers) */
// u64    period;      /* PERF_SAMPLE_PERIOD */
// u64    abi;         /* PERF_SAMPLE_REGS_USER */
// u64    regs[weight(mask)];
// u64    size;        /* PERF_SAMPLE_STACK_USER */
// char   data[size];
// u64    dyn_size;    /* if size != 0 */

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;
pub const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;

pub const PERF_SAMPLE_REGS_ABI_NONE: u64 = 0;
pub const PERF_SAMPLE_REGS_ABI_32: u64 = 1;
pub const PERF_SAMPLE_REGS_ABI_64: u64 = 2;

// Record types dispatched by the multiplexer
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;

// Custom record types produced by the allocation tracker. They live in
// the user-defined space far above the kernel's record ids.
pub const CUSTOM_RECORD_DEALLOCATION: u32 = 0x7000;
pub const CUSTOM_RECORD_CLEAR_LIVE: u32 = 0x7001;

pub const FLAG_DISABLED: u64 = 1 << 0;
pub const FLAG_INHERIT: u64 = 1 << 1;
pub const FLAG_EXCLUDE_USER: u64 = 1 << 4;
pub const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const FLAG_EXCLUDE_HV: u64 = 1 << 6;
pub const FLAG_EXCLUDE_IDLE: u64 = 1 << 7;
pub const FLAG_MMAP: u64 = 1 << 8;
pub const FLAG_COMM: u64 = 1 << 9;
pub const FLAG_FREQ: u64 = 1 << 10;
pub const FLAG_ENABLE_ON_EXEC: u64 = 1 << 12;
pub const FLAG_TASK: u64 = 1 << 13;
pub const FLAG_SAMPLE_ID_ALL: u64 = 1 << 18;
pub const FLAG_MMAP2: u64 = 1 << 23;
pub const FLAG_COMM_EXEC: u64 = 1 << 24;
pub const FLAG_USE_CLOCKID: u64 = 1 << 25;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

/// Watcher event type for sources that never touch perf_event_open.
pub const CUSTOM_TYPE_ALLOCATION: u32 = 0x8000_0000;

pub const PERF_EVENT_IOC_ENABLE: u64 = 9216;
pub const PERF_EVENT_IOC_DISABLE: u64 = 9217;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;

pub const PERF_ATTR_SIZE_VER4: u32 = 104;

pub const PERF_RECORD_MISC_COMM_EXEC: u16 = 1 << 13;

/* X86_64 user register bits requested per sample */
#[cfg(target_arch = "x86_64")]
pub const PERF_REG_BP: u64 = 1 << 6;
#[cfg(target_arch = "x86_64")]
pub const PERF_REG_SP: u64 = 1 << 7;
#[cfg(target_arch = "x86_64")]
pub const PERF_REG_IP: u64 = 1 << 8;

/* ARM64: x29 (frame pointer), sp, pc */
#[cfg(target_arch = "aarch64")]
pub const PERF_REG_BP: u64 = 1 << 29;
#[cfg(target_arch = "aarch64")]
pub const PERF_REG_SP: u64 = 1 << 31;
#[cfg(target_arch = "aarch64")]
pub const PERF_REG_IP: u64 = 1 << 32;

pub const PERF_REGS_MASK: u64 = PERF_REG_BP | PERF_REG_SP | PERF_REG_IP;

/// Number of registers in the sampled register block. The kernel emits
/// them in ascending bit order, so the block is always [bp, sp, ip].
pub const PERF_REGS_COUNT: usize = 3;

pub const REG_POS_BP: usize = 0;
pub const REG_POS_SP: usize = 1;
pub const REG_POS_IP: usize = 2;

#[repr(C)]
#[derive(Copy)]
#[derive(Clone)]
#[derive(Default)]
pub struct perf_event_attr {
    pub event_type: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_watermark: u32,
    pub bp_type: u32,
    pub bp_addr: u64,
    pub bp_len: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
}

impl perf_event_attr {
    pub fn has_flag(
        &self,
        flag: u64) -> bool {
        (self.flags & flag) == flag
    }

    pub fn has_format(
        &self,
        format: u64) -> bool {
        (self.sample_type & format) == format
    }
}

pub struct Header<'a> {
    pub entry_type: u32,
    pub misc: u16,
    pub size: u16,
    pub data: &'a [u8],
}

impl<'a> Header<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Result<Header<'a>, TryFromSliceError> {
        Ok(Self {
            entry_type: u32::from_ne_bytes(slice[0..4].try_into()?),
            misc: u16::from_ne_bytes(slice[4..6].try_into()?),
            size: u16::from_ne_bytes(slice[6..8].try_into()?),
            data: &slice[Self::data_offset().min(slice.len())..],
        })
    }

    pub fn data_offset() -> usize {
        8
    }

    pub fn write(
        entry_type: u32,
        misc: u16,
        data: &[u8],
        output: &mut Vec<u8>) {
        /* Account for header itself */
        let size = (data.len() + 8) as u16;
        output.extend_from_slice(&entry_type.to_ne_bytes());
        output.extend_from_slice(&misc.to_ne_bytes());
        output.extend_from_slice(&size.to_ne_bytes());
        output.extend_from_slice(data);
    }
}

fn read_u64(
    data: &[u8],
    offset: &mut usize) -> Option<u64> {
    let end = *offset + 8;

    if end > data.len() {
        return None;
    }

    let value = u64::from_ne_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;

    Some(value)
}

fn read_u32(
    data: &[u8],
    offset: &mut usize) -> Option<u32> {
    let end = *offset + 4;

    if end > data.len() {
        return None;
    }

    let value = u32::from_ne_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;

    Some(value)
}

/// A fully decoded sample record. Slices borrow from the ring buffer
/// frame, so a sample must be consumed before the consumer advances.
pub struct SampleRecord<'a> {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub addr: u64,
    pub period: u64,
    pub regs: [u64; PERF_REGS_COUNT],
    pub stack: &'a [u8],
    pub raw: &'a [u8],
}

impl<'a> SampleRecord<'a> {
    /// Decodes a SAMPLE payload laid out by `sample_type`. Only the
    /// format bits this profiler requests are understood.
    pub fn parse(
        data: &'a [u8],
        sample_type: u64) -> Option<Self> {
        let mut offset = Header::data_offset();

        if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            read_u64(data, &mut offset)?;
        }

        let mut sample = SampleRecord {
            pid: 0,
            tid: 0,
            time: 0,
            addr: 0,
            period: 0,
            regs: [0; PERF_REGS_COUNT],
            stack: &[],
            raw: &[],
        };

        if sample_type & PERF_SAMPLE_TID != 0 {
            sample.pid = read_u32(data, &mut offset)?;
            sample.tid = read_u32(data, &mut offset)?;
        }

        if sample_type & PERF_SAMPLE_TIME != 0 {
            sample.time = read_u64(data, &mut offset)?;
        }

        if sample_type & PERF_SAMPLE_ADDR != 0 {
            sample.addr = read_u64(data, &mut offset)?;
        }

        if sample_type & PERF_SAMPLE_PERIOD != 0 {
            sample.period = read_u64(data, &mut offset)?;
        }

        if sample_type & PERF_SAMPLE_RAW != 0 {
            let size = read_u32(data, &mut offset)? as usize;

            if offset + size > data.len() {
                return None;
            }

            sample.raw = &data[offset..offset + size];
            offset += size;
        }

        if sample_type & PERF_SAMPLE_REGS_USER != 0 {
            let abi = read_u64(data, &mut offset)?;

            if abi != PERF_SAMPLE_REGS_ABI_NONE {
                for reg in sample.regs.iter_mut() {
                    *reg = read_u64(data, &mut offset)?;
                }
            }
        }

        if sample_type & PERF_SAMPLE_STACK_USER != 0 {
            let size = read_u64(data, &mut offset)? as usize;

            if size != 0 {
                if offset + size + 8 > data.len() {
                    return None;
                }

                let stack = &data[offset..offset + size];
                offset += size;

                let dyn_size = read_u64(data, &mut offset)? as usize;

                /* Only the dynamic portion holds sampled memory */
                sample.stack = &stack[..dyn_size.min(size)];
            }
        }

        Some(sample)
    }
}

pub struct Mmap2Record<'a> {
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub maj: u32,
    pub min: u32,
    pub ino: u64,
    pub prot: u32,
    pub filename: &'a str,
}

impl<'a> Mmap2Record<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let mut offset = Header::data_offset();

        let pid = read_u32(data, &mut offset)?;
        let tid = read_u32(data, &mut offset)?;
        let addr = read_u64(data, &mut offset)?;
        let len = read_u64(data, &mut offset)?;
        let pgoff = read_u64(data, &mut offset)?;
        let maj = read_u32(data, &mut offset)?;
        let min = read_u32(data, &mut offset)?;
        let ino = read_u64(data, &mut offset)?;
        let _ino_generation = read_u64(data, &mut offset)?;
        let prot = read_u32(data, &mut offset)?;
        let _flags = read_u32(data, &mut offset)?;

        if offset > data.len() {
            return None;
        }

        let raw_name = &data[offset..];
        let end = raw_name.iter()
            .position(|b| *b == 0)
            .unwrap_or(raw_name.len());

        let filename = std::str::from_utf8(&raw_name[..end]).ok()?;

        Some(Self {
            pid,
            tid,
            addr,
            len,
            pgoff,
            maj,
            min,
            ino,
            prot,
            filename,
        })
    }
}

pub struct CommRecord<'a> {
    pub pid: u32,
    pub tid: u32,
    pub comm: &'a str,
}

impl<'a> CommRecord<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let mut offset = Header::data_offset();

        let pid = read_u32(data, &mut offset)?;
        let tid = read_u32(data, &mut offset)?;

        if offset > data.len() {
            return None;
        }

        let raw_name = &data[offset..];
        let end = raw_name.iter()
            .position(|b| *b == 0)
            .unwrap_or(raw_name.len());

        let comm = std::str::from_utf8(&raw_name[..end]).ok()?;

        Some(Self {
            pid,
            tid,
            comm,
        })
    }
}

pub struct TaskRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
}

impl TaskRecord {
    /// EXIT and FORK share this layout.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut offset = Header::data_offset();

        Some(Self {
            pid: read_u32(data, &mut offset)?,
            ppid: read_u32(data, &mut offset)?,
            tid: read_u32(data, &mut offset)?,
            ptid: read_u32(data, &mut offset)?,
            time: read_u64(data, &mut offset)?,
        })
    }
}

pub struct LostRecord {
    pub id: u64,
    pub lost: u64,
}

impl LostRecord {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut offset = Header::data_offset();

        Some(Self {
            id: read_u64(data, &mut offset)?,
            lost: read_u64(data, &mut offset)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rw() {
        let mut data = Vec::new();
        let magic: u32 = 1234;
        let magic_slice = magic.to_ne_bytes();

        Header::write(1024, 0, &magic_slice, &mut data);

        let header = Header::from_slice(&data).unwrap();

        assert_eq!(1024, header.entry_type);
        assert_eq!(0, header.misc);
        assert_eq!(12, header.size);
        assert_eq!(1234, u32::from_ne_bytes(header.data[0..4].try_into().unwrap()));
    }

    fn sample_mask() -> u64 {
        PERF_SAMPLE_IDENTIFIER |
        PERF_SAMPLE_TID |
        PERF_SAMPLE_TIME |
        PERF_SAMPLE_PERIOD |
        PERF_SAMPLE_REGS_USER |
        PERF_SAMPLE_STACK_USER
    }

    fn build_sample(
        stack_size: usize,
        dyn_size: u64) -> Vec<u8> {
        let mut payload = Vec::new();

        payload.extend_from_slice(&77u64.to_ne_bytes());      /* identifier */
        payload.extend_from_slice(&100u32.to_ne_bytes());     /* pid */
        payload.extend_from_slice(&101u32.to_ne_bytes());     /* tid */
        payload.extend_from_slice(&5555u64.to_ne_bytes());    /* time */
        payload.extend_from_slice(&1u64.to_ne_bytes());       /* period */
        payload.extend_from_slice(
            &PERF_SAMPLE_REGS_ABI_64.to_ne_bytes());          /* abi */
        payload.extend_from_slice(&0xB0u64.to_ne_bytes());    /* bp */
        payload.extend_from_slice(&0x50u64.to_ne_bytes());    /* sp */
        payload.extend_from_slice(&0x10u64.to_ne_bytes());    /* ip */
        payload.extend_from_slice(
            &(stack_size as u64).to_ne_bytes());              /* size */

        for i in 0..stack_size {
            payload.push(i as u8);
        }

        payload.extend_from_slice(&dyn_size.to_ne_bytes());

        let mut data = Vec::new();
        Header::write(PERF_RECORD_SAMPLE, 0, &payload, &mut data);
        data
    }

    #[test]
    fn sample_parse() {
        let data = build_sample(64, 48);

        let sample = SampleRecord::parse(&data, sample_mask()).unwrap();

        assert_eq!(100, sample.pid);
        assert_eq!(101, sample.tid);
        assert_eq!(5555, sample.time);
        assert_eq!(1, sample.period);
        assert_eq!(0xB0, sample.regs[REG_POS_BP]);
        assert_eq!(0x50, sample.regs[REG_POS_SP]);
        assert_eq!(0x10, sample.regs[REG_POS_IP]);

        /* Only the dynamic size portion is returned */
        assert_eq!(48, sample.stack.len());
        assert_eq!(0, sample.stack[0]);
        assert_eq!(47, sample.stack[47]);
    }

    #[test]
    fn sample_parse_short() {
        let mut data = build_sample(64, 48);

        data.truncate(32);

        assert!(SampleRecord::parse(&data, sample_mask()).is_none());
    }

    #[test]
    fn mmap2_parse() {
        let mut payload = Vec::new();

        payload.extend_from_slice(&7u32.to_ne_bytes());       /* pid */
        payload.extend_from_slice(&7u32.to_ne_bytes());       /* tid */
        payload.extend_from_slice(&0x1000u64.to_ne_bytes());  /* addr */
        payload.extend_from_slice(&0x2000u64.to_ne_bytes());  /* len */
        payload.extend_from_slice(&0x3000u64.to_ne_bytes());  /* pgoff */
        payload.extend_from_slice(&8u32.to_ne_bytes());       /* maj */
        payload.extend_from_slice(&9u32.to_ne_bytes());       /* min */
        payload.extend_from_slice(&42u64.to_ne_bytes());      /* ino */
        payload.extend_from_slice(&0u64.to_ne_bytes());       /* gen */
        payload.extend_from_slice(&5u32.to_ne_bytes());       /* prot */
        payload.extend_from_slice(&0u32.to_ne_bytes());       /* flags */
        payload.extend_from_slice(b"/usr/lib/libc.so\0\0");

        let mut data = Vec::new();
        Header::write(PERF_RECORD_MMAP2, 0, &payload, &mut data);

        let record = Mmap2Record::parse(&data).unwrap();

        assert_eq!(7, record.pid);
        assert_eq!(0x1000, record.addr);
        assert_eq!(0x2000, record.len);
        assert_eq!(0x3000, record.pgoff);
        assert_eq!(42, record.ino);
        assert_eq!("/usr/lib/libc.so", record.filename);
    }

    #[test]
    fn lost_parse() {
        let mut payload = Vec::new();

        payload.extend_from_slice(&1u64.to_ne_bytes());
        payload.extend_from_slice(&250u64.to_ne_bytes());

        let mut data = Vec::new();
        Header::write(PERF_RECORD_LOST, 0, &payload, &mut data);

        let record = LostRecord::parse(&data).unwrap();

        assert_eq!(250, record.lost);
    }
}
