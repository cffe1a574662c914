// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::{IOError, IOResult, io_error};
use crate::ringbuf::RingKind;

/// Ring buffer binding passed to the in-process tracker: the two file
/// descriptors travel as SCM_RIGHTS ancillary data, the rest rides in
/// the fixed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferInfo {
    pub ring_fd: RawFd,
    pub event_fd: RawFd,
    pub mem_size: u64,
    pub kind: RingKind,
}

/// The one fixed settings message the profiler serves to a connecting
/// library. A negative profiling rate selects deterministic sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    pub allocation_profiling_rate: i64,
    pub allocation_flags: u32,
    pub stack_sample_size: u32,
    pub initial_libs_delay_ms: u32,
    pub libs_interval_ms: u32,
    pub pid: i32,
}

/* rate + flags + stack + delay + interval + pid + mem_size + kind */
const MESSAGE_SIZE: usize = 8 + 4 + 4 + 4 + 4 + 4 + 8 + 4;

fn encode_message(
    settings: &TrackerSettings,
    info: &RingBufferInfo) -> [u8; MESSAGE_SIZE] {
    let mut message = [0u8; MESSAGE_SIZE];
    let mut offset = 0;

    let mut put = |bytes: &[u8], offset: &mut usize| {
        message[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        *offset += bytes.len();
    };

    put(&settings.allocation_profiling_rate.to_ne_bytes(), &mut offset);
    put(&settings.allocation_flags.to_ne_bytes(), &mut offset);
    put(&settings.stack_sample_size.to_ne_bytes(), &mut offset);
    put(&settings.initial_libs_delay_ms.to_ne_bytes(), &mut offset);
    put(&settings.libs_interval_ms.to_ne_bytes(), &mut offset);
    put(&settings.pid.to_ne_bytes(), &mut offset);
    put(&info.mem_size.to_ne_bytes(), &mut offset);
    put(&info.kind.to_wire().to_ne_bytes(), &mut offset);

    message
}

fn decode_message(
    message: &[u8; MESSAGE_SIZE],
    ring_fd: RawFd,
    event_fd: RawFd) -> IOResult<(TrackerSettings, RingBufferInfo)> {
    let settings = TrackerSettings {
        allocation_profiling_rate:
            i64::from_ne_bytes(message[0..8].try_into().unwrap()),
        allocation_flags:
            u32::from_ne_bytes(message[8..12].try_into().unwrap()),
        stack_sample_size:
            u32::from_ne_bytes(message[12..16].try_into().unwrap()),
        initial_libs_delay_ms:
            u32::from_ne_bytes(message[16..20].try_into().unwrap()),
        libs_interval_ms:
            u32::from_ne_bytes(message[20..24].try_into().unwrap()),
        pid:
            i32::from_ne_bytes(message[24..28].try_into().unwrap()),
    };

    let kind = RingKind::from_wire(
        u32::from_ne_bytes(message[36..40].try_into().unwrap()))
        .ok_or_else(|| io_error("unknown ring buffer kind"))?;

    let info = RingBufferInfo {
        ring_fd,
        event_fd,
        mem_size: u64::from_ne_bytes(message[28..36].try_into().unwrap()),
        kind,
    };

    Ok((settings, info))
}

/// Sends the settings message plus the two ring descriptors.
#[cfg(target_os = "linux")]
pub fn send_settings(
    stream: &UnixStream,
    settings: &TrackerSettings,
    info: &RingBufferInfo) -> IOResult<()> {
    let message = encode_message(settings, info);
    let fds = [info.ring_fd, info.event_fd];

    unsafe {
        let mut iov = libc::iovec {
            iov_base: message.as_ptr() as *mut libc::c_void,
            iov_len: message.len(),
        };

        let mut control =
            [0u8; 64];

        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen =
            libc::CMSG_SPACE(std::mem::size_of_val(&fds) as u32) as usize;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len =
            libc::CMSG_LEN(std::mem::size_of_val(&fds) as u32) as usize;

        std::ptr::copy_nonoverlapping(
            fds.as_ptr() as *const u8,
            libc::CMSG_DATA(cmsg),
            std::mem::size_of_val(&fds));

        if libc::sendmsg(stream.as_raw_fd(), &msg, 0) == -1 {
            return Err(IOError::last_os_error());
        }
    }

    Ok(())
}

/// Receives the settings message and adopts the passed descriptors.
#[cfg(target_os = "linux")]
pub fn recv_settings(
    stream: &UnixStream) -> IOResult<(TrackerSettings, RingBufferInfo)> {
    let mut message = [0u8; MESSAGE_SIZE];
    let mut fds: [RawFd; 2] = [-1, -1];

    unsafe {
        let mut iov = libc::iovec {
            iov_base: message.as_mut_ptr() as *mut libc::c_void,
            iov_len: message.len(),
        };

        let mut control = [0u8; 64];

        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len();

        let received = libc::recvmsg(stream.as_raw_fd(), &mut msg, 0);

        if received == -1 {
            return Err(IOError::last_os_error());
        }

        if received as usize != MESSAGE_SIZE {
            return Err(io_error("short settings message"));
        }

        let cmsg = libc::CMSG_FIRSTHDR(&msg);

        if cmsg.is_null() ||
           (*cmsg).cmsg_level != libc::SOL_SOCKET ||
           (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io_error("settings message carried no descriptors"));
        }

        std::ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cmsg),
            fds.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(&fds));
    }

    if fds[0] < 0 || fds[1] < 0 {
        return Err(io_error("invalid descriptors received"));
    }

    decode_message(&message, fds[0], fds[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuf::{MpscRing, RingCursor};

    fn settings() -> TrackerSettings {
        TrackerSettings {
            allocation_profiling_rate: -524288,
            allocation_flags: crate::alloc::FLAG_TRACK_DEALLOCATIONS,
            stack_sample_size: 16 * 1024,
            initial_libs_delay_ms: 5000,
            libs_interval_ms: 10000,
            pid: 4242,
        }
    }

    #[test]
    fn encode_decode() {
        let ring_info = RingBufferInfo {
            ring_fd: 7,
            event_fd: 8,
            mem_size: 128 * 1024,
            kind: RingKind::Mpsc,
        };

        let message = encode_message(&settings(), &ring_info);
        let (decoded, info) = decode_message(&message, 7, 8).unwrap();

        assert_eq!(settings(), decoded);
        assert_eq!(ring_info, info);
    }

    #[test]
    fn fd_passing_round_trip() {
        let ring = MpscRing::create(2).unwrap();

        let info = RingBufferInfo {
            ring_fd: ring.ring_fd(),
            event_fd: ring.event_fd(),
            mem_size: ring.total_size() as u64,
            kind: RingKind::Mpsc,
        };

        let (server, client) = UnixStream::pair().unwrap();

        send_settings(&server, &settings(), &info).unwrap();

        let (received_settings, received_info) =
            recv_settings(&client).unwrap();

        assert_eq!(settings(), received_settings);
        assert_eq!(RingKind::Mpsc, received_info.kind);
        assert_eq!(info.mem_size, received_info.mem_size);

        /* The passed descriptors are distinct, live duplicates: a
         * record produced through the attached mapping is visible to
         * the original consumer */
        assert_ne!(info.ring_fd, received_info.ring_fd);

        let attached = MpscRing::attach(
            received_info.ring_fd,
            received_info.event_fd,
            received_info.mem_size as usize).unwrap();

        assert!(attached.produce(1, 8, |payload| {
            payload.copy_from_slice(&0xFEEDu64.to_ne_bytes());
        }));

        let mut cursor = RingCursor::default();
        ring.begin_reading(&mut cursor);

        let record = ring.read(&mut cursor).unwrap();
        assert_eq!(
            0xFEED,
            u64::from_ne_bytes(record[8..16].try_into().unwrap()));

        ring.end_reading(&cursor);
    }
}
