// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
use libc::*;

use crate::{IOError, IOResult};

/// Which of the three participating processes the caller became.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonizeRole {
    /// The original process; it knows the daemon's PID.
    Initial { daemon_pid: i32 },
    /// Short-lived middle process that reaps the daemon.
    Intermediate { daemon_pid: i32 },
    /// The profiler daemon, reparented to init.
    Daemon { initial_pid: i32 },
}

extern "C" fn handle_term(_sig: i32) {
}

fn close_fd(fd: RawFd) {
    unsafe {
        close(fd);
    }
}

/// Triple-fork daemonization with a pipe-based handshake: the initial
/// process learns the daemon's PID deterministically and the daemon is
/// reparented away from the target's process tree.
///
/// The intermediate process stays alive as a reaper; in the happy path
/// the daemon terminates it with SIGTERM once startup completes.
#[cfg(target_os = "linux")]
pub fn daemonize() -> IOResult<DaemonizeRole> {
    let mut pipe_fds: [RawFd; 2] = [-1, -1];

    unsafe {
        /* Close-on-exec so the handshake ends cannot leak into
         * anything the daemon or target execs later */
        if pipe2(pipe_fds.as_mut_ptr(), O_CLOEXEC) == -1 {
            return Err(IOError::last_os_error());
        }
    }

    let read_fd = pipe_fds[0];
    let write_fd = pipe_fds[1];

    let initial_pid = unsafe { getpid() };

    let temp_pid = unsafe { fork() };

    if temp_pid == -1 {
        close_fd(read_fd);
        close_fd(write_fd);
        return Err(IOError::last_os_error());
    }

    if temp_pid == 0 {
        /* Intermediate process */
        close_fd(read_fd);

        let daemon_pid = unsafe { fork() };

        if daemon_pid == -1 {
            unsafe { _exit(1); }
        }

        if daemon_pid != 0 {
            /* Still the intermediate: reap the daemon, exiting on
             * SIGTERM when startup succeeds */
            close_fd(write_fd);

            unsafe {
                let mut action: sigaction = std::mem::zeroed();
                action.sa_sigaction = handle_term as usize;

                if sigemptyset(&mut action.sa_mask) == -1 ||
                   sigaction(SIGTERM, &action, std::ptr::null_mut()) == -1 {
                    _exit(1);
                }

                waitpid(daemon_pid, std::ptr::null_mut(), 0);
            }

            return Ok(DaemonizeRole::Intermediate { daemon_pid });
        }

        /* Daemon: announce our PID through the pipe */
        let daemon_pid = unsafe { getpid() };

        let written = unsafe {
            write(
                write_fd,
                &daemon_pid as *const i32 as *const c_void,
                std::mem::size_of::<i32>())
        };

        close_fd(write_fd);

        if written != std::mem::size_of::<i32>() as isize {
            unsafe { _exit(1); }
        }

        return Ok(DaemonizeRole::Daemon { initial_pid });
    }

    /* Initial process */
    close_fd(write_fd);

    let mut daemon_pid: i32 = 0;

    let read_bytes = unsafe {
        read(
            read_fd,
            &mut daemon_pid as *mut i32 as *mut c_void,
            std::mem::size_of::<i32>())
    };

    close_fd(read_fd);

    if read_bytes != std::mem::size_of::<i32>() as isize {
        return Err(IOError::new(
            std::io::ErrorKind::Other,
            "daemon never announced its pid"));
    }

    /* Reap the intermediate */
    unsafe {
        waitpid(temp_pid, std::ptr::null_mut(), 0);
    }

    Ok(DaemonizeRole::Initial { daemon_pid })
}

/// Sent by the daemon once startup succeeds so the intermediate
/// process exits instead of lingering as a reaper.
#[cfg(target_os = "linux")]
pub fn release_intermediate(
    intermediate_pid: i32) {
    unsafe {
        kill(intermediate_pid, SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /* daemonize() forks; exercising it inside the test harness would
     * duplicate the test runner. The handshake mechanics are covered
     * through a plain pipe instead. */
    #[test]
    fn pipe_handshake_shape() {
        let mut pipe_fds: [RawFd; 2] = [-1, -1];

        unsafe {
            assert_eq!(0, pipe2(pipe_fds.as_mut_ptr(), O_CLOEXEC));

            let magic: i32 = 0x5AFE;

            assert_eq!(
                4,
                write(
                    pipe_fds[1],
                    &magic as *const i32 as *const c_void,
                    4));

            let mut read_back: i32 = 0;

            assert_eq!(
                4,
                read(
                    pipe_fds[0],
                    &mut read_back as *mut i32 as *mut c_void,
                    4));

            assert_eq!(magic, read_back);

            close(pipe_fds[0]);
            close(pipe_fds[1]);
        }
    }
}
