// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;

const MAP_FLAG_READ: u8 = 1u8 << 0;
const MAP_FLAG_WRITE: u8 = 1u8 << 1;
const MAP_FLAG_EXEC: u8 = 1u8 << 2;
const MAP_FLAG_PRIVATE: u8 = 1u8 << 3;

/// One parsed line of a process's mapping table.
#[derive(Default)]
pub struct MapLine<'a> {
    pub start_addr: u64,
    pub end_addr: u64,
    pub offset: u64,
    pub ino: u64,
    pub dev_maj: u32,
    pub dev_min: u32,
    pub path: Option<&'a str>,
    flags: u8,
}

impl<'a> MapLine<'a> {
    pub fn is_read(&self) -> bool { self.flags & MAP_FLAG_READ != 0 }

    pub fn is_write(&self) -> bool { self.flags & MAP_FLAG_WRITE != 0 }

    pub fn is_exec(&self) -> bool { self.flags & MAP_FLAG_EXEC != 0 }

    pub fn is_private(&self) -> bool { self.flags & MAP_FLAG_PRIVATE != 0 }

    /// Parses one `/proc/<pid>/maps` line, for example:
    /// `55d78839f000-55d7883a1000 r--p 00000000 fe:01 3287864  /usr/bin/x`
    pub fn from_line(line: &'a str) -> Option<Self> {
        let parts = line.split_whitespace();
        let mut map = MapLine::default();

        for (index, part) in parts.enumerate() {
            match index {
                0 => {
                    for address in part.split('-') {
                        if let Ok(address) = u64::from_str_radix(address, 16) {
                            if map.start_addr == 0 {
                                map.start_addr = address;
                            } else {
                                map.end_addr = address;
                            }
                        } else {
                            return None;
                        }
                    }
                },
                1 => {
                    if part.contains('r') {
                        map.flags |= MAP_FLAG_READ;
                    }

                    if part.contains('w') {
                        map.flags |= MAP_FLAG_WRITE;
                    }

                    if part.contains('x') {
                        map.flags |= MAP_FLAG_EXEC;
                    }

                    if part.contains('p') {
                        map.flags |= MAP_FLAG_PRIVATE;
                    }
                },
                2 => {
                    if let Ok(offset) = u64::from_str_radix(part, 16) {
                        map.offset = offset;
                    } else {
                        /* Odd format */
                        return None;
                    }
                },
                3 => {
                    let mut i = 0;

                    for index in part.split(':') {
                        if let Ok(value) = u32::from_str_radix(index, 16) {
                            if i == 0 {
                                map.dev_maj = value;
                            } else {
                                map.dev_min = value;
                            }

                            i += 1;
                        } else {
                            /* Odd format */
                            return None;
                        }
                    }
                },
                4 => {
                    if let Ok(ino) = part.parse::<u64>() {
                        map.ino = ino;
                    } else {
                        /* Odd format */
                        return None;
                    }
                },
                5 => {
                    map.path = Some(part);
                },
                /* Default, not interesting */
                _ => {
                    break;
                }
            }
        }

        Some(map)
    }
}

/// Iterates the mapping table of a process. A pid of zero reads the
/// profiler's own table.
pub fn iter_proc_maps(
    pid: u32,
    mut callback: impl FnMut(&MapLine)) -> bool {
    let mut path_buf = PathBuf::new();
    path_buf.push("/proc");
    if pid != 0 {
        path_buf.push(pid.to_string());
    } else {
        path_buf.push("self");
    }
    path_buf.push("maps");

    match File::open(&path_buf) {
        Ok(file) => {
            for line in BufReader::new(file).lines() {
                match line {
                    Ok(line) => {
                        if let Some(map) = MapLine::from_line(&line) {
                            (callback)(&map);
                        }
                    },
                    Err(_) => { break; },
                }
            }

            true
        },
        Err(_) => false,
    }
}

/// Gets the `comm` value (process name) of a process.
pub fn get_comm(
    pid: u32) -> Option<String> {
    let result = fs::read_to_string(
        format!("/proc/{}/comm", pid));

    match result {
        Ok(mut comm) => {
            /* Drop new line */
            comm.pop();
            Some(comm)
        },
        Err(_) => None,
    }
}

pub fn process_is_alive(
    pid: u32) -> bool {
    fs::metadata(format!("/proc/{}/status", pid)).is_ok()
}

/// Resolves the executable path of a process via its exe link.
pub fn find_exe_name(
    pid: u32) -> Option<String> {
    let link = fs::read_link(format!("/proc/{}/exe", pid)).ok()?;

    link.to_str().map(str::to_owned)
}

/// Path to a file as seen from inside the target's mount namespace.
pub fn root_path(
    pid: u32,
    path: &str) -> String {
    format!("/proc/{}/root{}", pid, path)
}

/// CPU and memory usage of the profiler itself, scraped per cycle.
#[derive(Default, Clone, Copy)]
pub struct SelfStat {
    pub utime: u64,
    pub stime: u64,
    pub rss_pages: u64,
}

pub fn read_self_stat() -> Option<SelfStat> {
    let mut content = String::new();

    File::open("/proc/self/stat")
        .ok()?
        .read_to_string(&mut content)
        .ok()?;

    /* The comm field may hold spaces; fields are positional after the
     * closing paren. */
    let after_comm = content.rfind(')')? + 2;
    let fields: Vec<&str> = content[after_comm..].split(' ').collect();

    /* utime and stime are fields 14/15 (1-based), rss is 24 */
    Some(SelfStat {
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

/// Reads the perf_event_paranoid level, logged when opens fail.
pub fn perf_event_paranoid() -> Option<i32> {
    fs::read_to_string("/proc/sys/kernel/perf_event_paranoid")
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_line() {
        let line = "55d78839f000-55d7883a1000 r-xp 00002000 fe:01 3287864 \
            /usr/local/bin/solver";

        let map = MapLine::from_line(line).unwrap();

        assert_eq!(0x55d78839f000, map.start_addr);
        assert_eq!(0x55d7883a1000, map.end_addr);
        assert_eq!(0x2000, map.offset);
        assert_eq!(0xfe, map.dev_maj);
        assert_eq!(0x01, map.dev_min);
        assert_eq!(3287864, map.ino);
        assert_eq!(Some("/usr/local/bin/solver"), map.path);
        assert!(map.is_read());
        assert!(!map.is_write());
        assert!(map.is_exec());
        assert!(map.is_private());
    }

    #[test]
    fn map_line_anon() {
        let line = "7f53143a9000-7f53143aa000 rw-p 00000000 00:00 0";

        let map = MapLine::from_line(line).unwrap();

        assert_eq!(0, map.ino);
        assert!(map.path.is_none());
        assert!(map.is_write());
    }

    #[test]
    fn map_line_special() {
        let line = "7ffcd6c68000-7ffcd6c89000 rw-p 00000000 00:00 0 [stack]";

        let map = MapLine::from_line(line).unwrap();

        assert_eq!(Some("[stack]"), map.path);
    }

    #[test]
    fn map_line_invalid() {
        assert!(MapLine::from_line("not a mapping").is_none());
        assert!(MapLine::from_line("55d7-55d8 r-xp zz fe:01 1").is_none());
    }

    #[test]
    fn own_maps() {
        let mut count = 0;

        assert!(iter_proc_maps(0, |_map| { count += 1; }));
        assert!(count > 0);
    }

    #[test]
    fn own_stat() {
        let stat = read_self_stat().unwrap();

        assert!(stat.rss_pages > 0);
    }
}
