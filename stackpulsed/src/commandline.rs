// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{crate_version, Parser};

use stackpulse::export::ExporterConfig;
use stackpulse::watcher::{self, Cadence, Watcher};
use stackpulse::worker::{WorkerConfig, DEFAULT_CACHE_RESET_PERIOD,
    DEFAULT_PERF_PAGE_ORDER};

#[derive(Parser)]
#[command(version = crate_version!(), about, long_about = None)]
struct Args {
    #[arg(
        short = 'e',
        long = "event",
        help = "Sampling event to enable, optionally with a cadence \
                (e.g. sCPU, sALLOC,524288). Repeatable")]
    events: Vec<String>,

    #[arg(short = 'p', long = "pid", help = "Profile this process ID")]
    pid: Option<i32>,

    #[arg(short = 'g', long, help = "Profile the whole machine")]
    global: bool,

    #[arg(long, help = "Collector URL for profile uploads")]
    url: Option<String>,

    #[arg(
        long,
        default_value_t = 60,
        help = "Seconds between profile uploads")]
    upload_period: u64,

    #[arg(long, help = "Directory for local debug copies of profiles")]
    export_dir: Option<String>,

    #[arg(
        long,
        default_value_t = DEFAULT_CACHE_RESET_PERIOD,
        help = "Cycles between cache resets")]
    cache_reset_period: u32,

    #[arg(long, help = "Unix socket path served to in-process libraries")]
    socket: Option<String>,

    #[arg(short = 'v', long, action = clap::ArgAction::Count,
          help = "Increase log verbosity")]
    verbose: u8,
}

/// Validated run settings.
pub struct RunArgs {
    pub config: WorkerConfig,
    pub socket_path: Option<String>,
    pub verbose: u8,
}

fn parse_event(
    spec: &str) -> anyhow::Result<Watcher> {
    let mut parts = spec.splitn(2, ',');

    let name = parts.next().unwrap_or_default();

    let mut watcher = watcher::watcher_from_str(name)
        .ok_or_else(|| anyhow::anyhow!("unknown event '{}'", name))?;

    if let Some(value) = parts.next() {
        let value: u64 = value
            .parse()
            .map_err(|_| anyhow::anyhow!(
                "bad cadence '{}' for event '{}'", value, name))?;

        let cadence = if watcher.is_freq() {
            Cadence::Frequency(value)
        } else {
            Cadence::Period(value)
        };

        watcher = watcher.with_cadence(cadence);
    }

    Ok(watcher)
}

impl RunArgs {
    pub fn parse<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone {
        let args = Args::parse_from(args);

        if args.pid.is_none() && !args.global {
            anyhow::bail!("either --pid or --global is required");
        }

        if args.pid.is_some() && args.global {
            anyhow::bail!("--pid and --global are exclusive");
        }

        let mut watchers = Vec::new();

        for spec in &args.events {
            watchers.push(parse_event(spec)?);
        }

        if watchers.is_empty() {
            /* CPU time is the default profile */
            watchers.push(
                watcher::watcher_from_str("sCPU").expect("preset exists"));
        }

        let exporter = ExporterConfig {
            endpoint: args.url,
            debug_pprof_dir: args.export_dir.map(PathBuf::from),
            .. ExporterConfig::default()
        };

        let config = WorkerConfig {
            watchers,
            target_pid: args.pid,
            upload_period: Duration::from_secs(args.upload_period.max(1)),
            exporter,
            perf_page_order: DEFAULT_PERF_PAGE_ORDER,
            cache_reset_period: args.cache_reset_period,
        };

        let socket_path = args.socket
            .or_else(stackpulse::env::lib_socket);

        Ok(Self {
            config,
            socket_path,
            verbose: args.verbose,
        })
    }
}
