// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use stackpulse::alloc::protocol::{self, TrackerSettings};
use stackpulse::alloc::{FLAG_DETERMINISTIC_SAMPLING, FLAG_TRACK_DEALLOCATIONS};
use stackpulse::watcher::{AggregationMode, Cadence};
use stackpulse::worker::Worker;

mod commandline;

use commandline::RunArgs;

/// Serves the tracker settings to libraries connecting over the
/// handshake socket. Runs until the process exits.
fn serve_lib_socket(
    path: String,
    settings: TrackerSettings,
    ring: stackpulse::alloc::protocol::RingBufferInfo) {
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(error) => {
            warn!("unable to bind library socket {}: {}", path, error);
            return;
        },
    };

    info!("serving library settings on {}", path);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(error) = protocol::send_settings(
                        &stream,
                        &settings,
                        &ring) {
                        warn!("library handshake failed: {}", error);
                    }
                },
                Err(_) => { break; },
            }
        }
    });
}

fn run() -> anyhow::Result<i32> {
    let run_args = RunArgs::parse(std::env::args_os())?;

    let level = match run_args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    let mut worker = Worker::new(run_args.config.clone())?;

    /* Hand allocation rings to in-process libraries when asked */
    if let Some(socket_path) = run_args.socket_path {
        let rings = worker.allocation_rings();

        match rings.first() {
            Some((watcher_index, ring)) => {
                let watcher = &run_args.config.watchers[*watcher_index];

                let interval = match watcher.cadence {
                    Cadence::Period(period) => period,
                    Cadence::Frequency(freq) => freq,
                };

                let mut flags = FLAG_DETERMINISTIC_SAMPLING;

                if watcher.aggregation == AggregationMode::Both ||
                   watcher.aggregation == AggregationMode::LiveSum {
                    flags |= FLAG_TRACK_DEALLOCATIONS;
                }

                let settings = TrackerSettings {
                    allocation_profiling_rate: -(interval as i64),
                    allocation_flags: flags,
                    stack_sample_size: watcher.stack_sample_size,
                    initial_libs_delay_ms: 5000,
                    libs_interval_ms: 10000,
                    pid: std::process::id() as i32,
                };

                serve_lib_socket(socket_path, settings, *ring);
            },
            None => {
                warn!(
                    "--socket given but no allocation watcher is \
                     configured");
            },
        }
    }

    let stop = worker.stop_handle();
    let signaled = Arc::new(AtomicBool::new(false));
    let signaled_clone = signaled.clone();

    ctrlc::set_handler(move || {
        signaled_clone.store(true, Ordering::SeqCst);
        stop.store(true, Ordering::SeqCst);
    })?;

    worker.enable()?;

    info!("profiling started");

    match worker.run() {
        Ok(()) => {
            info!("profiling stopped");
            Ok(0)
        },
        Err(error) => {
            if signaled.load(Ordering::SeqCst) {
                /* Teardown raced the signal; exit clean */
                return Ok(0);
            }

            error!("worker failed: {}", error);
            Ok(1)
        },
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("Error: {}", error);
            1
        },
    };

    std::process::exit(code);
}
