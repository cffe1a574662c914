// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{ProfError, ProfResult, What};

pub const DEFAULT_UPLOAD_PERIOD: Duration = Duration::from_secs(60);
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive upload failures tolerated before the worker gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

pub const PROFILE_PART_NAME: &str = "auto.pprof";

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Collector URL; `None` keeps profiles local (debug runs).
    pub endpoint: Option<String>,
    pub debug_pprof_dir: Option<PathBuf>,
    pub language: String,
    pub profiler_version: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            debug_pprof_dir: None,
            language: String::from("native"),
            profiler_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// What one upload attempt did to the failure accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    /// 2xx: resets the consecutive failure counter.
    Success,
    /// 504: the profile is dropped without counting a failure.
    Dropped,
    /// Connection errors and unexpected statuses: counted.
    Retryable,
    /// 403/404: the endpoint rejects us for good.
    Fatal,
}

pub struct Exporter {
    config: ExporterConfig,
    client: reqwest::blocking::Client,
}

impl Exporter {
    pub fn new(
        config: ExporterConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()?;

        Ok(Self {
            config,
            client,
        })
    }

    fn write_debug_copy(
        &self,
        payload: &[u8],
        profile_seq: u32) {
        if let Some(dir) = &self.config.debug_pprof_dir {
            let path = dir.join(
                format!("profile_{}.pprof.gz", profile_seq));

            if let Err(error) = std::fs::write(&path, payload) {
                warn!(
                    "unable to write debug profile {}: {}",
                    path.display(), error);
            }
        }
    }

    /// One POST of a serialized profile, mapped onto the failure
    /// policy. Never blocks past the upload timeout.
    pub fn export(
        &self,
        payload: Vec<u8>,
        profile_seq: u32) -> ExportOutcome {
        self.write_debug_copy(&payload, profile_seq);

        let endpoint = match &self.config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                debug!("no endpoint configured, dropping profile");
                return ExportOutcome::Success;
            },
        };

        let part = reqwest::blocking::multipart::Part::bytes(payload)
            .file_name(PROFILE_PART_NAME)
            .mime_str("application/octet-stream")
            .expect("static mime is valid");

        let form = reqwest::blocking::multipart::Form::new()
            .text("language", self.config.language.clone())
            .text("profiler_version", self.config.profiler_version.clone())
            .text("profile_seq", profile_seq.to_string())
            .part(PROFILE_PART_NAME, part);

        let response = self.client
            .post(&endpoint)
            .multipart(form)
            .send();

        match response {
            Ok(response) => {
                let status = response.status().as_u16();

                match status {
                    200..=299 => {
                        debug!("profile {} uploaded", profile_seq);
                        ExportOutcome::Success
                    },
                    504 => {
                        warn!("collector timed out, dropping profile");
                        ExportOutcome::Dropped
                    },
                    403 | 404 => {
                        warn!("collector rejected upload ({})", status);
                        ExportOutcome::Fatal
                    },
                    other => {
                        warn!("unexpected upload status {}", other);
                        ExportOutcome::Retryable
                    },
                }
            },
            Err(error) => {
                warn!("upload failed: {}", error);
                ExportOutcome::Retryable
            },
        }
    }
}

/// Shared failure accounting between the worker thread and the
/// in-flight exporter thread.
#[derive(Default)]
struct ExportStatus {
    consecutive_errors: AtomicU32,
    fatal: AtomicBool,
}

impl ExportStatus {
    fn record(
        &self,
        outcome: ExportOutcome) {
        match outcome {
            ExportOutcome::Success => {
                self.consecutive_errors.store(0, Ordering::Release);
            },
            ExportOutcome::Dropped => {},
            ExportOutcome::Retryable => {
                let errors = self.consecutive_errors
                    .fetch_add(1, Ordering::AcqRel) + 1;

                if errors >= MAX_CONSECUTIVE_ERRORS {
                    self.fatal.store(true, Ordering::Release);
                }
            },
            ExportOutcome::Fatal => {
                self.fatal.store(true, Ordering::Release);
            },
        }
    }
}

/// Export cadence state machine. Lives on the worker thread; at most
/// one exporter thread is in flight and it is joined before the next
/// profile ships.
pub struct ExportCycle {
    upload_period: Duration,
    send_time: Instant,
    cycle_start_time: Instant,
    count_worker: u32,
    profile_seq: u32,
    exporter: Arc<Exporter>,
    status: Arc<ExportStatus>,
    in_flight: Option<JoinHandle<()>>,
}

impl ExportCycle {
    pub fn new(
        exporter: Exporter,
        upload_period: Duration) -> Self {
        let now = Instant::now();

        Self {
            upload_period,
            send_time: now + upload_period,
            cycle_start_time: now,
            count_worker: 0,
            profile_seq: 0,
            exporter: Arc::new(exporter),
            status: Arc::new(ExportStatus::default()),
            in_flight: None,
        }
    }

    pub fn should_export(
        &self,
        now: Instant) -> bool {
        now >= self.send_time
    }

    pub fn count_worker(&self) -> u32 {
        self.count_worker
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.status.consecutive_errors.load(Ordering::Acquire)
    }

    /// True once the exporter has decided the run cannot continue.
    pub fn has_fatal_error(&self) -> bool {
        self.status.fatal.load(Ordering::Acquire) ||
        self.consecutive_errors() >= MAX_CONSECUTIVE_ERRORS
    }

    /// Duration of the cycle being cut; also restarts the cycle clock.
    pub fn rotate_cycle_clock(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.cycle_start_time;

        self.cycle_start_time = now;

        elapsed
    }

    /// Ships one serialized profile on a fresh exporter thread. The
    /// previous thread, if any, is joined first so a single profile is
    /// in flight at any time.
    pub fn export(
        &mut self,
        payload: Vec<u8>,
        now: Instant) -> ProfResult<()> {
        if let Some(handle) = self.in_flight.take() {
            if handle.join().is_err() {
                return Err(ProfError::fatal(
                    What::Exporter,
                    "exporter thread panicked"));
            }
        }

        if self.has_fatal_error() {
            return Err(ProfError::fatal(
                What::Exporter,
                format!(
                    "{} consecutive upload failures",
                    self.consecutive_errors())));
        }

        let exporter = self.exporter.clone();
        let status = self.status.clone();
        let profile_seq = self.profile_seq;

        self.profile_seq += 1;
        self.count_worker += 1;

        self.in_flight = Some(std::thread::spawn(move || {
            let outcome = exporter.export(payload, profile_seq);
            status.record(outcome);
        }));

        /* Keep the cadence anchored to the period */
        self.send_time += self.upload_period;

        if now > self.send_time {
            /* Clock skew or a long stall; re-anchor to avoid catchup
             * storms */
            warn!("export timer skew detected, resetting cadence");
            self.send_time = now + self.upload_period;
        }

        Ok(())
    }

    /// Joins the in-flight thread during teardown.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            let _ = handle.join();
        }

        info!(
            "exporter shut down after {} cycles",
            self.count_worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Tiny HTTP stub returning a fixed status for every request.
    fn spawn_stub(
        status_line: &'static str,
        hits: Arc<AtomicU32>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => { break; },
                };

                hits.fetch_add(1, Ordering::SeqCst);

                /* Drain some of the request then answer */
                let mut buffer = [0u8; 4096];
                let _ = stream.read(&mut buffer);

                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\n\
                     connection: close\r\n\r\n",
                    status_line);

                let _ = stream.write_all(response.as_bytes());
            }
        });

        format!("http://{}", addr)
    }

    fn exporter_for(
        endpoint: Option<String>) -> Exporter {
        Exporter::new(
            ExporterConfig {
                endpoint,
                debug_pprof_dir: None,
                language: String::from("native"),
                profiler_version: String::from("test"),
            }).unwrap()
    }

    #[test]
    fn outcome_mapping() {
        let hits = Arc::new(AtomicU32::new(0));

        let ok = exporter_for(
            Some(spawn_stub("200 OK", hits.clone())));
        assert_eq!(
            ExportOutcome::Success,
            ok.export(vec![1, 2, 3], 0));

        let gateway = exporter_for(
            Some(spawn_stub("504 Gateway Timeout", hits.clone())));
        assert_eq!(
            ExportOutcome::Dropped,
            gateway.export(vec![1, 2, 3], 0));

        let forbidden = exporter_for(
            Some(spawn_stub("403 Forbidden", hits.clone())));
        assert_eq!(
            ExportOutcome::Fatal,
            forbidden.export(vec![1, 2, 3], 0));

        let missing = exporter_for(
            Some(spawn_stub("404 Not Found", hits.clone())));
        assert_eq!(
            ExportOutcome::Fatal,
            missing.export(vec![1, 2, 3], 0));

        let broken = exporter_for(
            Some(spawn_stub("500 Internal Server Error", hits.clone())));
        assert_eq!(
            ExportOutcome::Retryable,
            broken.export(vec![1, 2, 3], 0));

        /* Nothing listening */
        let refused = exporter_for(
            Some(String::from("http://127.0.0.1:9")));
        assert_eq!(
            ExportOutcome::Retryable,
            refused.export(vec![1, 2, 3], 0));

        /* No endpoint behaves as success */
        let none = exporter_for(None);
        assert_eq!(
            ExportOutcome::Success,
            none.export(vec![1, 2, 3], 0));
    }

    #[test]
    fn three_consecutive_failures_turn_fatal() {
        let hits = Arc::new(AtomicU32::new(0));
        let endpoint = spawn_stub(
            "500 Internal Server Error",
            hits.clone());

        let mut cycle = ExportCycle::new(
            exporter_for(Some(endpoint)),
            Duration::from_secs(60));

        /* First three cycles are tolerated */
        for i in 0..3 {
            assert!(
                cycle.export(vec![0u8; 16], Instant::now()).is_ok(),
                "cycle {} unexpectedly fatal", i);
        }

        /* The fourth sees three consecutive failures and reports
         * fatal before spawning */
        let error = cycle
            .export(vec![0u8; 16], Instant::now())
            .unwrap_err();

        assert!(error.is_fatal());
        assert_eq!(What::Exporter, error.what());
        assert_eq!(3, cycle.consecutive_errors());
        assert_eq!(3, hits.load(Ordering::SeqCst));

        cycle.shutdown();
    }

    #[test]
    fn success_resets_counter() {
        let hits = Arc::new(AtomicU32::new(0));

        /* Two failures then success */
        let bad = spawn_stub("500 Internal Server Error", hits.clone());
        let good = spawn_stub("200 OK", hits.clone());

        let mut cycle = ExportCycle::new(
            exporter_for(Some(bad)),
            Duration::from_secs(60));

        cycle.export(vec![0u8; 16], Instant::now()).unwrap();
        cycle.export(vec![0u8; 16], Instant::now()).unwrap();

        /* Join the in-flight thread before inspecting */
        cycle.shutdown();
        assert_eq!(2, cycle.consecutive_errors());
        assert!(!cycle.has_fatal_error());

        let mut cycle = ExportCycle::new(
            exporter_for(Some(good)),
            Duration::from_secs(60));

        cycle.export(vec![0u8; 16], Instant::now()).unwrap();
        cycle.shutdown();

        assert_eq!(0, cycle.consecutive_errors());
    }

    #[test]
    fn cadence() {
        let mut cycle = ExportCycle::new(
            exporter_for(None),
            Duration::from_millis(50));

        let start = Instant::now();

        assert!(!cycle.should_export(start));
        assert!(cycle.should_export(start + Duration::from_millis(60)));

        cycle.export(Vec::new(), start + Duration::from_millis(60)).unwrap();

        /* send_time advanced by one period */
        assert!(!cycle.should_export(start + Duration::from_millis(80)));
        assert!(cycle.should_export(start + Duration::from_millis(110)));

        assert_eq!(1, cycle.count_worker());

        cycle.shutdown();
    }

    #[test]
    fn cycle_clock_monotonic() {
        let mut cycle = ExportCycle::new(
            exporter_for(None),
            Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(5));

        let first = cycle.rotate_cycle_clock();
        let second = cycle.rotate_cycle_clock();

        assert!(first >= Duration::from_millis(5));
        assert!(second <= first);
    }
}
