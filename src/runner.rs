//! Sequential probing sessions: test, group and fuzz.
//!
//! A [`Prober`] owns the transport, so only one exchange is ever in flight
//! for a device. Cancellation is checked between probes, never during one.

use crate::catalog::{Catalog, CommandEntry};
use crate::classifier::{classify, Outcome, Reply};
use crate::config::ProbeConfig;
use crate::error::{DoomError, TransportError};
use crate::fuzz::{Denylist, FuzzCandidate, FuzzGenerator};
use crate::identity::DeviceIdentity;
use crate::report::{ProbeResult, SessionLog, SessionReport};
use crate::transport::{Transport, CLEAR_STATUS, ERROR_QUERY};
use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Stop conditions for generated sessions; whichever triggers first wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub iterations: usize,
    pub duration: Option<Duration>,
}

impl SessionLimits {
    pub fn new(iterations: usize, duration: Option<Duration>) -> Self {
        Self {
            iterations,
            duration,
        }
    }
}

/// Single owner of one device connection
pub struct Prober<T: Transport> {
    transport: T,
    pub(crate) config: ProbeConfig,
    pub(crate) denylist: Denylist,
    cancel: Arc<AtomicBool>,
    progress: bool,
    /// The error queue may hold entries left by earlier probes
    queue_dirty: bool,
}

impl<T: Transport> Prober<T> {
    pub fn new(transport: T, config: ProbeConfig) -> Self {
        Self {
            transport,
            config,
            denylist: Denylist::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: false,
            queue_dirty: true,
        }
    }

    /// Flag that, once set, stops the session before the next probe.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn with_denylist(mut self, denylist: Denylist) -> Self {
        self.denylist = denylist;
        self
    }

    /// Print a colored line per probe to stderr.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Identity required by learn and fuzz sessions.
    pub fn identify(&mut self) -> Result<DeviceIdentity, DoomError> {
        DeviceIdentity::query(&mut self.transport, self.config.timeout)
    }

    /// Identity for read-only sessions, shared namespace on failure.
    pub fn identify_or_generic(&mut self) -> DeviceIdentity {
        DeviceIdentity::query_or_generic(&mut self.transport, self.config.timeout)
    }

    fn read_error_queue(&mut self) -> Result<Option<String>, DoomError> {
        match self.transport.query(ERROR_QUERY, self.config.timeout) {
            Ok(response) => Ok(Some(
                String::from_utf8_lossy(&response.payload).trim().to_string(),
            )),
            Err(TransportError::Timeout(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Send one command and classify what comes back.
    ///
    /// Timeouts and instrument errors are outcomes; only a broken
    /// connection is an error. The error queue is cleared first whenever an
    /// earlier probe may have left an entry in it.
    pub fn probe(&mut self, command: &str) -> Result<ProbeResult, DoomError> {
        if self.queue_dirty {
            self.transport.write(CLEAR_STATUS)?;
            self.queue_dirty = false;
        }
        let result = self.exchange(command)?;
        self.queue_dirty = result.outcome != Outcome::Confirmed;
        Ok(result)
    }

    fn exchange(&mut self, command: &str) -> Result<ProbeResult, DoomError> {
        let started = Instant::now();

        if command.contains('?') {
            return match self.transport.query(command, self.config.timeout) {
                Ok(response) if !response.payload.is_empty() => {
                    let outcome = classify(command, &Reply::Payload(response.payload.clone()), None);
                    Ok(ProbeResult::new(command, response.elapsed, outcome, &response.payload))
                }
                Ok(response) => {
                    let queue = self.read_error_queue()?;
                    let outcome = classify(command, &Reply::Payload(Vec::new()), queue.as_deref());
                    let shown = queue.unwrap_or_default();
                    Ok(ProbeResult::new(command, response.elapsed, outcome, shown.as_bytes()))
                }
                Err(TransportError::Timeout(waited)) => {
                    Ok(ProbeResult::new(command, waited, Outcome::Timeout, &[]))
                }
                Err(e @ TransportError::Oversized(_)) => Ok(ProbeResult::new(
                    command,
                    started.elapsed(),
                    Outcome::Malformed,
                    e.to_string().as_bytes(),
                )),
                Err(e) => Err(e.into()),
            };
        }

        self.transport.write(command)?;
        let queue = self.read_error_queue()?;
        let outcome = match &queue {
            Some(_) => classify(command, &Reply::Payload(Vec::new()), queue.as_deref()),
            None => Outcome::Timeout,
        };
        let shown = queue.unwrap_or_default();
        Ok(ProbeResult::new(command, started.elapsed(), outcome, shown.as_bytes()))
    }

    pub(crate) fn open_log(&self, mode: &str, identity: &DeviceIdentity) -> SessionLog {
        if self.config.dry_run {
            return SessionLog::disabled();
        }
        match SessionLog::create(&self.config.log_dir(), mode, identity) {
            Ok(log) => log,
            Err(e) => {
                error!("{}; continuing without a session log", e);
                SessionLog::disabled()
            }
        }
    }

    pub(crate) fn progress_enabled(&self) -> bool {
        self.progress
    }

    pub(crate) fn show(&self, result: &ProbeResult, index: usize, total: Option<usize>) {
        if self.progress {
            eprintln!("{}", result.progress_line(index, total));
        }
    }

    /// Commands that must not be sent in this session, with the reason.
    pub(crate) fn skip_reason(&self, command: &str) -> Option<&'static str> {
        if self.config.is_skipped(command) {
            Some("binary reply")
        } else if self.denylist.blocks(command) {
            Some("destructive")
        } else {
            None
        }
    }

    fn run_entries<'a>(
        &mut self,
        mode: &str,
        identity: &DeviceIdentity,
        entries: impl Iterator<Item = &'a CommandEntry>,
    ) -> Result<SessionReport, DoomError> {
        let commands: Vec<String> = entries.map(CommandEntry::probe_string).collect();
        let total = commands.len();
        let mut report = SessionReport::new(mode, identity);
        let mut log = self.open_log(mode, identity);
        report.log_path = log.path().map(|p| p.to_path_buf());

        info!("Running {} session: {} commands", mode, total);
        for (i, command) in commands.iter().enumerate() {
            if self.cancelled() {
                warn!("{} session interrupted after {} probes", mode, report.probes());
                report.interrupted = true;
                break;
            }
            if let Some(reason) = self.skip_reason(command) {
                debug!("Skipped {} ({})", command, reason);
                if self.progress {
                    eprintln!("{}", format!("⏭️ Skipped {} ({})", command, reason).yellow());
                }
                report.skipped.push(command.clone());
                continue;
            }
            if self.config.dry_run {
                if self.progress {
                    eprintln!("{}", format!("💤 [{}/{}] {} (dry-run)", i + 1, total, command).yellow());
                }
                report.skipped.push(command.clone());
                continue;
            }

            let result = self.probe(command)?;
            self.show(&result, i + 1, Some(total));
            log.append(&result);
            report.record(result);
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Probe every entry of `catalog`.
    pub fn run_test(&mut self, catalog: &Catalog) -> Result<SessionReport, DoomError> {
        self.run_entries("test_all", catalog.identity(), catalog.entries())
    }

    /// Probe the entries whose group tag starts with `tag`.
    pub fn run_group(&mut self, catalog: &Catalog, tag: &str) -> Result<SessionReport, DoomError> {
        let mode = format!("group_{}", tag.trim().trim_start_matches(':'));
        let selected: Vec<&CommandEntry> = catalog.filter_by_group(tag).collect();
        if selected.is_empty() {
            warn!("No commands found for group '{}'", tag);
        }
        self.run_entries(&mode, catalog.identity(), selected.into_iter())
    }

    /// Probe generated candidates without touching the catalog.
    pub fn fuzz_candidates(
        &mut self,
        identity: &DeviceIdentity,
        candidates: impl Iterator<Item = FuzzCandidate>,
        limits: SessionLimits,
    ) -> Result<SessionReport, DoomError> {
        let mut report = SessionReport::new("fuzz", identity);
        let mut log = self.open_log("fuzz", identity);
        report.log_path = log.path().map(|p| p.to_path_buf());
        let started = Instant::now();

        for candidate in candidates.take(limits.iterations) {
            if self.cancelled() {
                warn!("FUZZ interrupted by user");
                report.interrupted = true;
                break;
            }
            if limits.duration.is_some_and(|d| started.elapsed() >= d) {
                info!("Fuzz time limit reached");
                break;
            }
            report.candidates_tried += 1;
            if self.skip_reason(&candidate.command).is_some() || self.config.dry_run {
                report.skipped.push(candidate.command);
                continue;
            }

            let result = self.probe(&candidate.command)?;
            self.show(&result, report.candidates_tried, None);
            log.append(&result);
            report.record(result);
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Fuzz the device: resolve its identity, load its catalog and probe
    /// generated candidates until a limit triggers.
    pub fn run_fuzz(
        &mut self,
        iteration_limit: usize,
        time_limit: Option<Duration>,
    ) -> Result<SessionReport, DoomError> {
        let identity = self.identify()?;
        let catalog = Catalog::open(
            identity.clone(),
            &self.config.baseline_path,
            &self.config.data_dir,
        )?;
        let generator = FuzzGenerator::new(&catalog, self.denylist.clone(), self.config.seed)
            .with_skip_patterns(self.config.skip_patterns.clone());
        let seed = generator.seed();
        let mut report = self.fuzz_candidates(
            &identity,
            generator,
            SessionLimits::new(iteration_limit, time_limit),
        )?;
        report.seed = Some(seed);
        Ok(report)
    }
}
