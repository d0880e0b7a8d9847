//! Learning sessions: fuzz, classify and grow the device's learned catalog.

use crate::catalog::{Catalog, Confirmation};
use crate::classifier::Outcome;
use crate::error::DoomError;
use crate::fuzz::{FuzzCandidate, FuzzGenerator};
use crate::report::SessionReport;
use crate::runner::{Prober, SessionLimits};
use crate::transport::Transport;
use colored::Colorize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

impl<T: Transport> Prober<T> {
    /// Probe `candidates` and confirm every new command into `catalog`.
    ///
    /// Known commands are not probed again. Membership is re-checked (with
    /// a reload of the persisted learned set) right before each
    /// confirmation, so repeated or parallel sessions do not add duplicates.
    pub fn learn_from(
        &mut self,
        catalog: &mut Catalog,
        candidates: impl Iterator<Item = FuzzCandidate>,
        limits: SessionLimits,
    ) -> Result<SessionReport, DoomError> {
        let identity = catalog.identity().clone();
        let mut report = SessionReport::new("learn", &identity);
        let mut log = self.open_log("learn", &identity);
        report.log_path = log.path().map(|p| p.to_path_buf());
        let started = Instant::now();
        let mut announced = false;

        for candidate in candidates.take(limits.iterations) {
            if self.cancelled() {
                warn!("Learning interrupted by user");
                report.interrupted = true;
                break;
            }
            if limits.duration.is_some_and(|d| started.elapsed() >= d) {
                info!("Learn time limit reached");
                break;
            }
            report.candidates_tried += 1;

            if catalog.contains(&candidate.command) {
                debug!("Already known: {}", candidate.command);
                continue;
            }
            if self.skip_reason(&candidate.command).is_some() {
                report.skipped.push(candidate.command);
                continue;
            }
            if self.config.dry_run {
                if self.progress_enabled() {
                    eprintln!("{}", format!("🧠 Would test: {}", candidate.command).yellow());
                }
                report.skipped.push(candidate.command);
                continue;
            }

            let result = self.probe(&candidate.command)?;
            self.show(&result, report.candidates_tried, None);
            log.append(&result);
            let confirmed = result.outcome == Outcome::Confirmed;
            report.record(result);

            if !announced {
                info!("Probe connected, learning from {}", identity);
                announced = true;
            }
            if !confirmed {
                continue;
            }

            if let Err(e) = catalog.refresh_learned() {
                warn!("Could not re-read learned commands: {}", e);
            }
            let entry = candidate.to_entry();
            match catalog.confirm_learned(&entry, &identity) {
                Ok(Confirmation::Added) => {
                    info!("Learned: {}", entry.template());
                    report.learned.push(entry.template().to_string());
                }
                Ok(Confirmation::AlreadyKnown) => {
                    debug!("{} confirmed again, already learned", entry.template());
                }
                Err(e @ DoomError::Persistence { .. }) => {
                    error!("{}", e);
                    report.learned.push(entry.template().to_string());
                    report.unpersisted.push(entry.template().to_string());
                }
                Err(e) => return Err(e),
            }
        }

        if report.learned.is_empty() {
            info!("Nothing new discovered");
        } else {
            info!("Learned {} new commands", report.learned.len());
        }
        if !report.unpersisted.is_empty() {
            warn!(
                "{} learned commands were NOT saved: {}",
                report.unpersisted.len(),
                report.unpersisted.join(", ")
            );
        }
        info!("{}", report.summary());
        Ok(report)
    }

    /// Learn on the connected device until a limit triggers.
    ///
    /// Requires a resolvable identity: learned commands are only ever
    /// written to the namespace of the device that confirmed them.
    pub fn run_learn(
        &mut self,
        iteration_limit: usize,
        time_limit: Option<Duration>,
    ) -> Result<SessionReport, DoomError> {
        let identity = self.identify()?;
        let mut catalog = Catalog::open(
            identity,
            &self.config.baseline_path,
            &self.config.data_dir,
        )?;
        let generator = FuzzGenerator::new(&catalog, self.denylist.clone(), self.config.seed)
            .with_skip_patterns(self.config.skip_patterns.clone());
        let seed = generator.seed();
        let mut report = self.learn_from(
            &mut catalog,
            generator,
            SessionLimits::new(iteration_limit, time_limit),
        )?;
        report.seed = Some(seed);
        Ok(report)
    }
}
