//! Probe results, session reports and the append-only session log.

use crate::classifier::Outcome;
use crate::error::DoomError;
use crate::identity::DeviceIdentity;
use chrono::Local;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// Width of the command column in logs and progress lines
const COMMAND_WIDTH: usize = 40;

/// Longest response kept verbatim in the session log
const MAX_LOGGED_RESPONSE: usize = 120;

/// One send-and-classify cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub command: String,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub outcome: Outcome,
    pub response: String,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}

impl ProbeResult {
    pub fn new(command: &str, elapsed: Duration, outcome: Outcome, payload: &[u8]) -> Self {
        Self {
            command: command.to_string(),
            elapsed,
            outcome,
            response: String::from_utf8_lossy(payload).trim().to_string(),
        }
    }

    /// Tab-separated session log line: command, outcome, elapsed ms, response.
    pub fn log_line(&self) -> String {
        let mut response: String = self
            .response
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .take(MAX_LOGGED_RESPONSE)
            .collect();
        if self.response.chars().count() > MAX_LOGGED_RESPONSE {
            response.push('…');
        }
        format!(
            "{:<width$}\t{}\t{}ms\t{}",
            self.command,
            self.outcome,
            self.elapsed.as_millis(),
            response,
            width = COMMAND_WIDTH
        )
    }

    /// Colored `▶ [i/n] cmd → result` line for the terminal.
    pub fn progress_line(&self, index: usize, total: Option<usize>) -> String {
        let position = match total {
            Some(total) => format!("[{}/{}]", index, total),
            None => format!("[{}]", index),
        };
        let detail = match self.outcome {
            Outcome::Confirmed if self.response.is_empty() => "✅ accepted".green(),
            Outcome::Confirmed => format!("✅ {}", self.response).green(),
            Outcome::Timeout => format!("⚠️ no reply in {}ms", self.elapsed.as_millis()).yellow(),
            Outcome::InstrumentError => format!("❌ {}", self.response).red(),
            Outcome::Malformed => "❌ malformed reply".red(),
        };
        format!(
            "▶ {} {:<width$} → {}",
            position,
            self.command,
            detail,
            width = COMMAND_WIDTH
        )
    }
}

/// Summary of one probing session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub mode: String,
    pub identity: String,
    pub counts: BTreeMap<Outcome, usize>,
    pub results: Vec<ProbeResult>,
    /// Commands matching a skip pattern, or listed by a dry run
    pub skipped: Vec<String>,
    /// Generated candidates drawn by fuzz/learn sessions
    pub candidates_tried: usize,
    /// Commands newly added to the learned catalog
    pub learned: Vec<String>,
    /// Learned commands that could not be written to disk
    pub unpersisted: Vec<String>,
    /// RNG seed of fuzz/learn sessions, for replaying them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Stopped early by the user
    pub interrupted: bool,
    pub log_path: Option<PathBuf>,
}

impl SessionReport {
    pub fn new(mode: &str, identity: &DeviceIdentity) -> Self {
        Self {
            mode: mode.to_string(),
            identity: identity.key().to_string(),
            counts: Outcome::ALL.iter().map(|o| (*o, 0)).collect(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: ProbeResult) {
        *self.counts.entry(result.outcome).or_insert(0) += 1;
        self.results.push(result);
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    pub fn probes(&self) -> usize {
        self.results.len()
    }

    fn with_outcome<'a>(&'a self, wanted: &'a [Outcome]) -> impl Iterator<Item = &'a str> + 'a {
        self.results
            .iter()
            .filter(move |r| wanted.contains(&r.outcome))
            .map(|r| r.command.as_str())
    }

    pub fn confirmed(&self) -> Vec<&str> {
        self.with_outcome(&[Outcome::Confirmed]).collect()
    }

    /// Commands that answered with an error or garbage: removal candidates.
    pub fn needs_review(&self) -> Vec<&str> {
        self.with_outcome(&[Outcome::InstrumentError, Outcome::Malformed])
            .collect()
    }

    /// Commands that never answered: instability candidates.
    pub fn timed_out(&self) -> Vec<&str> {
        self.with_outcome(&[Outcome::Timeout]).collect()
    }

    /// Human-readable summary for the terminal
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} session on {}: {} probes",
            self.mode,
            self.identity,
            self.probes()
        );
        for outcome in Outcome::ALL {
            out.push_str(&format!(", {} {}", self.count(outcome), outcome));
        }
        if self.candidates_tried > 0 {
            out.push_str(&format!(", {} candidates tried", self.candidates_tried));
        }
        if self.mode == "learn" {
            out.push_str(&format!(", {} new commands", self.learned.len()));
        }
        if !self.skipped.is_empty() {
            out.push_str(&format!(", {} skipped", self.skipped.len()));
        }
        if let Some(seed) = self.seed {
            out.push_str(&format!(", seed {}", seed));
        }
        if self.interrupted {
            out.push_str(" (interrupted)");
        }
        out
    }
}

/// Append-only, timestamped log with one line per probe.
///
/// Every line is flushed as it is written so an interrupted session keeps
/// everything probed so far. A failing log never aborts the session.
pub struct SessionLog {
    path: PathBuf,
    file: Option<File>,
}

impl SessionLog {
    /// Create `doom_log_<mode>_<timestamp>.txt` in `dir`.
    pub fn create(dir: &Path, mode: &str, identity: &DeviceIdentity) -> Result<Self, DoomError> {
        let path = dir.join(format!(
            "doom_log_{}_{}.txt",
            sanitize_mode(mode),
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        let log_err = |source| DoomError::SessionLog {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(log_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(log_err)?;

        if !identity.raw().is_empty() {
            writeln!(file, "# Scope IDN: {}", identity.raw()).map_err(log_err)?;
        }
        writeln!(file, "# Identity key: {}", identity.key()).map_err(log_err)?;
        writeln!(file, "# Started: {}", Local::now().to_rfc3339()).map_err(log_err)?;
        file.flush().map_err(log_err)?;

        info!("Session log: {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|_| self.path.as_path())
    }

    pub fn append(&mut self, result: &ProbeResult) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let written = writeln!(file, "{}", result.log_line()).and_then(|_| file.flush());
        if let Err(e) = written {
            error!(
                "Session log {} stopped recording: {}",
                self.path.display(),
                e
            );
            self.file = None;
        }
    }
}

fn sanitize_mode(mode: &str) -> String {
    mode.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
