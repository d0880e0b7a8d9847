//! Session configuration and file locations.

use crate::catalog::HeaderPatterns;
use crate::error::DoomError;
use std::path::PathBuf;
use std::time::Duration;

/// Baseline command list, relative to the working directory
pub const COMMAND_FILE: &str = "scpi_command_list.txt";

/// Application directory under the platform data dir
const APP_DIR: &str = "scpi-doom";

/// Subdirectory of the data dir holding session logs
pub const LOG_DIR: &str = "logs";

/// Queries that answer with IEEE 488.2 binary blocks, in SCPI notation
pub const SKIP_PATTERNS: &[&str] = &[":WAVeform:DATA", ":DISPlay:DATA"];

/// Default iteration budget of a fuzz session
pub const DEFAULT_FUZZ_ITERATIONS: usize = 50;

/// Default iteration budget of a learn session
pub const DEFAULT_LEARN_ITERATIONS: usize = 100;

/// Knobs shared by every probing mode
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Per-probe deadline
    pub timeout: Duration,
    /// Connection establishment deadline
    pub connect_timeout: Duration,
    /// Baseline command file
    pub baseline_path: PathBuf,
    /// Root of learned catalogs and session logs
    pub data_dir: PathBuf,
    /// Extra destructive commands on top of the built-in denylist
    pub denylist_path: Option<PathBuf>,
    /// Commands whose header matches one of these are never sent
    pub skip_patterns: HeaderPatterns,
    /// RNG seed for reproducible fuzz runs
    pub seed: Option<u64>,
    /// List what would be probed without sending anything
    pub dry_run: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(3000),
            baseline_path: PathBuf::from(COMMAND_FILE),
            data_dir: default_data_dir().unwrap_or_else(|_| PathBuf::from(".")),
            denylist_path: None,
            skip_patterns: HeaderPatterns::new(SKIP_PATTERNS),
            seed: None,
            dry_run: false,
        }
    }
}

impl ProbeConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(LOG_DIR)
    }

    /// True when `command` matches one of the skip patterns.
    pub fn is_skipped(&self, command: &str) -> bool {
        self.skip_patterns.matches(command)
    }
}

/// `<platform data dir>/scpi-doom`
pub fn default_data_dir() -> Result<PathBuf, DoomError> {
    let base = dirs::data_dir().ok_or(DoomError::NoDataDir)?;
    Ok(base.join(APP_DIR))
}
