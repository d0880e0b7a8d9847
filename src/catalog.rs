//! Command catalog: shipped baseline plus per-device learned commands.
//!
//! Learned commands live under `learned/<identity-key>/`:
//! - `learned_<key>_latest.txt` holds the full learned set and is rewritten
//!   atomically after every confirmation.
//! - `learned_<key>_<timestamp>.txt` is this session's snapshot. It is only
//!   appended to while the session runs and left untouched afterwards.
//!
//! Two processes learning against the *same* identity at the same time are
//! not coordinated; the last `latest` rewrite wins.

use crate::error::DoomError;
use crate::identity::DeviceIdentity;
use chrono::Local;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Marker starting a comment line in command files
const COMMENT_MARKER: char = '#';

/// Subdirectory of the data dir holding one directory per identity
pub const LEARNED_DIR: &str = "learned";

/// Numeric parameter placeholder in command templates
pub const NUMERIC_PLACEHOLDER: &str = "<n>";

/// Enumerated parameter placeholder in command templates
pub const ENUM_PLACEHOLDER: &str = "<e>";

/// Where a command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Shipped with the tool, presumed safe
    Baseline,
    /// Discovered at runtime on one device
    Learned,
}

/// A known command template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEntry {
    template: String,
    group: Option<String>,
    provenance: Provenance,
}

impl CommandEntry {
    pub fn new(template: &str, provenance: Provenance) -> Self {
        let template = template.trim().to_string();
        let group = group_of(&template);
        Self {
            template,
            group,
            provenance,
        }
    }

    pub fn baseline(template: &str) -> Self {
        Self::new(template, Provenance::Baseline)
    }

    pub fn learned(template: &str) -> Self {
        Self::new(template, Provenance::Learned)
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Uniqueness key: trimmed, whitespace-collapsed, upper-cased
    pub fn normalized(&self) -> String {
        normalize(&self.template)
    }

    pub fn is_query(&self) -> bool {
        self.template.contains('?')
    }

    pub fn is_parameterized(&self) -> bool {
        self.template.contains(NUMERIC_PLACEHOLDER) || self.template.contains(ENUM_PLACEHOLDER)
    }

    /// Concrete command for a plain test probe (placeholders take their
    /// first legal value).
    pub fn probe_string(&self) -> String {
        self.template
            .replace(NUMERIC_PLACEHOLDER, "1")
            .replace(ENUM_PLACEHOLDER, "ON")
    }
}

/// Case- and whitespace-insensitive form of a command string.
pub fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// First header node of a command, e.g. `MATH1` for `:MATH1:DISPlay?`.
pub fn group_of(command: &str) -> Option<String> {
    let header = command.trim().trim_start_matches(':');
    let node: String = header
        .chars()
        .take_while(|c| !matches!(c, ':' | '?' | ' ' | '\t'))
        .collect();
    if node.is_empty() {
        None
    } else {
        Some(node)
    }
}

/// Header nodes of a command: `:CHAN1:SCAL? MAX` → `["CHAN1", "SCAL"]`
pub(crate) fn header_nodes(command: &str) -> Vec<String> {
    let header = command.split_whitespace().next().unwrap_or("");
    header
        .trim_start_matches(':')
        .trim_end_matches('?')
        .split(':')
        .filter(|node| !node.is_empty())
        .map(str::to_string)
        .collect()
}

/// SCPI keyword equivalence with short/long forms.
///
/// `pattern` uses SCPI notation (`SYSTem`); `candidate` matches when its
/// upper-cased text is at least the short form and a prefix of the long
/// form. A numeric suffix on the candidate is ignored.
fn node_matches(candidate: &str, pattern: &str) -> bool {
    let long = pattern.to_uppercase();
    let short: String = pattern
        .chars()
        .take_while(|c| !c.is_ascii_lowercase())
        .collect();
    let mut cand = candidate.to_uppercase();
    if !long.ends_with(|c: char| c.is_ascii_digit()) {
        let trimmed_len = cand.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        cand.truncate(trimmed_len);
    }
    cand.len() >= short.len() && long.starts_with(&cand)
}

/// Command headers in SCPI notation, matched node by node.
///
/// A command matches when its header starts with a pattern's nodes, each
/// written in short form, long form or anything in between (`:WAV:DATA?`,
/// `:WAVE:DATA?` and `:WAVeform:DATA?` all match `:WAVeform:DATA`).
#[derive(Debug, Clone, Default)]
pub struct HeaderPatterns {
    entries: Vec<Vec<String>>,
    normalized: BTreeSet<String>,
}

impl HeaderPatterns {
    pub fn new(patterns: &[&str]) -> Self {
        let mut set = Self::default();
        for pattern in patterns {
            set.add(pattern);
        }
        set
    }

    pub fn add(&mut self, pattern: &str) {
        let nodes = header_nodes(pattern);
        if !nodes.is_empty() {
            self.entries.push(nodes);
        }
        self.normalized.insert(normalize(pattern));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn matches(&self, command: &str) -> bool {
        let normalized = normalize(command);
        let header = normalized.split_whitespace().next().unwrap_or("");
        if self.normalized.contains(&normalized)
            || self.normalized.contains(header)
            || self.normalized.contains(header.trim_end_matches('?'))
        {
            return true;
        }

        let nodes = header_nodes(command);
        self.entries.iter().any(|pattern| {
            nodes.len() >= pattern.len()
                && pattern
                    .iter()
                    .zip(&nodes)
                    .all(|(p, n)| node_matches(n, p))
        })
    }
}

/// Read a line-oriented command file, skipping blanks and comments.
pub fn read_command_file(path: &Path) -> Result<Vec<String>, DoomError> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            DoomError::CatalogNotFound(path.to_path_buf())
        } else {
            DoomError::CatalogRead {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_MARKER))
        .map(str::to_string)
        .collect())
}

/// Result of a [`Catalog::confirm_learned`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// New command, written to disk
    Added,
    /// Already known; nothing changed
    AlreadyKnown,
}

/// File locations of one identity's learned commands
#[derive(Debug, Clone)]
pub struct DeviceStore {
    dir: PathBuf,
    latest: PathBuf,
    snapshot: PathBuf,
}

impl DeviceStore {
    /// Paths for `identity` under `data_dir`, with a snapshot stamped now.
    pub fn new(data_dir: &Path, identity: &DeviceIdentity) -> Self {
        let key = identity.key();
        let dir = data_dir.join(LEARNED_DIR).join(key);
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        Self {
            latest: dir.join(format!("learned_{}_latest.txt", key)),
            snapshot: dir.join(format!("learned_{}_{}.txt", key, stamp)),
            dir,
        }
    }

    pub fn latest_path(&self) -> &Path {
        &self.latest
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot
    }

    /// Commands currently in the `latest` file; missing file means none.
    pub fn read_latest(&self) -> Result<Vec<String>, DoomError> {
        match read_command_file(&self.latest) {
            Ok(commands) => Ok(commands),
            Err(DoomError::CatalogNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Append one command to the session snapshot and flush it to disk.
    fn append_snapshot(&self, command: &str) -> Result<(), DoomError> {
        let persist_err = |source| DoomError::Persistence {
            path: self.snapshot.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(persist_err)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.snapshot)
            .map_err(persist_err)?;
        writeln!(file, "{}", command).map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
        Ok(())
    }

    /// Replace the `latest` file with `commands` via write-then-rename.
    fn rewrite_latest<'a>(
        &self,
        commands: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), DoomError> {
        let persist_err = |source| DoomError::Persistence {
            path: self.latest.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(persist_err)?;

        let tmp = self.latest.with_extension("txt.tmp");
        {
            let mut file = File::create(&tmp).map_err(persist_err)?;
            for command in commands {
                writeln!(file, "{}", command).map_err(persist_err)?;
            }
            file.sync_all().map_err(persist_err)?;
        }
        fs::rename(&tmp, &self.latest).map_err(persist_err)?;
        Ok(())
    }
}

/// Baseline commands plus the learned commands of exactly one device.
#[derive(Debug)]
pub struct Catalog {
    identity: DeviceIdentity,
    baseline: Vec<CommandEntry>,
    learned: Vec<CommandEntry>,
    known: HashSet<String>,
    store: Option<DeviceStore>,
}

impl Catalog {
    /// Catalog with no persistence, mostly for tests and dry runs.
    pub fn in_memory(identity: DeviceIdentity, baseline: &[&str]) -> Self {
        let mut catalog = Self {
            identity,
            baseline: Vec::new(),
            learned: Vec::new(),
            known: HashSet::new(),
            store: None,
        };
        for command in baseline {
            catalog.push(CommandEntry::baseline(command));
        }
        catalog
    }

    /// Merge `baseline_path` and `learned_path`; baseline wins duplicates.
    pub fn load(
        identity: DeviceIdentity,
        baseline_path: &Path,
        learned_path: &Path,
    ) -> Result<Self, DoomError> {
        let baseline = read_command_file(baseline_path)?;
        let learned = match read_command_file(learned_path) {
            Ok(commands) => commands,
            Err(DoomError::CatalogNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut catalog = Self {
            identity,
            baseline: Vec::new(),
            learned: Vec::new(),
            known: HashSet::new(),
            store: None,
        };
        for command in &baseline {
            catalog.push(CommandEntry::baseline(command));
        }
        let mut included = 0;
        for command in &learned {
            if catalog.push(CommandEntry::learned(command)) {
                included += 1;
            }
        }

        info!(
            "Loaded {} baseline and {} learned commands for {}",
            catalog.baseline.len(),
            included,
            catalog.identity
        );
        Ok(catalog)
    }

    /// Load the baseline plus the learned set stored for `identity` under
    /// `data_dir`, and bind the catalog to that identity's store.
    pub fn open(
        identity: DeviceIdentity,
        baseline_path: &Path,
        data_dir: &Path,
    ) -> Result<Self, DoomError> {
        let store = DeviceStore::new(data_dir, &identity);
        let mut catalog = Self::load(identity, baseline_path, store.latest_path())?;
        catalog.store = Some(store);
        Ok(catalog)
    }

    fn push(&mut self, entry: CommandEntry) -> bool {
        if !self.known.insert(entry.normalized()) {
            debug!("Duplicate command ignored: {}", entry.template());
            return false;
        }
        match entry.provenance() {
            Provenance::Baseline => self.baseline.push(entry),
            Provenance::Learned => self.learned.push(entry),
        }
        true
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn store(&self) -> Option<&DeviceStore> {
        self.store.as_ref()
    }

    pub fn len(&self) -> usize {
        self.baseline.len() + self.learned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Baseline entries first, then learned ones.
    pub fn entries(&self) -> impl Iterator<Item = &CommandEntry> {
        self.baseline.iter().chain(self.learned.iter())
    }

    pub fn learned(&self) -> &[CommandEntry] {
        &self.learned
    }

    pub fn contains(&self, command: &str) -> bool {
        self.known.contains(&normalize(command))
    }

    /// Entries whose group tag starts with `tag`, ignoring case.
    pub fn filter_by_group<'a>(&'a self, tag: &str) -> impl Iterator<Item = &'a CommandEntry> + 'a {
        let wanted = tag.trim().trim_start_matches(':').to_uppercase();
        self.entries().filter(move |entry| {
            entry
                .group()
                .is_some_and(|group| group.to_uppercase().starts_with(&wanted))
        })
    }

    /// Pull in commands another session for this identity has persisted
    /// since we loaded.
    pub fn refresh_learned(&mut self) -> Result<usize, DoomError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let on_disk = store.read_latest()?;
        let mut merged = 0;
        for command in &on_disk {
            if self.push(CommandEntry::learned(command)) {
                merged += 1;
            }
        }
        if merged > 0 {
            debug!("Merged {} commands persisted by another session", merged);
        }
        Ok(merged)
    }

    /// Record `entry` as learned for `identity` and persist it.
    ///
    /// Re-confirming a known command is a no-op. The entry is kept in memory
    /// even when persisting fails, so the session does not probe it again;
    /// the [`DoomError::Persistence`] is still returned to the caller.
    pub fn confirm_learned(
        &mut self,
        entry: &CommandEntry,
        identity: &DeviceIdentity,
    ) -> Result<Confirmation, DoomError> {
        if identity != &self.identity {
            return Err(DoomError::IdentityMismatch {
                active: self.identity.key().to_string(),
                requested: identity.key().to_string(),
            });
        }
        if self.contains(entry.template()) {
            return Ok(Confirmation::AlreadyKnown);
        }

        self.push(CommandEntry::learned(entry.template()));

        if let Some(store) = &self.store {
            let snapshot = store.append_snapshot(entry.template());
            let latest = store.rewrite_latest(self.learned.iter().map(|e| e.template()));
            if let Err(e) = snapshot.and(latest) {
                warn!("{} was learned but not saved", entry.template());
                return Err(e);
            }
        }
        Ok(Confirmation::Added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity(serial: &str) -> DeviceIdentity {
        DeviceIdentity::resolve(&format!("RIGOL TECHNOLOGIES,MSO5074,{},00.01", serial)).unwrap()
    }

    fn write_file(path: &Path, lines: &[&str]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    fn line_count(path: &Path) -> usize {
        read_command_file(path).unwrap().len()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  :chan1:scal? "), ":CHAN1:SCAL?");
        assert_eq!(normalize(":WAV:FORM   byte"), ":WAV:FORM BYTE");
    }

    #[test]
    fn test_group_of() {
        assert_eq!(group_of(":MATH1:DISPlay?").as_deref(), Some("MATH1"));
        assert_eq!(group_of("CHANnel1:SCALe?").as_deref(), Some("CHANnel1"));
        assert_eq!(group_of("*IDN?").as_deref(), Some("*IDN"));
        assert_eq!(group_of(":RUN").as_deref(), Some("RUN"));
        assert_eq!(group_of("?"), None);
    }

    #[test]
    fn test_node_matches_short_and_long_forms() {
        assert!(node_matches("SYST", "SYSTem"));
        assert!(node_matches("system", "SYSTem"));
        assert!(node_matches("SYSTE", "SYSTem"));
        assert!(!node_matches("SYS", "SYSTem"));
        assert!(!node_matches("SYSTEMS", "SYSTem"));
        assert!(node_matches("MMEM2", "MMEMory"));
        assert!(node_matches("*RST", "*RST"));
        assert!(!node_matches("*RSTX", "*RST"));
    }

    #[test]
    fn test_header_patterns_match_every_keyword_form() {
        let patterns = HeaderPatterns::new(&[":WAVeform:DATA", ":DISPlay:DATA"]);
        for command in [
            ":WAV:DATA?",
            ":WAVE:DATA?",
            ":WAVeform:DATA?",
            "wav:data?",
            ":DISP:DATA?",
            ":DISPLAY:DATA? ON",
        ] {
            assert!(patterns.matches(command), "{} should match", command);
        }
        for command in [":WAV:FORM?", ":WAV:DAT?", ":DISP:GRAD:TIME?", ":MATH1:DISP?"] {
            assert!(!patterns.matches(command), "{} should not match", command);
        }
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn test_load_prefers_baseline_on_duplicates() {
        let dir = TempDir::new().unwrap();
        let baseline = dir.path().join("baseline.txt");
        let learned = dir.path().join("learned.txt");
        write_file(&baseline, &["# shipped list", ":CHAN1:SCAL?", "", ":TIM:SCAL?"]);
        write_file(&learned, &[":chan1:scal?", ":MATH1:OPER?"]);

        let catalog = Catalog::load(identity("SN1"), &baseline, &learned).unwrap();
        assert_eq!(catalog.len(), 3);

        let chan: Vec<_> = catalog
            .entries()
            .filter(|e| e.normalized() == ":CHAN1:SCAL?")
            .collect();
        assert_eq!(chan.len(), 1);
        assert_eq!(chan[0].provenance(), Provenance::Baseline);
        assert_eq!(catalog.learned().len(), 1);
    }

    #[test]
    fn test_load_without_learned_file() {
        let dir = TempDir::new().unwrap();
        let baseline = dir.path().join("baseline.txt");
        write_file(&baseline, &[":CHAN1:SCAL?"]);
        let catalog = Catalog::load(identity("SN1"), &baseline, &dir.path().join("nope")).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_load_requires_baseline() {
        let dir = TempDir::new().unwrap();
        let err = Catalog::load(
            identity("SN1"),
            &dir.path().join("missing.txt"),
            &dir.path().join("learned.txt"),
        )
        .unwrap_err();
        assert!(matches!(err, DoomError::CatalogNotFound(_)));
    }

    #[test]
    fn test_filter_by_group() {
        let catalog = Catalog::in_memory(
            identity("SN1"),
            &[":MATH1:DISP?", ":MATH1:OPER?", ":CHANnel1:SCALe?", ":MATH2:DISP?", "*IDN?"],
        );
        assert_eq!(catalog.filter_by_group("math1").count(), 2);
        assert_eq!(catalog.filter_by_group("MATH").count(), 3);
        assert_eq!(catalog.filter_by_group(":chan").count(), 1);
        assert_eq!(catalog.filter_by_group("BUS1").count(), 0);
    }

    #[test]
    fn test_confirm_learned_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let baseline = dir.path().join("baseline.txt");
        write_file(&baseline, &[":CHAN1:SCAL?"]);
        let id = identity("SN1");
        let mut catalog = Catalog::open(id.clone(), &baseline, dir.path()).unwrap();

        let entry = CommandEntry::learned(":MATH1:GRADing?");
        assert_eq!(catalog.confirm_learned(&entry, &id).unwrap(), Confirmation::Added);
        let latest = catalog.store().unwrap().latest_path().to_path_buf();
        let snapshot = catalog.store().unwrap().snapshot_path().to_path_buf();
        assert_eq!(line_count(&latest), 1);

        let again = CommandEntry::learned(":math1:grading?");
        assert_eq!(
            catalog.confirm_learned(&again, &id).unwrap(),
            Confirmation::AlreadyKnown
        );
        assert_eq!(line_count(&latest), 1);
        assert_eq!(line_count(&snapshot), 1);
    }

    #[test]
    fn test_confirm_learned_skips_baseline_commands() {
        let dir = TempDir::new().unwrap();
        let baseline = dir.path().join("baseline.txt");
        write_file(&baseline, &[":CHAN1:SCAL?"]);
        let id = identity("SN1");
        let mut catalog = Catalog::open(id.clone(), &baseline, dir.path()).unwrap();

        let entry = CommandEntry::learned(":CHAN1:SCAL?");
        assert_eq!(
            catalog.confirm_learned(&entry, &id).unwrap(),
            Confirmation::AlreadyKnown
        );
        assert!(!catalog.store().unwrap().latest_path().exists());
    }

    #[test]
    fn test_learned_sets_are_isolated_per_device() {
        let dir = TempDir::new().unwrap();
        let baseline = dir.path().join("baseline.txt");
        write_file(&baseline, &[":CHAN1:SCAL?"]);
        let scope_a = identity("SN-A");
        let scope_b = identity("SN-B");

        let mut catalog_a = Catalog::open(scope_a.clone(), &baseline, dir.path()).unwrap();
        catalog_a
            .confirm_learned(&CommandEntry::learned(":BUS1:MODE?"), &scope_a)
            .unwrap();

        let mut catalog_b = Catalog::open(scope_b.clone(), &baseline, dir.path()).unwrap();
        assert!(!catalog_b.contains(":BUS1:MODE?"));

        let err = catalog_b
            .confirm_learned(&CommandEntry::learned(":BUS2:MODE?"), &scope_a)
            .unwrap_err();
        assert!(matches!(err, DoomError::IdentityMismatch { .. }));
        assert_eq!(catalog_a.learned().len(), 1);

        let reopened = Catalog::open(scope_a, &baseline, dir.path()).unwrap();
        assert!(reopened.contains(":bus1:mode?"));
    }

    #[test]
    fn test_refresh_learned_picks_up_other_sessions() {
        let dir = TempDir::new().unwrap();
        let baseline = dir.path().join("baseline.txt");
        write_file(&baseline, &[":CHAN1:SCAL?"]);
        let id = identity("SN1");

        let mut first = Catalog::open(id.clone(), &baseline, dir.path()).unwrap();
        let mut second = Catalog::open(id.clone(), &baseline, dir.path()).unwrap();
        first
            .confirm_learned(&CommandEntry::learned(":TRIG:MODE?"), &id)
            .unwrap();

        assert!(!second.contains(":TRIG:MODE?"));
        assert_eq!(second.refresh_learned().unwrap(), 1);
        assert!(second.contains(":TRIG:MODE?"));
    }

    #[test]
    fn test_probe_string_fills_placeholders() {
        let entry = CommandEntry::baseline(":CHAN<n>:DISP <e>");
        assert!(entry.is_parameterized());
        assert_eq!(entry.probe_string(), ":CHAN1:DISP ON");
        assert_eq!(entry.group(), Some("CHAN<n>"));
    }
}
