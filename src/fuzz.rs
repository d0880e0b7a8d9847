//! Fuzz candidate generation.
//!
//! Candidates come from three strategies over the known catalog:
//! - parameter variants: `<n>`/`<e>` placeholders and trailing node indices
//!   (`CHANnel1` → `CHANnel7`) are replaced with random, often out-of-spec,
//!   values
//! - recombination: header nodes of different known commands are spliced
//!   together
//! - keyword mutation: one character of one node is inserted, deleted or
//!   substituted
//!
//! Only query forms are emitted, and every candidate is checked against the
//! [`Denylist`] before it leaves the generator.

use crate::catalog::{
    header_nodes, read_command_file, Catalog, CommandEntry, HeaderPatterns, ENUM_PLACEHOLDER,
    NUMERIC_PLACEHOLDER,
};
use crate::config::SKIP_PATTERNS;
use crate::error::DoomError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Commands that reset, erase or overwrite instrument state.
///
/// Mixed case follows SCPI notation: the upper-case part is the short form.
/// A candidate is blocked when its header starts with one of these, node by
/// node, in short form, long form or anything in between.
pub const DENYLIST: &[&str] = &[
    "*RST",
    "*RCL",
    "*SAV",
    "*PSC",
    "*PUD",
    "*CAL",
    "*TST",
    "*DDT",
    "*DMC",
    "*PCB",
    ":SYSTem:RESet",
    ":SYSTem:PRESet",
    ":SYSTem:SETup",
    ":SYSTem:DEFault",
    ":SYSTem:ERASe",
    ":SYSTem:CLEar",
    ":SYSTem:SECure",
    ":SYSTem:POWer",
    ":SYSTem:SHUTdown",
    ":SYSTem:REBoot",
    ":SYSTem:UPGRade",
    ":SYSTem:UPDate",
    ":SYSTem:OPTion",
    ":SYSTem:PASSword",
    ":SYSTem:LANGuage",
    ":CALibrate",
    ":SAVE",
    ":LOAD",
    ":RECall",
    ":STORage",
    ":MMEMory",
    ":DISK",
    ":LAN:APPLy",
    ":LAN:RESet",
    ":FIRMware",
];

/// Seed vocabulary for recombination, on top of the catalog's own nodes
const SEED_ROOTS: &[&str] = &[
    "CHANnel1", "MATH1", "BUS1", "TRIGger", "DISPlay", "WAVeform", "MEASure", "TIMebase", "SYSTem",
];

const SEED_LEAVES: &[&str] = &[
    "SCALe", "OFFSet", "COUPling", "STATus", "GRADing", "FORM", "SOURce", "OPERator", "MODE", "TYPE",
];

/// Numeric values worth probing: boundaries, powers of two, nonsense
const NUMERIC_PROBES: &[i64] = &[
    -1, 0, 1, 2, 3, 4, 5, 7, 8, 9, 10, 16, 32, 64, 99, 100, 255, 256, 1000, 4096, 65535, 65536,
    1_000_000,
];

/// Plausible-looking but possibly invalid enumerated tokens
const ENUM_TOKENS: &[&str] = &[
    "ON", "OFF", "1", "0", "AUTO", "NORMal", "MIN", "MAX", "ALL", "NONE", "CHAN1", "CHAN5", "MATH1",
    "DC", "AC", "GND", "XYZ",
];

/// Attempts to find a safe, non-empty candidate before giving up
const MAX_ATTEMPTS: usize = 256;

/// How a candidate was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateKind {
    /// Grammar mutation without a validated template behind it
    Mutation,
    /// Known command with substituted parameters or indices
    ParameterVariant,
}

/// A generated, unverified command string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzCandidate {
    pub command: String,
    pub source: Option<CommandEntry>,
    pub kind: CandidateKind,
}

impl FuzzCandidate {
    pub fn mutation(command: &str, source: Option<CommandEntry>) -> Self {
        Self {
            command: command.to_string(),
            source,
            kind: CandidateKind::Mutation,
        }
    }

    pub fn variant(command: &str, source: CommandEntry) -> Self {
        Self {
            command: command.to_string(),
            source: Some(source),
            kind: CandidateKind::ParameterVariant,
        }
    }

    /// Learned catalog entry for a confirmed candidate
    pub fn to_entry(&self) -> CommandEntry {
        CommandEntry::learned(&self.command)
    }
}

/// Fixed safety boundary for generated commands
#[derive(Debug, Clone)]
pub struct Denylist {
    patterns: HeaderPatterns,
}

impl Default for Denylist {
    fn default() -> Self {
        Self {
            patterns: HeaderPatterns::new(DENYLIST),
        }
    }
}

impl Denylist {
    /// Built-in denylist extended with an expert-maintained file.
    ///
    /// The file can only add entries; the built-in ones always apply.
    pub fn with_file(path: &Path) -> Result<Self, DoomError> {
        let mut denylist = Self::default();
        let extra = read_command_file(path)?;
        for command in &extra {
            denylist.patterns.add(command);
        }
        info!(
            "Denylist extended with {} entries from {} ({} total)",
            extra.len(),
            path.display(),
            denylist.len()
        );
        Ok(denylist)
    }

    fn len(&self) -> usize {
        self.patterns.len()
    }

    /// True when `command` must never be sent.
    pub fn blocks(&self, command: &str) -> bool {
        self.patterns.matches(command)
    }
}

/// Query form of a command: `:CHAN1:DISP ON` → `:CHAN1:DISP?`
fn to_query(command: &str) -> String {
    if command.contains('?') {
        return command.to_string();
    }
    let header = command.split_whitespace().next().unwrap_or(command);
    format!("{}?", header)
}

fn join_nodes(nodes: &[String]) -> String {
    format!(":{}?", nodes.join(":"))
}

/// Lazy stream of [`FuzzCandidate`]s
pub struct FuzzGenerator {
    sources: Vec<CommandEntry>,
    variant_sources: Vec<CommandEntry>,
    roots: Vec<String>,
    middles: Vec<String>,
    leaves: Vec<String>,
    denylist: Denylist,
    /// Binary-reply queries, never emitted
    skip: HeaderPatterns,
    rng: StdRng,
    seed: u64,
    limit: Option<usize>,
    emitted: usize,
}

impl FuzzGenerator {
    /// Generator over the grammar of `catalog`.
    ///
    /// Without a `seed` one is drawn from entropy; [`Self::seed`] reports it
    /// so the run can be replayed.
    pub fn new(catalog: &Catalog, denylist: Denylist, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random);
        let skip = HeaderPatterns::new(SKIP_PATTERNS);
        let sources: Vec<CommandEntry> = catalog
            .entries()
            .filter(|e| !denylist.blocks(e.template()) && !skip.matches(e.template()))
            .cloned()
            .collect();

        let variant_sources: Vec<CommandEntry> = sources
            .iter()
            .filter(|e| {
                e.is_parameterized()
                    || header_nodes(e.template())
                        .iter()
                        .any(|n| n.ends_with(|c: char| c.is_ascii_digit()))
            })
            .cloned()
            .collect();

        let mut roots: BTreeSet<String> = SEED_ROOTS.iter().map(|s| s.to_string()).collect();
        let mut middles = BTreeSet::new();
        let mut leaves: BTreeSet<String> = SEED_LEAVES.iter().map(|s| s.to_string()).collect();
        for entry in &sources {
            let nodes = header_nodes(entry.template());
            if nodes.len() < 2 || nodes.iter().any(|n| n.contains('<')) {
                continue;
            }
            roots.insert(nodes[0].clone());
            leaves.insert(nodes[nodes.len() - 1].clone());
            for middle in &nodes[1..nodes.len() - 1] {
                middles.insert(middle.clone());
            }
        }

        debug!(
            "Fuzz grammar: {} roots, {} middles, {} leaves, {} variant sources, seed {}",
            roots.len(),
            middles.len(),
            leaves.len(),
            variant_sources.len(),
            seed
        );

        Self {
            sources,
            variant_sources,
            roots: roots.into_iter().collect(),
            middles: middles.into_iter().collect(),
            leaves: leaves.into_iter().collect(),
            denylist,
            skip,
            rng: StdRng::seed_from_u64(seed),
            seed,
            limit: None,
            emitted: 0,
        }
    }

    /// Stop after `limit` candidates.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Replace the built-in skip patterns; matching sources are dropped.
    pub fn with_skip_patterns(mut self, skip: HeaderPatterns) -> Self {
        self.sources.retain(|e| !skip.matches(e.template()));
        self.variant_sources.retain(|e| !skip.matches(e.template()));
        self.skip = skip;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn numeric(&mut self) -> String {
        if self.rng.gen_bool(0.6) {
            NUMERIC_PROBES.choose(&mut self.rng).copied().unwrap_or(1).to_string()
        } else {
            self.rng.gen_range(-100_000i64..=100_000).to_string()
        }
    }

    fn token(&mut self) -> String {
        ENUM_TOKENS.choose(&mut self.rng).copied().unwrap_or("ON").to_string()
    }

    fn parameter_variant(&mut self) -> Option<FuzzCandidate> {
        let source = self.variant_sources.choose(&mut self.rng)?.clone();
        let mut command = source.template().to_string();

        while command.contains(NUMERIC_PLACEHOLDER) {
            let value = self.numeric();
            command = command.replacen(NUMERIC_PLACEHOLDER, &value, 1);
        }
        while command.contains(ENUM_PLACEHOLDER) {
            let value = self.token();
            command = command.replacen(ENUM_PLACEHOLDER, &value, 1);
        }

        let mut nodes = header_nodes(&command);
        let indexed: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.ends_with(|c: char| c.is_ascii_digit()))
            .map(|(i, _)| i)
            .collect();
        if let Some(&i) = indexed.choose(&mut self.rng) {
            let stem = nodes[i]
                .trim_end_matches(|c: char| c.is_ascii_digit())
                .to_string();
            let index = self.rng.gen_range(0..=16);
            nodes[i] = format!("{}{}", stem, index);
            let params = command
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim().to_string());
            let header = if command.contains('?') {
                join_nodes(&nodes)
            } else {
                format!(":{}", nodes.join(":"))
            };
            command = match params {
                Some(p) if !p.is_empty() => format!("{} {}", header, p),
                _ => header,
            };
        }

        Some(FuzzCandidate::variant(&to_query(&command), source))
    }

    fn recombination(&mut self) -> Option<FuzzCandidate> {
        let mut nodes = vec![self.roots.choose(&mut self.rng)?.clone()];
        if !self.middles.is_empty() && self.rng.gen_bool(0.3) {
            nodes.push(self.middles.choose(&mut self.rng)?.clone());
        }
        nodes.push(self.leaves.choose(&mut self.rng)?.clone());
        Some(FuzzCandidate::mutation(&join_nodes(&nodes), None))
    }

    fn keyword_mutation(&mut self) -> Option<FuzzCandidate> {
        let source = self.sources.choose(&mut self.rng)?.clone();
        let mut nodes = header_nodes(&source.probe_string());
        if nodes.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..nodes.len());
        let mut chars: Vec<char> = nodes[i].chars().collect();
        let letter = self.rng.gen_range(b'A'..=b'Z') as char;

        match self.rng.gen_range(0..3) {
            0 => {
                let at = self.rng.gen_range(0..=chars.len());
                chars.insert(at, letter);
            }
            1 if chars.len() > 1 => {
                let at = self.rng.gen_range(0..chars.len());
                chars.remove(at);
            }
            _ => {
                let at = self.rng.gen_range(0..chars.len());
                chars[at] = letter;
            }
        }
        nodes[i] = chars.into_iter().collect();

        let command = if nodes.len() == 1 && nodes[0].starts_with('*') {
            format!("{}?", nodes[0])
        } else {
            join_nodes(&nodes)
        };
        Some(FuzzCandidate::mutation(&command, Some(source)))
    }

    fn generate(&mut self) -> Option<FuzzCandidate> {
        let roll: f64 = self.rng.gen();
        let candidate = if roll < 0.4 && !self.variant_sources.is_empty() {
            self.parameter_variant()
        } else if roll < 0.8 || self.sources.is_empty() {
            self.recombination()
        } else {
            self.keyword_mutation()
        }?;
        let command = candidate.command.trim();
        if command.len() < 2 || header_nodes(command).is_empty() {
            return None;
        }
        Some(candidate)
    }
}

impl Iterator for FuzzGenerator {
    type Item = FuzzCandidate;

    fn next(&mut self) -> Option<FuzzCandidate> {
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return None;
        }
        for _ in 0..MAX_ATTEMPTS {
            let Some(candidate) = self.generate() else {
                continue;
            };
            if self.denylist.blocks(&candidate.command) {
                debug!("Denylisted candidate dropped: {}", candidate.command);
                continue;
            }
            if self.skip.matches(&candidate.command) {
                debug!("Binary-reply candidate dropped: {}", candidate.command);
                continue;
            }
            self.emitted += 1;
            return Some(candidate);
        }
        warn!(
            "No safe candidate after {} attempts; stopping generation",
            MAX_ATTEMPTS
        );
        None
    }
}
