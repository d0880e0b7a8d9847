//! SCPI Doom - command-surface discovery for SCPI instruments
//!
//! Probes an instrument over a request/reply channel, classifies every
//! reply and grows a learned command catalog that is scoped to the exact
//! device that confirmed each command.
//!
//! # Modes
//! - test: probe the whole catalog (baseline + this device's learned set)
//! - group: probe the entries of one header group, e.g. `MATH1`
//! - fuzz: probe generated candidates and report what answers
//! - learn: fuzz and persist newly confirmed commands for this device
//!
//! Probing is strictly sequential per device; see [`runner::Prober`].

pub mod catalog;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fuzz;
pub mod identity;
pub mod learner;
pub mod report;
pub mod runner;
pub mod transport;

pub use catalog::{Catalog, CommandEntry, Confirmation, HeaderPatterns, Provenance};
pub use classifier::{classify, Outcome, Reply};
pub use config::ProbeConfig;
pub use error::{DoomError, TransportError};
pub use fuzz::{CandidateKind, Denylist, FuzzCandidate, FuzzGenerator};
pub use identity::DeviceIdentity;
pub use report::{ProbeResult, SessionReport};
pub use runner::{Prober, SessionLimits};
pub use transport::{Response, TcpTransport, Transport};
