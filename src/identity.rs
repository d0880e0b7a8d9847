//! Device identity keys derived from the `*IDN?` reply.

use crate::error::DoomError;
use crate::transport::Transport;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Namespace used by read-only modes when the device cannot identify itself
pub const GENERIC_NAMESPACE: &str = "generic";

/// Hex digits of the identity digest appended to every key
const DIGEST_HEX_LEN: usize = 8;

lazy_static! {
    static ref RE_UNSAFE: Regex = Regex::new(r"[^A-Za-z0-9_]+").unwrap();
    static ref RE_UNDERSCORES: Regex = Regex::new(r"_{2,}").unwrap();
}

/// Stable storage namespace for one physical instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceIdentity {
    key: String,
    /// Reported identification string, kept for log headers
    raw: String,
}

impl DeviceIdentity {
    /// Parse a `vendor,model,serial,firmware` identification reply.
    pub fn resolve(raw: &str) -> Result<Self, DoomError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DoomError::IdentityUnavailable(
                "empty identification string".to_string(),
            ));
        }

        let fields: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            return Err(DoomError::IdentityUnavailable(format!(
                "expected vendor,model,serial but got '{}'",
                trimmed
            )));
        }
        if fields[..3].iter().any(|f| f.is_empty()) {
            return Err(DoomError::IdentityUnavailable(format!(
                "blank vendor, model or serial in '{}'",
                trimmed
            )));
        }

        let stem = sanitize(&fields[..3].join("_"));
        let digest = Sha256::digest(fields[..3].join(",").as_bytes());
        let suffix = &hex::encode(digest)[..DIGEST_HEX_LEN];

        let key = if stem.is_empty() {
            suffix.to_string()
        } else {
            format!("{}_{}", stem, suffix)
        };

        Ok(Self {
            key,
            raw: trimmed.to_string(),
        })
    }

    /// Ask the device who it is.
    pub fn query(transport: &mut impl Transport, timeout: Duration) -> Result<Self, DoomError> {
        let raw = transport
            .identify(timeout)
            .map_err(|e| DoomError::IdentityUnavailable(e.to_string()))?;
        Self::resolve(&raw)
    }

    /// Shared namespace for read-only sessions against unidentified devices.
    pub fn generic() -> Self {
        Self {
            key: GENERIC_NAMESPACE.to_string(),
            raw: String::new(),
        }
    }

    /// Resolve for read-only modes, falling back to [`Self::generic`].
    pub fn query_or_generic(transport: &mut impl Transport, timeout: Duration) -> Self {
        match Self::query(transport, timeout) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(
                    "{}; using shared '{}' namespace for this read-only session",
                    e, GENERIC_NAMESPACE
                );
                Self::generic()
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_generic(&self) -> bool {
        self.key == GENERIC_NAMESPACE
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Replace unsafe characters with `_`, collapse runs, trim the ends.
fn sanitize(input: &str) -> String {
    let replaced = RE_UNSAFE.replace_all(input, "_");
    let collapsed = RE_UNDERSCORES.replace_all(&replaced, "_");
    collapsed.trim_matches('_').to_string()
}
