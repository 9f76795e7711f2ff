//! Server version parsing and ordering
//!
//! Version banners look like `8.0.36`, `5.7.44-log`, `10.11.6-MariaDB-1:10.11.6+maria~ubu2204`
//! or `5.7.25-TiDB-v7.1.0`. Only the leading numeric segments take part in
//! comparisons; everything after them is kept for display.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// A server version with numeric ordering
#[derive(Debug, Clone)]
pub struct ServerVersion {
    major: u32,
    minor: u32,
    patch: u32,
    raw: String,
}

impl ServerVersion {
    /// Build a version from numeric parts
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            raw: String::new(),
        }
    }

    /// Parse a version banner as returned by `SELECT @@GLOBAL.version`
    ///
    /// Anything after the first `:` is discarded. Missing segments are zero.
    pub fn parse(banner: &str) -> Result<Self> {
        let raw = banner.split(':').next().unwrap_or_default().trim();

        let mut parts = [0u32; 3];
        let mut seen = 0;
        for segment in raw.split('.').take(3) {
            let digits: &str = {
                let end = segment
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(segment.len());
                &segment[..end]
            };
            if digits.is_empty() {
                break;
            }
            parts[seen] = digits
                .parse()
                .map_err(|_| Error::Protocol(format!("version segment out of range: {}", banner)))?;
            seen += 1;
            if digits.len() != segment.len() {
                break;
            }
        }

        if seen == 0 {
            return Err(Error::Protocol(format!(
                "unrecognized server version: {:?}",
                banner
            )));
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            raw: raw.to_string(),
        })
    }

    /// Major version
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Minor version
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Patch version
    pub fn patch(&self) -> u32 {
        self.patch
    }

    /// Banner the version was parsed from (empty for [`ServerVersion::new`])
    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn key(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// Whether `low <= self < high`
    pub fn in_range(&self, low: &ServerVersion, high: &ServerVersion) -> bool {
        self >= low && self < high
    }
}

impl PartialEq for ServerVersion {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ServerVersion {}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        } else {
            f.write_str(&self.raw)
        }
    }
}

impl std::str::FromStr for ServerVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
