//! Host platform introspection and platform gating.
//!
//! Formulas and their dependencies can be gated on the host platform: an OS
//! family, a minimum OS version, or both. Bottles are keyed by a platform
//! tag (e.g. `mojave`, `x86_64_linux`). This module provides the host facts
//! ([`HostPlatform`]) those checks run against and the gate type
//! ([`PlatformGate`]) the formula schema deserializes into.
//!
//! Resolution evaluates gates exactly once, before any fetch or build side
//! effect; an unmet formula-level requirement is a fatal
//! [`UnsupportedPlatform`](crate::core::MaltError::UnsupportedPlatform).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operating system family recognized by platform gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Apple macOS
    Macos,
    /// Linux distributions
    Linux,
    /// Microsoft Windows
    Windows,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Macos => write!(f, "macos"),
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

/// A `major.minor` OS version.
///
/// Formula platform gates use OS product versions (e.g. macOS `10.14`),
/// which are not semver; a two-component ordered pair is sufficient for
/// minimum-version comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformVersion {
    /// Major version component
    pub major: u32,
    /// Minor version component
    pub minor: u32,
}

impl PlatformVersion {
    /// Create a version from its components.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PlatformVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid platform version: {s}"))?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| format!("invalid platform version: {s}"))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for PlatformVersion {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PlatformVersion> for String {
    fn from(v: PlatformVersion) -> Self {
        v.to_string()
    }
}

/// Facts about the host the engine is running on.
///
/// Immutable for the duration of a run. Tests construct these directly to
/// exercise platform gating without depending on the build machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatform {
    /// Operating system family
    pub os: OsFamily,
    /// OS product version
    pub version: PlatformVersion,
    /// CPU architecture (e.g. `x86_64`, `arm64`)
    pub arch: String,
    /// Bottle platform tag this host accepts (e.g. `mojave`, `x86_64_linux`)
    pub bottle_tag: String,
}

impl HostPlatform {
    /// Construct a host description explicitly. Primarily used by tests and
    /// by callers that want to evaluate gates for a foreign platform.
    pub fn new(
        os: OsFamily,
        version: PlatformVersion,
        arch: impl Into<String>,
        bottle_tag: impl Into<String>,
    ) -> Self {
        Self {
            os,
            version,
            arch: arch.into(),
            bottle_tag: bottle_tag.into(),
        }
    }

    /// Detect the current host.
    ///
    /// The bottle tag is `<arch>_<os>` except on macOS where the product
    /// version is included, matching the tags bottle tables are keyed by.
    pub fn detect() -> Self {
        let os = if cfg!(target_os = "macos") {
            OsFamily::Macos
        } else if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        };
        let arch = std::env::consts::ARCH.to_string();
        let version = Self::detect_version(os);
        let bottle_tag = match os {
            OsFamily::Macos => format!("{arch}_macos_{}_{}", version.major, version.minor),
            _ => format!("{arch}_{os}"),
        };
        Self {
            os,
            version,
            arch,
            bottle_tag,
        }
    }

    fn detect_version(os: OsFamily) -> PlatformVersion {
        match os {
            OsFamily::Macos => {
                // sw_vers is present on every macOS installation
                if let Ok(output) = std::process::Command::new("sw_vers")
                    .arg("-productVersion")
                    .output()
                    && output.status.success()
                    && let Some(v) = leading_version(String::from_utf8_lossy(&output.stdout).trim())
                {
                    return v;
                }
            }
            OsFamily::Linux => {
                // Kernel release, e.g. "6.1.0-13-amd64"; the leading
                // major.minor is what minimum-version gates compare against.
                if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease")
                    && let Some(v) = leading_version(release.trim())
                {
                    return v;
                }
            }
            OsFamily::Windows => {
                // `ver` prints "Microsoft Windows [Version 10.0.22631.1]".
                if let Ok(output) = std::process::Command::new("cmd").args(["/C", "ver"]).output()
                    && output.status.success()
                    && let Some(v) = leading_version(String::from_utf8_lossy(&output.stdout).trim())
                {
                    return v;
                }
            }
        }
        PlatformVersion::new(0, 0)
    }

    /// One-line human description used in error messages.
    pub fn describe(&self) -> String {
        format!("{} {} ({})", self.os, self.version, self.arch)
    }
}

/// Extract the first `major[.minor]` pair from a version string that may
/// carry extra components or suffixes ("6.1.0-13-amd64", "14.6.1",
/// "Microsoft Windows [Version 10.0.22631.1]").
fn leading_version(s: &str) -> Option<PlatformVersion> {
    let mut parts = s.split(|c: char| !c.is_ascii_digit()).filter(|p| !p.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some(PlatformVersion::new(major, minor))
}

/// A conditional platform requirement attached to a formula, a dependency,
/// or an install step.
///
/// Empty gates (no fields set) are always satisfied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformGate {
    /// Required OS family, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsFamily>,
    /// Minimum OS version, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<PlatformVersion>,
}

impl PlatformGate {
    /// Evaluate this gate against the host. Evaluated once per use site,
    /// never re-checked mid-recipe.
    pub fn satisfied_by(&self, host: &HostPlatform) -> bool {
        if let Some(os) = self.os
            && os != host.os
        {
            return false;
        }
        if let Some(min) = self.min_version
            && host.version < min
        {
            return false;
        }
        true
    }

    /// Whether this gate imposes any constraint at all.
    pub fn is_empty(&self) -> bool {
        self.os.is_none() && self.min_version.is_none()
    }
}

impl fmt::Display for PlatformGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.os, self.min_version) {
            (Some(os), Some(min)) => write!(f, "{os} >= {min}"),
            (Some(os), None) => write!(f, "{os}"),
            (None, Some(min)) => write!(f, "version >= {min}"),
            (None, None) => write!(f, "any platform"),
        }
    }
}
