//! Error handling for Malt.
//!
//! The error system is built around two types:
//! - [`MaltError`] - strongly-typed error variants for every failure mode in
//!   the engine, from dependency resolution through bottle installation and
//!   acceptance testing
//! - [`ErrorContext`] - a wrapper that adds a user-friendly message and an
//!   actionable suggestion for CLI display
//!
//! # Error categories
//!
//! - **Resolution**: [`MaltError::DependencyCycle`], [`MaltError::UnsupportedPlatform`],
//!   [`MaltError::FormulaNotFound`] - detected before any fetch or build side effect
//! - **Fetching**: [`MaltError::NetworkError`] (retried with backoff, then fatal),
//!   [`MaltError::ChecksumMismatch`] (fatal, never retried)
//! - **Building**: [`MaltError::BuildStepFailure`] (fail-fast per formula,
//!   captures the external command's exit status and output tail)
//! - **Testing**: [`MaltError::TestAssertionFailure`] (reported, never reverts
//!   a successful install)
//!
//! Each fatal category maps to a distinct process exit code via
//! [`MaltError::exit_code`], so scripts can distinguish a checksum failure
//! from a dependency cycle without parsing stderr.

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// The main error type for Malt operations.
///
/// Variants carry enough context to name the offending formula and the
/// failing step; `user_friendly_error` turns them into colored, suggestion
/// bearing CLI output.
#[derive(Error, Debug)]
pub enum MaltError {
    /// No formula file with the requested name exists in the formula directory.
    #[error("Formula '{name}' not found")]
    FormulaNotFound {
        /// Name of the formula that could not be found
        name: String,
    },

    /// A formula file exists but could not be parsed.
    #[error("Invalid formula file syntax in {file}")]
    FormulaParseError {
        /// Path to the formula file that failed to parse
        file: String,
        /// Specific reason for the parsing failure
        reason: String,
    },

    /// The dependency graph contains a cycle.
    ///
    /// Resolution fails before any fetch or build step runs. The chain
    /// shows the full cycle, e.g. `a -> b -> c -> a`.
    #[error("Dependency cycle detected: {chain}")]
    DependencyCycle {
        /// String representation of the dependency cycle
        chain: String,
    },

    /// The host does not satisfy a formula's minimum platform requirement.
    ///
    /// Detected during resolution, before any network or filesystem side
    /// effect occurs.
    #[error("Formula '{formula}' requires {requirement}, host is {host}")]
    UnsupportedPlatform {
        /// Formula whose requirement is unmet
        formula: String,
        /// The declared platform requirement
        requirement: String,
        /// Description of the host platform
        host: String,
    },

    /// A fetched resource's bytes do not match the declared checksum.
    ///
    /// Never retried: a mismatch may indicate tampered content, and
    /// unverified content is never consumed by any subsequent step.
    #[error("Checksum mismatch for '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Name of the resource with the mismatch
        name: String,
        /// The declared checksum
        expected: String,
        /// The checksum computed from the fetched bytes
        actual: String,
    },

    /// A network operation failed after exhausting its retry budget.
    #[error("Network error fetching '{url}': {reason}")]
    NetworkError {
        /// URL of the failed fetch
        url: String,
        /// Reason for the final failure
        reason: String,
    },

    /// An external command in an install recipe exited nonzero.
    ///
    /// Aborts the remaining recipe for the formula (fail-fast). Carries the
    /// tail of the command's combined output for diagnostics.
    #[error("Build step failed for '{formula}': `{command}` exited with {status}")]
    BuildStepFailure {
        /// Formula whose recipe failed
        formula: String,
        /// The command line that failed
        command: String,
        /// Exit status description (code or signal)
        status: String,
        /// Tail of the captured stdout/stderr
        output_tail: String,
    },

    /// An external command could not be spawned at all.
    #[error("Command '{command}' not found in PATH")]
    CommandNotFound {
        /// Name of the missing executable
        command: String,
    },

    /// A test step or assertion failed after a successful install.
    ///
    /// The install is kept; the run is reported as "installed, tests failed".
    #[error("Test failed for '{formula}': {reason}")]
    TestAssertionFailure {
        /// Formula whose test recipe failed
        formula: String,
        /// Which step or assertion failed
        reason: String,
    },

    /// The run was cancelled because another formula failed in strict mode.
    #[error("Build of '{formula}' cancelled")]
    Cancelled {
        /// Formula whose work was cancelled
        formula: String,
    },

    /// Configuration file problem.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the configuration error
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerError(#[from] toml::ser::Error),
}

impl MaltError {
    /// Map this error to the process exit code documented for the CLI.
    ///
    /// - 0: success (never produced here)
    /// - 1: generic build failure
    /// - 2: checksum verification failure
    /// - 3: unmet platform requirement
    /// - 4: dependency cycle
    /// - 5: test assertion failure (build succeeded)
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ChecksumMismatch { .. } => 2,
            Self::UnsupportedPlatform { .. } => 3,
            Self::DependencyCycle { .. } => 4,
            Self::TestAssertionFailure { .. } => 5,
            _ => 1,
        }
    }
}

/// Error wrapper providing user-friendly messages and recovery suggestions.
///
/// Used by the CLI to display errors with helpful context rather than raw
/// debug output.
pub struct ErrorContext {
    /// The underlying error
    pub error: anyhow::Error,
    /// Optional suggestion for how to resolve the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context from any error type.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: error.into(),
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add additional details about the error.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Display the error to stderr with colors and formatting.
    pub fn display(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self.error);

        if let Some(ref details) = self.details {
            eprintln!("\n{} {}", "Details:".yellow().bold(), details);
        }

        if let Some(ref suggestion) = self.suggestion {
            eprintln!("\n{} {}", "Suggestion:".green().bold(), suggestion);
        }
    }

    /// Exit code appropriate for the wrapped error.
    pub fn exit_code(&self) -> i32 {
        self.error.downcast_ref::<MaltError>().map_or(1, MaltError::exit_code)
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;
        if let Some(ref details) = self.details {
            write!(f, "\nDetails: {details}")?;
        }
        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorContext")
            .field("error", &self.error)
            .field("suggestion", &self.suggestion)
            .field("details", &self.details)
            .finish()
    }
}

/// Convert any error into a user-friendly [`ErrorContext`] with contextual
/// suggestions for the known [`MaltError`] variants.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    let Some(malt_error) = error.downcast_ref::<MaltError>() else {
        return ErrorContext::new(error);
    };

    let suggestion = match malt_error {
        MaltError::FormulaNotFound { .. } => {
            Some("Check the formula name, or point --formula-dir at the directory containing your formula files".to_string())
        }
        MaltError::FormulaParseError { file, .. } => {
            Some(format!("Fix the TOML syntax in {file} and retry"))
        }
        MaltError::DependencyCycle { .. } => {
            Some("Remove one of the dependency edges shown in the cycle".to_string())
        }
        MaltError::UnsupportedPlatform { .. } => {
            Some("This formula cannot be built on the current host".to_string())
        }
        MaltError::ChecksumMismatch { .. } => Some(
            "The downloaded content does not match the formula's declared checksum. \
             Verify the formula's URL and sha256; do not bypass this check"
                .to_string(),
        ),
        MaltError::NetworkError { .. } => {
            Some("Check your internet connection and retry".to_string())
        }
        MaltError::BuildStepFailure { .. } => {
            Some("Inspect the captured output above; rerun with --verbose for the full build log".to_string())
        }
        MaltError::CommandNotFound { command } => {
            Some(format!("Install '{command}' and ensure it is in your PATH"))
        }
        MaltError::TestAssertionFailure { .. } => Some(
            "The formula was installed but its acceptance test failed; the keg was kept"
                .to_string(),
        ),
        _ => None,
    };

    let details = match malt_error {
        MaltError::BuildStepFailure { output_tail, .. } if !output_tail.is_empty() => {
            Some(output_tail.clone())
        }
        _ => None,
    };

    let mut ctx = ErrorContext::new(error);
    if let Some(d) = details {
        ctx = ctx.with_details(d);
    }
    if let Some(s) = suggestion {
        ctx = ctx.with_suggestion(s);
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_match_cli_contract() {
        let checksum = MaltError::ChecksumMismatch {
            name: "aom".into(),
            expected: "sha256:aa".into(),
            actual: "sha256:bb".into(),
        };
        assert_eq!(checksum.exit_code(), 2);

        let platform = MaltError::UnsupportedPlatform {
            formula: "ffmpeg".into(),
            requirement: "macos >= 10.12".into(),
            host: "macos 10.11".into(),
        };
        assert_eq!(platform.exit_code(), 3);

        let cycle = MaltError::DependencyCycle {
            chain: "a -> b -> a".into(),
        };
        assert_eq!(cycle.exit_code(), 4);

        let test = MaltError::TestAssertionFailure {
            formula: "aom".into(),
            reason: "file missing".into(),
        };
        assert_eq!(test.exit_code(), 5);

        let build = MaltError::BuildStepFailure {
            formula: "aom".into(),
            command: "make install".into(),
            status: "exit code 2".into(),
            output_tail: String::new(),
        };
        assert_eq!(build.exit_code(), 1);
    }

    #[test]
    fn test_user_friendly_error_preserves_exit_code() {
        let err = MaltError::DependencyCycle {
            chain: "x -> y -> x".into(),
        };
        let ctx = user_friendly_error(anyhow::Error::from(err));
        assert_eq!(ctx.exit_code(), 4);
        assert!(ctx.suggestion.is_some());
    }

    #[test]
    fn test_build_failure_carries_output_tail() {
        let err = MaltError::BuildStepFailure {
            formula: "aom".into(),
            command: "cmake ..".into(),
            status: "exit code 1".into(),
            output_tail: "CMake Error: missing yasm".into(),
        };
        let ctx = user_friendly_error(anyhow::Error::from(err));
        assert_eq!(ctx.details.as_deref(), Some("CMake Error: missing yasm"));
    }
}
