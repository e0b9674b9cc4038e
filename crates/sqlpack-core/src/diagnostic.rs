//! Diagnostic codes and status reporting
//!
//! IMPORTANT: Diagnostic codes are versioned and stable.
//! NEVER rename or remove codes - they are part of the public API.
//! Add new codes with new names only.

use serde::{Deserialize, Serialize};

/// Diagnostic code registry (v1)
///
/// These codes are STABLE and VERSIONED.
/// Do NOT rename or remove codes - only add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Registry state (1xxx)
    /// Change is in the plan but has no registry entry
    RegistryPendingChange,

    /// Recorded script hash differs from the current deploy script
    RegistryHashMismatch,

    /// Registry entry exists for a change no longer present in the plan
    RegistryUnknownChange,

    // Plan compilation (2xxx)
    /// Two modules define the same change name with different scripts
    PlanNameConflict,

    /// A require references a change that cannot be found
    PlanDanglingRequire,

    // Verification (3xxx)
    /// Verify script failed for a deployed change
    VerifyFailed,

    // General warnings (9xxx)
    /// General informational message
    Info,

    /// General warning message
    Warning,
}

impl DiagnosticCode {
    /// Get the diagnostic code as a stable string identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistryPendingChange => "REGISTRY_PENDING_CHANGE",
            Self::RegistryHashMismatch => "REGISTRY_HASH_MISMATCH",
            Self::RegistryUnknownChange => "REGISTRY_UNKNOWN_CHANGE",
            Self::PlanNameConflict => "PLAN_NAME_CONFLICT",
            Self::PlanDanglingRequire => "PLAN_DANGLING_REQUIRE",
            Self::VerifyFailed => "VERIFY_FAILED",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational message
    Info,

    /// Warning - should be reviewed but not blocking
    Warn,

    /// Error - blocking issue that should fail CI
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Where a diagnostic points: a module and optionally one of its changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Module name
    pub module: String,

    /// Change name within the module plan
    pub change: Option<String>,

    /// Script or plan file path, when one is known
    pub file: Option<String>,
}

impl Location {
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            change: None,
            file: None,
        }
    }

    pub fn change(module: impl Into<String>, change: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            change: Some(change.into()),
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.change {
            Some(change) => write!(f, "{}:{}", self.module, change),
            None => write!(f, "{}", self.module),
        }
    }
}

/// A diagnostic message with structured metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable diagnostic code
    pub code: DiagnosticCode,

    /// Severity level
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Module/change the diagnostic is about
    pub location: Option<Location>,

    /// Expected value (for comparison diagnostics)
    pub expected: Option<String>,

    /// Actual value (for comparison diagnostics)
    pub actual: Option<String>,

    /// Operator guidance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with minimal fields
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            location: None,
            expected: None,
            actual: None,
            hint: None,
        }
    }

    /// Set the location
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set expected/actual values
    pub fn with_comparison(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    /// Attach operator guidance
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
