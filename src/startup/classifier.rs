//! Startup failure classification
//!
//! Looks at what a server printed before the handshake (and how it exited)
//! to tell "never became a valid server" apart from a protocol failure.
//! Matchers run in a fixed order; the first hit wins.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, error};

/// Longest evidence excerpt kept
const MAX_EVIDENCE_CHARS: usize = 200;

/// Why a server failed to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartupCategory {
    MissingEnvVar,
    UsageError,
    PackageNotFound,
    CommandNotFound,
    Generic,
    /// Nothing recognizable
    #[serde(rename = "none")]
    Unclassified,
}

impl StartupCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartupCategory::MissingEnvVar => "missing-env-var",
            StartupCategory::UsageError => "usage-error",
            StartupCategory::PackageNotFound => "package-not-found",
            StartupCategory::CommandNotFound => "command-not-found",
            StartupCategory::Generic => "generic",
            StartupCategory::Unclassified => "none",
        }
    }
}

impl fmt::Display for StartupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying pre-handshake output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    pub category: StartupCategory,
    /// Line that triggered the match
    pub evidence: Option<String>,
    /// What the user should do about it
    pub remediation: Option<String>,
}

impl ErrorClassification {
    pub fn unclassified() -> Self {
        Self {
            category: StartupCategory::Unclassified,
            evidence: None,
            remediation: None,
        }
    }

    fn new(category: StartupCategory, evidence: String, remediation: String) -> Self {
        Self {
            category,
            evidence: Some(evidence),
            remediation: Some(remediation),
        }
    }

    pub fn is_classified(&self) -> bool {
        self.category != StartupCategory::Unclassified
    }
}

/// Compiled matchers
#[derive(Debug, Clone)]
pub struct StartupErrorClassifier {
    env_var_patterns: Vec<Regex>,
    usage_regex: Regex,
    package_regex: Regex,
    command_regex: Regex,
    generic_regex: Regex,
}

impl StartupErrorClassifier {
    /// Create a classifier with compiled regex patterns
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            env_var_patterns: vec![
                // GITHUB_TOKEN environment variable is required
                Regex::new(
                    r"\b([A-Z][A-Z0-9_]*)\s+(?i:environment\s+variable|env\s+var(?:iable)?)\s+(?i:is\s+)?(?i:required|not\s+set|missing|must\s+be\s+set|undefined)",
                )?,
                // Environment variable "API_KEY" is not set
                Regex::new(
                    r#"(?i:environment\s+variable|env\s+var(?:iable)?)\s+["'`]?([A-Z][A-Z0-9_]*)["'`]?\s+(?i:is\s+)?(?i:required|not\s+set|missing|must\s+be\s+set|undefined)"#,
                )?,
                // Missing required environment variable: DATABASE_URL
                Regex::new(
                    r#"(?i:missing|required|set\s+the)\s+(?i:required\s+)?(?i:environment\s+variables?|env\s+var(?:iable)?s?)\s*:?\s+["'`]?([A-Z][A-Z0-9_]*)"#,
                )?,
            ],

            // Usage: mcp-server-filesystem <allowed-directory> [...]
            usage_regex: Regex::new(r"(?m)^\s*(?i:usage):\s*(\S+)")?,

            // npm ERR! 404 Not Found - GET https://registry.npmjs.org/@scope%2fmissing
            package_regex: Regex::new(
                r"(?i)(npm\s+ERR!\s+(?:code\s+E404|404)|\b404\s+Not\s+Found\b|is\s+not\s+in\s+(?:this|the\s+npm)\s+registry|No\s+matching\s+distribution\s+found|Could\s+not\s+find\s+a\s+version\s+that\s+satisfies|Cannot\s+find\s+module|ModuleNotFoundError|No\s+module\s+named)",
            )?,

            // sh: 1: mcp-server: not found / env: 'uvx': No such file or directory /
            // exec: "uvx": executable file not found in $PATH
            command_regex: Regex::new(
                r"(?im)(executable\s+file\s+not\s+found|command\s+not\s+found|is\s+not\s+recognized\s+as\s+an\s+internal\s+or\s+external\s+command|^\S+: (?:\d+: )?\S+: (?:not\s+found|No\s+such\s+file\s+or\s+directory)\s*$)",
            )?,

            // Error: ..., fatal: ..., panic: ..., Traceback (most recent call last):
            generic_regex: Regex::new(r"(?m)^\s*(?i:error|fatal|panic|traceback)\b")?,
        })
    }

    /// Classify pre-handshake output
    ///
    /// `exit_code` is `None` while the process is still running (or was
    /// killed by a signal); only the first three matchers apply then.
    pub fn classify(&self, exit_code: Option<i32>, early_output: &str) -> ErrorClassification {
        let failed = exit_code.is_some_and(|code| code != 0);

        for pattern in &self.env_var_patterns {
            if let Some(captures) = pattern.captures(early_output)
                && let (Some(whole), Some(name)) = (captures.get(0), captures.get(1))
            {
                return ErrorClassification::new(
                    StartupCategory::MissingEnvVar,
                    line_at(early_output, whole.start()),
                    format!(
                        "Set the {} environment variable in the server's env configuration",
                        name.as_str()
                    ),
                );
            }
        }

        if let Some(captures) = self.usage_regex.captures(early_output)
            && let (Some(whole), Some(program)) = (captures.get(0), captures.get(1))
        {
            return ErrorClassification::new(
                StartupCategory::UsageError,
                line_at(early_output, whole.start()),
                format!(
                    "{} printed its usage text; check the arguments in the server configuration",
                    program.as_str()
                ),
            );
        }

        if let Some(found) = self.package_regex.find(early_output) {
            return ErrorClassification::new(
                StartupCategory::PackageNotFound,
                line_at(early_output, found.start()),
                "A package the server needs could not be found; check the package name or install the dependency".to_string(),
            );
        }

        if !failed {
            return ErrorClassification::unclassified();
        }

        if let Some(found) = self.command_regex.find(early_output) {
            return ErrorClassification::new(
                StartupCategory::CommandNotFound,
                line_at(early_output, found.start()),
                "The server command or one of its helpers is not installed or not on PATH".to_string(),
            );
        }

        if let Some(found) = self.generic_regex.find(early_output) {
            return ErrorClassification::new(
                StartupCategory::Generic,
                line_at(early_output, found.start()),
                "The server exited with an error before the handshake; see the evidence for details".to_string(),
            );
        }

        ErrorClassification::unclassified()
    }
}

static CLASSIFIER: LazyLock<Option<StartupErrorClassifier>> =
    LazyLock::new(|| match StartupErrorClassifier::new() {
        Ok(classifier) => Some(classifier),
        Err(e) => {
            error!("Failed to compile startup classifier patterns: {}", e);
            None
        }
    });

/// Classify with the shared compiled classifier
pub fn classify(exit_code: Option<i32>, early_output: &str) -> ErrorClassification {
    let classification = CLASSIFIER
        .as_ref()
        .map(|classifier| classifier.classify(exit_code, early_output))
        .unwrap_or_else(ErrorClassification::unclassified);
    debug!(
        "Startup classification: {} (exit code {:?})",
        classification.category, exit_code
    );
    classification
}

/// The trimmed line containing byte offset `at`, capped for display
fn line_at(text: &str, at: usize) -> String {
    let start = text[..at].rfind('\n').map_or(0, |i| i + 1);
    let end = text[at..].find('\n').map_or(text.len(), |i| at + i);
    let line = text[start..end].trim();

    if line.chars().count() <= MAX_EVIDENCE_CHARS {
        line.to_string()
    } else {
        let mut cut: String = line.chars().take(MAX_EVIDENCE_CHARS).collect();
        cut.push('…');
        cut
    }
}
