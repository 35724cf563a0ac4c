//! Command validation
//!
//! Screens the command and arguments of a stdio server before anything is
//! spawned. The command is executed directly (never through a shell), so the
//! checks target the signals of an injection attempt:
//!
//! - shell metacharacters in the command itself
//! - bare shell operators, substitutions and control characters in arguments
//! - `..` traversal that escapes a configured root directory

use std::path::{Component, Path, PathBuf};

/// Characters never allowed in the command string
const COMMAND_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '\n', '\r', '\0'];

/// Characters never allowed anywhere in an argument
const ARGUMENT_FORBIDDEN_CHARACTERS: &[char] = &['`', '\n', '\r', '\0'];

/// Argument tokens that only make sense as shell control operators
const SHELL_OPERATOR_TOKENS: &[&str] = &[";", "&", "&&", "|", "||", ";;", "|&"];

/// Substitution openers that only a shell would expand
const SUBSTITUTION_OPENERS: &[&str] = &["$(", "${"];

/// Reasons a command is rejected before spawn
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Shell metacharacter {character:?} in {token:?}")]
    ShellMetacharacter { token: String, character: char },

    #[error("Shell operator {token:?} in argument list")]
    ShellOperator { token: String },

    #[error("Shell substitution {opener:?} in {token:?}")]
    Substitution { token: String, opener: &'static str },

    #[error("Path {token:?} escapes allowed root {root}")]
    PathTraversal { token: String, root: PathBuf },
}

impl ValidationError {
    /// The offending token
    pub fn token(&self) -> &str {
        match self {
            ValidationError::EmptyCommand => "",
            ValidationError::ShellMetacharacter { token, .. }
            | ValidationError::ShellOperator { token }
            | ValidationError::Substitution { token, .. }
            | ValidationError::PathTraversal { token, .. } => token,
        }
    }
}

/// Validates stdio server commands before spawn
#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    /// Root directory path-like tokens must not escape
    allowed_root: Option<PathBuf>,
}

impl CommandValidator {
    /// Create a validator without a root restriction
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a validator that rejects traversal outside `root`
    pub fn with_allowed_root(root: impl Into<PathBuf>) -> Self {
        Self {
            allowed_root: Some(normalize(&root.into())),
        }
    }

    pub fn allowed_root(&self) -> Option<&Path> {
        self.allowed_root.as_deref()
    }

    /// Validate a command and its arguments
    ///
    /// Either everything passes or the first offending token is reported.
    pub fn validate(&self, command: &str, args: &[String]) -> Result<(), ValidationError> {
        if command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand);
        }

        if let Some(character) = command.chars().find(|c| COMMAND_METACHARACTERS.contains(c)) {
            return Err(ValidationError::ShellMetacharacter {
                token: command.to_string(),
                character,
            });
        }

        for arg in args {
            Self::check_argument(arg)?;
        }

        if let Some(root) = &self.allowed_root {
            for token in std::iter::once(command).chain(args.iter().map(String::as_str)) {
                Self::check_traversal(root, token)?;
            }
        }

        Ok(())
    }

    fn check_argument(arg: &str) -> Result<(), ValidationError> {
        if SHELL_OPERATOR_TOKENS.contains(&arg.trim()) {
            return Err(ValidationError::ShellOperator {
                token: arg.to_string(),
            });
        }

        if let Some(character) = arg
            .chars()
            .find(|c| ARGUMENT_FORBIDDEN_CHARACTERS.contains(c))
        {
            return Err(ValidationError::ShellMetacharacter {
                token: arg.to_string(),
                character,
            });
        }

        if let Some(opener) = SUBSTITUTION_OPENERS.iter().copied().find(|o| arg.contains(o)) {
            return Err(ValidationError::Substitution {
                token: arg.to_string(),
                opener,
            });
        }

        Ok(())
    }

    fn check_traversal(root: &Path, token: &str) -> Result<(), ValidationError> {
        // Options like --dir=../x carry the path after '='
        let candidate = token.split_once('=').map_or(token, |(_, value)| value);
        let path = Path::new(candidate);

        if !path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Ok(());
        }

        let resolved = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&root.join(path))
        };

        if resolved.starts_with(root) {
            Ok(())
        } else {
            Err(ValidationError::PathTraversal {
                token: token.to_string(),
                root: root.to_path_buf(),
            })
        }
    }
}

/// Lexically normalize a path (no filesystem access)
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
