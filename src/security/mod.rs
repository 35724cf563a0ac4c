//! Pre-spawn security checks for stdio servers

pub mod validator;

pub use validator::{CommandValidator, ValidationError};
