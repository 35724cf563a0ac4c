//! Startup failure diagnosis for stdio servers

pub mod classifier;

pub use classifier::{ErrorClassification, StartupCategory, StartupErrorClassifier, classify};
