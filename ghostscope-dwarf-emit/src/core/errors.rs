//! Error types for the DWARF emission library

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum EmitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DWARF write error: {0}")]
    Write(#[from] gimli::write::Error),
    #[error("Object file error: {0}")]
    Object(#[from] object::write::Error),
    /// Configuration the target cannot express; detected once at setup
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),
    /// A metadata handle that does not resolve in the module
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Programming-contract violation inside the emitter
    #[error("Invariant violated: {0}")]
    Invariant(String),
    #[error("Label {0} was referenced but never bound")]
    UnboundLabel(u32),
    #[error("Labels {0} and {1} are not in the same section")]
    CrossSectionDifference(u32, u32),
}

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;
