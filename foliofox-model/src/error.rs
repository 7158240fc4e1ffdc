use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    /// A field failed an invariant check (field name, reason).
    InvalidField(&'static str, String),
    /// A stored enum discriminant was not recognised.
    UnknownVariant(&'static str, String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidField(field, reason) => {
                write!(f, "invalid {field}: {reason}")
            }
            ModelError::UnknownVariant(kind, value) => {
                write!(f, "unknown {kind}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
