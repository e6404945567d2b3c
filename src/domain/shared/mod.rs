//! Shared kernel - identifiers, errors and result type used by every layer

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::DomainError;
pub use result::Result;
pub use value_objects::*;
