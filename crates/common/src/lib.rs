//! Common types for the token switcher

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
