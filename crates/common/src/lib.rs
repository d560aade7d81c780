//! Types shared by the OAuth token crates and the gateway service

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
