//! Shared types for the orchids proxy workspace
//!
//! Holds the configuration error type, the `Secret` wrapper used for
//! long-lived account cookies, and the wall-clock helper every crate uses
//! for millisecond timestamps.

mod clock;
mod error;
mod secret;

pub use clock::unix_millis;
pub use error::{Error, Result};
pub use secret::Secret;
