//! Environment-driven configuration for the switchyard gateway.
//!
//! Every knob is an environment variable; the binary loads a `.env` file
//! before calling [`Settings::from_env`]. Tests construct settings through
//! [`Settings::from_lookup`] with an in-memory map instead of mutating
//! process state.

mod error;
mod settings;

pub use {
    error::{ConfigError, Result},
    settings::{KNOWN_PROVIDERS, Settings},
};
