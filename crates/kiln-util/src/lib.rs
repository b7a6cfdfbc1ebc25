#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for kiln.
//!
//! Pure helper functions with no logging/tracing dependencies. Logging is
//! handled by the CLI crate (and by `tracing` events in `kiln-core`).

pub mod fs;
pub mod hash;
pub mod path;
