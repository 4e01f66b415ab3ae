#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for testmachine.
//!
//! Pure helper functions with no logging dependencies. Logging lives in the
//! crates that own the behavior being logged.

pub mod fs;
pub mod hash;
