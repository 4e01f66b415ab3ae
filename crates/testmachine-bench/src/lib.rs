#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! Benchmark harness for testmachine.
//!
//! Run benchmarks with: `cargo bench -p testmachine-bench`
//!
//! Covers the engine-independent hot paths: content hashing, the compiler
//! result cache and test selection.
