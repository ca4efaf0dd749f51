//! Straylight — an admission gate for autonomous agent work.
//!
//! Single Rust binary. Callers ask the gate for permission before an agent
//! acts; the gate answers from operator policy, capability tokens, and
//! session quotas, and records every decision on an append-only audit stream.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod gate;
pub mod token;

pub mod server;
