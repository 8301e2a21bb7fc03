//! # System Interaction Layer
//!
//! The boundary between task semantics and the operating system: process
//! spawning and supervision, executable lookup, and the interpreter probing
//! used by shell, script and expr tasks.

pub mod executor;
pub mod interpreter;
