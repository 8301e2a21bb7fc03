// src/lib.rs

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Process-wide interrupt flag, set from the Ctrl+C handler and polled by the
/// executor's wait loop.
pub type CancellationToken = Arc<AtomicBool>;

pub mod cli;
pub mod constants;
pub mod core;
pub mod errors;
pub mod models;
pub mod system;
pub mod ui;
