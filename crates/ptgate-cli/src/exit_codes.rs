//! Process exit classes.
//!
//! The convention every wrapper script and CI job relies on:
//!
//! - 0: success / gate PASS
//! - 1: internal error (integrity mismatch, unexpected I/O)
//! - 2: usage or configuration error
//! - 3: gate or health failure (including guard rejection)

/// Exit codes for all `ptgate` commands.
pub mod codes {
    /// Success / gate PASS.
    pub const SUCCESS: u8 = 0;
    /// Internal error: integrity mismatch or unexpected I/O.
    pub const INTERNAL: u8 = 1;
    /// Usage or configuration error.
    pub const USAGE: u8 = 2;
    /// Gate or health failure, guard rejection included.
    pub const GATE_FAILED: u8 = 3;
}
